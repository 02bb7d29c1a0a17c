//! SSH public key algorithms (RFC 4253 Section 6.6).
//!
//! Host keys sign the exchange hash during key exchange; the same key type
//! signs user authentication requests on the client side.
//!
//! # Supported Algorithms
//!
//! - `ssh-rsa` - RSASSA-PKCS1-v1_5 over SHA-1
//! - `ssh-dss` - recognized in key files and blobs, but signing and
//!   verification return [`KeelError::NotImplemented`]
//!
//! # Wire Formats
//!
//! ```text
//! public key blob:  string "ssh-rsa", mpint e, mpint n
//! signature blob:   string "ssh-rsa", string rsa_signature
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use keel_proto::ssh::hostkey::{verify_signature, HostKey, RsaHostKey};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pem = std::fs::read_to_string("/etc/keel/ssh_host_rsa_key")?;
//! let hostkey = RsaHostKey::from_pem(&pem)?;
//!
//! let signature = hostkey.sign(b"data to sign")?;
//! assert!(verify_signature(&hostkey.public_key_blob(), b"data to sign", &signature)?);
//! # Ok(())
//! # }
//! ```

use crate::ssh::wire::{Reader, Writer};
use keel_platform::{KeelError, KeelResult};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use tracing::debug;

/// Public key algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostKeyAlgorithm {
    /// ssh-rsa
    SshRsa,
    /// ssh-dss (recognized only)
    SshDss,
}

impl HostKeyAlgorithm {
    /// Get the algorithm name as specified in RFC 4253
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshRsa => "ssh-rsa",
            HostKeyAlgorithm::SshDss => "ssh-dss",
        }
    }

    /// Parse algorithm from name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ssh-rsa" => Some(HostKeyAlgorithm::SshRsa),
            "ssh-dss" => Some(HostKeyAlgorithm::SshDss),
            _ => None,
        }
    }
}

/// Trait for private key operations
pub trait HostKey: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> HostKeyAlgorithm;

    /// Get the public key in SSH wire format
    fn public_key_blob(&self) -> Vec<u8>;

    /// Sign data and return the signature in SSH wire format
    fn sign(&self, data: &[u8]) -> KeelResult<Vec<u8>>;

    /// Get the algorithm name
    fn algorithm_name(&self) -> &'static str {
        self.algorithm().name()
    }
}

/// RSA private key (ssh-rsa)
pub struct RsaHostKey {
    private_key: RsaPrivateKey,
    blob: Vec<u8>,
}

impl RsaHostKey {
    /// Wraps a parsed RSA private key.
    pub fn new(private_key: RsaPrivateKey) -> Self {
        let blob = rsa_public_key_blob(&private_key.to_public_key());
        Self { private_key, blob }
    }

    /// Loads a PEM encoded key (PKCS#1 `RSA PRIVATE KEY` or PKCS#8 `PRIVATE KEY`).
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Config`] if the PEM cannot be parsed as RSA.
    pub fn from_pem(pem: &str) -> KeelResult<Self> {
        let private_key = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map_err(|e| KeelError::Config(format!("Invalid RSA private key: {}", e)))?;
        Ok(Self::new(private_key))
    }

    /// Returns the public half.
    pub fn public_key(&self) -> RsaPublicKey {
        self.private_key.to_public_key()
    }
}

impl HostKey for RsaHostKey {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::SshRsa
    }

    fn public_key_blob(&self) -> Vec<u8> {
        self.blob.clone()
    }

    fn sign(&self, data: &[u8]) -> KeelResult<Vec<u8>> {
        let digest = Sha1::digest(data);
        let signature = self
            .private_key
            .sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
            .map_err(|e| KeelError::Security(format!("RSA signing failed: {}", e)))?;

        let mut w = Writer::new();
        w.string(HostKeyAlgorithm::SshRsa.name()).string(&signature);
        Ok(w.into_vec())
    }
}

impl std::fmt::Debug for RsaHostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaHostKey")
            .field("bits", &(self.private_key.size() * 8))
            .finish()
    }
}

/// Encodes an RSA public key as `string "ssh-rsa", mpint e, mpint n`.
pub fn rsa_public_key_blob(key: &RsaPublicKey) -> Vec<u8> {
    let mut w = Writer::new();
    w.string(HostKeyAlgorithm::SshRsa.name())
        .mpint_bytes(&key.e().to_bytes_be())
        .mpint_bytes(&key.n().to_bytes_be());
    w.into_vec()
}

/// Loads a PEM private key file of any recognized type.
///
/// # Errors
///
/// - [`KeelError::NotImplemented`] for DSA keys
/// - [`KeelError::Config`] for anything unparseable
pub fn load_host_key(pem: &str) -> KeelResult<Box<dyn HostKey>> {
    if pem.contains("BEGIN DSA PRIVATE KEY") {
        return Err(KeelError::NotImplemented(
            "ssh-dss host keys are not supported".to_string(),
        ));
    }
    Ok(Box::new(RsaHostKey::from_pem(pem)?))
}

/// Verifies an SSH signature blob against an SSH public key blob.
///
/// Returns `Ok(false)` for a well-formed signature that does not verify,
/// or for a signature whose algorithm differs from the key's.
///
/// # Errors
///
/// - [`KeelError::NotImplemented`] for `ssh-dss`
/// - [`KeelError::Protocol`] for malformed blobs or unknown algorithms
pub fn verify_signature(public_key_blob: &[u8], data: &[u8], signature: &[u8]) -> KeelResult<bool> {
    let mut key = Reader::new(public_key_blob);
    let algorithm = key.utf8()?;

    match HostKeyAlgorithm::from_name(algorithm) {
        Some(HostKeyAlgorithm::SshRsa) => {
            let e = key.mpint()?;
            let n = key.mpint()?;
            let public_key = RsaPublicKey::new(
                rsa::BigUint::from_bytes_be(&n.to_bytes_be()),
                rsa::BigUint::from_bytes_be(&e.to_bytes_be()),
            )
            .map_err(|e| KeelError::Protocol(format!("Invalid RSA public key: {}", e)))?;

            let mut sig = Reader::new(signature);
            let sig_algorithm = sig.utf8()?;
            if sig_algorithm != HostKeyAlgorithm::SshRsa.name() {
                debug!(sig_algorithm, "signature algorithm does not match key");
                return Ok(false);
            }
            let sig_bytes = sig.string()?;

            let digest = Sha1::digest(data);
            Ok(public_key
                .verify(Pkcs1v15Sign::new::<Sha1>(), &digest, sig_bytes)
                .is_ok())
        }
        Some(HostKeyAlgorithm::SshDss) => Err(KeelError::NotImplemented(
            "ssh-dss signature verification".to_string(),
        )),
        None => Err(KeelError::Protocol(format!(
            "Unknown public key algorithm: {}",
            algorithm
        ))),
    }
}

/// The host keys a server holds, at most one per algorithm.
#[derive(Default)]
pub struct HostKeys {
    keys: Vec<Box<dyn HostKey>>,
}

impl HostKeys {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key, replacing any held key of the same algorithm.
    pub fn add(&mut self, key: Box<dyn HostKey>) {
        self.keys.retain(|k| k.algorithm() != key.algorithm());
        self.keys.push(key);
    }

    /// Returns the held algorithm names in insertion order.
    pub fn algorithm_names(&self) -> Vec<String> {
        self.keys
            .iter()
            .map(|k| k.algorithm_name().to_string())
            .collect()
    }

    /// Looks up the key for an algorithm name.
    pub fn get(&self, name: &str) -> Option<&dyn HostKey> {
        self.keys
            .iter()
            .find(|k| k.algorithm_name() == name)
            .map(|k| k.as_ref())
    }

    /// Returns true if no key is held.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl std::fmt::Debug for HostKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.algorithm_names()).finish()
    }
}
