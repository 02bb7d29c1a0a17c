//! Symmetric algorithms and randomness for the binary packet protocol.
//!
//! This module holds the capability tables consulted during negotiation and
//! the per-direction state objects the packet protocol drives:
//! - CBC block ciphers: `aes128-cbc`, `aes192-cbc`, `aes256-cbc`, `3des-cbc`
//! - MACs: `hmac-sha1`, `hmac-sha1-96`, `hmac-sha2-256`
//! - Compression: `none`
//!
//! # Security
//!
//! - Cipher state is chained across packets (the IV of the next packet is the
//!   last ciphertext block of the previous one, RFC 4253 Section 6.3)
//! - MAC comparison is constant time
//! - Key material is zeroized on drop
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::crypto::{Capabilities, CipherAlgorithm};
//!
//! let caps = Capabilities::default();
//! let cipher = caps.cipher("aes128-cbc").unwrap();
//! assert_eq!(cipher, CipherAlgorithm::Aes128Cbc);
//! assert_eq!(cipher.key_size(), 16);
//! assert_eq!(cipher.block_size(), 16);
//! ```

use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use keel_platform::{KeelError, KeelResult};
use rand::RngCore;
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Fills `buf` from the thread-local CSPRNG.
pub fn fill_random(buf: &mut [u8]) {
    rand::thread_rng().fill_bytes(buf);
}

/// CBC cipher algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// AES-128 in CBC mode
    Aes128Cbc,
    /// AES-192 in CBC mode
    Aes192Cbc,
    /// AES-256 in CBC mode
    Aes256Cbc,
    /// Three-key triple DES (EDE) in CBC mode
    TripleDesCbc,
}

impl CipherAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::Aes128Cbc => "aes128-cbc",
            CipherAlgorithm::Aes192Cbc => "aes192-cbc",
            CipherAlgorithm::Aes256Cbc => "aes256-cbc",
            CipherAlgorithm::TripleDesCbc => "3des-cbc",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::Aes128Cbc => 16,
            CipherAlgorithm::Aes192Cbc => 24,
            CipherAlgorithm::Aes256Cbc => 32,
            CipherAlgorithm::TripleDesCbc => 24,
        }
    }

    /// Returns the block size in bytes (also the IV size).
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlgorithm::Aes128Cbc
            | CipherAlgorithm::Aes192Cbc
            | CipherAlgorithm::Aes256Cbc => 16,
            CipherAlgorithm::TripleDesCbc => 8,
        }
    }

    /// Parses cipher algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "aes128-cbc" => Some(CipherAlgorithm::Aes128Cbc),
            "aes192-cbc" => Some(CipherAlgorithm::Aes192Cbc),
            "aes256-cbc" => Some(CipherAlgorithm::Aes256Cbc),
            "3des-cbc" => Some(CipherAlgorithm::TripleDesCbc),
            _ => None,
        }
    }
}

/// MAC algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA1
    HmacSha1,
    /// HMAC-SHA1 truncated to 96 bits
    HmacSha1_96,
    /// HMAC-SHA256 (RFC 6668)
    HmacSha256,
}

impl MacAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha1 => "hmac-sha1",
            MacAlgorithm::HmacSha1_96 => "hmac-sha1-96",
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha1 | MacAlgorithm::HmacSha1_96 => 20,
            MacAlgorithm::HmacSha256 => 32,
        }
    }

    /// Returns the number of MAC bytes carried on the wire.
    pub fn mac_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha1 => 20,
            MacAlgorithm::HmacSha1_96 => 12,
            MacAlgorithm::HmacSha256 => 32,
        }
    }

    /// Parses MAC algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha1" => Some(MacAlgorithm::HmacSha1),
            "hmac-sha1-96" => Some(MacAlgorithm::HmacSha1_96),
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            _ => None,
        }
    }
}

/// Compression algorithm. Only the identity transform exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    /// No compression
    None,
}

impl CompressionAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
        }
    }

    /// Parses compression algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CompressionAlgorithm::None),
            _ => None,
        }
    }

    /// Compresses an outgoing payload.
    pub fn compress(&self, payload: Vec<u8>) -> Vec<u8> {
        match self {
            CompressionAlgorithm::None => payload,
        }
    }

    /// Decompresses an incoming payload.
    pub fn decompress(&self, payload: Vec<u8>) -> Vec<u8> {
        match self {
            CompressionAlgorithm::None => payload,
        }
    }
}

/// The algorithms this endpoint is willing to use, in preference order.
///
/// Built once and shared read-only (usually behind an `Arc`) by every packet
/// protocol instance and key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    ciphers: Vec<CipherAlgorithm>,
    macs: Vec<MacAlgorithm>,
    compression: Vec<CompressionAlgorithm>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            ciphers: vec![
                CipherAlgorithm::Aes128Cbc,
                CipherAlgorithm::Aes192Cbc,
                CipherAlgorithm::Aes256Cbc,
                CipherAlgorithm::TripleDesCbc,
            ],
            macs: vec![
                MacAlgorithm::HmacSha1,
                MacAlgorithm::HmacSha1_96,
                MacAlgorithm::HmacSha256,
            ],
            compression: vec![CompressionAlgorithm::None],
        }
    }
}

impl Capabilities {
    /// Creates capability tables from explicit lists.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Config`] if a list is empty.
    pub fn new(
        ciphers: Vec<CipherAlgorithm>,
        macs: Vec<MacAlgorithm>,
        compression: Vec<CompressionAlgorithm>,
    ) -> KeelResult<Self> {
        if ciphers.is_empty() || macs.is_empty() || compression.is_empty() {
            return Err(KeelError::Config(
                "Capability tables must offer at least one algorithm each".to_string(),
            ));
        }
        Ok(Self {
            ciphers,
            macs,
            compression,
        })
    }

    /// Offered cipher names.
    pub fn cipher_names(&self) -> Vec<String> {
        self.ciphers.iter().map(|c| c.name().to_string()).collect()
    }

    /// Offered MAC names.
    pub fn mac_names(&self) -> Vec<String> {
        self.macs.iter().map(|m| m.name().to_string()).collect()
    }

    /// Offered compression names.
    pub fn compression_names(&self) -> Vec<String> {
        self.compression
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Looks up an offered cipher by name.
    pub fn cipher(&self, name: &str) -> KeelResult<CipherAlgorithm> {
        CipherAlgorithm::from_name(name)
            .filter(|c| self.ciphers.contains(c))
            .ok_or_else(|| KeelError::Negotiation(format!("Unsupported cipher: {}", name)))
    }

    /// Looks up an offered MAC by name.
    pub fn mac(&self, name: &str) -> KeelResult<MacAlgorithm> {
        MacAlgorithm::from_name(name)
            .filter(|m| self.macs.contains(m))
            .ok_or_else(|| KeelError::Negotiation(format!("Unsupported MAC: {}", name)))
    }

    /// Looks up an offered compression algorithm by name.
    pub fn compression(&self, name: &str) -> KeelResult<CompressionAlgorithm> {
        CompressionAlgorithm::from_name(name)
            .filter(|c| self.compression.contains(c))
            .ok_or_else(|| {
                KeelError::Negotiation(format!("Unsupported compression: {}", name))
            })
    }
}

fn check_blocks(data: &[u8], block_size: usize) -> KeelResult<()> {
    if data.len() % block_size != 0 {
        return Err(KeelError::Protocol(format!(
            "Cipher input of {} bytes is not a multiple of the {} byte block size",
            data.len(),
            block_size
        )));
    }
    Ok(())
}

fn encrypt_blocks<C: BlockEncryptMut>(cipher: &mut C, data: &mut [u8], block_size: usize) {
    for block in data.chunks_exact_mut(block_size) {
        cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn decrypt_blocks<C: BlockDecryptMut>(cipher: &mut C, data: &mut [u8], block_size: usize) {
    for block in data.chunks_exact_mut(block_size) {
        cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn bad_key(algorithm: CipherAlgorithm) -> KeelError {
    KeelError::Security(format!("Invalid key or IV length for {}", algorithm.name()))
}

enum CbcEncryptor {
    Aes128(cbc::Encryptor<aes::Aes128>),
    Aes192(cbc::Encryptor<aes::Aes192>),
    Aes256(cbc::Encryptor<aes::Aes256>),
    TripleDes(cbc::Encryptor<des::TdesEde3>),
}

enum CbcDecryptor {
    Aes128(cbc::Decryptor<aes::Aes128>),
    Aes192(cbc::Decryptor<aes::Aes192>),
    Aes256(cbc::Decryptor<aes::Aes256>),
    TripleDes(cbc::Decryptor<des::TdesEde3>),
}

/// Outgoing direction cipher state.
pub struct Encryptor {
    algorithm: CipherAlgorithm,
    state: CbcEncryptor,
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encryptor")
            .field("algorithm", &self.algorithm)
            .field("state", &"<redacted>")
            .finish()
    }
}

impl Encryptor {
    /// Creates an encryptor from derived key and IV.
    pub fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> KeelResult<Self> {
        let state = match algorithm {
            CipherAlgorithm::Aes128Cbc => CbcEncryptor::Aes128(
                cbc::Encryptor::new_from_slices(key, iv).map_err(|_| bad_key(algorithm))?,
            ),
            CipherAlgorithm::Aes192Cbc => CbcEncryptor::Aes192(
                cbc::Encryptor::new_from_slices(key, iv).map_err(|_| bad_key(algorithm))?,
            ),
            CipherAlgorithm::Aes256Cbc => CbcEncryptor::Aes256(
                cbc::Encryptor::new_from_slices(key, iv).map_err(|_| bad_key(algorithm))?,
            ),
            CipherAlgorithm::TripleDesCbc => CbcEncryptor::TripleDes(
                cbc::Encryptor::new_from_slices(key, iv).map_err(|_| bad_key(algorithm))?,
            ),
        };
        Ok(Self { algorithm, state })
    }

    /// Encrypts whole blocks in place, continuing the CBC chain.
    pub fn encrypt(&mut self, data: &mut [u8]) -> KeelResult<()> {
        let bs = self.algorithm.block_size();
        check_blocks(data, bs)?;
        match &mut self.state {
            CbcEncryptor::Aes128(c) => encrypt_blocks(c, data, bs),
            CbcEncryptor::Aes192(c) => encrypt_blocks(c, data, bs),
            CbcEncryptor::Aes256(c) => encrypt_blocks(c, data, bs),
            CbcEncryptor::TripleDes(c) => encrypt_blocks(c, data, bs),
        }
        Ok(())
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }
}

/// Incoming direction cipher state.
pub struct Decryptor {
    algorithm: CipherAlgorithm,
    state: CbcDecryptor,
}

impl std::fmt::Debug for Decryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decryptor")
            .field("algorithm", &self.algorithm)
            .field("state", &"<redacted>")
            .finish()
    }
}

impl Decryptor {
    /// Creates a decryptor from derived key and IV.
    pub fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> KeelResult<Self> {
        let state = match algorithm {
            CipherAlgorithm::Aes128Cbc => CbcDecryptor::Aes128(
                cbc::Decryptor::new_from_slices(key, iv).map_err(|_| bad_key(algorithm))?,
            ),
            CipherAlgorithm::Aes192Cbc => CbcDecryptor::Aes192(
                cbc::Decryptor::new_from_slices(key, iv).map_err(|_| bad_key(algorithm))?,
            ),
            CipherAlgorithm::Aes256Cbc => CbcDecryptor::Aes256(
                cbc::Decryptor::new_from_slices(key, iv).map_err(|_| bad_key(algorithm))?,
            ),
            CipherAlgorithm::TripleDesCbc => CbcDecryptor::TripleDes(
                cbc::Decryptor::new_from_slices(key, iv).map_err(|_| bad_key(algorithm))?,
            ),
        };
        Ok(Self { algorithm, state })
    }

    /// Decrypts whole blocks in place, continuing the CBC chain.
    pub fn decrypt(&mut self, data: &mut [u8]) -> KeelResult<()> {
        let bs = self.algorithm.block_size();
        check_blocks(data, bs)?;
        match &mut self.state {
            CbcDecryptor::Aes128(c) => decrypt_blocks(c, data, bs),
            CbcDecryptor::Aes192(c) => decrypt_blocks(c, data, bs),
            CbcDecryptor::Aes256(c) => decrypt_blocks(c, data, bs),
            CbcDecryptor::TripleDes(c) => decrypt_blocks(c, data, bs),
        }
        Ok(())
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }
}

/// MAC key for one direction.
pub struct MacKey {
    algorithm: MacAlgorithm,
    key: Vec<u8>,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacKey {
    /// Creates a new MAC key.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> KeelResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(KeelError::Security(format!(
                "Insufficient key material for MAC: expected {}, got {}",
                algorithm.key_size(),
                key_material.len()
            )));
        }

        Ok(Self {
            algorithm,
            key: key_material[..algorithm.key_size()].to_vec(),
        })
    }

    /// Computes `MAC(key, sequence || packet)` truncated to the wire length.
    pub fn compute(&self, sequence: u32, packet: &[u8]) -> KeelResult<Vec<u8>> {
        let mut mac = match self.algorithm {
            MacAlgorithm::HmacSha1 | MacAlgorithm::HmacSha1_96 => {
                let mut hmac = Hmac::<Sha1>::new_from_slice(&self.key)
                    .map_err(|_| KeelError::Security("Invalid HMAC key".to_string()))?;
                hmac.update(&sequence.to_be_bytes());
                hmac.update(packet);
                hmac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha256 => {
                let mut hmac = Hmac::<Sha256>::new_from_slice(&self.key)
                    .map_err(|_| KeelError::Security("Invalid HMAC key".to_string()))?;
                hmac.update(&sequence.to_be_bytes());
                hmac.update(packet);
                hmac.finalize().into_bytes().to_vec()
            }
        };
        mac.truncate(self.algorithm.mac_size());
        Ok(mac)
    }

    /// Verifies a received MAC in constant time.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Integrity`] on mismatch.
    pub fn verify(&self, sequence: u32, packet: &[u8], received: &[u8]) -> KeelResult<()> {
        let expected = self.compute(sequence, packet)?;
        if expected.len() == received.len() && bool::from(expected.ct_eq(received)) {
            Ok(())
        } else {
            Err(KeelError::Integrity(format!(
                "MAC verification failed for packet {}",
                sequence
            )))
        }
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }
}

impl Drop for MacKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}
