//! Diffie-Hellman key exchange over fixed MODP groups (RFC 4253 Section 8).
//!
//! This module implements:
//! - diffie-hellman-group1-sha1 (Oakley Group 2, 1024-bit, RFC 2409)
//! - diffie-hellman-group14-sha1 (2048-bit MODP, RFC 3526)
//!
//! It also holds the exchange hash and the key derivation of RFC 4253
//! Section 7.2, both over SHA-1.
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::kex_dh::{DhExchange, DhGroup};
//!
//! let client = DhExchange::new(DhGroup::Group14);
//! let server = DhExchange::new(DhGroup::Group14);
//!
//! let k1 = client.compute_shared_secret(server.public_value()).unwrap();
//! let k2 = server.compute_shared_secret(client.public_value()).unwrap();
//! assert_eq!(k1, k2);
//! ```

use crate::ssh::crypto::fill_random;
use crate::ssh::wire::Writer;
use keel_platform::{KeelError, KeelResult};
use num_bigint::BigUint;
use once_cell::sync::Lazy;
use sha1::{Digest, Sha1};
use zeroize::Zeroize;

/// Oakley Group 2 prime (1024-bit)
static GROUP1_P: Lazy<BigUint> = Lazy::new(|| {
    prime_from_hex(
        "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
         29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
         EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
         E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
         EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381\
         FFFFFFFFFFFFFFFF",
    )
});

/// MODP Group 14 prime (2048-bit)
static GROUP14_P: Lazy<BigUint> = Lazy::new(|| {
    prime_from_hex(
        "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
         29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
         EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
         E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
         EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
         C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
         83655D23DCA3AD961C62F356208552BB9ED529077096966D\
         670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
         E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
         DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
         15728E5A8AACAA68FFFFFFFFFFFFFFFF",
    )
});

/// Generator shared by both groups
static G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));

// Only called on the literal group primes above.
fn prime_from_hex(hex: &str) -> BigUint {
    BigUint::parse_bytes(hex.as_bytes(), 16).unwrap_or_default()
}

/// A fixed Diffie-Hellman group with generator 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhGroup {
    /// 1024-bit group, 64-byte private exponents
    Group1,
    /// 2048-bit group, 128-byte private exponents
    Group14,
}

impl DhGroup {
    /// Returns the key exchange method name.
    pub fn kex_name(&self) -> &'static str {
        match self {
            DhGroup::Group1 => "diffie-hellman-group1-sha1",
            DhGroup::Group14 => "diffie-hellman-group14-sha1",
        }
    }

    /// Parses a key exchange method name.
    pub fn from_kex_name(name: &str) -> Option<Self> {
        match name {
            "diffie-hellman-group1-sha1" => Some(DhGroup::Group1),
            "diffie-hellman-group14-sha1" => Some(DhGroup::Group14),
            _ => None,
        }
    }

    /// Returns the group prime.
    pub fn prime(&self) -> &'static BigUint {
        match self {
            DhGroup::Group1 => &GROUP1_P,
            DhGroup::Group14 => &GROUP14_P,
        }
    }

    /// Returns the private exponent length in bytes.
    pub fn exponent_len(&self) -> usize {
        match self {
            DhGroup::Group1 => 64,
            DhGroup::Group14 => 128,
        }
    }
}

/// One side of a Diffie-Hellman exchange.
pub struct DhExchange {
    group: DhGroup,
    /// Private exponent, big-endian
    private_key: Vec<u8>,
    /// g^x mod p
    public_value: BigUint,
}

impl DhExchange {
    /// Draws a random non-zero private exponent of the group's length.
    pub fn new(group: DhGroup) -> Self {
        let mut private_key = vec![0u8; group.exponent_len()];
        loop {
            fill_random(&mut private_key);
            if private_key.iter().any(|&b| b != 0) {
                break;
            }
        }
        let public_value = G.modpow(&BigUint::from_bytes_be(&private_key), group.prime());
        Self {
            group,
            private_key,
            public_value,
        }
    }

    /// Uses a caller-chosen private exponent.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Security`] if the exponent is zero.
    pub fn with_exponent(group: DhGroup, exponent: &BigUint) -> KeelResult<Self> {
        if exponent.bits() == 0 {
            return Err(KeelError::Security(
                "Diffie-Hellman exponent must be positive".to_string(),
            ));
        }
        Ok(Self {
            group,
            private_key: exponent.to_bytes_be(),
            public_value: G.modpow(exponent, group.prime()),
        })
    }

    /// Returns the group.
    pub fn group(&self) -> DhGroup {
        self.group
    }

    /// Returns the public value (`e` for a client, `f` for a server).
    pub fn public_value(&self) -> &BigUint {
        &self.public_value
    }

    /// Computes the shared secret `K = peer^x mod p`.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Security`] unless `1 < peer < p - 1`.
    pub fn compute_shared_secret(&self, peer_public: &BigUint) -> KeelResult<BigUint> {
        let p = self.group.prime();
        let one = BigUint::from(1u32);
        let p_minus_one = p - &one;

        if *peer_public <= one || *peer_public >= p_minus_one {
            return Err(KeelError::Security(
                "Invalid peer public value: out of range".to_string(),
            ));
        }

        let x = BigUint::from_bytes_be(&self.private_key);
        Ok(peer_public.modpow(&x, p))
    }
}

impl std::fmt::Debug for DhExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhExchange")
            .field("group", &self.group)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl Drop for DhExchange {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// Inputs of the exchange hash, in hashing order.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeHashInput<'a> {
    /// Client identification line without CR LF
    pub client_id: &'a [u8],
    /// Server identification line without CR LF
    pub server_id: &'a [u8],
    /// Client KEXINIT payload
    pub client_kexinit: &'a [u8],
    /// Server KEXINIT payload
    pub server_kexinit: &'a [u8],
    /// Server host key blob
    pub host_key: &'a [u8],
    /// Client public value
    pub e: &'a BigUint,
    /// Server public value
    pub f: &'a BigUint,
    /// Shared secret
    pub k: &'a BigUint,
}

impl ExchangeHashInput<'_> {
    /// Computes `H = SHA1(string V_C, string V_S, string I_C, string I_S,
    /// string K_S, mpint e, mpint f, mpint K)`.
    pub fn hash(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.string(self.client_id)
            .string(self.server_id)
            .string(self.client_kexinit)
            .string(self.server_kexinit)
            .string(self.host_key)
            .mpint(self.e)
            .mpint(self.f)
            .mpint(self.k);
        Sha1::digest(w.into_vec()).to_vec()
    }
}

/// Derives one session secret (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = SHA1(mpint K || H || letter || session_id)
/// K2 = SHA1(mpint K || H || K1)
/// K3 = SHA1(mpint K || H || K1 || K2)
/// ```
///
/// Letters `A` to `F` select: IV client to server, IV server to client,
/// key client to server, key server to client, MAC key client to server,
/// MAC key server to client.
pub fn derive_key(
    shared_secret: &BigUint,
    exchange_hash: &[u8],
    session_id: &[u8],
    letter: u8,
    key_length: usize,
) -> Vec<u8> {
    let mut k_mpint = Writer::new();
    k_mpint.mpint(shared_secret);
    let k_mpint = k_mpint.into_vec();

    let mut hasher = Sha1::new();
    hasher.update(&k_mpint);
    hasher.update(exchange_hash);
    hasher.update([letter]);
    hasher.update(session_id);
    let mut key = hasher.finalize_reset().to_vec();

    while key.len() < key_length {
        hasher.update(&k_mpint);
        hasher.update(exchange_hash);
        hasher.update(&key);
        let block = hasher.finalize_reset();
        key.extend_from_slice(&block);
    }

    key.truncate(key_length);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_tables() {
        assert_eq!(DhGroup::Group1.prime().bits(), 1024);
        assert_eq!(DhGroup::Group14.prime().bits(), 2048);
        assert_eq!(DhGroup::Group1.exponent_len(), 64);
        assert_eq!(DhGroup::Group14.exponent_len(), 128);
        assert_eq!(
            DhGroup::from_kex_name("diffie-hellman-group1-sha1"),
            Some(DhGroup::Group1)
        );
        assert_eq!(DhGroup::from_kex_name("curve25519-sha256"), None);
    }

    #[test]
    fn test_shared_secret_agrees() {
        for group in [DhGroup::Group1, DhGroup::Group14] {
            let client = DhExchange::new(group);
            let server = DhExchange::new(group);
            let k1 = client.compute_shared_secret(server.public_value()).unwrap();
            let k2 = server.compute_shared_secret(client.public_value()).unwrap();
            assert_eq!(k1, k2);
        }
    }

    #[test]
    fn test_fixed_exponents() {
        let client = DhExchange::with_exponent(DhGroup::Group14, &BigUint::from(5u32)).unwrap();
        let server = DhExchange::with_exponent(DhGroup::Group14, &BigUint::from(7u32)).unwrap();
        assert_eq!(*client.public_value(), BigUint::from(32u32));
        assert_eq!(*server.public_value(), BigUint::from(128u32));
        assert_eq!(
            client.compute_shared_secret(server.public_value()).unwrap(),
            BigUint::from(1u64 << 35)
        );
    }

    #[test]
    fn test_zero_exponent_rejected() {
        assert!(matches!(
            DhExchange::with_exponent(DhGroup::Group1, &BigUint::default()),
            Err(KeelError::Security(_))
        ));
    }

    #[test]
    fn test_peer_value_range() {
        let ex = DhExchange::new(DhGroup::Group1);
        let p = DhGroup::Group1.prime();
        for bad in [
            BigUint::default(),
            BigUint::from(1u32),
            p - BigUint::from(1u32),
            p.clone(),
        ] {
            assert!(ex.compute_shared_secret(&bad).is_err());
        }
        assert!(ex.compute_shared_secret(&BigUint::from(2u32)).is_ok());
    }

    #[test]
    fn test_exchange_hash_known_answer() {
        let input = ExchangeHashInput {
            client_id: b"SSH-2.0-client",
            server_id: b"SSH-2.0-server",
            client_kexinit: b"\x14ci",
            server_kexinit: b"\x14si",
            host_key: b"blob",
            e: &BigUint::from(32u32),
            f: &BigUint::from(128u32),
            k: &BigUint::from(1u64 << 35),
        };
        assert_eq!(
            hex::encode(input.hash()),
            "33be22c191b0aaf72357a855c2142d55086ffc77"
        );
    }

    #[test]
    fn test_derive_key_known_answer() {
        let k = BigUint::parse_bytes(b"80112233445566778899", 16).unwrap();
        let h = [0x11u8; 20];
        let sid = [0x22u8; 20];

        // two SHA-1 blocks, second hashed over the whole first block
        assert_eq!(
            hex::encode(derive_key(&k, &h, &sid, b'C', 32)),
            "ca2b1a78c0ddb7299a255428aa11a5655898a0e136815cc511218f9ac439ab1c"
        );
        assert_eq!(
            hex::encode(derive_key(&k, &h, &sid, b'A', 16)),
            "23621eb7121aae0075f09cbe0e947bf4"
        );
    }

    #[test]
    fn test_derive_key_lengths() {
        let k = BigUint::from(42u32);
        for len in [8, 16, 20, 24, 32, 41, 64] {
            assert_eq!(derive_key(&k, &[1; 20], &[2; 20], b'E', len).len(), len);
        }
    }
}
