//! SSH key exchange (KEX) implementation (RFC 4253 Section 7).
//!
//! This module implements SSH key exchange, including:
//! - SSH_MSG_KEXINIT message
//! - SSH_MSG_NEWKEYS message
//! - Algorithm negotiation
//! - Diffie-Hellman group1/group14 over SHA-1 (see [`kex_dh`](crate::ssh::kex_dh))
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first client choice the server supports wins)
//! 3. KEXDH_INIT / KEXDH_REPLY, the server signs the exchange hash
//! 4. SSH_MSG_NEWKEYS in each direction
//! 5. Switch to encrypted communication
//!
//! The order of step 4 differs by role. The server waits for the client's
//! NEWKEYS, enables its receive direction, then sends its own NEWKEYS and
//! enables its send direction. The client sends NEWKEYS and enables its
//! send direction first. Both sides block on reads, so swapping either
//! order deadlocks.
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::crypto::Capabilities;
//! use keel_proto::ssh::kex::{select_algorithm, KexInit};
//!
//! let proposal = KexInit::proposal(&Capabilities::default(), &["ssh-rsa"]);
//! assert_eq!(proposal.kex_algorithms()[0], "diffie-hellman-group14-sha1");
//!
//! let (choice, skipped) = select_algorithm(
//!     &["b".to_string(), "a".to_string()],
//!     &["a".to_string(), "b".to_string()],
//!     "kex",
//! )
//! .unwrap();
//! assert_eq!((choice.as_str(), skipped), ("b", 0));
//! ```

use crate::ssh::crypto::{
    fill_random, Capabilities, CipherAlgorithm, CompressionAlgorithm, MacAlgorithm,
};
use crate::ssh::hostkey::{verify_signature, HostKeys};
use crate::ssh::kex_dh::{derive_key, DhExchange, DhGroup, ExchangeHashInput};
use crate::ssh::message::MessageType;
use crate::ssh::packet::PacketProtocol;
use crate::ssh::wire::{Reader, Writer};
use keel_platform::{KeelError, KeelResult};
use num_bigint::BigUint;
use std::io::{Read, Write};
use tracing::{debug, info};
use zeroize::Zeroize;

/// Key exchange methods offered, most preferred first.
pub const KEX_ALGORITHMS: [&str; 2] = ["diffie-hellman-group14-sha1", "diffie-hellman-group1-sha1"];

/// Host key algorithms a client accepts.
pub const CLIENT_HOST_KEY_ALGORITHMS: [&str; 1] = ["ssh-rsa"];

/// Which end of the connection this side is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepting side; signs the exchange hash
    Server,
    /// Connecting side; verifies the exchange hash
    Client,
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    encryption_algorithms_client_to_server: Vec<String>,
    encryption_algorithms_server_to_client: Vec<String>,
    mac_algorithms_client_to_server: Vec<String>,
    mac_algorithms_server_to_client: Vec<String>,
    compression_algorithms_client_to_server: Vec<String>,
    compression_algorithms_server_to_client: Vec<String>,
    languages_client_to_server: Vec<String>,
    languages_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Builds a proposal from the capability tables with a fresh random cookie.
    ///
    /// Languages are empty and no guessed packet follows.
    pub fn proposal<S: AsRef<str>>(capabilities: &Capabilities, host_key_algorithms: &[S]) -> Self {
        let mut cookie = [0u8; 16];
        fill_random(&mut cookie);

        let ciphers = capabilities.cipher_names();
        let macs = capabilities.mac_names();
        let compression = capabilities.compression_names();

        Self {
            cookie,
            kex_algorithms: KEX_ALGORITHMS.iter().map(|s| s.to_string()).collect(),
            server_host_key_algorithms: host_key_algorithms
                .iter()
                .map(|s| s.as_ref().to_string())
                .collect(),
            encryption_algorithms_client_to_server: ciphers.clone(),
            encryption_algorithms_server_to_client: ciphers,
            mac_algorithms_client_to_server: macs.clone(),
            mac_algorithms_server_to_client: macs,
            compression_algorithms_client_to_server: compression.clone(),
            compression_algorithms_server_to_client: compression,
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Replaces the offered key exchange methods.
    pub fn with_kex_algorithms<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        self.kex_algorithms = names.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the encryption algorithms (client to server).
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        &self.encryption_algorithms_client_to_server
    }

    /// Returns the encryption algorithms (server to client).
    pub fn encryption_algorithms_server_to_client(&self) -> &[String] {
        &self.encryption_algorithms_server_to_client
    }

    /// Returns the MAC algorithms (client to server).
    pub fn mac_algorithms_client_to_server(&self) -> &[String] {
        &self.mac_algorithms_client_to_server
    }

    /// Returns the MAC algorithms (server to client).
    pub fn mac_algorithms_server_to_client(&self) -> &[String] {
        &self.mac_algorithms_server_to_client
    }

    /// Returns whether a guessed first KEX packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the message payload.
    ///
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie
    /// name-list    kex_algorithms
    /// name-list    server_host_key_algorithms
    /// name-list    encryption_algorithms_client_to_server
    /// name-list    encryption_algorithms_server_to_client
    /// name-list    mac_algorithms_client_to_server
    /// name-list    mac_algorithms_server_to_client
    /// name-list    compression_algorithms_client_to_server
    /// name-list    compression_algorithms_server_to_client
    /// name-list    languages_client_to_server
    /// name-list    languages_server_to_client
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::KexInit);
        w.raw(&self.cookie)
            .name_list(&self.kex_algorithms)
            .name_list(&self.server_host_key_algorithms)
            .name_list(&self.encryption_algorithms_client_to_server)
            .name_list(&self.encryption_algorithms_server_to_client)
            .name_list(&self.mac_algorithms_client_to_server)
            .name_list(&self.mac_algorithms_server_to_client)
            .name_list(&self.compression_algorithms_client_to_server)
            .name_list(&self.compression_algorithms_server_to_client)
            .name_list(&self.languages_client_to_server)
            .name_list(&self.languages_server_to_client)
            .boolean(self.first_kex_packet_follows)
            .uint32(0);
        w.into_vec()
    }

    /// Parses a KEXINIT payload.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Protocol`] if the type byte is wrong or a field
    /// is truncated.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut r = Reader::message(data, MessageType::KexInit)?;

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(r.bytes(16)?);

        let kex = Self {
            cookie,
            kex_algorithms: r.name_list()?,
            server_host_key_algorithms: r.name_list()?,
            encryption_algorithms_client_to_server: r.name_list()?,
            encryption_algorithms_server_to_client: r.name_list()?,
            mac_algorithms_client_to_server: r.name_list()?,
            mac_algorithms_server_to_client: r.name_list()?,
            compression_algorithms_client_to_server: r.name_list()?,
            compression_algorithms_server_to_client: r.name_list()?,
            languages_client_to_server: r.name_list()?,
            languages_server_to_client: r.name_list()?,
            first_kex_packet_follows: r.boolean()?,
        };
        let _reserved = r.uint32()?;
        Ok(kex)
    }
}

/// Picks the first client algorithm that the server also lists.
///
/// Returns the choice and the number of client entries skipped before it;
/// a non-zero count means the client's first guess was wrong.
///
/// # Errors
///
/// Returns [`KeelError::Negotiation`] if the lists share no entry.
pub fn select_algorithm(
    client: &[String],
    server: &[String],
    category: &str,
) -> KeelResult<(String, usize)> {
    client
        .iter()
        .enumerate()
        .find(|(_, name)| server.contains(name))
        .map(|(skipped, name)| (name.clone(), skipped))
        .ok_or_else(|| {
            KeelError::Negotiation(format!(
                "No suitable {} algorithm (client: {}, server: {})",
                category,
                client.join(","),
                server.join(",")
            ))
        })
}

/// Result of algorithm negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    /// Key exchange group
    pub kex: DhGroup,
    /// Host key algorithm name
    pub host_key: String,
    /// Cipher client to server
    pub cipher_client_to_server: CipherAlgorithm,
    /// Cipher server to client
    pub cipher_server_to_client: CipherAlgorithm,
    /// MAC client to server
    pub mac_client_to_server: MacAlgorithm,
    /// MAC server to client
    pub mac_server_to_client: MacAlgorithm,
    /// Compression client to server
    pub compression_client_to_server: CompressionAlgorithm,
    /// Compression server to client
    pub compression_server_to_client: CompressionAlgorithm,
}

/// Negotiates every category.
///
/// The boolean is true when the kex or host key first choices differed,
/// which makes a guessed KEX packet from the peer invalid.
pub fn negotiate(
    client: &KexInit,
    server: &KexInit,
    capabilities: &Capabilities,
) -> KeelResult<(NegotiatedAlgorithms, bool)> {
    let (kex, kex_skipped) = select_algorithm(&client.kex_algorithms, &server.kex_algorithms, "kex")?;
    let (host_key, host_key_skipped) = select_algorithm(
        &client.server_host_key_algorithms,
        &server.server_host_key_algorithms,
        "host key",
    )?;

    let kex = DhGroup::from_kex_name(&kex)
        .ok_or_else(|| KeelError::Negotiation(format!("Unsupported kex algorithm: {}", kex)))?;

    let cipher = |c: &[String], s: &[String], what| {
        select_algorithm(c, s, what).and_then(|(name, _)| capabilities.cipher(&name))
    };
    let mac = |c: &[String], s: &[String], what| {
        select_algorithm(c, s, what).and_then(|(name, _)| capabilities.mac(&name))
    };
    let compression = |c: &[String], s: &[String], what| {
        select_algorithm(c, s, what).and_then(|(name, _)| capabilities.compression(&name))
    };

    let algorithms = NegotiatedAlgorithms {
        kex,
        host_key,
        cipher_client_to_server: cipher(
            &client.encryption_algorithms_client_to_server,
            &server.encryption_algorithms_client_to_server,
            "client to server encryption",
        )?,
        cipher_server_to_client: cipher(
            &client.encryption_algorithms_server_to_client,
            &server.encryption_algorithms_server_to_client,
            "server to client encryption",
        )?,
        mac_client_to_server: mac(
            &client.mac_algorithms_client_to_server,
            &server.mac_algorithms_client_to_server,
            "client to server mac",
        )?,
        mac_server_to_client: mac(
            &client.mac_algorithms_server_to_client,
            &server.mac_algorithms_server_to_client,
            "server to client mac",
        )?,
        compression_client_to_server: compression(
            &client.compression_algorithms_client_to_server,
            &server.compression_algorithms_client_to_server,
            "client to server compression",
        )?,
        compression_server_to_client: compression(
            &client.compression_algorithms_server_to_client,
            &server.compression_algorithms_server_to_client,
            "server to client compression",
        )?,
    };

    Ok((algorithms, kex_skipped + host_key_skipped > 0))
}

/// The six secrets derived from K and H.
#[derive(Clone, PartialEq, Eq)]
pub struct DerivedKeys {
    /// Initial IV client to server ("A")
    pub iv_client_to_server: Vec<u8>,
    /// Initial IV server to client ("B")
    pub iv_server_to_client: Vec<u8>,
    /// Encryption key client to server ("C")
    pub key_client_to_server: Vec<u8>,
    /// Encryption key server to client ("D")
    pub key_server_to_client: Vec<u8>,
    /// Integrity key client to server ("E")
    pub mac_key_client_to_server: Vec<u8>,
    /// Integrity key server to client ("F")
    pub mac_key_server_to_client: Vec<u8>,
}

impl DerivedKeys {
    /// Derives every secret at the length its negotiated algorithm needs.
    pub fn derive(
        algorithms: &NegotiatedAlgorithms,
        shared_secret: &BigUint,
        exchange_hash: &[u8],
        session_id: &[u8],
    ) -> Self {
        let derive = |letter, len| derive_key(shared_secret, exchange_hash, session_id, letter, len);
        Self {
            iv_client_to_server: derive(b'A', algorithms.cipher_client_to_server.block_size()),
            iv_server_to_client: derive(b'B', algorithms.cipher_server_to_client.block_size()),
            key_client_to_server: derive(b'C', algorithms.cipher_client_to_server.key_size()),
            key_server_to_client: derive(b'D', algorithms.cipher_server_to_client.key_size()),
            mac_key_client_to_server: derive(b'E', algorithms.mac_client_to_server.key_size()),
            mac_key_server_to_client: derive(b'F', algorithms.mac_server_to_client.key_size()),
        }
    }
}

impl std::fmt::Debug for DerivedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKeys(<redacted>)")
    }
}

impl Drop for DerivedKeys {
    fn drop(&mut self) {
        self.iv_client_to_server.zeroize();
        self.iv_server_to_client.zeroize();
        self.key_client_to_server.zeroize();
        self.key_server_to_client.zeroize();
        self.mac_key_client_to_server.zeroize();
        self.mac_key_server_to_client.zeroize();
    }
}

/// What a completed key exchange produced.
#[derive(Debug)]
pub struct KexOutcome {
    /// Negotiated algorithms
    pub algorithms: NegotiatedAlgorithms,
    /// Exchange hash H of this exchange
    pub exchange_hash: Vec<u8>,
    /// Session identifier (H of the first exchange)
    pub session_id: Vec<u8>,
    /// Derived secrets
    pub keys: DerivedKeys,
}

enum Credentials<'a> {
    HostKeys(&'a HostKeys),
    ExpectedHostKey(&'a [u8]),
}

/// One key exchange run, configured for a role.
pub struct KeyExchange<'a> {
    local_id: &'a str,
    remote_id: &'a str,
    credentials: Credentials<'a>,
    kex_algorithms: Option<Vec<String>>,
}

impl<'a> KeyExchange<'a> {
    /// Server side: signs with the matching key from `host_keys`.
    pub fn server(server_id: &'a str, client_id: &'a str, host_keys: &'a HostKeys) -> Self {
        Self {
            local_id: server_id,
            remote_id: client_id,
            credentials: Credentials::HostKeys(host_keys),
            kex_algorithms: None,
        }
    }

    /// Client side: accepts only a server presenting `expected_host_key`.
    pub fn client(client_id: &'a str, server_id: &'a str, expected_host_key: &'a [u8]) -> Self {
        Self {
            local_id: client_id,
            remote_id: server_id,
            credentials: Credentials::ExpectedHostKey(expected_host_key),
            kex_algorithms: None,
        }
    }

    /// Restricts the offered key exchange methods.
    pub fn with_kex_algorithms<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        self.kex_algorithms = Some(names.iter().map(|s| s.as_ref().to_string()).collect());
        self
    }

    /// Returns the role.
    pub fn role(&self) -> Role {
        match self.credentials {
            Credentials::HostKeys(_) => Role::Server,
            Credentials::ExpectedHostKey(_) => Role::Client,
        }
    }

    /// Runs the exchange to completion and activates the new keys.
    ///
    /// # Errors
    ///
    /// - [`KeelError::Negotiation`] if a category has no common algorithm
    /// - [`KeelError::Security`] if the host key or signature is rejected
    /// - [`KeelError::Disconnected`] if the peer disconnects
    /// - [`KeelError::Protocol`] on unexpected or malformed messages
    pub fn run<R: Read, W: Write>(
        self,
        protocol: &mut PacketProtocol<R, W>,
    ) -> KeelResult<KexOutcome> {
        let role = self.role();
        let capabilities = protocol.capabilities().clone();

        let host_key_algorithms = match &self.credentials {
            Credentials::HostKeys(keys) => {
                if keys.is_empty() {
                    return Err(KeelError::Config("No host keys loaded".to_string()));
                }
                keys.algorithm_names()
            }
            Credentials::ExpectedHostKey(_) => CLIENT_HOST_KEY_ALGORITHMS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };
        let mut local = KexInit::proposal(&capabilities, &host_key_algorithms);
        if let Some(names) = &self.kex_algorithms {
            local = local.with_kex_algorithms(names);
        }

        let local_bytes = local.to_bytes();
        protocol.send(&local_bytes)?;

        let remote_bytes = protocol.receive(false)?;
        expect_message(&remote_bytes, MessageType::KexInit)?;
        let remote = KexInit::from_bytes(&remote_bytes)?;

        let (client, server) = match role {
            Role::Server => (&remote, &local),
            Role::Client => (&local, &remote),
        };
        let (algorithms, guess_wrong) = negotiate(client, server, &capabilities)?;
        debug!(
            kex = algorithms.kex.kex_name(),
            host_key = %algorithms.host_key,
            c2s = algorithms.cipher_client_to_server.name(),
            s2c = algorithms.cipher_server_to_client.name(),
            "negotiated algorithms"
        );

        if remote.first_kex_packet_follows() && guess_wrong {
            let guessed = match role {
                Role::Server => MessageType::KexdhInit,
                Role::Client => MessageType::KexdhReply,
            };
            drain_guessed_packet(protocol, guessed)?;
        }

        let (client_kexinit, server_kexinit) = match role {
            Role::Server => (&remote_bytes, &local_bytes),
            Role::Client => (&local_bytes, &remote_bytes),
        };
        let (client_id, server_id) = match role {
            Role::Server => (self.remote_id, self.local_id),
            Role::Client => (self.local_id, self.remote_id),
        };

        let dh = DhExchange::new(algorithms.kex);

        let (exchange_hash, shared_secret) = match &self.credentials {
            Credentials::HostKeys(keys) => {
                let packet = protocol.receive(false)?;
                expect_message(&packet, MessageType::KexdhInit)?;
                let e = Reader::message(&packet, MessageType::KexdhInit)?.mpint()?;

                let k = dh.compute_shared_secret(&e)?;
                let host_key = keys.get(&algorithms.host_key).ok_or_else(|| {
                    KeelError::Negotiation(format!("No {} host key", algorithms.host_key))
                })?;
                let blob = host_key.public_key_blob();

                let h = ExchangeHashInput {
                    client_id: client_id.as_bytes(),
                    server_id: server_id.as_bytes(),
                    client_kexinit,
                    server_kexinit,
                    host_key: &blob,
                    e: &e,
                    f: dh.public_value(),
                    k: &k,
                }
                .hash();

                let signature = host_key.sign(&h)?;

                let mut reply = Writer::message(MessageType::KexdhReply);
                reply
                    .string(&blob)
                    .mpint(dh.public_value())
                    .string(&signature);
                protocol.send(&reply.into_vec())?;

                (h, k)
            }
            Credentials::ExpectedHostKey(expected) => {
                let mut init = Writer::message(MessageType::KexdhInit);
                init.mpint(dh.public_value());
                protocol.send(&init.into_vec())?;

                let packet = protocol.receive(false)?;
                expect_message(&packet, MessageType::KexdhReply)?;
                let mut r = Reader::message(&packet, MessageType::KexdhReply)?;
                let blob = r.string()?;
                let f = r.mpint()?;
                let signature = r.string()?;

                if blob != *expected {
                    return Err(KeelError::Security(
                        "Server host key does not match".to_string(),
                    ));
                }

                let k = dh.compute_shared_secret(&f)?;
                let h = ExchangeHashInput {
                    client_id: client_id.as_bytes(),
                    server_id: server_id.as_bytes(),
                    client_kexinit,
                    server_kexinit,
                    host_key: blob,
                    e: dh.public_value(),
                    f: &f,
                    k: &k,
                }
                .hash();

                if !verify_signature(blob, &h, signature)? {
                    return Err(KeelError::Security(
                        "Server reply cannot be verified".to_string(),
                    ));
                }

                (h, k)
            }
        };

        if protocol.session_id().is_none() {
            protocol.set_session_id(exchange_hash.clone())?;
        }
        let session_id = protocol
            .session_id()
            .map(<[u8]>::to_vec)
            .unwrap_or_else(|| exchange_hash.clone());

        let keys = DerivedKeys::derive(&algorithms, &shared_secret, &exchange_hash, &session_id);

        match role {
            Role::Server => {
                expect_newkeys(protocol)?;
                activate_receive(protocol, role, &algorithms, &keys)?;
                protocol.send(&[MessageType::NewKeys as u8])?;
                activate_send(protocol, role, &algorithms, &keys)?;
            }
            Role::Client => {
                protocol.send(&[MessageType::NewKeys as u8])?;
                activate_send(protocol, role, &algorithms, &keys)?;
                expect_newkeys(protocol)?;
                activate_receive(protocol, role, &algorithms, &keys)?;
            }
        }

        info!(
            ?role,
            session_id = %hex::encode(&session_id),
            "key exchange complete"
        );

        Ok(KexOutcome {
            algorithms,
            exchange_hash,
            session_id,
            keys,
        })
    }
}

/// Fails unless `payload` has type `expected`; a DISCONNECT becomes
/// [`KeelError::Disconnected`].
pub fn expect_message(payload: &[u8], expected: MessageType) -> KeelResult<()> {
    match MessageType::of(payload) {
        Some(t) if t == expected => Ok(()),
        Some(MessageType::Disconnect) => Err(parse_disconnect(payload)),
        _ => Err(KeelError::Protocol(format!(
            "Expected {}, got #{}",
            expected,
            payload.first().copied().unwrap_or(0)
        ))),
    }
}

/// Converts a DISCONNECT payload into [`KeelError::Disconnected`].
pub fn parse_disconnect(payload: &[u8]) -> KeelError {
    let parsed = Reader::message(payload, MessageType::Disconnect).and_then(|mut r| {
        let reason = r.uint32()?;
        let description = String::from_utf8_lossy(r.string()?).into_owned();
        Ok((reason, description))
    });
    match parsed {
        Ok((reason, description)) => KeelError::Disconnected {
            reason,
            description,
        },
        Err(e) => e,
    }
}

fn drain_guessed_packet<R: Read, W: Write>(
    protocol: &mut PacketProtocol<R, W>,
    guessed: MessageType,
) -> KeelResult<()> {
    loop {
        let packet = protocol.receive(false)?;
        match MessageType::of(&packet) {
            Some(MessageType::Disconnect) => {
                return Err(KeelError::Negotiation(format!(
                    "Peer disconnected during negotiation: {}",
                    parse_disconnect(&packet)
                )));
            }
            Some(t) if t == guessed => {
                debug!(msg_type = %t, "discarded wrongly guessed kex packet");
                return Ok(());
            }
            _ => continue,
        }
    }
}

fn expect_newkeys<R: Read, W: Write>(protocol: &mut PacketProtocol<R, W>) -> KeelResult<()> {
    let packet = protocol.receive(false)?;
    expect_message(&packet, MessageType::NewKeys)
}

fn activate_send<R: Read, W: Write>(
    protocol: &mut PacketProtocol<R, W>,
    role: Role,
    algorithms: &NegotiatedAlgorithms,
    keys: &DerivedKeys,
) -> KeelResult<()> {
    let (cipher, mac, compression, key, iv, mac_key) = match role {
        Role::Server => (
            algorithms.cipher_server_to_client,
            algorithms.mac_server_to_client,
            algorithms.compression_server_to_client,
            &keys.key_server_to_client,
            &keys.iv_server_to_client,
            &keys.mac_key_server_to_client,
        ),
        Role::Client => (
            algorithms.cipher_client_to_server,
            algorithms.mac_client_to_server,
            algorithms.compression_client_to_server,
            &keys.key_client_to_server,
            &keys.iv_client_to_server,
            &keys.mac_key_client_to_server,
        ),
    };
    protocol.init_encryption(cipher, key, iv)?;
    protocol.init_compression(compression);
    protocol.init_send_mac(mac, mac_key)
}

fn activate_receive<R: Read, W: Write>(
    protocol: &mut PacketProtocol<R, W>,
    role: Role,
    algorithms: &NegotiatedAlgorithms,
    keys: &DerivedKeys,
) -> KeelResult<()> {
    let (cipher, mac, compression, key, iv, mac_key) = match role {
        Role::Server => (
            algorithms.cipher_client_to_server,
            algorithms.mac_client_to_server,
            algorithms.compression_client_to_server,
            &keys.key_client_to_server,
            &keys.iv_client_to_server,
            &keys.mac_key_client_to_server,
        ),
        Role::Client => (
            algorithms.cipher_server_to_client,
            algorithms.mac_server_to_client,
            algorithms.compression_server_to_client,
            &keys.key_server_to_client,
            &keys.iv_server_to_client,
            &keys.mac_key_server_to_client,
        ),
    };
    protocol.init_decryption(cipher, key, iv)?;
    protocol.init_decompression(compression);
    protocol.init_receive_mac(mac, mac_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_follows_client_order() {
        let (choice, skipped) =
            select_algorithm(&names(&["b", "a"]), &names(&["a", "b"]), "test").unwrap();
        assert_eq!(choice, "b");
        assert_eq!(skipped, 0);

        let (choice, skipped) =
            select_algorithm(&names(&["x", "y", "a"]), &names(&["a", "b"]), "test").unwrap();
        assert_eq!(choice, "a");
        assert_eq!(skipped, 2);
    }

    #[test]
    fn test_select_no_overlap() {
        match select_algorithm(&names(&["x"]), &names(&["a"]), "kex") {
            Err(KeelError::Negotiation(msg)) => assert!(msg.contains("kex")),
            other => panic!("Expected Negotiation error, got {:?}", other),
        }
    }

    #[test]
    fn test_kexinit_round_trip() {
        let proposal = KexInit::proposal(&Capabilities::default(), &["ssh-rsa"]);
        let bytes = proposal.to_bytes();
        assert_eq!(bytes[0], 20);
        assert_eq!(&bytes[1..17], proposal.cookie());

        let parsed = KexInit::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, proposal);
        assert_eq!(
            parsed.encryption_algorithms_client_to_server(),
            &names(&["aes128-cbc", "aes192-cbc", "aes256-cbc", "3des-cbc"])[..]
        );
        assert!(!parsed.first_kex_packet_follows());
        // reserved uint32 is the last field
        assert_eq!(&bytes[bytes.len() - 5..], &[0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_kexinit_truncated() {
        let bytes = KexInit::proposal(&Capabilities::default(), &["ssh-rsa"]).to_bytes();
        assert!(matches!(
            KexInit::from_bytes(&bytes[..bytes.len() - 2]),
            Err(KeelError::Protocol(_))
        ));
        assert!(matches!(
            KexInit::from_bytes(&[20, 1, 2]),
            Err(KeelError::Protocol(_))
        ));
        assert!(KexInit::from_bytes(&[21]).is_err());
    }

    #[test]
    fn test_negotiate_detects_wrong_guess() {
        let caps = Capabilities::default();
        let client = KexInit::proposal(&caps, &["ssh-rsa"])
            .with_kex_algorithms(&["diffie-hellman-group1-sha1", "diffie-hellman-group14-sha1"]);
        let server = KexInit::proposal(&caps, &["ssh-rsa"])
            .with_kex_algorithms(&["diffie-hellman-group14-sha1"]);

        let (algorithms, wrong) = negotiate(&client, &server, &caps).unwrap();
        assert_eq!(algorithms.kex, DhGroup::Group14);
        assert_eq!(algorithms.cipher_client_to_server, CipherAlgorithm::Aes128Cbc);
        assert_eq!(algorithms.mac_server_to_client, MacAlgorithm::HmacSha1);
        assert!(wrong);

        let (_, wrong) = negotiate(&server, &server, &caps).unwrap();
        assert!(!wrong);
    }

    #[test]
    fn test_negotiate_host_key_mismatch() {
        let caps = Capabilities::default();
        let client = KexInit::proposal(&caps, &["ssh-rsa"]);
        let server = KexInit::proposal(&caps, &["ssh-dss"]);
        assert!(matches!(
            negotiate(&client, &server, &caps),
            Err(KeelError::Negotiation(_))
        ));
    }

    #[test]
    fn test_derived_key_lengths() {
        let algorithms = NegotiatedAlgorithms {
            kex: DhGroup::Group1,
            host_key: "ssh-rsa".to_string(),
            cipher_client_to_server: CipherAlgorithm::Aes256Cbc,
            cipher_server_to_client: CipherAlgorithm::TripleDesCbc,
            mac_client_to_server: MacAlgorithm::HmacSha256,
            mac_server_to_client: MacAlgorithm::HmacSha1_96,
            compression_client_to_server: CompressionAlgorithm::None,
            compression_server_to_client: CompressionAlgorithm::None,
        };
        let keys = DerivedKeys::derive(&algorithms, &BigUint::from(99u32), &[1; 20], &[1; 20]);
        assert_eq!(keys.iv_client_to_server.len(), 16);
        assert_eq!(keys.iv_server_to_client.len(), 8);
        assert_eq!(keys.key_client_to_server.len(), 32);
        assert_eq!(keys.key_server_to_client.len(), 24);
        assert_eq!(keys.mac_key_client_to_server.len(), 32);
        assert_eq!(keys.mac_key_server_to_client.len(), 20);
    }

    #[test]
    fn test_expect_message_disconnect() {
        let mut w = Writer::message(MessageType::Disconnect);
        w.uint32(3).string("no kex").string("");
        match expect_message(&w.into_vec(), MessageType::KexInit) {
            Err(KeelError::Disconnected {
                reason,
                description,
            }) => {
                assert_eq!(reason, 3);
                assert_eq!(description, "no kex");
            }
            other => panic!("Expected Disconnected, got {:?}", other),
        }
        assert!(matches!(
            expect_message(&[94], MessageType::NewKeys),
            Err(KeelError::Protocol(_))
        ));
    }
}
