//! A minimal SSH-2 server transport (RFC 4251-4254).
//!
//! # Architecture
//!
//! Layers, leaves first:
//!
//! 1. **Wire codec** ([`wire`]) - typed fields of every message
//! 2. **Packet protocol** ([`packet`]) - framing, padding, CBC encryption, MAC
//! 3. **Key exchange** ([`kex`], [`kex_dh`], [`hostkey`]) - negotiation,
//!    Diffie-Hellman group1/group14, key derivation and activation
//! 4. **Dispatcher** ([`dispatcher`]) - routes packets by message type
//! 5. **Authentication** ([`auth`], [`authorized_keys`]) - publickey only
//! 6. **Channel** ([`channel`], [`connection`]) - one session channel with
//!    window flow control and an external [`channel::Executor`]
//! 7. **Server** ([`server`]) - ties the layers into a session main loop
//!
//! Everything is synchronous and runs on the caller's thread; one
//! [`server::Server`] serves each connection with its own blocking call.
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::Packet;
//!
//! let packet = Packet::new(b"payload".to_vec());
//! let bytes = packet.to_bytes();
//!
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), b"payload");
//! ```
//!
//! # References
//!
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

pub mod auth;
pub mod authorized_keys;
pub mod channel;
pub mod connection;
pub mod crypto;
pub mod dispatcher;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod message;
pub mod packet;
pub mod server;
pub mod transport;
pub mod version;
pub mod wire;

// Re-export main types
pub use auth::{AuthMethod, AuthRequest, Authenticator};
pub use authorized_keys::{AuthorizedKey, AuthorizedKeyStore, DirectoryKeyStore, MemoryKeyStore};
pub use channel::{Channel, Executor, WindowPolicy};
pub use crypto::{Capabilities, CipherAlgorithm, CompressionAlgorithm, MacAlgorithm};
pub use dispatcher::{Dispatcher, Handler, Route};
pub use hostkey::{load_host_key, HostKey, HostKeyAlgorithm, HostKeys, RsaHostKey};
pub use kex::{KexInit, KexOutcome, KeyExchange, NegotiatedAlgorithms};
pub use kex_dh::{DhExchange, DhGroup};
pub use message::MessageType;
pub use packet::{Packet, PacketProtocol};
pub use server::{Server, ServerConfig};
pub use transport::WaitReadable;
pub use version::Version;
