//! Protocol implementation for the keel SSH server.
//!
//! - **SSH** - a minimal single-channel SSH-2 server transport
//!
//! # Features
//!
//! - `ssh` (default) - SSH protocol support
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::Packet;
//!
//! // Create and serialize an SSH packet
//! let packet = Packet::new(b"SSH message payload".to_vec());
//! let wire_format = packet.to_bytes();
//!
//! // Parse from wire format
//! let parsed = Packet::from_bytes(&wire_format).unwrap();
//! assert_eq!(parsed.payload(), b"SSH message payload");
//! ```
//!
//! # Security
//!
//! - Vetted RustCrypto primitives (`rsa`, `aes`, `des`, `hmac`, `sha1`)
//! - Constant-time MAC comparison
//! - Key material zeroized on drop with `zeroize`
//! - A fuzz target for the packet decoder

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
