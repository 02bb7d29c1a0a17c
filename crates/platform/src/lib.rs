//! # keel platform
//!
//! Shared types for the keel SSH server crates.
//!
//! This crate provides:
//! - Unified error type (`KeelError`, `KeelResult`)
//! - The SSH disconnect reason codes errors map onto
//!
//! # Examples
//!
//! ```
//! use keel_platform::{KeelError, KeelResult};
//!
//! fn parse_port(s: &str) -> KeelResult<u16> {
//!     s.parse()
//!         .map_err(|_| KeelError::Config(format!("bad port: {}", s)))
//! }
//!
//! # fn main() -> KeelResult<()> {
//! assert_eq!(parse_port("2222")?, 2222);
//! assert!(parse_port("ssh").is_err());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{KeelError, KeelResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
