//! Authorized public keys per user (OpenSSH line format).
//!
//! # Format
//!
//! Each entry is one line:
//! ```text
//! [options] keytype base64-key [comment]
//! ```
//!
//! Options are tolerated and kept but not enforced.
//!
//! # Stores
//!
//! - [`MemoryKeyStore`]: in-process map, for tests and embedding
//! - [`DirectoryKeyStore`]: one file per user, named after the user
//!
//! # Example
//!
//! ```rust,no_run
//! use keel_proto::ssh::authorized_keys::{AuthorizedKeyStore, DirectoryKeyStore};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = DirectoryKeyStore::new("/etc/keel/users");
//! if let Some(key) = store.lookup("alice")? {
//!     println!("Algorithm: {}", key.algorithm());
//! }
//! # Ok(())
//! # }
//! ```

use base64::Engine;
use keel_platform::{KeelError, KeelResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A single authorized key entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedKey {
    /// Key options (e.g., "no-port-forwarding")
    options: Vec<String>,
    /// Algorithm name (e.g., "ssh-rsa")
    algorithm: String,
    /// Public key blob (SSH wire format)
    key_data: Vec<u8>,
    /// Optional comment
    comment: String,
}

impl AuthorizedKey {
    /// Creates a new authorized key entry.
    pub fn new(algorithm: String, key_data: Vec<u8>, comment: String) -> Self {
        Self {
            options: Vec::new(),
            algorithm,
            key_data,
            comment,
        }
    }

    /// Returns the key options.
    pub fn options(&self) -> &[String] {
        &self.options
    }

    /// Returns the algorithm name.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Returns the public key blob.
    pub fn key_data(&self) -> &[u8] {
        &self.key_data
    }

    /// Returns the comment.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Returns true if this entry is `algorithm` with exactly this blob.
    pub fn matches(&self, algorithm: &str, key_data: &[u8]) -> bool {
        self.algorithm == algorithm && self.key_data == key_data
    }

    /// Parses one line.
    ///
    /// ```rust
    /// use keel_proto::ssh::authorized_keys::AuthorizedKey;
    ///
    /// let key = AuthorizedKey::parse_line("ssh-rsa AAAAB3NzaC1yc2E= alice@host").unwrap();
    /// assert_eq!(key.algorithm(), "ssh-rsa");
    /// assert_eq!(key.key_data(), b"\x00\x00\x00\x07ssh-rsa");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Config`] for blank or comment lines, a missing
    /// key type, or invalid base64.
    pub fn parse_line(line: &str) -> KeelResult<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Err(KeelError::Config("Empty or comment line".to_string()));
        }

        let parts: Vec<&str> = line.split_whitespace().collect();

        let algorithm_idx = parts
            .iter()
            .position(|p| Self::is_key_type(p))
            .ok_or_else(|| {
                KeelError::Config("No key type found in authorized key line".to_string())
            })?;
        let options = parts[..algorithm_idx]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let base64_key = parts.get(algorithm_idx + 1).ok_or_else(|| {
            KeelError::Config("Missing key data in authorized key line".to_string())
        })?;

        let key_data = base64::engine::general_purpose::STANDARD
            .decode(base64_key)
            .map_err(|e| KeelError::Config(format!("Invalid base64 key data: {}", e)))?;

        let comment = parts
            .get(algorithm_idx + 2..)
            .map(|rest| rest.join(" "))
            .unwrap_or_default();

        Ok(Self {
            options,
            algorithm: parts[algorithm_idx].to_string(),
            key_data,
            comment,
        })
    }

    fn is_key_type(s: &str) -> bool {
        matches!(
            s,
            "ssh-rsa"
                | "ssh-dss"
                | "rsa-sha2-256"
                | "rsa-sha2-512"
                | "ssh-ed25519"
                | "ecdsa-sha2-nistp256"
                | "ecdsa-sha2-nistp384"
                | "ecdsa-sha2-nistp521"
        )
    }
}

/// Source of authorized keys, looked up by user name.
pub trait AuthorizedKeyStore: Send + Sync {
    /// Returns the user's key, or `None` if the user is unknown.
    fn lookup(&self, user: &str) -> KeelResult<Option<AuthorizedKey>>;
}

/// Keys held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyStore {
    keys: HashMap<String, AuthorizedKey>,
}

impl MemoryKeyStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the key of a user.
    pub fn insert(&mut self, user: impl Into<String>, key: AuthorizedKey) {
        self.keys.insert(user.into(), key);
    }

    /// Parses and sets the key of a user.
    pub fn insert_line(&mut self, user: impl Into<String>, line: &str) -> KeelResult<()> {
        let key = AuthorizedKey::parse_line(line)?;
        self.insert(user, key);
        Ok(())
    }
}

impl AuthorizedKeyStore for MemoryKeyStore {
    fn lookup(&self, user: &str) -> KeelResult<Option<AuthorizedKey>> {
        Ok(self.keys.get(user).cloned())
    }
}

/// One file per user under a directory.
///
/// The file is named after the user and its first key line is used. Names
/// that could escape the directory are treated as unknown users.
#[derive(Debug, Clone)]
pub struct DirectoryKeyStore {
    dir: PathBuf,
}

impl DirectoryKeyStore {
    /// Creates a store over `dir`.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Returns the directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn is_safe_name(user: &str) -> bool {
        !user.is_empty()
            && !user.starts_with('.')
            && !user.contains(['/', '\\', '\0'])
    }
}

impl AuthorizedKeyStore for DirectoryKeyStore {
    fn lookup(&self, user: &str) -> KeelResult<Option<AuthorizedKey>> {
        if !Self::is_safe_name(user) {
            debug!(user, "rejected user name");
            return Ok(None);
        }

        let content = match std::fs::read_to_string(self.dir.join(user)) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(KeelError::Io(e)),
        };

        content
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'))
            .map(AuthorizedKey::parse_line)
            .transpose()
    }
}
