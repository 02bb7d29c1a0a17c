//! Error types for keel

use std::fmt;

/// SSH disconnect reason: protocol error.
pub const DISCONNECT_PROTOCOL_ERROR: u32 = 2;
/// SSH disconnect reason: key exchange failed.
pub const DISCONNECT_KEY_EXCHANGE_FAILED: u32 = 3;
/// SSH disconnect reason: MAC error.
pub const DISCONNECT_MAC_ERROR: u32 = 5;
/// SSH disconnect reason: service not available.
pub const DISCONNECT_SERVICE_NOT_AVAILABLE: u32 = 7;
/// SSH disconnect reason: by application.
pub const DISCONNECT_BY_APPLICATION: u32 = 11;

/// Unified error type for all keel operations
#[derive(Debug)]
pub enum KeelError {
    /// I/O error on the underlying byte stream
    Io(std::io::Error),

    /// Configuration error (bad key material, missing host key, ...)
    Config(String),

    /// Protocol error (malformed or truncated message)
    Protocol(String),

    /// Integrity error (MAC verification failed)
    Integrity(String),

    /// Algorithm negotiation or key exchange failure
    Negotiation(String),

    /// Security error (signature, key mismatch)
    Security(String),

    /// Not implemented
    NotImplemented(String),

    /// The connection was closed with a DISCONNECT message
    Disconnected {
        /// Reason code carried by the DISCONNECT message
        reason: u32,
        /// Human-readable description
        description: String,
    },

    /// Internal invariant violated
    Internal(String),
}

impl KeelError {
    /// Returns the disconnect reason to announce when this error ends a session.
    ///
    /// `None` means no DISCONNECT should be attempted: either the stream is
    /// unusable or the connection is already gone.
    pub fn disconnect_reason(&self) -> Option<u32> {
        match self {
            KeelError::Io(_) | KeelError::Disconnected { .. } => None,
            KeelError::Protocol(_) => Some(DISCONNECT_PROTOCOL_ERROR),
            KeelError::Integrity(_) => Some(DISCONNECT_MAC_ERROR),
            KeelError::Negotiation(_) | KeelError::Security(_) => {
                Some(DISCONNECT_KEY_EXCHANGE_FAILED)
            }
            KeelError::Config(_) | KeelError::NotImplemented(_) | KeelError::Internal(_) => {
                Some(DISCONNECT_BY_APPLICATION)
            }
        }
    }

    /// Returns true if this error is an orderly end of the connection.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, KeelError::Disconnected { .. })
    }
}

impl fmt::Display for KeelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeelError::Io(e) => write!(f, "IO error: {}", e),
            KeelError::Config(msg) => write!(f, "Configuration error: {}", msg),
            KeelError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            KeelError::Integrity(msg) => write!(f, "Integrity error: {}", msg),
            KeelError::Negotiation(msg) => write!(f, "Negotiation error: {}", msg),
            KeelError::Security(msg) => write!(f, "Security error: {}", msg),
            KeelError::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            KeelError::Disconnected {
                reason,
                description,
            } => write!(f, "Disconnected (reason {}): {}", reason, description),
            KeelError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for KeelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KeelError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KeelError {
    fn from(err: std::io::Error) -> Self {
        KeelError::Io(err)
    }
}

/// Result type for keel operations
pub type KeelResult<T> = Result<T, KeelError>;
