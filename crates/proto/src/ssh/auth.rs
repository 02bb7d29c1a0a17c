//! SSH user authentication (RFC 4252), publickey method only.
//!
//! [`Authenticator`] answers SSH_MSG_USERAUTH_REQUEST messages:
//!
//! - unsigned request for a known user: SSH_MSG_USERAUTH_PK_OK, still
//!   unauthenticated
//! - signed request with a valid signature over the session identifier:
//!   SSH_MSG_USERAUTH_SUCCESS
//! - anything else: SSH_MSG_USERAUTH_FAILURE listing "publickey"
//!
//! Once authenticated, every further request fails with an empty method
//! list.
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::auth::{AuthMethod, AuthRequest};
//!
//! let request = AuthRequest::new(
//!     "alice",
//!     "ssh-connection",
//!     AuthMethod::PublicKey {
//!         algorithm: "ssh-rsa".to_string(),
//!         public_key: vec![0, 0, 0, 7],
//!         signature: None,
//!     },
//! );
//! let parsed = AuthRequest::from_bytes(&request.to_bytes()).unwrap();
//! assert_eq!(parsed, request);
//! ```

use crate::ssh::authorized_keys::AuthorizedKeyStore;
use crate::ssh::hostkey::{verify_signature, HostKeyAlgorithm};
use crate::ssh::message::MessageType;
use crate::ssh::wire::{Reader, Writer};
use keel_platform::KeelResult;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Service that must be requested in every authentication request.
pub const CONNECTION_SERVICE: &str = "ssh-connection";

/// The only supported method.
pub const PUBLICKEY_METHOD: &str = "publickey";

/// Authentication method of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Public key authentication.
    PublicKey {
        /// Algorithm name (e.g., "ssh-rsa")
        algorithm: String,
        /// Public key blob
        public_key: Vec<u8>,
        /// Signature (if present)
        signature: Option<Vec<u8>>,
    },
    /// Any other method, kept by name only.
    Other(String),
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &str {
        match self {
            AuthMethod::PublicKey { .. } => PUBLICKEY_METHOD,
            AuthMethod::Other(name) => name,
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST message (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// User name
    user_name: String,
    /// Service name (usually "ssh-connection")
    service_name: String,
    /// Authentication method
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates a new authentication request.
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the authentication method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Serializes to bytes.
    ///
    /// Format (publickey):
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    "publickey"
    /// boolean   has signature
    /// string    public key algorithm name
    /// string    public key blob
    /// [string   signature]
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::UserauthRequest);
        w.string(&self.user_name)
            .string(&self.service_name)
            .string(self.method.name());

        if let AuthMethod::PublicKey {
            algorithm,
            public_key,
            signature,
        } = &self.method
        {
            w.boolean(signature.is_some())
                .string(algorithm)
                .string(public_key);
            if let Some(sig) = signature {
                w.string(sig);
            }
        }

        w.into_vec()
    }

    /// Parses from bytes. Method-specific fields of other methods are ignored.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut r = Reader::message(data, MessageType::UserauthRequest)?;
        let user_name = r.utf8()?.to_string();
        let service_name = r.utf8()?.to_string();
        let method_name = r.utf8()?;

        let method = if method_name == PUBLICKEY_METHOD {
            let has_signature = r.boolean()?;
            let algorithm = r.utf8()?.to_string();
            let public_key = r.string()?.to_vec();
            let signature = if has_signature {
                Some(r.string()?.to_vec())
            } else {
                None
            };
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            }
        } else {
            AuthMethod::Other(method_name.to_string())
        };

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE payload.
pub fn failure_message(methods: &[&str]) -> Vec<u8> {
    let mut w = Writer::message(MessageType::UserauthFailure);
    w.name_list(methods).boolean(false);
    w.into_vec()
}

/// SSH_MSG_USERAUTH_PK_OK payload.
pub fn pk_ok_message(algorithm: &str, public_key: &[u8]) -> Vec<u8> {
    let mut w = Writer::message(MessageType::UserauthPkOk);
    w.string(algorithm).string(public_key);
    w.into_vec()
}

/// Constructs the data a publickey signature covers (RFC 4252 Section 7).
///
/// ```text
/// string    session identifier
/// byte      SSH_MSG_USERAUTH_REQUEST
/// string    user name
/// string    service name
/// string    "publickey"
/// boolean   TRUE
/// string    public key algorithm name
/// string    public key blob
/// ```
pub fn construct_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key: &[u8],
) -> Vec<u8> {
    let mut w = Writer::new();
    w.string(session_id)
        .byte(MessageType::UserauthRequest as u8)
        .string(user_name)
        .string(service_name)
        .string(PUBLICKEY_METHOD)
        .boolean(true)
        .string(algorithm)
        .string(public_key);
    w.into_vec()
}

/// Authentication state of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// No successful request yet
    Unauthenticated,
    /// A signed request succeeded
    Authenticated {
        /// Authenticated user
        user: String,
        /// Service the user asked for
        service: String,
    },
}

/// Publickey authentication state machine for one session.
pub struct Authenticator {
    store: Arc<dyn AuthorizedKeyStore>,
    state: AuthState,
}

impl Authenticator {
    /// Creates an unauthenticated authenticator backed by `store`.
    pub fn new(store: Arc<dyn AuthorizedKeyStore>) -> Self {
        Self {
            store,
            state: AuthState::Unauthenticated,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> &AuthState {
        &self.state
    }

    /// Returns true once a signed request has succeeded.
    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, AuthState::Authenticated { .. })
    }

    /// Returns the authenticated user.
    pub fn user(&self) -> Option<&str> {
        match &self.state {
            AuthState::Authenticated { user, .. } => Some(user),
            AuthState::Unauthenticated => None,
        }
    }

    /// Returns the service the authenticated user asked for.
    pub fn service(&self) -> Option<&str> {
        match &self.state {
            AuthState::Authenticated { service, .. } => Some(service),
            AuthState::Unauthenticated => None,
        }
    }

    /// Handles one USERAUTH_REQUEST payload and returns the reply payload.
    ///
    /// # Errors
    ///
    /// Only a malformed request is an error ([`KeelError::Protocol`]);
    /// every authentication failure is a FAILURE reply.
    ///
    /// [`KeelError::Protocol`]: keel_platform::KeelError::Protocol
    pub fn handle_request(&mut self, session_id: &[u8], payload: &[u8]) -> KeelResult<Vec<u8>> {
        if self.is_authenticated() {
            debug!("authentication request after success");
            return Ok(failure_message(&[]));
        }

        let request = AuthRequest::from_bytes(payload)?;
        let user = request.user_name();
        let service = request.service_name();

        let (algorithm, public_key, signature) = match request.method() {
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } if service == CONNECTION_SERVICE => (algorithm, public_key, signature),
            method => {
                debug!(user, service, method = method.name(), "unsupported request");
                return Ok(failure_message(&[PUBLICKEY_METHOD]));
            }
        };

        if algorithm != HostKeyAlgorithm::SshRsa.name() {
            debug!(user, algorithm = %algorithm, "unsupported key algorithm");
            return Ok(failure_message(&[PUBLICKEY_METHOD]));
        }

        let stored = match self.store.lookup(user) {
            Ok(Some(key)) => key,
            Ok(None) => {
                debug!(user, "unknown user");
                return Ok(failure_message(&[PUBLICKEY_METHOD]));
            }
            Err(e) => {
                warn!(user, error = %e, "authorized key lookup failed");
                return Ok(failure_message(&[PUBLICKEY_METHOD]));
            }
        };

        let Some(signature) = signature else {
            debug!(user, "public key query");
            return Ok(pk_ok_message(algorithm, public_key));
        };

        if !stored.matches(algorithm, public_key) {
            debug!(user, "key is not authorized");
            return Ok(failure_message(&[PUBLICKEY_METHOD]));
        }

        let data = construct_signature_data(session_id, user, service, algorithm, public_key);
        match verify_signature(stored.key_data(), &data, signature) {
            Ok(true) => {
                info!(user, service, "user authenticated");
                self.state = AuthState::Authenticated {
                    user: user.to_string(),
                    service: service.to_string(),
                };
                Ok(vec![MessageType::UserauthSuccess as u8])
            }
            Ok(false) => {
                warn!(user, "bad signature");
                Ok(failure_message(&[PUBLICKEY_METHOD]))
            }
            Err(e) => {
                warn!(user, error = %e, "signature not checked");
                Ok(failure_message(&[PUBLICKEY_METHOD]))
            }
        }
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("state", &self.state)
            .finish()
    }
}
