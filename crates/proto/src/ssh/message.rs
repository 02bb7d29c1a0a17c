//! SSH message numbers understood by the server (RFC 4250 Section 4.1).
//!
//! The set is closed: anything not listed here is answered with
//! SSH_MSG_UNIMPLEMENTED by the [`Dispatcher`](crate::ssh::dispatcher::Dispatcher).
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::message::MessageType;
//!
//! assert_eq!(MessageType::of(&[94, 0, 0, 0, 0]), Some(MessageType::ChannelData));
//! assert_eq!(MessageType::of(&[80]), None); // global requests are not supported
//! ```

/// SSH message types handled by this implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Terminates the connection.
    Disconnect = 1,
    /// Padding or keep-alive, no semantics.
    Ignore = 2,
    /// Reply to a message the receiver does not implement.
    Unimplemented = 3,
    /// Debug text.
    Debug = 4,
    /// Service request ("ssh-userauth").
    ServiceRequest = 5,
    /// Service accepted.
    ServiceAccept = 6,
    /// Algorithm negotiation.
    KexInit = 20,
    /// Switch to the negotiated keys.
    NewKeys = 21,
    /// Diffie-Hellman client public value.
    KexdhInit = 30,
    /// Diffie-Hellman server reply.
    KexdhReply = 31,
    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// Public key is acceptable.
    UserauthPkOk = 60,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel request succeeded.
    ChannelSuccess = 99,
    /// Channel request failed.
    ChannelFailure = 100,
}

impl MessageType {
    /// Every known message type, in numeric order.
    pub const ALL: [MessageType; 25] = [
        MessageType::Disconnect,
        MessageType::Ignore,
        MessageType::Unimplemented,
        MessageType::Debug,
        MessageType::ServiceRequest,
        MessageType::ServiceAccept,
        MessageType::KexInit,
        MessageType::NewKeys,
        MessageType::KexdhInit,
        MessageType::KexdhReply,
        MessageType::UserauthRequest,
        MessageType::UserauthFailure,
        MessageType::UserauthSuccess,
        MessageType::UserauthPkOk,
        MessageType::ChannelOpen,
        MessageType::ChannelOpenConfirmation,
        MessageType::ChannelOpenFailure,
        MessageType::ChannelWindowAdjust,
        MessageType::ChannelData,
        MessageType::ChannelExtendedData,
        MessageType::ChannelEof,
        MessageType::ChannelClose,
        MessageType::ChannelRequest,
        MessageType::ChannelSuccess,
        MessageType::ChannelFailure,
    ];

    /// Converts a message number to a known type.
    pub fn from_u8(byte: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| *t as u8 == byte)
    }

    /// Returns the type of a payload, judged by its first byte.
    pub fn of(payload: &[u8]) -> Option<Self> {
        payload.first().and_then(|&b| Self::from_u8(b))
    }

    /// Returns the RFC name, e.g. `SSH_MSG_KEXINIT`.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEXDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEXDH_REPLY",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthPkOk => "SSH_MSG_USERAUTH_PK_OK",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}
