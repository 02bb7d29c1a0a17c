//! SSH connection protocol messages (RFC 4254).
//!
//! Only what a single session channel needs:
//! - channel open, confirmation and failure
//! - window adjust, data and extended data
//! - channel requests: pty-req, env, shell, exec, exit-status
//! - eof, close, success, failure
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::connection::{ChannelOpen, SESSION_CHANNEL_TYPE};
//!
//! let open = ChannelOpen::new(SESSION_CHANNEL_TYPE, 0, 1048576, 32768);
//! let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
//! assert!(parsed.is_session());
//! ```

use crate::ssh::message::MessageType;
use crate::ssh::wire::{Reader, Writer};
use keel_platform::KeelResult;

/// The only accepted channel type.
pub const SESSION_CHANNEL_TYPE: &str = "session";

/// Extended data type code for stderr (RFC 4254 Section 5.2).
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// SSH_MSG_CHANNEL_OPEN message (RFC 4254 Section 5.1).
///
/// Type-specific data after the common fields is not parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// Channel type
    channel_type: String,
    /// Sender channel number
    sender_channel: u32,
    /// Initial window size
    initial_window_size: u32,
    /// Maximum packet size
    maximum_packet_size: u32,
}

impl ChannelOpen {
    /// Creates a new channel open message.
    pub fn new(
        channel_type: &str,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            channel_type: channel_type.to_string(),
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Returns the channel type.
    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Returns true for a "session" channel.
    pub fn is_session(&self) -> bool {
        self.channel_type == SESSION_CHANNEL_TYPE
    }

    /// Returns the sender channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the initial window size.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Serializes to bytes.
    ///
    /// Format (RFC 4254 Section 5.1):
    /// ```text
    /// byte      SSH_MSG_CHANNEL_OPEN (90)
    /// string    channel type
    /// uint32    sender channel
    /// uint32    initial window size
    /// uint32    maximum packet size
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::ChannelOpen);
        w.string(&self.channel_type)
            .uint32(self.sender_channel)
            .uint32(self.initial_window_size)
            .uint32(self.maximum_packet_size);
        w.into_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut r = Reader::message(data, MessageType::ChannelOpen)?;
        Ok(Self {
            channel_type: String::from_utf8_lossy(r.string()?).into_owned(),
            sender_channel: r.uint32()?,
            initial_window_size: r.uint32()?,
            maximum_packet_size: r.uint32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Sender channel number
    pub sender_channel: u32,
    /// Initial window size
    pub initial_window_size: u32,
    /// Maximum packet size
    pub maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::ChannelOpenConfirmation);
        w.uint32(self.recipient_channel)
            .uint32(self.sender_channel)
            .uint32(self.initial_window_size)
            .uint32(self.maximum_packet_size);
        w.into_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut r = Reader::message(data, MessageType::ChannelOpenConfirmation)?;
        Ok(Self {
            recipient_channel: r.uint32()?,
            sender_channel: r.uint32()?,
            initial_window_size: r.uint32()?,
            maximum_packet_size: r.uint32()?,
        })
    }
}

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// Administratively prohibited
    AdministrativelyProhibited = 1,
    /// Connect failed
    ConnectFailed = 2,
    /// Unknown channel type
    UnknownChannelType = 3,
    /// Resource shortage
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Converts from u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE payload.
///
/// ```text
/// byte      SSH_MSG_CHANNEL_OPEN_FAILURE (92)
/// uint32    recipient channel
/// uint32    reason code
/// string    description
/// string    language tag
/// ```
pub fn open_failure_message(
    recipient_channel: u32,
    reason: ChannelOpenFailureReason,
    description: &str,
) -> Vec<u8> {
    let mut w = Writer::message(MessageType::ChannelOpenFailure);
    w.uint32(recipient_channel)
        .uint32(reason as u32)
        .string(description)
        .string("");
    w.into_vec()
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST payload.
pub fn window_adjust_message(recipient_channel: u32, bytes_to_add: u32) -> Vec<u8> {
    let mut w = Writer::message(MessageType::ChannelWindowAdjust);
    w.uint32(recipient_channel).uint32(bytes_to_add);
    w.into_vec()
}

/// SSH_MSG_CHANNEL_DATA payload.
pub fn data_message(recipient_channel: u32, data: &[u8]) -> Vec<u8> {
    let mut w = Writer::message(MessageType::ChannelData);
    w.uint32(recipient_channel).string(data);
    w.into_vec()
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA payload.
pub fn extended_data_message(recipient_channel: u32, data_type_code: u32, data: &[u8]) -> Vec<u8> {
    let mut w = Writer::message(MessageType::ChannelExtendedData);
    w.uint32(recipient_channel)
        .uint32(data_type_code)
        .string(data);
    w.into_vec()
}

/// A message carrying only a recipient channel: EOF, CLOSE, SUCCESS or FAILURE.
pub fn channel_message(msg_type: MessageType, recipient_channel: u32) -> Vec<u8> {
    let mut w = Writer::message(msg_type);
    w.uint32(recipient_channel);
    w.into_vec()
}

/// Reads the recipient channel of any channel message.
pub fn recipient_channel(payload: &[u8]) -> KeelResult<u32> {
    let mut r = Reader::new(payload);
    r.byte()?;
    r.uint32()
}

/// Parses WINDOW_ADJUST into `(recipient, bytes_to_add)`.
pub fn parse_window_adjust(payload: &[u8]) -> KeelResult<(u32, u32)> {
    let mut r = Reader::message(payload, MessageType::ChannelWindowAdjust)?;
    Ok((r.uint32()?, r.uint32()?))
}

/// Parses CHANNEL_DATA into `(recipient, data)`.
pub fn parse_data(payload: &[u8]) -> KeelResult<(u32, &[u8])> {
    let mut r = Reader::message(payload, MessageType::ChannelData)?;
    Ok((r.uint32()?, r.string()?))
}

/// Channel request type (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// PTY request (pseudoterminal allocation)
    PtyReq {
        /// Terminal type (e.g., "xterm")
        term: String,
        /// Terminal width in characters
        width_chars: u32,
        /// Terminal height in rows
        height_rows: u32,
        /// Terminal width in pixels
        width_pixels: u32,
        /// Terminal height in pixels
        height_pixels: u32,
        /// Encoded terminal modes
        modes: Vec<u8>,
    },
    /// Environment variable
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// Execute command
    Exec {
        /// Command to execute
        command: String,
    },
    /// Start interactive shell
    Shell,
    /// Exit status
    ExitStatus {
        /// Exit status code
        exit_status: u32,
    },
    /// Any other request, by name. Its data is not parsed.
    Other(String),
}

impl ChannelRequestType {
    /// Returns the request type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::PtyReq { .. } => "pty-req",
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::Other(name) => name,
        }
    }
}

/// SSH_MSG_CHANNEL_REQUEST message (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Recipient channel number
    recipient_channel: u32,
    /// Request type
    request_type: ChannelRequestType,
    /// Want reply flag
    want_reply: bool,
}

impl ChannelRequest {
    /// Creates a new channel request.
    pub fn new(recipient_channel: u32, request_type: ChannelRequestType, want_reply: bool) -> Self {
        Self {
            recipient_channel,
            request_type,
            want_reply,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the request type.
    pub fn request_type(&self) -> &ChannelRequestType {
        &self.request_type
    }

    /// Returns whether a reply is wanted.
    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::ChannelRequest);
        w.uint32(self.recipient_channel)
            .string(self.request_type.name())
            .boolean(self.want_reply);

        match &self.request_type {
            ChannelRequestType::PtyReq {
                term,
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
                modes,
            } => {
                w.string(term)
                    .uint32(*width_chars)
                    .uint32(*height_rows)
                    .uint32(*width_pixels)
                    .uint32(*height_pixels)
                    .string(modes);
            }
            ChannelRequestType::Env { name, value } => {
                w.string(name).string(value);
            }
            ChannelRequestType::Exec { command } => {
                w.string(command);
            }
            ChannelRequestType::ExitStatus { exit_status } => {
                w.uint32(*exit_status);
            }
            ChannelRequestType::Shell | ChannelRequestType::Other(_) => {}
        }

        w.into_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut r = Reader::message(data, MessageType::ChannelRequest)?;
        let recipient_channel = r.uint32()?;
        let request_name = String::from_utf8_lossy(r.string()?).into_owned();
        let want_reply = r.boolean()?;

        let request_type = match request_name.as_str() {
            "pty-req" => ChannelRequestType::PtyReq {
                term: String::from_utf8_lossy(r.string()?).into_owned(),
                width_chars: r.uint32()?,
                height_rows: r.uint32()?,
                width_pixels: r.uint32()?,
                height_pixels: r.uint32()?,
                modes: r.string()?.to_vec(),
            },
            "env" => ChannelRequestType::Env {
                name: String::from_utf8_lossy(r.string()?).into_owned(),
                value: String::from_utf8_lossy(r.string()?).into_owned(),
            },
            "exec" => ChannelRequestType::Exec {
                command: String::from_utf8_lossy(r.string()?).into_owned(),
            },
            "shell" => ChannelRequestType::Shell,
            "exit-status" => ChannelRequestType::ExitStatus {
                exit_status: r.uint32()?,
            },
            _ => ChannelRequestType::Other(request_name),
        };

        Ok(Self {
            recipient_channel,
            request_type,
            want_reply,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_failure_layout() {
        let msg = open_failure_message(
            7,
            ChannelOpenFailureReason::AdministrativelyProhibited,
            "Only one channel at the time is supported.",
        );
        let mut r = Reader::message(&msg, MessageType::ChannelOpenFailure).unwrap();
        assert_eq!(r.uint32().unwrap(), 7);
        assert_eq!(
            ChannelOpenFailureReason::from_u32(r.uint32().unwrap()),
            Some(ChannelOpenFailureReason::AdministrativelyProhibited)
        );
        assert_eq!(r.utf8().unwrap(), "Only one channel at the time is supported.");
        assert_eq!(r.string().unwrap(), b"");
        assert!(r.is_empty());
    }

    #[test]
    fn test_open_ignores_type_specific_data() {
        let mut w = Writer::message(MessageType::ChannelOpen);
        w.string("direct-tcpip")
            .uint32(3)
            .uint32(100)
            .uint32(200)
            .string("example.com")
            .uint32(80);
        let open = ChannelOpen::from_bytes(&w.into_vec()).unwrap();
        assert_eq!(open.channel_type(), "direct-tcpip");
        assert!(!open.is_session());
        assert_eq!(open.sender_channel(), 3);
        assert_eq!(open.initial_window_size(), 100);
        assert_eq!(open.maximum_packet_size(), 200);
    }

    #[test]
    fn test_request_pty() {
        let request = ChannelRequest::new(
            0,
            ChannelRequestType::PtyReq {
                term: "xterm-256color".to_string(),
                width_chars: 80,
                height_rows: 24,
                width_pixels: 640,
                height_pixels: 480,
                modes: vec![0],
            },
            true,
        );
        let parsed = ChannelRequest::from_bytes(&request.to_bytes()).unwrap();
        assert_eq!(parsed, request);
        assert_eq!(parsed.request_type().name(), "pty-req");
    }

    #[test]
    fn test_request_unknown_type() {
        let mut w = Writer::message(MessageType::ChannelRequest);
        w.uint32(0)
            .string("x11-req")
            .boolean(true)
            .boolean(false)
            .string("MIT-MAGIC-COOKIE-1");
        let parsed = ChannelRequest::from_bytes(&w.into_vec()).unwrap();
        assert_eq!(
            parsed.request_type(),
            &ChannelRequestType::Other("x11-req".to_string())
        );
        assert!(parsed.want_reply());
    }

    #[test]
    fn test_request_truncated() {
        let mut w = Writer::message(MessageType::ChannelRequest);
        w.uint32(0).string("exec").boolean(false);
        assert!(ChannelRequest::from_bytes(&w.into_vec()).is_err());
    }

    #[test]
    fn test_small_messages() {
        assert_eq!(
            channel_message(MessageType::ChannelEof, 5),
            vec![96, 0, 0, 0, 5]
        );
        assert_eq!(recipient_channel(&data_message(9, b"hi")).unwrap(), 9);
        assert_eq!(parse_data(&data_message(9, b"hi")).unwrap(), (9, &b"hi"[..]));
        assert_eq!(
            parse_window_adjust(&window_adjust_message(2, 0x7fff_ffff)).unwrap(),
            (2, 0x7fff_ffff)
        );
        let ext = extended_data_message(1, EXTENDED_DATA_STDERR, b"err");
        assert_eq!(&ext[..9], &[95, 0, 0, 0, 1, 0, 0, 0, 1]);
    }
}
