//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! The SSH protocol begins with a version exchange where both client and server
//! send an identification string:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! The string without CR LF enters the exchange hash, so it is kept verbatim.
//!
//! # Security
//!
//! - Maximum line length: 255 bytes including CR LF
//! - Must start with "SSH-2.0-" and end with CR LF
//! - No null bytes allowed
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::version::{read_identification, Version};
//!
//! let version = Version::new("keel_0.1.0", None);
//! assert_eq!(version.to_string(), "SSH-2.0-keel_0.1.0");
//!
//! let mut input: &[u8] = b"SSH-2.0-OpenSSH_8.9\r\nrest";
//! assert_eq!(read_identification(&mut input).unwrap(), "SSH-2.0-OpenSSH_8.9");
//! ```

use keel_platform::{KeelError, KeelResult};
use std::io::{Read, Write};

/// Maximum length of an identification line (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// Required identification prefix.
pub const PROTOCOL_PREFIX: &str = "SSH-2.0-";

/// Local identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Software version (e.g., "keel_0.1.0")
    software_version: String,
    /// Optional comments
    comments: Option<String>,
}

impl Version {
    /// Creates a new SSH 2.0 identification.
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Returns the default identification, `SSH-2.0-keel_<version>`.
    pub fn default_keel() -> Self {
        Self::new(&format!("keel_{}", keel_platform::VERSION), None)
    }

    /// Returns the software version.
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Formats the line as sent on the wire (with CR LF).
    pub fn to_wire_format(&self) -> String {
        format!("{}\r\n", self)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", PROTOCOL_PREFIX, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

/// Writes the local identification line and flushes.
pub fn write_identification<W: Write>(output: &mut W, version: &Version) -> KeelResult<()> {
    output.write_all(version.to_wire_format().as_bytes())?;
    output.flush()?;
    Ok(())
}

/// Reads the peer identification line one byte at a time.
///
/// Returns the line without CR LF. Nothing past the LF is consumed.
///
/// # Errors
///
/// - [`KeelError::Protocol`] if the line is too long, lacks the `SSH-2.0-`
///   prefix or the CR LF terminator, or contains NUL or non-UTF-8 bytes
/// - [`KeelError::Io`] if the stream ends first
pub fn read_identification<R: Read>(input: &mut R) -> KeelResult<String> {
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];

    loop {
        input.read_exact(&mut byte)?;
        line.push(byte[0]);
        if byte[0] == b'\n' {
            break;
        }
        if line.len() >= MAX_VERSION_LENGTH {
            return Err(KeelError::Protocol(format!(
                "Identification line exceeds {} bytes",
                MAX_VERSION_LENGTH
            )));
        }
    }

    parse_identification(&line)
}

/// Validates a complete identification line and strips CR LF.
pub fn parse_identification(line: &[u8]) -> KeelResult<String> {
    let body = line
        .strip_suffix(b"\r\n")
        .ok_or_else(|| KeelError::Protocol("Identification line must end with CR LF".to_string()))?;

    if body.contains(&0) {
        return Err(KeelError::Protocol(
            "Identification line contains null bytes".to_string(),
        ));
    }

    let body = std::str::from_utf8(body)
        .map_err(|_| KeelError::Protocol("Identification line is not UTF-8".to_string()))?;

    if !body.starts_with(PROTOCOL_PREFIX) {
        return Err(KeelError::Protocol(format!(
            "Unsupported protocol version: {}",
            body
        )));
    }

    Ok(body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let v = Version::new("keel_1.2.3", Some("test build"));
        assert_eq!(v.to_string(), "SSH-2.0-keel_1.2.3 test build");
        assert_eq!(v.to_wire_format(), "SSH-2.0-keel_1.2.3 test build\r\n");
        assert!(Version::default_keel().to_string().starts_with("SSH-2.0-keel_"));
    }

    #[test]
    fn test_read_stops_at_newline() {
        let mut input: &[u8] = b"SSH-2.0-PuTTY_Release_0.78\r\n\x00\x00\x00\x0c";
        let id = read_identification(&mut input).unwrap();
        assert_eq!(id, "SSH-2.0-PuTTY_Release_0.78");
        assert_eq!(input, b"\x00\x00\x00\x0c");
    }

    #[test]
    fn test_rejects_bad_lines() {
        for line in [
            &b"SSH-1.5-old\r\n"[..],
            b"SSH-2.0-bare-lf\n",
            b"HTTP/1.1 200 OK\r\n",
            b"SSH-2.0-nul\x00\r\n",
        ] {
            assert!(
                matches!(parse_identification(line), Err(KeelError::Protocol(_))),
                "accepted {:?}",
                line
            );
        }
    }

    #[test]
    fn test_too_long() {
        let mut long = b"SSH-2.0-".to_vec();
        long.extend(std::iter::repeat(b'a').take(300));
        let mut input: &[u8] = &long;
        assert!(matches!(
            read_identification(&mut input),
            Err(KeelError::Protocol(_))
        ));
    }

    #[test]
    fn test_eof() {
        let mut input: &[u8] = b"SSH-2.0-cut";
        assert!(matches!(
            read_identification(&mut input),
            Err(KeelError::Io(_))
        ));
    }

    #[test]
    fn test_write() {
        let mut out = Vec::new();
        write_identification(&mut out, &Version::new("keel_0.1.0", None)).unwrap();
        assert_eq!(out, b"SSH-2.0-keel_0.1.0\r\n");
    }
}
