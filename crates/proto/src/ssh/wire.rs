//! SSH wire encoding of primitive field types (RFC 4251 Section 5).
//!
//! Every message in this crate is built with a [`Writer`] and parsed with a
//! [`Reader`]. Both operate strictly left to right.
//!
//! # Field Types
//!
//! ```text
//! byte       single octet
//! boolean    single octet, 0 = false, anything else = true
//! uint32     4 bytes big-endian
//! string     uint32 length + bytes
//! mpint      uint32 length + two's-complement big-endian magnitude
//! name-list  string holding comma-separated ASCII names
//! raw        bytes with no length prefix (pre-built sub-messages)
//! ```
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::wire::{Reader, Writer};
//!
//! let mut writer = Writer::new();
//! writer.byte(94).uint32(7).string(b"ls\r");
//! let bytes = writer.into_vec();
//!
//! let mut reader = Reader::new(&bytes);
//! assert_eq!(reader.byte().unwrap(), 94);
//! assert_eq!(reader.uint32().unwrap(), 7);
//! assert_eq!(reader.string().unwrap(), b"ls\r");
//! assert!(reader.is_empty());
//! ```

use crate::ssh::message::MessageType;
use bytes::{BufMut, BytesMut};
use keel_platform::{KeelError, KeelResult};
use num_bigint::BigUint;

/// A typed wire field.
///
/// Used where a message is described as an ordered list of values rather
/// than built call by call, e.g. [`encode`] / [`decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    /// Single byte
    Byte(u8),
    /// Boolean
    Boolean(bool),
    /// 32-bit unsigned integer
    Uint32(u32),
    /// Length-prefixed byte string
    String(Vec<u8>),
    /// Non-negative arbitrary precision integer
    Mpint(BigUint),
    /// Comma-joined name list
    NameList(Vec<String>),
    /// Unprefixed bytes; on decode consumes the remaining input
    Raw(Vec<u8>),
}

/// The type of a [`Field`], used to drive [`decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Single byte
    Byte,
    /// Boolean
    Boolean,
    /// 32-bit unsigned integer
    Uint32,
    /// Length-prefixed byte string
    String,
    /// Arbitrary precision integer
    Mpint,
    /// Name list
    NameList,
    /// Remaining bytes
    Raw,
}

impl Field {
    /// Returns the kind of this field.
    pub fn kind(&self) -> FieldKind {
        match self {
            Field::Byte(_) => FieldKind::Byte,
            Field::Boolean(_) => FieldKind::Boolean,
            Field::Uint32(_) => FieldKind::Uint32,
            Field::String(_) => FieldKind::String,
            Field::Mpint(_) => FieldKind::Mpint,
            Field::NameList(_) => FieldKind::NameList,
            Field::Raw(_) => FieldKind::Raw,
        }
    }
}

/// Encodes an ordered list of fields.
pub fn encode(fields: &[Field]) -> Vec<u8> {
    let mut writer = Writer::new();
    for field in fields {
        writer.field(field);
    }
    writer.into_vec()
}

/// Decodes `data` according to `kinds`, left to right.
///
/// Trailing bytes after the last field are allowed; only a [`FieldKind::Raw`]
/// field consumes them.
///
/// # Errors
///
/// Returns [`KeelError::Protocol`] if the input runs out before a field is
/// complete.
pub fn decode(kinds: &[FieldKind], data: &[u8]) -> KeelResult<Vec<Field>> {
    let mut reader = Reader::new(data);
    kinds.iter().map(|kind| reader.field(*kind)).collect()
}

/// Incremental message builder.
#[derive(Debug, Clone, Default)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Creates a writer whose first byte is the message type.
    pub fn message(msg_type: MessageType) -> Self {
        let mut writer = Self::new();
        writer.byte(msg_type as u8);
        writer
    }

    /// Appends a byte.
    pub fn byte(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    /// Appends a boolean.
    pub fn boolean(&mut self, value: bool) -> &mut Self {
        self.buf.put_u8(u8::from(value));
        self
    }

    /// Appends a big-endian uint32.
    pub fn uint32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    /// Appends a length-prefixed string.
    pub fn string(&mut self, value: impl AsRef<[u8]>) -> &mut Self {
        let value = value.as_ref();
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value);
        self
    }

    /// Appends an mpint.
    ///
    /// Only non-negative values exist in this protocol (Diffie-Hellman
    /// values, shared secrets, RSA parameters), so the two's-complement
    /// negative form is never produced.
    pub fn mpint(&mut self, value: &BigUint) -> &mut Self {
        self.mpint_bytes(&value.to_bytes_be())
    }

    /// Appends an mpint given its unsigned big-endian magnitude.
    ///
    /// Leading zero bytes are stripped and a single zero byte is inserted when
    /// the high bit of the first byte is set. Zero encodes as an empty string.
    pub fn mpint_bytes(&mut self, magnitude: &[u8]) -> &mut Self {
        let start = magnitude
            .iter()
            .position(|&b| b != 0)
            .unwrap_or(magnitude.len());
        let trimmed = &magnitude[start..];

        let pad = trimmed.first().map_or(false, |&b| b & 0x80 != 0);
        self.buf.put_u32((trimmed.len() + usize::from(pad)) as u32);
        if pad {
            self.buf.put_u8(0);
        }
        self.buf.put_slice(trimmed);
        self
    }

    /// Appends a name-list.
    pub fn name_list<S: AsRef<str>>(&mut self, names: &[S]) -> &mut Self {
        let joined = names
            .iter()
            .map(|n| n.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        self.string(joined)
    }

    /// Appends bytes without a length prefix.
    pub fn raw(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_slice(value);
        self
    }

    /// Appends a typed field.
    pub fn field(&mut self, field: &Field) -> &mut Self {
        match field {
            Field::Byte(v) => self.byte(*v),
            Field::Boolean(v) => self.boolean(*v),
            Field::Uint32(v) => self.uint32(*v),
            Field::String(v) => self.string(v),
            Field::Mpint(v) => self.mpint(v),
            Field::NameList(v) => self.name_list(v),
            Field::Raw(v) => self.raw(v),
        }
    }

    /// Returns the number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consumes the writer and returns the encoded bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Left-to-right message parser.
///
/// Every accessor fails with [`KeelError::Protocol`] when fewer bytes remain
/// than the field needs. A failed read leaves the reader positioned where it
/// was.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader over `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Creates a reader over a message payload, checking its type byte.
    pub fn message(data: &'a [u8], expected: MessageType) -> KeelResult<Self> {
        let mut reader = Self::new(data);
        let msg_type = reader.byte()?;
        if msg_type != expected as u8 {
            return Err(KeelError::Protocol(format!(
                "Invalid message type: expected {}, got {}",
                expected, msg_type
            )));
        }
        Ok(reader)
    }

    /// Returns the number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Returns true if all input has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize, what: &str) -> KeelResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(KeelError::Protocol(format!(
                "Truncated {}: need {} bytes, {} remaining",
                what,
                len,
                self.remaining()
            )));
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    /// Reads `len` raw bytes.
    pub fn bytes(&mut self, len: usize) -> KeelResult<&'a [u8]> {
        self.take(len, "raw bytes")
    }

    /// Reads a byte.
    pub fn byte(&mut self) -> KeelResult<u8> {
        Ok(self.take(1, "byte")?[0])
    }

    /// Reads a boolean.
    pub fn boolean(&mut self) -> KeelResult<bool> {
        Ok(self.take(1, "boolean")?[0] != 0)
    }

    /// Reads a big-endian uint32.
    pub fn uint32(&mut self) -> KeelResult<u32> {
        let bytes = self.take(4, "uint32")?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a length-prefixed string.
    pub fn string(&mut self) -> KeelResult<&'a [u8]> {
        let start = self.offset;
        let len = self.uint32()? as usize;
        self.take(len, "string").map_err(|e| {
            self.offset = start;
            e
        })
    }

    /// Reads a string that must be valid UTF-8.
    pub fn utf8(&mut self) -> KeelResult<&'a str> {
        let start = self.offset;
        let bytes = self.string()?;
        std::str::from_utf8(bytes).map_err(|_| {
            self.offset = start;
            KeelError::Protocol("String is not valid UTF-8".to_string())
        })
    }

    /// Reads a non-negative mpint.
    ///
    /// A set high bit marks a negative two's-complement value. Those are
    /// unsupported and rejected with [`KeelError::Protocol`].
    pub fn mpint(&mut self) -> KeelResult<BigUint> {
        let start = self.offset;
        let bytes = self.string()?;
        if bytes.first().map_or(false, |&b| b & 0x80 != 0) {
            self.offset = start;
            return Err(KeelError::Protocol(
                "Negative mpint values are not supported".to_string(),
            ));
        }
        Ok(BigUint::from_bytes_be(bytes))
    }

    /// Reads a name-list.
    pub fn name_list(&mut self) -> KeelResult<Vec<String>> {
        let list = self.utf8()?;
        if list.is_empty() {
            return Ok(Vec::new());
        }
        Ok(list.split(',').map(String::from).collect())
    }

    /// Consumes and returns all remaining bytes.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.offset..];
        self.offset = self.data.len();
        slice
    }

    /// Reads a typed field.
    pub fn field(&mut self, kind: FieldKind) -> KeelResult<Field> {
        Ok(match kind {
            FieldKind::Byte => Field::Byte(self.byte()?),
            FieldKind::Boolean => Field::Boolean(self.boolean()?),
            FieldKind::Uint32 => Field::Uint32(self.uint32()?),
            FieldKind::String => Field::String(self.string()?.to_vec()),
            FieldKind::Mpint => Field::Mpint(self.mpint()?),
            FieldKind::NameList => Field::NameList(self.name_list()?),
            FieldKind::Raw => Field::Raw(self.rest().to_vec()),
        })
    }
}
