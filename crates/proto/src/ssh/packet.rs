//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac (MAC = Message Authentication Code)
//! ```
//!
//! # Constraints
//!
//! - `packet_length` does NOT include `mac` or the `packet_length` field itself
//! - `padding_length` is in `[4, block_size + 3]`
//! - `packet_length + 4` is a multiple of the block size (8 when no cipher is active)
//! - The MAC is computed over `uint32 sequence || plaintext packet` and is not encrypted
//!
//! [`Packet`] is the plaintext frame. [`PacketProtocol`] owns the byte
//! streams and the per-direction cipher, MAC and compression state, and
//! turns payloads into frames and back.
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ssh::packet::Packet;
//!
//! let packet = Packet::new(b"\x02ignore me".to_vec());
//! let bytes = packet.to_bytes();
//! assert_eq!(bytes.len() % 8, 0);
//!
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), b"\x02ignore me");
//! ```

use crate::ssh::crypto::{
    fill_random, Capabilities, CipherAlgorithm, CompressionAlgorithm, Decryptor, Encryptor,
    MacAlgorithm, MacKey,
};
use crate::ssh::message::MessageType;
use bytes::{Buf, BufMut, BytesMut};
use keel_platform::{KeelError, KeelResult};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{error, trace};

/// Largest accepted `packet_length`.
///
/// Room for a 1 MiB channel data payload plus message headers.
pub const MAX_PACKET_LENGTH: usize = 1024 * 1024 + 1024;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Block size used for padding when no cipher is active.
pub const MIN_BLOCK_SIZE: usize = 8;

/// Returns the padding length for a payload of `payload_len` bytes.
///
/// The result lies in `[4, block_size + 3]` and makes
/// `4 + 1 + payload_len + padding` a multiple of `block_size`
/// (which is raised to at least 8).
pub fn padding_length(payload_len: usize, block_size: usize) -> usize {
    let block_size = block_size.max(MIN_BLOCK_SIZE);
    let unpadded = 4 + 1 + payload_len;
    let mut padding = block_size - unpadded % block_size;
    if padding < MIN_PADDING_LEN {
        padding += block_size;
    }
    padding
}

/// Plaintext SSH packet frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

impl Packet {
    /// Creates a frame padded for the default 8-byte block size.
    pub fn new(payload: Vec<u8>) -> Self {
        Self::with_block_size(payload, MIN_BLOCK_SIZE)
    }

    /// Creates a frame padded for `block_size` with random padding bytes.
    pub fn with_block_size(payload: Vec<u8>, block_size: usize) -> Self {
        let mut padding = vec![0u8; padding_length(payload.len(), block_size)];
        fill_random(&mut padding);
        Self { payload, padding }
    }

    /// Returns the payload of this packet.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the frame and returns the payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Returns the padding of this packet.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Serializes this frame (without MAC).
    pub fn to_bytes(&self) -> Vec<u8> {
        let packet_length = 1 + self.payload.len() + self.padding.len();
        let mut buf = BytesMut::with_capacity(4 + packet_length);

        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);

        buf.to_vec()
    }

    /// Parses a plaintext frame (length field included, no MAC).
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Protocol`] if:
    /// - Data is shorter than the header or the declared length
    /// - `packet_length` exceeds [`MAX_PACKET_LENGTH`]
    /// - Padding is shorter than 4 bytes or longer than the packet
    /// - Bytes follow the declared packet
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        if data.len() < 5 {
            return Err(KeelError::Protocol(format!(
                "Packet too short: {} bytes (minimum 5)",
                data.len()
            )));
        }

        let mut buf = data;
        let packet_length = buf.get_u32() as usize;

        if packet_length > MAX_PACKET_LENGTH {
            return Err(KeelError::Protocol(format!(
                "Packet too large: {} bytes (maximum {})",
                packet_length, MAX_PACKET_LENGTH
            )));
        }

        if buf.len() != packet_length {
            return Err(KeelError::Protocol(format!(
                "Packet length mismatch: declared {} bytes, got {} bytes",
                packet_length,
                buf.len()
            )));
        }

        let padding_length = buf.get_u8() as usize;

        if padding_length < MIN_PADDING_LEN {
            return Err(KeelError::Protocol(format!(
                "Padding too short: {} bytes (minimum {})",
                padding_length, MIN_PADDING_LEN
            )));
        }

        if padding_length + 1 > packet_length {
            return Err(KeelError::Protocol(format!(
                "Padding of {} bytes does not fit in packet of {} bytes",
                padding_length, packet_length
            )));
        }

        let payload_length = packet_length - 1 - padding_length;
        let payload = buf[..payload_length].to_vec();
        let padding = buf[payload_length..].to_vec();

        Ok(Self { payload, padding })
    }
}

#[derive(Debug)]
struct SendState {
    next_seq: u32,
    encryptor: Option<Encryptor>,
    mac: Option<MacKey>,
    compression: CompressionAlgorithm,
}

#[derive(Debug)]
struct ReceiveState {
    count: u32,
    decryptor: Option<Decryptor>,
    mac: Option<MacKey>,
    compression: CompressionAlgorithm,
}

/// Framing, encryption and integrity for one connection.
///
/// Send and receive sequence numbers start at 0 with the first packet after
/// the identification exchange and are never reset. Cipher and MAC state
/// can be installed once per direction.
///
/// Peeked packets wait in a FIFO look-ahead queue that is always drained
/// before the input stream is read again.
pub struct PacketProtocol<R, W> {
    input: R,
    output: W,
    capabilities: Arc<Capabilities>,
    session_id: Option<Vec<u8>>,
    queue: VecDeque<Vec<u8>>,
    send: SendState,
    receive: ReceiveState,
    broken: bool,
}

impl<R: Read, W: Write> PacketProtocol<R, W> {
    /// Creates a protocol instance over an input and an output stream.
    pub fn new(input: R, output: W, capabilities: Arc<Capabilities>) -> Self {
        Self {
            input,
            output,
            capabilities,
            session_id: None,
            queue: VecDeque::new(),
            send: SendState {
                next_seq: 0,
                encryptor: None,
                mac: None,
                compression: CompressionAlgorithm::None,
            },
            receive: ReceiveState {
                count: 0,
                decryptor: None,
                mac: None,
                compression: CompressionAlgorithm::None,
            },
            broken: false,
        }
    }

    /// Returns the algorithm tables this connection was created with.
    pub fn capabilities(&self) -> &Arc<Capabilities> {
        &self.capabilities
    }

    /// Returns the session identifier, once key exchange has produced it.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Binds the connection to a session identifier.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Internal`] if the identifier is already set.
    pub fn set_session_id(&mut self, session_id: Vec<u8>) -> KeelResult<()> {
        if self.session_id.is_some() {
            return Err(KeelError::Internal("Session ID already set".to_string()));
        }
        self.session_id = Some(session_id);
        Ok(())
    }

    /// Sequence number the next outgoing packet will carry.
    pub fn send_seq(&self) -> u32 {
        self.send.next_seq
    }

    /// Sequence number of the most recently received packet.
    pub fn receive_seq(&self) -> u32 {
        self.receive.count.wrapping_sub(1)
    }

    /// Direct access to the input stream (identification exchange, readiness checks).
    pub fn input_mut(&mut self) -> &mut R {
        &mut self.input
    }

    /// Direct access to the output stream.
    pub fn output_mut(&mut self) -> &mut W {
        &mut self.output
    }

    /// Flushes buffered output.
    pub fn flush(&mut self) -> KeelResult<()> {
        self.output.flush()?;
        Ok(())
    }

    /// Frames, authenticates, encrypts and writes one payload.
    pub fn send(&mut self, payload: &[u8]) -> KeelResult<()> {
        let seq = self.send.next_seq;
        self.send.next_seq = seq.wrapping_add(1);

        let msg_type = MessageType::of(payload);
        let payload = self.send.compression.compress(payload.to_vec());
        let block_size = self
            .send
            .encryptor
            .as_ref()
            .map_or(MIN_BLOCK_SIZE, |e| e.algorithm().block_size());

        let mut frame = Packet::with_block_size(payload, block_size).to_bytes();

        let mac = match &self.send.mac {
            Some(key) => key.compute(seq, &frame)?,
            None => Vec::new(),
        };

        if let Some(encryptor) = &mut self.send.encryptor {
            encryptor.encrypt(&mut frame)?;
        }

        trace!(seq, len = frame.len(), msg_type = ?msg_type, "send packet");

        self.output.write_all(&frame)?;
        self.output.write_all(&mac)?;
        self.output.flush()?;
        Ok(())
    }

    /// Returns the next payload.
    ///
    /// Queued look-ahead packets are returned first: with `peek` the head of
    /// the queue is returned and kept, otherwise it is removed. When the
    /// queue is empty a packet is read from the stream; with `peek` it is
    /// also appended to the queue.
    ///
    /// # Errors
    ///
    /// - [`KeelError::Integrity`] on MAC mismatch; every later call fails too
    /// - [`KeelError::Protocol`] on a malformed frame
    /// - [`KeelError::Io`] on read failure or end of stream
    pub fn receive(&mut self, peek: bool) -> KeelResult<Vec<u8>> {
        if self.broken {
            return Err(KeelError::Integrity(
                "Connection integrity lost; refusing further packets".to_string(),
            ));
        }

        if peek {
            if let Some(front) = self.queue.front() {
                return Ok(front.clone());
            }
        } else if let Some(front) = self.queue.pop_front() {
            return Ok(front);
        }

        let payload = self.read_packet()?;
        if peek {
            self.queue.push_back(payload.clone());
        }
        Ok(payload)
    }

    /// Appends packets to the look-ahead queue.
    pub fn enqueue<I: IntoIterator<Item = Vec<u8>>>(&mut self, packets: I) {
        self.queue.extend(packets);
    }

    /// Returns true if look-ahead packets are waiting.
    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    fn read_packet(&mut self) -> KeelResult<Vec<u8>> {
        let seq = self.receive.count;
        self.receive.count = seq.wrapping_add(1);

        let block_size = self
            .receive
            .decryptor
            .as_ref()
            .map_or(MIN_BLOCK_SIZE, |d| d.algorithm().block_size());

        let mut frame = vec![0u8; block_size];
        self.input.read_exact(&mut frame)?;
        if let Some(decryptor) = &mut self.receive.decryptor {
            decryptor.decrypt(&mut frame)?;
        }

        let packet_length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        if packet_length > MAX_PACKET_LENGTH || packet_length + 4 < block_size {
            return Err(KeelError::Protocol(format!(
                "Invalid packet length {} (block size {})",
                packet_length, block_size
            )));
        }
        if self.receive.decryptor.is_some() && (packet_length + 4) % block_size != 0 {
            return Err(KeelError::Protocol(format!(
                "Packet length {} is not aligned to block size {}",
                packet_length, block_size
            )));
        }

        let mut rest = vec![0u8; packet_length + 4 - block_size];
        self.input.read_exact(&mut rest)?;
        if let Some(decryptor) = &mut self.receive.decryptor {
            decryptor.decrypt(&mut rest)?;
        }
        frame.extend_from_slice(&rest);

        if let Some(key) = &self.receive.mac {
            let mut received = vec![0u8; key.algorithm().mac_size()];
            self.input.read_exact(&mut received)?;
            if let Err(e) = key.verify(seq, &frame, &received) {
                self.broken = true;
                error!(seq, "MAC verification failed");
                return Err(e);
            }
        }

        let packet = Packet::from_bytes(&frame)?;
        trace!(seq, len = frame.len(), msg_type = ?MessageType::of(packet.payload()), "received packet");

        Ok(self.receive.compression.decompress(packet.into_payload()))
    }

    /// Activates outgoing encryption.
    pub fn init_encryption(
        &mut self,
        algorithm: CipherAlgorithm,
        key: &[u8],
        iv: &[u8],
    ) -> KeelResult<()> {
        if self.send.encryptor.is_some() {
            return Err(KeelError::Internal("Send cipher already set".to_string()));
        }
        self.send.encryptor = Some(Encryptor::new(algorithm, key, iv)?);
        Ok(())
    }

    /// Activates incoming decryption.
    pub fn init_decryption(
        &mut self,
        algorithm: CipherAlgorithm,
        key: &[u8],
        iv: &[u8],
    ) -> KeelResult<()> {
        if self.receive.decryptor.is_some() {
            return Err(KeelError::Internal("Receive cipher already set".to_string()));
        }
        self.receive.decryptor = Some(Decryptor::new(algorithm, key, iv)?);
        Ok(())
    }

    /// Activates the outgoing MAC.
    pub fn init_send_mac(&mut self, algorithm: MacAlgorithm, key: &[u8]) -> KeelResult<()> {
        if self.send.mac.is_some() {
            return Err(KeelError::Internal("Send MAC already set".to_string()));
        }
        self.send.mac = Some(MacKey::new(algorithm, key)?);
        Ok(())
    }

    /// Activates the incoming MAC.
    pub fn init_receive_mac(&mut self, algorithm: MacAlgorithm, key: &[u8]) -> KeelResult<()> {
        if self.receive.mac.is_some() {
            return Err(KeelError::Internal("Receive MAC already set".to_string()));
        }
        self.receive.mac = Some(MacKey::new(algorithm, key)?);
        Ok(())
    }

    /// Sets outgoing compression.
    pub fn init_compression(&mut self, algorithm: CompressionAlgorithm) {
        self.send.compression = algorithm;
    }

    /// Sets incoming decompression.
    pub fn init_decompression(&mut self, algorithm: CompressionAlgorithm) {
        self.receive.compression = algorithm;
    }
}

impl<R, W> std::fmt::Debug for PacketProtocol<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketProtocol")
            .field("send", &self.send)
            .field("receive", &self.receive)
            .field("queued", &self.queue.len())
            .field("session_id", &self.session_id.as_ref().map(hex::encode))
            .finish()
    }
}
