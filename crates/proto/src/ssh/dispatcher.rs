//! SSH Message Dispatcher.
//!
//! Routes incoming SSH messages by type to a [`Handler`].
//!
//! Each message type is either routed to the handler, accepted silently, or
//! unregistered. Unregistered types are answered with SSH_MSG_UNIMPLEMENTED
//! carrying the current receive sequence number.
//!
//! [`Dispatcher::dispatch`] takes an optional filter. A packet matching the
//! filter is handed back to the caller instead of being routed. A handler
//! that needs one specific message (a channel waiting for data) calls
//! `dispatch` again with a filter, so every other message keeps being
//! serviced while it waits.

use crate::ssh::message::MessageType;
use crate::ssh::packet::PacketProtocol;
use crate::ssh::wire::Writer;
use keel_platform::KeelResult;
use std::collections::HashMap;
use std::io::{Read, Write};
use tracing::{debug, trace, warn};

/// What to do with a registered message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Pass to [`Handler::handle`]
    Handle,
    /// Accept silently
    Ignore,
}

/// Receiver of routed messages.
pub trait Handler {
    /// Handles one message. `payload` includes the type byte.
    fn handle<R: Read, W: Write>(
        &mut self,
        dispatcher: &mut Dispatcher<R, W>,
        msg_type: MessageType,
        payload: Vec<u8>,
    ) -> KeelResult<()>;
}

/// A predicate selecting packets to return from [`Dispatcher::dispatch`].
pub type Filter<'a> = &'a dyn Fn(&[u8]) -> bool;

/// Message router owning the connection's packet protocol.
pub struct Dispatcher<R, W> {
    protocol: PacketProtocol<R, W>,
    routes: HashMap<MessageType, Route>,
}

impl<R: Read, W: Write> Dispatcher<R, W> {
    /// Creates a dispatcher with no registered types.
    pub fn new(protocol: PacketProtocol<R, W>) -> Self {
        Self {
            protocol,
            routes: HashMap::new(),
        }
    }

    /// Registers a message type.
    pub fn on(&mut self, msg_type: MessageType, route: Route) -> &mut Self {
        self.routes.insert(msg_type, route);
        self
    }

    /// Returns the route of a message type, if registered.
    pub fn route(&self, msg_type: MessageType) -> Option<Route> {
        self.routes.get(&msg_type).copied()
    }

    /// Returns the packet protocol.
    pub fn protocol(&self) -> &PacketProtocol<R, W> {
        &self.protocol
    }

    /// Returns the packet protocol mutably.
    pub fn protocol_mut(&mut self) -> &mut PacketProtocol<R, W> {
        &mut self.protocol
    }

    /// Sends one payload.
    pub fn send(&mut self, payload: &[u8]) -> KeelResult<()> {
        self.protocol.send(payload)
    }

    /// Sends SSH_MSG_UNIMPLEMENTED for the most recently received packet.
    pub fn send_unimplemented(&mut self) -> KeelResult<()> {
        let seq = self.protocol.receive_seq();
        let mut w = Writer::message(MessageType::Unimplemented);
        w.uint32(seq);
        self.protocol.send(&w.into_vec())
    }

    /// Receives and routes one packet.
    ///
    /// Queued look-ahead packets are taken before the stream is read.
    /// Returns `Some(packet)` only when `filter` matches it; such a packet
    /// is not routed.
    pub fn dispatch<H: Handler>(
        &mut self,
        handler: &mut H,
        filter: Option<Filter<'_>>,
    ) -> KeelResult<Option<Vec<u8>>> {
        let payload = self.protocol.receive(false)?;

        if let Some(filter) = filter {
            if filter(&payload) {
                return Ok(Some(payload));
            }
        }

        let msg_type = MessageType::of(&payload);
        match msg_type.and_then(|t| self.route(t).map(|r| (t, r))) {
            Some((t, Route::Handle)) => {
                trace!(msg_type = %t, "dispatching");
                handler.handle(self, t, payload)?;
            }
            Some((t, Route::Ignore)) => {
                debug!(msg_type = %t, "ignored message");
            }
            None => {
                warn!(
                    msg_type = payload.first().copied().unwrap_or(0),
                    seq = self.protocol.receive_seq(),
                    "unimplemented message"
                );
                self.send_unimplemented()?;
            }
        }

        Ok(None)
    }
}

impl<R, W> std::fmt::Debug for Dispatcher<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("protocol", &self.protocol)
            .field("routes", &self.routes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::Capabilities;
    use crate::ssh::wire::Reader;
    use std::io::Cursor;
    use std::sync::Arc;

    type MemoryDispatcher = Dispatcher<Cursor<Vec<u8>>, Vec<u8>>;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<Vec<u8>>,
    }

    impl Handler for Recorder {
        fn handle<R: Read, W: Write>(
            &mut self,
            _dispatcher: &mut Dispatcher<R, W>,
            _msg_type: MessageType,
            payload: Vec<u8>,
        ) -> KeelResult<()> {
            self.seen.push(payload);
            Ok(())
        }
    }

    fn wire(payloads: &[&[u8]]) -> Vec<u8> {
        let mut writer = PacketProtocol::new(
            Cursor::new(Vec::new()),
            Vec::new(),
            Arc::new(Capabilities::default()),
        );
        for p in payloads {
            writer.send(p).unwrap();
        }
        std::mem::take(writer.output_mut())
    }

    fn dispatcher(payloads: &[&[u8]]) -> MemoryDispatcher {
        Dispatcher::new(PacketProtocol::new(
            Cursor::new(wire(payloads)),
            Vec::new(),
            Arc::new(Capabilities::default()),
        ))
    }

    fn sent(d: &mut MemoryDispatcher) -> Vec<Vec<u8>> {
        let out = std::mem::take(d.protocol_mut().output_mut());
        let mut reader = PacketProtocol::new(
            Cursor::new(out),
            Vec::new(),
            Arc::new(Capabilities::default()),
        );
        let mut packets = Vec::new();
        while let Ok(p) = reader.receive(false) {
            packets.push(p);
        }
        packets
    }

    #[test]
    fn test_routes_and_ignores() {
        let mut d = dispatcher(&[b"\x02pad", b"\x05\x00\x00\x00\x00"]);
        d.on(MessageType::Ignore, Route::Ignore)
            .on(MessageType::ServiceRequest, Route::Handle);
        let mut h = Recorder::default();

        assert_eq!(d.dispatch(&mut h, None).unwrap(), None);
        assert!(h.seen.is_empty());
        d.dispatch(&mut h, None).unwrap();
        assert_eq!(h.seen, vec![b"\x05\x00\x00\x00\x00".to_vec()]);
        assert!(sent(&mut d).is_empty());
    }

    #[test]
    fn test_unregistered_gets_unimplemented() {
        let mut d = dispatcher(&[b"\x02first", b"\x50global"]);
        d.on(MessageType::Ignore, Route::Ignore);
        let mut h = Recorder::default();

        d.dispatch(&mut h, None).unwrap();
        d.dispatch(&mut h, None).unwrap();

        let replies = sent(&mut d);
        assert_eq!(replies.len(), 1);
        let mut r = Reader::message(&replies[0], MessageType::Unimplemented).unwrap();
        assert_eq!(r.uint32().unwrap(), 1);
        assert!(h.seen.is_empty());
    }

    #[test]
    fn test_filter_returns_packet() {
        let mut d = dispatcher(&[b"\x02skip", b"\x5edata"]);
        d.on(MessageType::Ignore, Route::Ignore)
            .on(MessageType::ChannelData, Route::Handle);
        let mut h = Recorder::default();
        let is_data = |p: &[u8]| MessageType::of(p) == Some(MessageType::ChannelData);

        assert_eq!(d.dispatch(&mut h, Some(&is_data)).unwrap(), None);
        assert_eq!(
            d.dispatch(&mut h, Some(&is_data)).unwrap(),
            Some(b"\x5edata".to_vec())
        );
        assert!(h.seen.is_empty());
    }

    #[test]
    fn test_queue_has_priority() {
        let mut d = dispatcher(&[b"\x02from stream"]);
        d.on(MessageType::Ignore, Route::Handle);
        d.protocol_mut().enqueue(vec![b"\x02queued".to_vec()]);
        let mut h = Recorder::default();

        d.dispatch(&mut h, None).unwrap();
        d.dispatch(&mut h, None).unwrap();
        assert_eq!(
            h.seen,
            vec![b"\x02queued".to_vec(), b"\x02from stream".to_vec()]
        );
    }
}
