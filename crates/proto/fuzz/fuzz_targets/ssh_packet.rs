//! Fuzz target for SSH packet parsing.
//!
//! Feeds arbitrary bytes to the frame parser and to a plaintext
//! [`PacketProtocol`] reading from the same bytes. Neither may panic.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use keel_proto::ssh::{Capabilities, Packet, PacketProtocol};
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = Packet::from_bytes(data) {
        // re-framing keeps the payload
        let reframed = Packet::new(packet.payload().to_vec()).to_bytes();
        let reparsed = Packet::from_bytes(&reframed).expect("re-framed packet must parse");
        assert_eq!(packet.payload(), reparsed.payload());
    }

    let mut protocol = PacketProtocol::new(
        Cursor::new(data.to_vec()),
        Vec::new(),
        Arc::new(Capabilities::default()),
    );
    while protocol.receive(false).is_ok() {}
});
