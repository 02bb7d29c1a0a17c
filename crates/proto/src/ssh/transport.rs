//! Readiness checks on the session input stream.
//!
//! The session main loop waits a bounded time for input so it can flush
//! output while the peer is quiet. This matters for transports that only
//! move bytes when flushed. It is not a protocol timeout: a packet that has
//! started arriving is always read to completion.

use std::io::{self, Cursor};
use std::net::TcpStream;
use std::time::Duration;

/// An input stream that can report whether a read would make progress.
pub trait WaitReadable {
    /// Waits up to `timeout` for input.
    ///
    /// Returns `Ok(true)` if data or end of stream is available, `Ok(false)`
    /// if the wait timed out.
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool>;
}

impl WaitReadable for TcpStream {
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        // a zero timeout is rejected by set_read_timeout
        let timeout = timeout.max(Duration::from_millis(1));
        self.set_read_timeout(Some(timeout))?;

        let mut probe = [0u8; 1];
        let result = self.peek(&mut probe);
        self.set_read_timeout(None)?;

        match result {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

impl<T: AsRef<[u8]>> WaitReadable for Cursor<T> {
    fn wait_readable(&mut self, _timeout: Duration) -> io::Result<bool> {
        Ok(true)
    }
}

impl WaitReadable for &[u8] {
    fn wait_readable(&mut self, _timeout: Duration) -> io::Result<bool> {
        Ok(true)
    }
}

impl<T: WaitReadable + ?Sized> WaitReadable for Box<T> {
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        (**self).wait_readable(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn test_tcp_wait_readable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        assert!(!server.wait_readable(Duration::from_millis(20)).unwrap());

        client.write_all(b"x").unwrap();
        assert!(server.wait_readable(Duration::from_secs(5)).unwrap());

        // peeking leaves the byte in place and blocking reads still work
        let mut buf = [0u8; 1];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"x");

        drop(client);
        assert!(server.wait_readable(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_memory_always_ready() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(cursor.wait_readable(Duration::ZERO).unwrap());
        let mut slice: &[u8] = b"";
        assert!(slice.wait_readable(Duration::ZERO).unwrap());
    }
}
