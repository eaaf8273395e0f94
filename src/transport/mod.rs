//! Raw bidirectional byte transport.
//!
//! Two implementations back a [`ByteTransport`]: a POSIX serial device and a
//! UNIX domain socket. The engine selects between them by inspecting the
//! launch target address (`unix#...` selects the socket variant).

mod serial;
mod unixsock;

use crate::error::Result;

pub use self::serial::SerialTransport;
pub use self::unixsock::UnixTransport;

/// A raw, timeout-capable byte stream to the target's monitor.
pub trait ByteTransport: Send {
    /// Writes all bytes, retrying on would-block. Fails only on hard I/O errors.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Reads up to `n` bytes, returning as many as are available before
    /// `timeout_ms` elapses. May return fewer than `n` bytes (including
    /// zero) on timeout; never blocks past the deadline.
    fn read(&mut self, n: usize, timeout_ms: u64) -> Result<Vec<u8>>;
}

/// Opens the transport appropriate for `target`.
///
/// Returns the transport along with whether the target is an Xemu instance
/// (true for `unix#...` addresses, false for serial devices).
pub fn open(target: &str) -> Result<(Box<dyn ByteTransport>, bool)> {
    if let Some(path) = target.strip_prefix("unix#") {
        let conn = UnixTransport::connect(path)?;
        Ok((Box::new(conn), true))
    } else {
        let conn = SerialTransport::open(target)?;
        Ok((Box::new(conn), false))
    }
}
