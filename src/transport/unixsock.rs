//! UNIX domain socket transport (used to reach Xemu).

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::error::{Error, Result};

/// A UNIX domain socket link to an Xemu instance.
pub struct UnixTransport {
    sock: UnixStream,
}

impl UnixTransport {
    /// Connects to the UNIX domain socket at `path`.
    ///
    /// The socket is left in blocking mode with a per-read deadline, which
    /// gives the same externally observable "return within `timeout_ms`"
    /// contract as a non-blocking socket polled in a loop, without the
    /// spin-wait.
    pub fn connect(path: &str) -> Result<Self> {
        let sock = UnixStream::connect(path)?;
        Ok(Self { sock })
    }
}

impl super::ByteTransport for UnixTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mut remaining = bytes;
        while !remaining.is_empty() {
            match self.sock.write(remaining) {
                Ok(0) => continue,
                Ok(n) => remaining = &remaining[n..],
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(Error::Transport(err)),
            }
        }
        Ok(())
    }

    fn read(&mut self, n: usize, timeout_ms: u64) -> Result<Vec<u8>> {
        self.sock.set_read_timeout(Some(Duration::from_millis(timeout_ms.max(1))))?;

        let mut buf = vec![0u8; n];
        match self.sock.read(&mut buf) {
            Ok(read) => {
                buf.truncate(read);
                Ok(buf)
            }
            Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(Vec::new()),
            Err(err) => Err(Error::Transport(err)),
        }
    }
}
