//! POSIX serial device transport.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use serialport::SerialPort;

use crate::error::{Error, Result};

/// 2,000,000 baud, 8N1, non-blocking, no line-discipline translation — the
/// fixed configuration the MEGA65 bitstream expects on its serial monitor.
const BAUD_RATE: u32 = 2_000_000;

/// A serial link to a real MEGA65 board.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Opens the serial device at `path`, configuring it for monitor use.
    pub fn open(path: &str) -> Result<Self> {
        let port = serialport::new(path, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(1))
            .open()
            .map_err(|err| Error::Transport(std::io::Error::other(err)))?;
        Ok(Self { port })
    }
}

impl super::ByteTransport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mut remaining = bytes;
        while !remaining.is_empty() {
            match self.port.write(remaining) {
                Ok(0) => continue,
                Ok(n) => remaining = &remaining[n..],
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(Error::Transport(err)),
            }
        }
        Ok(())
    }

    fn read(&mut self, n: usize, timeout_ms: u64) -> Result<Vec<u8>> {
        self.port
            .set_timeout(Duration::from_millis(timeout_ms.max(1)))
            .map_err(|err| Error::Transport(std::io::Error::other(err)))?;

        let mut buf = vec![0u8; n];
        match self.port.read(&mut buf) {
            Ok(read) => {
                buf.truncate(read);
                Ok(buf)
            }
            Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(Vec::new()),
            Err(err) => Err(Error::Transport(err)),
        }
    }
}
