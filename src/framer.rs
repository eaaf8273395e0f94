//! Line/prompt/breakpoint token framing over a [`ByteTransport`].

use crate::error::Result;
use crate::transport::ByteTransport;

/// A logical token yielded by the framer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Token {
    /// A complete line of monitor output.
    Line(String),
    /// The prompt marker (`.`), terminating a response.
    Prompt,
    /// The asynchronous breakpoint marker (`!`), real HW only.
    Breakpoint,
}

/// Converts a raw byte stream into [`Token`]s.
///
/// Maintains a read-ahead buffer; bytes are pulled from the transport only
/// as needed to complete the next token.
pub struct Framer {
    conn: Box<dyn ByteTransport>,
    xemu: bool,
    buf: Vec<u8>,
}

impl Framer {
    /// Wraps `conn` in a framer. `xemu` selects the `.\r\n` prompt variant.
    pub fn new(conn: Box<dyn ByteTransport>, xemu: bool) -> Self {
        Self {
            conn,
            xemu,
            buf: Vec::new(),
        }
    }

    /// Reads the next token, waiting up to `timeout_ms`.
    ///
    /// Returns `(None, true)` if no complete token arrived before the
    /// deadline.
    pub fn read_line(&mut self, timeout_ms: u64) -> Result<(Option<Token>, bool)> {
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
        loop {
            if let Some(tok) = self.try_take() {
                return Ok((Some(tok), false));
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Ok((None, true));
            }
            let chunk = self.conn.read(4096, remaining.as_millis().min(u64::from(u32::MAX) as u128) as u64)?;
            if chunk.is_empty() {
                // Nothing new arrived this round; let the deadline check above decide.
                if std::time::Instant::now() >= deadline {
                    return Ok((None, true));
                }
                continue;
            }
            self.buf.extend_from_slice(&chunk);
        }
    }

    /// Attempts to pull a single complete token out of the buffer without
    /// touching the transport.
    fn try_take(&mut self) -> Option<Token> {
        if self.buf.is_empty() {
            return None;
        }
        if self.buf[0] == b'.' {
            if self.xemu {
                if self.buf.len() >= 3 && &self.buf[..3] == b".\r\n" {
                    self.buf.drain(..3);
                    return Some(Token::Prompt);
                }
                return None;
            }
            self.buf.remove(0);
            return Some(Token::Prompt);
        }
        if self.buf[0] == b'!' {
            self.buf.remove(0);
            return Some(Token::Breakpoint);
        }
        let nl = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=nl).collect();
        line.pop(); // drop '\n'
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(Token::Line(String::from_utf8_lossy(&line).into_owned()))
    }

    /// Empties the buffer and drains any bytes the transport is currently
    /// holding. Fails silently when nothing is pending.
    pub fn flush(&mut self) {
        self.buf.clear();
        let _ = self.conn.read(65536, 50);
    }

    /// Writes raw bytes to the underlying transport.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.conn.write(bytes)
    }

    /// Reads exactly `n` raw bytes, bypassing token framing.
    ///
    /// Used for the fixed-width reset acknowledgement (`!\r\n@`/`!\r\n?`)
    /// and the single post-reboot banner byte, neither of which is
    /// line-terminated.
    pub fn read_raw(&mut self, n: usize, timeout_ms: u64) -> Result<Vec<u8>> {
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
        while self.buf.len() < n {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let chunk = self.conn.read(n - self.buf.len(), remaining.as_millis().min(u64::from(u32::MAX) as u128) as u64)?;
            if chunk.is_empty() && std::time::Instant::now() >= deadline {
                break;
            }
            self.buf.extend_from_slice(&chunk);
        }
        let take = n.min(self.buf.len());
        Ok(self.buf.drain(..take).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct MockTransport(Arc<Mutex<VecDeque<u8>>>);

    impl MockTransport {
        fn push(&self, bytes: &[u8]) {
            self.0.lock().unwrap().extend(bytes);
        }
    }

    impl ByteTransport for MockTransport {
        fn write(&mut self, _bytes: &[u8]) -> Result<()> {
            Ok(())
        }

        fn read(&mut self, n: usize, _timeout_ms: u64) -> Result<Vec<u8>> {
            let mut q = self.0.lock().unwrap();
            let take = n.min(q.len());
            Ok(q.drain(..take).collect())
        }
    }

    #[test]
    fn help_banner_tokens() {
        let mock = MockTransport::default();
        mock.push(b"?\nMEGA65 Serial Monitor\r\nbuild GIT: development,20220305.00,ee4f29d\r\n\r\n.");
        let mut framer = Framer::new(Box::new(mock), false);

        assert_eq!(framer.read_line(50).unwrap().0, Some(Token::Line("?".into())));
        assert_eq!(
            framer.read_line(50).unwrap().0,
            Some(Token::Line("MEGA65 Serial Monitor".into()))
        );
        assert_eq!(
            framer.read_line(50).unwrap().0,
            Some(Token::Line("build GIT: development,20220305.00,ee4f29d".into()))
        );
        assert_eq!(framer.read_line(50).unwrap().0, Some(Token::Line(String::new())));
        assert_eq!(framer.read_line(50).unwrap().0, Some(Token::Prompt));
        assert_eq!(framer.read_line(10).unwrap(), (None, true));
    }

    #[test]
    fn xemu_prompt_requires_crlf() {
        let mock = MockTransport::default();
        mock.push(b"t0\r\n.\r\n");
        let mut framer = Framer::new(Box::new(mock), true);
        assert_eq!(framer.read_line(50).unwrap().0, Some(Token::Line("t0".into())));
        assert_eq!(framer.read_line(50).unwrap().0, Some(Token::Prompt));
    }

    #[test]
    fn breakpoint_marker() {
        let mock = MockTransport::default();
        mock.push(b"!PC   A\r\n0123 45\r\n.");
        let mut framer = Framer::new(Box::new(mock), false);
        assert_eq!(framer.read_line(50).unwrap().0, Some(Token::Breakpoint));
    }
}
