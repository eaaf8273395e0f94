//! `Content-Length`-framed JSON-RPC-like stdio transport for DAP messages.
//!
//! Grounded on the wire framing the spec assigns this layer (§6.1, §6.5):
//! each message is a JSON object preceded by an ASCII header block,
//! terminated by a blank line, giving the body's length in bytes.

pub mod types;

use std::io::{self, BufRead, Write};

use serde_json::Value;
use thiserror::Error;

/// An error framing or parsing a DAP message.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error reading DAP message: {0}")]
    Io(#[from] io::Error),
    #[error("malformed DAP header: {0}")]
    Header(String),
    #[error("malformed DAP body: {0}")]
    Body(#[from] serde_json::Error),
}

/// Reads one framed message, or `None` on a clean EOF before any header byte
/// is read.
pub fn read_message(reader: &mut impl BufRead) -> Result<Option<Value>, Error> {
    let mut content_length = None;
    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            return Ok(None);
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::Header(format!("missing ':' in header line: `{line}`")))?;
        if name.eq_ignore_ascii_case("Content-Length") {
            content_length = Some(
                value
                    .trim()
                    .parse::<usize>()
                    .map_err(|e| Error::Header(format!("bad Content-Length `{value}`: {e}")))?,
            );
        }
    }

    let len = content_length.ok_or_else(|| Error::Header("missing Content-Length header".into()))?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    let value = serde_json::from_slice(&body)?;
    Ok(Some(value))
}

/// Writes one framed message and flushes the writer.
pub fn write_message(writer: &mut impl Write, value: &Value) -> Result<(), Error> {
    let body = serde_json::to_vec(value)?;
    write!(writer, "Content-Length: {}\r\n\r\n", body.len())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_a_message() {
        let mut buf = Vec::new();
        let sent = json!({"seq": 1, "type": "request", "command": "initialize"});
        write_message(&mut buf, &sent).unwrap();

        let mut reader = io::BufReader::new(buf.as_slice());
        let received = read_message(&mut reader).unwrap().unwrap();
        assert_eq!(received, sent);
    }

    #[test]
    fn returns_none_on_clean_eof() {
        let mut reader = io::BufReader::new(&b""[..]);
        assert!(read_message(&mut reader).unwrap().is_none());
    }

    #[test]
    fn rejects_missing_content_length() {
        let mut reader = io::BufReader::new(&b"X-Custom: 1\r\n\r\n"[..]);
        assert!(read_message(&mut reader).is_err());
    }
}
