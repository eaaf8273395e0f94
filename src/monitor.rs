//! Monitor protocol: synchronous command dispatch, binary load framing,
//! register/memory line parsing, and connection synchronization.
//!
//! This is the layer the control engine drives; it owns the [`Framer`] and
//! therefore the byte transport beneath it.

use std::path::Path;
use std::time::{Duration, Instant};

use crate::cache::PageSource;
use crate::error::{Error, Result};
use crate::framer::{Framer, Token};
use crate::transport::ByteTransport;

/// A full register snapshot, as parsed from a monitor `r` response.
#[derive(Clone, Debug, Default)]
pub struct Registers {
    pub pc: u32,
    pub a: u32,
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub b: u32,
    pub sp: u32,
    pub maph: u32,
    pub mapl: u32,
    pub last_op: u32,
    pub r#in: u32,
    pub p: u32,
    pub flags_string: String,
    pub flags: u8,
    pub rgp_string: String,
    pub rgp: u32,
    pub us: u32,
    pub io: u32,
    pub ws: u32,
    pub h: u32,
    pub reca8lhc: String,
}

impl Registers {
    /// Derives the 8-bit flag byte from `flags_string`, per §3: starting at
    /// bit 7, the bit is set for each of the first 7 characters that isn't `.`.
    fn derive_flags(flags_string: &str) -> u8 {
        let mut flags = 0u8;
        for (i, ch) in flags_string.chars().take(7).enumerate() {
            if ch != '.' {
                flags |= 0x80 >> i;
            }
        }
        flags
    }
}

/// The default quiescence timeout for ordinary command/response exchanges.
const DEFAULT_TIMEOUT_MS: u64 = 1_000;
/// Timeout for identity-sync probes.
const SYNC_TIMEOUT_MS: u64 = 500;
/// Timeout waiting for the post-reboot banner byte.
const RESET_BANNER_TIMEOUT_MS: u64 = 10_000;

/// Drives the monitor REPL over a [`Framer`].
pub struct Monitor {
    framer: Framer,
    is_xemu: bool,
}

impl Monitor {
    pub fn new(conn: Box<dyn ByteTransport>, is_xemu: bool) -> Self {
        Self {
            framer: Framer::new(conn, is_xemu),
            is_xemu,
        }
    }

    #[must_use]
    pub fn is_xemu(&self) -> bool {
        self.is_xemu
    }

    /// Reads lines until (and excluding) the next prompt token.
    ///
    /// Fails with [`Error::Timeout`] if the prompt doesn't arrive before
    /// `timeout_ms` elapses.
    fn lines_until_prompt(&mut self, timeout_ms: u64) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            let (tok, timed_out) = self.framer.read_line(timeout_ms)?;
            if timed_out {
                return Err(Error::Timeout);
            }
            match tok {
                Some(Token::Prompt) => return Ok(lines),
                Some(Token::Line(line)) => lines.push(line),
                Some(Token::Breakpoint) => {
                    return Err(Error::Protocol("unexpected breakpoint marker mid-response".into()));
                }
                None => return Err(Error::Timeout),
            }
        }
    }

    /// Dispatches a command, returning the response lines (excluding the
    /// echo of `cmd` and the trailing prompt).
    ///
    /// Any line seen before the echo is handled by `on_async`, matching the
    /// reference engine's `process_async_event` hook for breakpoints that
    /// arrive between commands.
    pub fn execute(&mut self, cmd: &str, mut on_async: impl FnMut(&[String])) -> Result<Vec<String>> {
        self.framer.write(cmd.as_bytes())?;
        let expected = cmd.trim_end_matches('\n');
        loop {
            let mut lines = self.lines_until_prompt(DEFAULT_TIMEOUT_MS)?;
            if lines.is_empty() {
                return Err(Error::Protocol("expected echo of command, got empty reply".into()));
            }
            if lines[0] == expected {
                lines.remove(0);
                return Ok(lines);
            }
            on_async(&lines);
        }
    }

    /// Non-blocking poll for an asynchronous breakpoint marker or (Xemu)
    /// bare register header. Returns the following registers block, or
    /// `None` if nothing arrived.
    pub fn poll_async_breakpoint(&mut self) -> Result<Option<Vec<String>>> {
        let (tok, timed_out) = self.framer.read_line(0)?;
        if timed_out {
            return Ok(None);
        }
        match tok {
            Some(Token::Breakpoint) => Ok(Some(self.lines_until_prompt(DEFAULT_TIMEOUT_MS)?)),
            Some(Token::Line(line)) if is_register_header(&line, self.is_xemu) => {
                let mut block = self.lines_until_prompt(DEFAULT_TIMEOUT_MS)?;
                block.insert(0, line);
                Ok(Some(block))
            }
            Some(other) => {
                // Not an async breakpoint after all; there is nowhere to put
                // the token back, so surface it as a protocol mismatch.
                Err(Error::Protocol(format!("unexpected token outside a command: {other:?}")))
            }
            None => Ok(None),
        }
    }

    /// Sends `?\n` (Xemu) or `?<n>\n` (HW) probes until the identity banner
    /// is seen, per §4.8/§9.
    pub fn sync_connection(&mut self) -> Result<()> {
        let ident = if self.is_xemu {
            "Xemu/MEGA65 Serial Monitor"
        } else {
            "MEGA65 Serial Monitor"
        };

        let mut first_try = true;
        for retries in (0..10).rev() {
            let cmd = if self.is_xemu {
                "?\n".to_string()
            } else {
                format!("?{retries}\n")
            };
            self.framer.write(cmd.as_bytes())?;
            let (tok, timed_out) = self.framer.read_line(SYNC_TIMEOUT_MS)?;

            if !timed_out {
                let expected = cmd.trim_end_matches('\n');
                if matches!(&tok, Some(Token::Line(line)) if line == expected) {
                    if let Ok(lines) = self.lines_until_prompt(SYNC_TIMEOUT_MS) {
                        if lines.first().is_some_and(|l| l.starts_with(ident)) {
                            log::debug!("synced with target debugger");
                            return Ok(());
                        }
                    }
                }
            }

            if first_try && timed_out {
                first_try = false;
                // Recover from a possibly-stuck load command.
                let mut dummy = vec![b' '; 65536];
                *dummy.last_mut().unwrap() = b'\n';
                self.framer.write(&dummy)?;
            }
            self.framer.flush();
        }

        Err(Error::Timeout)
    }

    /// Resets the target and re-syncs.
    pub fn reset_target(&mut self) -> Result<()> {
        self.framer.write(b"!\n")?;

        let reply = self.framer.read_raw(4, RESET_BANNER_TIMEOUT_MS)?;
        let expected: &[u8] = if self.is_xemu { b"!\r\n?" } else { b"!\r\n@" };
        if reply != expected {
            return Err(Error::Protocol("unexpected reset acknowledgement".into()));
        }

        let banner = self.framer.read_raw(1, RESET_BANNER_TIMEOUT_MS)?;
        if banner.is_empty() {
            return Err(Error::Timeout);
        }
        self.framer.flush();

        self.sync_connection()
    }

    /// Reads registers via `r`, populating a [`Registers`] snapshot.
    pub fn read_registers(&mut self) -> Result<Registers> {
        let lines = self.execute("r\n", |_| {})?;
        self.parse_register_lines(&lines)
    }

    /// Parses a register block already stripped of its echo line (the
    /// header line is `lines[0]`, the values line `lines[1]`).
    pub fn parse_register_lines(&self, lines: &[String]) -> Result<Registers> {
        let header = lines.first().ok_or_else(|| Error::Protocol("missing register header".into()))?;
        let expected_prefix = if self.is_xemu {
            "PC   A  X  Y  Z  B  SP   MAPH MAPL LAST-OP     P  P-FLAGS"
        } else {
            "PC   A  X  Y  Z  B  SP   MAPH MAPL LAST-OP In     P  P-FLAGS"
        };
        if !header.starts_with(expected_prefix) {
            return Err(Error::Protocol(format!("unexpected register header: {header}")));
        }
        let values = lines.get(1).ok_or_else(|| Error::Protocol("missing register values line".into()))?;
        let fields: Vec<&str> = values.split_whitespace().collect();

        let mut it = fields.iter();
        let hex = |it: &mut std::slice::Iter<&str>| -> u32 {
            it.next().and_then(|s| u32::from_str_radix(s, 16).ok()).unwrap_or_default()
        };

        let mut regs = Registers {
            pc: hex(&mut it),
            a: hex(&mut it),
            x: hex(&mut it),
            y: hex(&mut it),
            z: hex(&mut it),
            b: hex(&mut it),
            sp: hex(&mut it),
            maph: hex(&mut it),
            mapl: hex(&mut it),
            last_op: hex(&mut it),
            ..Registers::default()
        };
        if !self.is_xemu {
            regs.r#in = hex(&mut it);
        }
        regs.p = hex(&mut it);
        regs.flags_string = it.next().map(|s| (*s).to_string()).unwrap_or_default();
        regs.flags = Registers::derive_flags(&regs.flags_string);
        regs.rgp_string = it.next().map(|s| (*s).to_string()).unwrap_or_default();
        regs.rgp = u32::from_str_radix(&regs.rgp_string, 16).unwrap_or_default();
        regs.us = hex(&mut it);
        regs.io = hex(&mut it);
        regs.ws = hex(&mut it);
        regs.h = hex(&mut it);
        regs.reca8lhc = it.next().map(|s| (*s).to_string()).unwrap_or_default();
        Ok(regs)
    }

    /// Uploads a `.prg` file: 2-byte little-endian load address, payload.
    pub fn upload_prg(&mut self, data: &[u8]) -> Result<()> {
        if data.len() < 3 {
            return Err(Error::Domain("PRG file is too small".into()));
        }
        if data.len() > 65_536 {
            return Err(Error::Domain("PRG file size exceeds 64KB".into()));
        }
        let load_addr = u32::from(data[0]) | (u32::from(data[1]) << 8);
        let payload = &data[2..];
        let end = load_addr + payload.len() as u32;

        let cmd = format!("l{load_addr:X} {end:X}\n");
        self.framer.write(cmd.as_bytes())?;
        self.framer.write(payload)?;
        self.lines_until_prompt(DEFAULT_TIMEOUT_MS)?;
        Ok(())
    }

    /// Simulates keystrokes by writing to the keyboard buffer at `$2B0`
    /// and updating the queue length at `$D0`, in groups of at most 9.
    pub fn simulate_keypresses(&mut self, keys: &[u8]) -> Result<()> {
        const MAX_PER_GROUP: usize = 9;
        for group in keys.chunks(MAX_PER_GROUP) {
            let bytes: Vec<String> = group.iter().map(|b| format!("{b:02X}")).collect();
            let write_cmd = format!("s2B0 {}\n", bytes.join(" "));
            self.execute(&write_cmd, |_| {})?;
            let len_cmd = format!("sD0 {:X}\n", group.len());
            self.execute(&len_cmd, |_| {})?;
        }
        Ok(())
    }

    /// Reads one 16-byte line via `m<hex-addr>`.
    pub fn read_memory_line(&mut self, addr: u32) -> Result<[u8; 16]> {
        let cmd = format!("m{addr:X}\n");
        let lines = self.execute(&cmd, |_| {})?;
        let line = lines.first().ok_or_else(|| Error::Protocol("missing memory read line".into()))?;
        parse_memory_line(line)
    }

    /// Sets a breakpoint at `pc`.
    pub fn set_breakpoint_pc(&mut self, pc: u32) -> Result<()> {
        self.execute(&format!("b{pc:X}\n"), |_| {})?;
        Ok(())
    }

    /// Clears the current breakpoint.
    pub fn clear_breakpoint(&mut self) -> Result<()> {
        self.execute("b\n", |_| {})?;
        Ok(())
    }

    pub fn trace_off(&mut self) -> Result<()> {
        self.execute("t0\n", |_| {})?;
        Ok(())
    }

    pub fn trace_on(&mut self) -> Result<()> {
        self.execute("t1\n", |_| {})?;
        Ok(())
    }

    /// Single-steps, returning the resulting registers.
    ///
    /// On real HW the register block follows the empty-command echo
    /// directly; on Xemu it arrives after a second prompt, so we fall back
    /// to an explicit `r` poll when the inline block fails to parse.
    pub fn step(&mut self) -> Result<Registers> {
        let lines = self.execute("\n", |_| {})?;
        match self.parse_register_lines(&lines) {
            Ok(regs) => Ok(regs),
            Err(_) if self.is_xemu => self.read_registers(),
            Err(err) => Err(err),
        }
    }
}

impl PageSource for Monitor {
    /// Fetches one 256-byte page using `M<hex-addr>` (16 lines of 16 bytes).
    fn fetch_page(&mut self, line_addr: u32) -> Result<[u8; 256]> {
        let cmd = format!("M{line_addr:X}\n");
        let lines = self.execute(&cmd, |_| {})?;
        let mut page = [0u8; 256];
        for (i, line) in lines.iter().filter(|l| !l.is_empty()).take(16).enumerate() {
            let chunk = parse_memory_line(line)?;
            page[i * 16..i * 16 + 16].copy_from_slice(&chunk);
        }
        Ok(page)
    }
}

fn is_register_header(line: &str, is_xemu: bool) -> bool {
    let prefix = if is_xemu {
        "PC   A  X  Y  Z  B  SP   MAPH MAPL LAST-OP     P  P-FLAGS"
    } else {
        "PC   A  X  Y  Z  B  SP   MAPH MAPL LAST-OP In     P  P-FLAGS"
    };
    line.starts_with(prefix)
}

/// Parses a `:AAAAAAAA:HH×16` memory-read response line.
fn parse_memory_line(line: &str) -> Result<[u8; 16]> {
    let body = line
        .strip_prefix(':')
        .and_then(|rest| rest.split_once(':'))
        .map(|(_, hex)| hex)
        .ok_or_else(|| Error::Protocol(format!("malformed memory read line: {line}")))?;
    if body.len() < 32 {
        return Err(Error::Protocol(format!("short memory read line: {line}")));
    }
    let mut out = [0u8; 16];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&body[i * 2..i * 2 + 2], 16)
            .map_err(|e| Error::Protocol(format!("bad hex byte in memory line: {e}")))?;
    }
    Ok(out)
}

/// Reads a source `.prg` file, replaces its extension with `.dbg`, and
/// loads the matching symbol file path (caller does the actual parse).
#[must_use]
pub fn debug_symbol_path(prg_path: &Path) -> std::path::PathBuf {
    prg_path.with_extension("dbg")
}

/// An elapsed-time helper for the main loop's 1-second inactivity check.
#[derive(Debug)]
pub struct InactivityTimer {
    last_activity: Instant,
}

impl Default for InactivityTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl InactivityTimer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_activity: Instant::now(),
        }
    }

    pub fn reset(&mut self) {
        self.last_activity = Instant::now();
    }

    #[must_use]
    pub fn exceeded(&self, threshold: Duration) -> bool {
        self.last_activity.elapsed() >= threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct MockTransport(Arc<Mutex<VecDeque<u8>>>, Arc<Mutex<Vec<u8>>>);

    impl MockTransport {
        fn push(&self, bytes: &[u8]) {
            self.0.lock().unwrap().extend(bytes);
        }

        fn written(&self) -> Vec<u8> {
            self.1.lock().unwrap().clone()
        }
    }

    impl ByteTransport for MockTransport {
        fn write(&mut self, bytes: &[u8]) -> Result<()> {
            self.1.lock().unwrap().extend_from_slice(bytes);
            Ok(())
        }

        fn read(&mut self, n: usize, _timeout_ms: u64) -> Result<Vec<u8>> {
            let mut q = self.0.lock().unwrap();
            let take = n.min(q.len());
            Ok(q.drain(..take).collect())
        }
    }

    #[test]
    fn derives_flags_from_flags_string() {
        assert_eq!(Registers::derive_flags(".......") , 0);
        assert_eq!(Registers::derive_flags("N......"), 0b1000_0000);
        assert_eq!(Registers::derive_flags("NV.....") , 0b1100_0000);
        assert_eq!(Registers::derive_flags("......C"), 0b0000_0010);
    }

    #[test]
    fn parses_memory_line() {
        let bytes = parse_memory_line(":00001000:0102030405060708090A0B0C0D0E0F10").unwrap();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[15], 0x10);
    }

    #[test]
    fn execute_strips_echo_and_prompt() {
        let mock = MockTransport::default();
        mock.push(b"t0\r\n\r\n.");
        let mut mon = Monitor::new(Box::new(mock.clone()), false);
        let lines = mon.execute("t0\n", |_| {}).unwrap();
        assert_eq!(lines, vec![String::new()]);
        assert_eq!(mock.written(), b"t0\n");
    }

    #[test]
    fn sync_connection_succeeds_on_banner() {
        let mock = MockTransport::default();
        mock.push(b"?9\r\nMEGA65 Serial Monitor\r\n.");
        let mut mon = Monitor::new(Box::new(mock), false);
        mon.sync_connection().unwrap();
    }

    #[test]
    fn upload_prg_rejects_undersized_payload() {
        let mock = MockTransport::default();
        let mut mon = Monitor::new(Box::new(mock), false);
        let err = mon.upload_prg(&[1, 2]).unwrap_err();
        assert!(matches!(err, Error::Domain(_)));
    }
}
