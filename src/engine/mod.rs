//! Control engine: task queue, main loop, and target lifecycle.
//!
//! Grounded on `M65Debugger` (public operations, registers, breakpoint
//! validity) from the reference implementation, with the worker-thread
//! split modeled on the teacher's `Channel`/`pair` inter-thread pattern.

pub mod expr;
mod task;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cache::MemoryCache;
use crate::error::{Error, Result};
use crate::monitor::{InactivityTimer, Monitor, Registers};
use crate::opcode::{self, AddressingMode, Mnemonic};
use crate::symbol::{loader, SymbolModel};
use crate::transport;

pub use expr::EvalResult;
use task::{Op, Reply};

/// Why the target transitioned to the stopped state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoppedReason {
    Pause,
    Step,
    Breakpoint,
}

/// The current source location of the program counter, if known.
#[derive(Clone, Debug, Default)]
pub struct SourcePosition {
    pub src_path: Option<PathBuf>,
    pub line: u32,
    pub segment: String,
    pub block: String,
}

/// A single pending breakpoint (spec: at most one exists at a time).
#[derive(Clone, Debug)]
pub struct Breakpoint {
    pub src_path: PathBuf,
    pub line: u32,
    pub pc: u32,
}

/// Receives stopped events from the worker thread.
///
/// Invoked on a short-lived helper thread which the worker joins before
/// continuing, preserving "event fully delivered before next task" (§9).
pub trait EventSink: Send + Sync {
    fn stopped(&self, reason: StoppedReason);
}

/// The 1-second inactivity threshold for the periodic `check_breakpoint_by_pc`.
const BREAKPOINT_POLL_THRESHOLD: Duration = Duration::from_secs(1);
/// The main-loop sleep quantum when idle.
const QUANTUM: Duration = Duration::from_millis(10);

/// A connected target control engine.
///
/// Caller-facing operations enqueue work for the worker thread and block on
/// the task's single-shot reply; the worker thread alone touches the
/// transport, framer, memory cache, and monitor state.
pub struct Engine {
    sender: task::Sender,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Engine {
    /// Connects to `target` (a serial device path or `unix#<socket path>`),
    /// synchronizes with the monitor, optionally resets, and spawns the
    /// worker thread.
    pub fn connect(
        target: &str,
        reset_on_run: bool,
        reset_on_disconnect: bool,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let (conn, is_xemu) = transport::open(target)?;
        let mut monitor = Monitor::new(conn, is_xemu);
        monitor.sync_connection()?;

        if reset_on_run {
            monitor.reset_target()?;
            std::thread::sleep(Duration::from_secs(2));
        } else {
            monitor.trace_off()?;
        }

        let (sender, receiver) = task::pair();
        let running = Arc::new(AtomicBool::new(true));
        let worker_running = running.clone();

        let handle = std::thread::spawn(move || {
            let mut worker = Worker {
                monitor,
                cache: MemoryCache::new(MemoryCache::DEFAULT_LINES),
                symbols: None,
                breakpoint: None,
                registers: Registers::default(),
                stopped: false,
                is_xemu,
                reset_on_disconnect,
                events,
            };
            worker.run(&receiver, &worker_running);
        });

        Ok(Self {
            sender,
            running,
            handle: Some(handle),
        })
    }

    fn call(&self, op: Op) -> Result<Reply> {
        self.sender.submit(op).map_err(|_| Error::State("engine worker has shut down".into()))
    }

    pub fn set_target(&self, prg_path: &Path) -> Result<()> {
        match self.call(Op::SetTarget(prg_path.to_path_buf()))? {
            Reply::Unit(r) => r,
            _ => unreachable!("set_target always replies Unit"),
        }
    }

    pub fn run_target(&self) -> Result<()> {
        match self.call(Op::RunTarget)? {
            Reply::Unit(r) => r,
            _ => unreachable!("run_target always replies Unit"),
        }
    }

    pub fn pause(&self) -> Result<()> {
        match self.call(Op::Pause)? {
            Reply::Unit(r) => r,
            _ => unreachable!("pause always replies Unit"),
        }
    }

    pub fn cont(&self) -> Result<()> {
        match self.call(Op::Cont)? {
            Reply::Unit(r) => r,
            _ => unreachable!("cont always replies Unit"),
        }
    }

    pub fn next(&self) -> Result<()> {
        match self.call(Op::Next)? {
            Reply::Unit(r) => r,
            _ => unreachable!("next always replies Unit"),
        }
    }

    /// Resolves `(src_path, line)` against the loaded symbols and sets a
    /// breakpoint at the matching PC. Returns `false` if no mapping exists.
    pub fn set_breakpoint(&self, src_path: &Path, line: u32) -> Result<bool> {
        match self.call(Op::SetBreakpoint(src_path.to_path_buf(), line))? {
            Reply::Bool(r) => r,
            _ => unreachable!("set_breakpoint always replies Bool"),
        }
    }

    pub fn clear_breakpoint(&self) -> Result<()> {
        match self.call(Op::ClearBreakpoint)? {
            Reply::Unit(r) => r,
            _ => unreachable!("clear_breakpoint always replies Unit"),
        }
    }

    pub fn evaluate_expression(&self, expr: &str, format_as_hex: bool) -> Result<EvalResult> {
        match self.call(Op::Evaluate(expr.to_string(), format_as_hex))? {
            Reply::Eval(r) => r,
            _ => unreachable!("evaluate_expression always replies Eval"),
        }
    }

    pub fn registers(&self) -> Result<Registers> {
        match self.call(Op::Registers)? {
            Reply::Regs(r) => r,
            _ => unreachable!("registers always replies Regs"),
        }
    }

    /// The source location of the current program counter, if symbols are
    /// loaded and it resolves to a block.
    pub fn source_position(&self) -> Result<SourcePosition> {
        match self.call(Op::SourcePosition)? {
            Reply::Pos(r) => r,
            _ => unreachable!("source_position always replies Pos"),
        }
    }

    /// Signals the worker to shut down after its current quantum, optionally
    /// resetting the target first, and waits for the thread to exit.
    pub fn disconnect(&mut self) {
        let _ = self.sender.submit(Op::Shutdown);
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.disconnect();
        }
    }
}

/// Worker-thread state: everything the spec forbids sharing across threads.
struct Worker {
    monitor: Monitor,
    cache: MemoryCache,
    symbols: Option<SymbolModel>,
    breakpoint: Option<Breakpoint>,
    registers: Registers,
    stopped: bool,
    is_xemu: bool,
    reset_on_disconnect: bool,
    events: Arc<dyn EventSink>,
}

impl Worker {
    fn run(&mut self, receiver: &task::Receiver, running: &Arc<AtomicBool>) {
        let mut inactivity = InactivityTimer::new();

        while running.load(Ordering::SeqCst) {
            if let Some((op, reply_tx)) = receiver.try_pop() {
                let shutdown = matches!(op, Op::Shutdown);
                let reply = self.execute(op);
                let _ = reply_tx.send(reply);
                inactivity.reset();
                if shutdown {
                    break;
                }
            }

            match self.monitor.poll_async_breakpoint() {
                Ok(Some(lines)) => self.handle_async_stop(&lines),
                Ok(None) => {}
                Err(err) => log::warn!("async event processing failed: {err}"),
            }

            if inactivity.exceeded(BREAKPOINT_POLL_THRESHOLD) {
                if let Err(err) = self.check_breakpoint_by_pc() {
                    log::warn!("breakpoint poll failed: {err}");
                }
                inactivity.reset();
            }

            std::thread::sleep(QUANTUM);
        }

        if !self.is_xemu && self.reset_on_disconnect {
            if let Err(err) = self.monitor.reset_target() {
                log::warn!("reset on disconnect failed: {err}");
            }
        }
    }

    fn execute(&mut self, op: Op) -> Reply {
        match op {
            Op::SetTarget(path) => Reply::Unit(self.set_target(&path)),
            Op::RunTarget => Reply::Unit(self.run_target()),
            Op::Pause => Reply::Unit(self.pause()),
            Op::Cont => Reply::Unit(self.cont()),
            Op::Next => Reply::Unit(self.next()),
            Op::SetBreakpoint(path, line) => Reply::Bool(self.set_breakpoint(&path, line)),
            Op::ClearBreakpoint => Reply::Unit(self.clear_breakpoint()),
            Op::Evaluate(expr, hex) => Reply::Eval(self.evaluate_expression(&expr, hex)),
            Op::Registers => Reply::Regs(Ok(self.registers.clone())),
            Op::SourcePosition => Reply::Pos(Ok(source_position(self.symbols.as_ref(), self.registers.pc))),
            Op::Shutdown => Reply::Unit(Ok(())),
        }
    }

    fn set_target(&mut self, prg_path: &Path) -> Result<()> {
        let data = std::fs::read(prg_path).map_err(Error::from)?;
        self.monitor.upload_prg(&data)?;
        let dbg_path = prg_path.with_extension("dbg");
        self.symbols = if dbg_path.exists() { Some(loader::load(&dbg_path)?) } else { None };
        Ok(())
    }

    fn run_target(&mut self) -> Result<()> {
        self.monitor.simulate_keypresses(b"RUN\r")
    }

    fn pause(&mut self) -> Result<()> {
        self.monitor.trace_on()?;
        self.stopped = true;
        self.registers = self.monitor.read_registers()?;
        self.cache.invalidate();
        self.emit(StoppedReason::Pause);
        Ok(())
    }

    fn cont(&mut self) -> Result<()> {
        self.monitor.trace_off()?;
        self.stopped = false;
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        if !self.stopped {
            return Err(Error::State("next requires the target to be stopped".into()));
        }
        self.registers = self.monitor.step()?;
        self.cache.refresh_accessed(&mut self.monitor)?;
        self.emit(StoppedReason::Step);
        Ok(())
    }

    fn set_breakpoint(&mut self, src_path: &Path, line: u32) -> Result<bool> {
        let Some(symbols) = &self.symbols else {
            return Err(Error::Domain("no symbols loaded".into()));
        };
        let Some(entry) = symbols.next_breakpoint_line(src_path, line) else {
            return Ok(false);
        };
        let pc = entry.start;
        let resolved_line = entry.range.line1;
        self.monitor.set_breakpoint_pc(pc)?;
        self.breakpoint = Some(Breakpoint {
            src_path: src_path.to_path_buf(),
            line: resolved_line,
            pc,
        });
        Ok(true)
    }

    fn clear_breakpoint(&mut self) -> Result<()> {
        self.monitor.clear_breakpoint()?;
        self.breakpoint = None;
        Ok(())
    }

    fn evaluate_expression(&mut self, expr: &str, _format_as_hex: bool) -> Result<EvalResult> {
        if !self.stopped {
            return Err(Error::State("evaluate_expression requires the target to be stopped".into()));
        }
        let parsed = expr::Expr::parse(expr)?;
        let cache = &mut self.cache;
        let monitor = &mut self.monitor;
        parsed.evaluate(self.symbols.as_ref(), |addr, buf| cache.read(monitor, addr, buf))
    }

    /// Reads the registers block following an async `!` marker / Xemu header,
    /// and transitions to stopped if the breakpoint validates.
    fn handle_async_stop(&mut self, lines: &[String]) {
        let Ok(regs) = self.monitor.parse_register_lines(lines) else {
            return;
        };
        if self.accept_breakpoint_hit(regs.pc) {
            self.registers = regs;
            self.stopped = true;
            self.cache.invalidate();
            self.emit(StoppedReason::Breakpoint);
        } else if let Err(err) = self.monitor.trace_off() {
            log::warn!("failed to resume after invalid breakpoint hit: {err}");
        }
    }

    /// The periodic fallback: poll registers and check whether `pc` has
    /// landed on the breakpoint, for transports that don't emit `!`.
    fn check_breakpoint_by_pc(&mut self) -> Result<()> {
        let Some(bp) = self.breakpoint.clone() else {
            return Ok(());
        };
        if self.stopped {
            return Ok(());
        }
        let regs = self.monitor.read_registers()?;
        if regs.pc == bp.pc && self.accept_breakpoint_hit(regs.pc) {
            self.registers = regs;
            self.stopped = true;
            self.cache.invalidate();
            self.emit(StoppedReason::Breakpoint);
        }
        Ok(())
    }

    /// §4.6 breakpoint validity: accepts unconditionally unless the
    /// breakpoint sits on a call-family opcode, in which case the hit is
    /// only genuine if `current_pc` equals the resolved call target.
    fn accept_breakpoint_hit(&mut self, current_pc: u32) -> bool {
        let Some(bp) = self.breakpoint.clone() else {
            return false;
        };
        match self.call_target_if_any(bp.pc) {
            Ok(Some(target)) => current_pc == target,
            Ok(None) => true,
            Err(err) => {
                log::warn!("breakpoint validity check failed: {err}");
                true
            }
        }
    }

    fn call_target_if_any(&mut self, pc: u32) -> Result<Option<u32>> {
        let mut bytes = [0u8; 3];
        let cache = &mut self.cache;
        cache.read(&mut self.monitor, pc, &mut bytes)?;
        let op = opcode::opcode_at(bytes[0]);
        if matches!(op.mnemonic, Mnemonic::Illegal) {
            return Ok(None);
        }
        let operand = u32::from(bytes[1]) | (u32::from(bytes[2]) << 8);
        let target = match op.mode {
            AddressingMode::Absolute => operand,
            AddressingMode::AbsoluteIndirect => self.read_word(operand)?,
            AddressingMode::AbsoluteIndirectX => self.read_word(operand + self.registers.x)?,
            AddressingMode::RelativeWord => {
                let signed = if operand < 0x8000 {
                    operand as i64
                } else {
                    operand as i64 - 0x1_0000
                };
                (i64::from(pc) + signed) as u32
            }
        };
        Ok(Some(target))
    }

    fn read_word(&mut self, addr: u32) -> Result<u32> {
        let mut bytes = [0u8; 2];
        self.cache.read(&mut self.monitor, addr, &mut bytes)?;
        Ok(u32::from(bytes[0]) | (u32::from(bytes[1]) << 8))
    }

    /// Dispatches the stopped event on a short-lived thread and waits for
    /// it, so a subsequent task never races the event's delivery (§9).
    fn emit(&self, reason: StoppedReason) {
        let events = self.events.clone();
        let handle = std::thread::spawn(move || events.stopped(reason));
        let _ = handle.join();
    }
}

/// Derives the current source position for `pc` from the loaded symbols.
#[must_use]
pub fn source_position(symbols: Option<&SymbolModel>, pc: u32) -> SourcePosition {
    let Some(symbols) = symbols else {
        return SourcePosition::default();
    };
    let Some(hit) = symbols.block_entry_at(pc) else {
        return SourcePosition::default();
    };
    SourcePosition {
        src_path: symbols.files.get(hit.entry.file_index).cloned(),
        line: hit.entry.range.line1,
        segment: hit.segment.to_string(),
        block: hit.block.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink(Mutex<Vec<StoppedReason>>);

    impl EventSink for RecordingSink {
        fn stopped(&self, reason: StoppedReason) {
            self.0.lock().unwrap().push(reason);
        }
    }

    #[test]
    fn source_position_defaults_without_symbols() {
        let pos = source_position(None, 0x2000);
        assert_eq!(pos.line, 0);
        assert!(pos.src_path.is_none());
    }

    #[test]
    fn event_sink_receives_reasons_in_order() {
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let worker_events: Arc<dyn EventSink> = sink.clone();
        worker_events.stopped(StoppedReason::Pause);
        worker_events.stopped(StoppedReason::Step);
        assert_eq!(sink.0.lock().unwrap().as_slice(), [StoppedReason::Pause, StoppedReason::Step]);
    }
}
