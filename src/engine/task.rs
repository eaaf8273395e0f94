//! Task queue: a single background worker thread serializes monitor I/O,
//! and callers enqueue work and await a single-shot reply.
//!
//! Grounded on the channel-pair pattern used for inter-thread talk in the
//! teacher codebase, but split so each call gets its own one-shot reply
//! channel: the shared queue preserves FIFO submission order while the
//! per-call channel gives the "single-shot notification" the spec asks for.

use std::path::PathBuf;
use std::sync::mpsc;

use crate::engine::expr::EvalResult;
use crate::engine::SourcePosition;
use crate::error::Result;
use crate::monitor::Registers;

/// A unit of work the worker thread executes against the monitor/cache.
pub enum Op {
    SetTarget(PathBuf),
    RunTarget,
    Pause,
    Cont,
    Next,
    SetBreakpoint(PathBuf, u32),
    ClearBreakpoint,
    Evaluate(String, bool),
    Registers,
    SourcePosition,
    Shutdown,
}

/// The typed reply to an [`Op`].
pub enum Reply {
    Unit(Result<()>),
    Bool(Result<bool>),
    Eval(Result<EvalResult>),
    Regs(Result<Registers>),
    Pos(Result<SourcePosition>),
}

struct Queued {
    op: Op,
    reply: mpsc::Sender<Reply>,
}

/// The caller-facing handle: enqueues work, blocks for the reply.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<Queued>,
}

impl Sender {
    /// Enqueues `op` and blocks until the worker replies.
    ///
    /// # Errors
    ///
    /// Fails if the worker thread has shut down and dropped its receiver.
    pub fn submit(&self, op: Op) -> std::result::Result<Reply, mpsc::RecvError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        if self.tx.send(Queued { op, reply: reply_tx }).is_err() {
            return Err(mpsc::RecvError);
        }
        reply_rx.recv()
    }
}

/// The worker-facing handle: pops at most one task per main-loop iteration.
pub struct Receiver {
    rx: mpsc::Receiver<Queued>,
}

impl Receiver {
    /// Pops at most one pending task, returning its op and a reply slot.
    pub fn try_pop(&self) -> Option<(Op, mpsc::Sender<Reply>)> {
        self.rx.try_recv().ok().map(|q| (q.op, q.reply))
    }
}

/// Constructs a connected `(Sender, Receiver)` pair.
#[must_use]
pub fn pair() -> (Sender, Receiver) {
    let (tx, rx) = mpsc::channel();
    (Sender { tx }, Receiver { rx })
}
