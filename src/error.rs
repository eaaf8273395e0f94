//! Error types for the target control engine.

use thiserror::Error;

/// A convenient type alias for [`Result`](std::result::Result).
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised anywhere in the control engine.
///
/// Variants correspond to the error kinds of `spec.md` §7: transport errors
/// are permanent and terminate the session; the rest are scoped to a single
/// task and reported back to the DAP client as a request error.
#[derive(Debug, Error)]
pub enum Error {
    /// Permanent I/O failure: open, write, or a non-timeout read error.
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),
    /// A bounded read did not complete before its deadline.
    #[error("timed out waiting for response")]
    Timeout,
    /// The monitor did not echo, prompt, or header as expected.
    #[error("protocol mismatch: {0}")]
    Protocol(String),
    /// An operation was invoked while the engine was in the wrong state.
    #[error("invalid state: {0}")]
    State(String),
    /// A domain-level precondition was violated (missing symbols, bad file).
    #[error("{0}")]
    Domain(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut || err.kind() == std::io::ErrorKind::WouldBlock {
            Error::Timeout
        } else {
            Error::Transport(err)
        }
    }
}
