//! Top-level error and exit-code reporting.

use std::error::Error as StdError;
use std::process::{ExitCode, Termination};

use owo_colors::OwoColorize;
use thiserror::Error;

/// A top-level error from within the application.
#[derive(Debug, Error)]
pub enum Error {
    /// Startup failure: bad args, unreadable config, logger couldn't open.
    #[error(transparent)]
    Startup(#[from] anyhow::Error),
}

impl Error {
    fn advise(&self) {
        eprintln!("{} {}", "error:".red().bold(), self);
        let Some(mut err) = self.source() else {
            return;
        };
        while let Some(src) = err.source() {
            eprintln!("   {} {err}", "├─".red());
            err = src;
        }
        eprintln!("   {} {err}", "╰─".red());
    }
}

/// Application exit condition.
///
/// Per spec: a clean `disconnect` or a fatal DAP-*session* error (once the
/// session has actually started and logged the failure) both exit 0 — the
/// DAP client learns of session failure over the wire, not via exit code.
/// Only a failure to even start the session (bad args, unwritable log file)
/// produces a non-zero [`sysexits`] code.
#[derive(Debug)]
pub enum Exit {
    Success,
    Failure(Error),
}

impl<E: Into<Error>> From<E> for Exit {
    fn from(err: E) -> Self {
        Self::Failure(err.into())
    }
}

impl Termination for Exit {
    fn report(self) -> ExitCode {
        match self {
            Exit::Success => ExitCode::SUCCESS,
            Exit::Failure(err) => {
                err.advise();
                sysexits::ExitCode::Usage.into()
            }
        }
    }
}
