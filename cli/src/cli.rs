//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

/// A Debug Adapter Protocol bridge for the MEGA65 and its emulator, Xemu.
///
/// Speaks DAP on stdin/stdout; the DAP `launch` request supplies the
/// program to run and the serial device or `unix#` socket to reach it.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Write logs to this file instead of stderr.
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Increase log verbosity (may be repeated: `-v`, `-vv`, `-vvv`).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
