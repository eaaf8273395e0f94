//! Logger setup.
//!
//! stdout is reserved for the DAP wire channel, so logs always go to
//! stderr or, if `--log-file` is given, a file — never stdout.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use log::LevelFilter;

/// Installs the process-wide logger.
///
/// `verbosity` follows the repeated `-v` convention: 0 is warnings and
/// above, 1 is info, 2 is debug, 3+ is trace.
pub fn init(log_file: Option<&Path>, verbosity: u8) -> Result<()> {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);

    if let Some(path) = log_file {
        let file = File::create(path).with_context(|| format!("could not open log file: `{}`", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    } else {
        builder.target(env_logger::Target::Stderr);
    }

    builder.init();
    Ok(())
}
