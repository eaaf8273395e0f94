//! Entry point: parses arguments, installs the logger, and runs the DAP
//! session over stdin/stdout.

mod app;
mod cli;
mod dap;
mod err;
mod log;

use clap::Parser;

use crate::err::Exit;

fn main() -> Exit {
    match try_main() {
        Ok(()) => Exit::Success,
        Err(err) => Exit::Failure(err.into()),
    }
}

fn try_main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    log::init(cli.log_file.as_deref(), cli.verbose)?;

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    app::run(stdin.lock(), stdout)
}
