//! Typed shapes for the handful of DAP request arguments and event bodies
//! this bridge constructs or consumes directly. Everything else is handled
//! as loosely-typed `serde_json::Value`, matching the "one command at a
//! time" shape of the underlying monitor protocol rather than modeling the
//! full DAP schema.

use std::path::PathBuf;

use serde::Deserialize;

/// Arguments of the custom `launch` request (spec §6.1).
#[derive(Debug, Deserialize)]
pub struct LaunchArgs {
    pub program: PathBuf,
    #[serde(rename = "serialPort")]
    pub serial_port: String,
    #[serde(rename = "resetBeforeRun", default)]
    pub reset_before_run: bool,
    #[serde(rename = "resetAfterDisconnect", default = "default_true")]
    pub reset_after_disconnect: bool,
}

fn default_true() -> bool {
    true
}

/// Arguments of `setBreakpoints`.
#[derive(Debug, Deserialize)]
pub struct SetBreakpointsArgs {
    pub source: Source,
    pub breakpoints: Vec<SourceBreakpoint>,
}

#[derive(Debug, Deserialize)]
pub struct Source {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct SourceBreakpoint {
    pub line: u32,
}

/// Arguments of `evaluate`.
#[derive(Debug, Deserialize)]
pub struct EvaluateArgs {
    pub expression: String,
    #[serde(default)]
    pub format: Option<ValueFormat>,
}

#[derive(Debug, Deserialize)]
pub struct ValueFormat {
    #[serde(default)]
    pub hex: bool,
}
