//! DAP request dispatcher: translates JSON-RPC-shaped DAP requests into
//! calls against [`m65dap::engine::Engine`] and writes back responses and
//! events over the same guarded stdout writer.

use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use m65dap::engine::{Engine, EventSink, StoppedReason};
use serde_json::{json, Value};

use crate::dap::types::{EvaluateArgs, LaunchArgs, SetBreakpointsArgs};
use crate::dap::{read_message, write_message};

const THREAD_ID: i64 = 1;
const FRAME_ID: i64 = 1;
const REGISTERS_SCOPE: i64 = 1;
const LOCALS_SCOPE: i64 = 2;

/// Emits a `stopped` DAP event on the shared writer, joined by the engine
/// worker before its next task so event delivery precedes the next reply.
struct DapEventSink<W: Write + Send> {
    out: Out<W>,
}

impl<W: Write + Send> EventSink for DapEventSink<W> {
    fn stopped(&self, reason: StoppedReason) {
        let body = json!({
            "reason": reason_name(reason),
            "threadId": THREAD_ID,
            "allThreadsStopped": true,
        });
        if let Err(err) = self.out.send_event("stopped", body) {
            log::warn!("failed to write stopped event: {err}");
        }
    }
}

fn reason_name(reason: StoppedReason) -> &'static str {
    match reason {
        StoppedReason::Pause => "pause",
        StoppedReason::Step => "step",
        StoppedReason::Breakpoint => "breakpoint",
    }
}

/// A writer shared between the request/response loop and the event sink, so
/// a `stopped` event never interleaves with a response mid-write.
struct Out<W: Write + Send> {
    writer: Arc<Mutex<W>>,
    seq: Arc<Mutex<u64>>,
}

impl<W: Write + Send> Clone for Out<W> {
    fn clone(&self) -> Self {
        Self { writer: self.writer.clone(), seq: self.seq.clone() }
    }
}

impl<W: Write + Send> Out<W> {
    fn next_seq(&self) -> u64 {
        let mut seq = self.seq.lock().unwrap();
        *seq += 1;
        *seq
    }

    fn send(&self, value: Value) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        write_message(&mut *writer, &value).context("writing DAP message")
    }

    fn send_event(&self, event: &str, body: Value) -> Result<()> {
        self.send(json!({
            "seq": self.next_seq(),
            "type": "event",
            "event": event,
            "body": body,
        }))
    }

    fn send_response(&self, request_seq: u64, command: &str, outcome: Result<Value, String>) -> Result<()> {
        let (success, body, message) = match outcome {
            Ok(body) => (true, body, None),
            Err(message) => (false, Value::Null, Some(message)),
        };
        let mut envelope = json!({
            "seq": self.next_seq(),
            "type": "response",
            "request_seq": request_seq,
            "success": success,
            "command": command,
            "body": body,
        });
        if let Some(message) = message {
            envelope["message"] = Value::String(message);
        }
        self.send(envelope)
    }
}

/// Session state threaded through the request loop: the target engine, once
/// a `launch` request has connected it.
struct Session<W: Write + Send> {
    out: Out<W>,
    engine: Option<Engine>,
}

impl<W: Write + Send + 'static> Session<W> {
    fn dispatch(&mut self, command: &str, args: &Value) -> Result<Value, String> {
        match command {
            "initialize" => Ok(json!({
                "supportsConfigurationDoneRequest": true,
                "supportsValueFormattingOptions": true,
                "supportsReadMemoryRequest": true,
            })),
            "configurationDone" => Ok(Value::Null),
            "launch" => self.launch(args),
            "threads" => Ok(json!({ "threads": [{ "id": THREAD_ID, "name": "MEGA65Thread" }] })),
            "setBreakpoints" => self.set_breakpoints(args),
            "pause" => self.engine()?.pause().map(|()| Value::Null).map_err(|e| e.to_string()),
            "continue" => self
                .engine()?
                .cont()
                .map(|()| json!({ "allThreadsContinued": true }))
                .map_err(|e| e.to_string()),
            "next" => self.engine()?.next().map(|()| Value::Null).map_err(|e| e.to_string()),
            "stackTrace" => self.stack_trace(),
            "source" => self.source(args),
            "scopes" => Ok(json!({
                "scopes": [
                    { "name": "Registers", "variablesReference": REGISTERS_SCOPE, "expensive": false },
                    { "name": "Local Vars", "variablesReference": LOCALS_SCOPE, "expensive": false },
                ]
            })),
            "variables" => self.variables(args),
            "evaluate" => self.evaluate(args),
            "disconnect" => self.disconnect(),
            _ => Err(format!("unsupported request: {command}")),
        }
    }

    fn engine(&self) -> Result<&Engine, String> {
        self.engine.as_ref().ok_or_else(|| "no target connected; send `launch` first".to_string())
    }

    fn launch(&mut self, args: &Value) -> Result<Value, String> {
        let args: LaunchArgs = serde_json::from_value(args.clone()).map_err(|e| e.to_string())?;
        let sink: Arc<dyn EventSink> = Arc::new(DapEventSink { out: self.out.clone() });
        let engine = Engine::connect(&args.serial_port, args.reset_before_run, args.reset_after_disconnect, sink)
            .map_err(|e| e.to_string())?;
        engine.set_target(&args.program).map_err(|e| e.to_string())?;
        self.engine = Some(engine);
        Ok(Value::Null)
    }

    fn set_breakpoints(&mut self, args: &Value) -> Result<Value, String> {
        let args: SetBreakpointsArgs = serde_json::from_value(args.clone()).map_err(|e| e.to_string())?;
        let path = args.source.path.ok_or_else(|| "setBreakpoints requires a source path".to_string())?;
        let engine = self.engine()?;

        let mut resolved = Vec::with_capacity(args.breakpoints.len());
        for (i, bp) in args.breakpoints.iter().enumerate() {
            let verified = if i == 0 {
                engine.set_breakpoint(&path, bp.line).map_err(|e| e.to_string())?
            } else {
                false
            };
            resolved.push(json!({ "verified": verified, "line": bp.line }));
        }
        Ok(json!({ "breakpoints": resolved }))
    }

    fn stack_trace(&self) -> Result<Value, String> {
        let engine = self.engine()?;
        let pos = engine.source_position().map_err(|e| e.to_string())?;
        let name = if pos.block.is_empty() { "unknown".to_string() } else { pos.block.clone() };
        let source = pos.src_path.as_ref().map(|p| json!({ "path": p }));
        Ok(json!({
            "stackFrames": [{
                "id": FRAME_ID,
                "name": name,
                "line": pos.line,
                "column": 0,
                "source": source,
            }],
            "totalFrames": 1,
        }))
    }

    fn source(&self, args: &Value) -> Result<Value, String> {
        let path = args
            .get("source")
            .and_then(|s| s.get("path"))
            .and_then(Value::as_str)
            .ok_or_else(|| "source request requires source.path".to_string())?;
        let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        Ok(json!({ "content": content }))
    }

    fn variables(&self, args: &Value) -> Result<Value, String> {
        let reference = args.get("variablesReference").and_then(Value::as_i64).unwrap_or(0);
        if reference == LOCALS_SCOPE {
            return Ok(json!({ "variables": [] }));
        }
        if reference != REGISTERS_SCOPE {
            return Err(format!("unsupported variablesReference: {reference}"));
        }

        let regs = self.engine()?.registers().map_err(|e| e.to_string())?;
        let byte = |name: &str, v: u32| json!({ "name": name, "value": format!("{v:02X}"), "variablesReference": 0 });
        let word = |name: &str, v: u32| json!({ "name": name, "value": format!("{v:04X}"), "variablesReference": 0 });
        Ok(json!({
            "variables": [
                byte("A", regs.a),
                byte("X", regs.x),
                byte("Y", regs.y),
                byte("Z", regs.z),
                byte("BP", regs.b),
                word("PC", regs.pc),
                word("SP", regs.sp),
                json!({ "name": "FL", "value": regs.flags_string, "variablesReference": 0 }),
            ]
        }))
    }

    fn evaluate(&self, args: &Value) -> Result<Value, String> {
        let args: EvaluateArgs = serde_json::from_value(args.clone()).map_err(|e| e.to_string())?;
        let hex = args.format.map(|f| f.hex).unwrap_or(true);
        let result = self.engine()?.evaluate_expression(&args.expression, hex).map_err(|e| e.to_string())?;
        Ok(json!({
            "result": result.text,
            "variablesReference": 0,
            "memoryReference": format!("0x{:X}", result.address),
        }))
    }

    fn disconnect(&mut self) -> Result<Value, String> {
        self.engine.take();
        Ok(Value::Null)
    }
}

/// Runs the DAP session to completion: reads requests from `input` until
/// EOF or a `disconnect` request, replying and emitting events on `output`.
pub fn run<R: BufRead, W: Write + Send + 'static>(mut input: R, output: W) -> Result<()> {
    let out = Out { writer: Arc::new(Mutex::new(output)), seq: Arc::new(Mutex::new(0)) };
    let mut session = Session { out: out.clone(), engine: None };

    loop {
        let message = read_message(&mut input).context("reading DAP request")?;
        let Some(message) = message else {
            break;
        };
        let request_seq = message.get("seq").and_then(Value::as_u64).unwrap_or(0);
        let command = message
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("DAP request missing `command`"))?
            .to_string();
        let empty_args = Value::Object(Default::default());
        let args = message.get("arguments").unwrap_or(&empty_args).clone();

        let is_disconnect = command == "disconnect";
        let outcome = session.dispatch(&command, &args);
        out.send_response(request_seq, &command, outcome)?;
        if command == "initialize" {
            out.send_event("initialized", Value::Null)?;
        }
        if is_disconnect {
            break;
        }
    }

    Ok(())
}
