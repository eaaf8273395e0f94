//! Target control engine for a MEGA65/Xemu Debug Adapter Protocol bridge.
//!
//! This crate mediates between a DAP client and a MEGA65 (or Xemu) monitor
//! over a serial link or UNIX domain socket. It owns the line/prompt
//! framing state machine, the paged memory cache, the debug-symbol model,
//! and the serialized command/event pump that makes up the "main loop".
//!
//! The DAP wire codec itself is not part of this crate; see the `cli`
//! workspace member for the stdio front end built on top of [`engine`].

pub mod cache;
pub mod engine;
pub mod error;
pub mod framer;
pub mod monitor;
pub mod opcode;
pub mod symbol;
pub mod transport;

pub use error::{Error, Result};
