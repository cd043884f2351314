//! Output observation primitives for shellwire sessions.
//!
//! This crate provides the pieces a session writes to but never depends on:
//! - `LogMsg` - Typed output message enum
//! - `MsgStore` - Broadcast + history store backing the verbose observation sink
//! - `LogSink` - Async byte sink used to mirror raw shell output to a log

pub mod log_msg;
pub mod log_sink;
pub mod msg_store;

pub use log_msg::{LogMsg, OutputStream};
pub use log_sink::LogSink;
pub use msg_store::MsgStore;
