//! Request/response command sessions over a long-lived shell process.
//!
//! Provides:
//! - `Session` - Wrapped shell with waiting and fire-and-forget commands
//! - `SessionBuilder` / `SessionConfig` - Construction options
//! - `FailureHandler` - Hook absorbing per-command failures
//!
//! Completion is detected by appending a sentinel echo to every waiting
//! command; see [`shellwire_shell::Sentinel`] for the rewrite.

pub mod config;
mod driver;
pub mod error;
pub mod handler;
mod responder;
pub mod session;
pub mod state;

pub use config::{RunOptions, SessionConfig};
pub use error::{Error, Result};
pub use handler::{FailureHandler, FnFailureHandler, LogFailureHandler};
pub use session::{Session, SessionBuilder};
pub use shellwire_core::{LogMsg, MsgStore};
pub use state::{SessionEvent, SessionState};
