//! Session and command errors.

use std::{path::PathBuf, time::Duration};

use shellwire_shell::ShellError;
use thiserror::Error;

/// Result alias for session operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Session error.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid construction input; nothing was spawned.
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Failed to spawn shell {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The whole-session deadline expired; the session accepts no more commands.
    #[error("Session timed out after {0:?}")]
    SessionTimeout(Duration),
    /// The per-command deadline expired before the command completed.
    #[error("Command timed out after {0:?}")]
    CommandTimeout(Duration),
    /// The command exited nonzero, carrying whatever it wrote to stderr.
    #[error("Command failed{}", failure_suffix(.0.as_deref()))]
    CommandFailure(Option<String>),
    #[error("Shell process exited")]
    ProcessExited,
    #[error("Session is closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn failure_suffix(message: Option<&str>) -> String {
    message.map(|m| format!(": {m}")).unwrap_or_default()
}

impl Error {
    /// Whether this error is the outcome of a single command rather than of
    /// the session. Only these are routed to a registered failure handler.
    #[must_use]
    pub const fn is_command_failure(&self) -> bool {
        matches!(
            self,
            Self::CommandFailure(_) | Self::CommandTimeout(_) | Self::ProcessExited
        )
    }

    /// Failure text of a [`CommandFailure`](Self::CommandFailure), if any.
    #[must_use]
    pub fn failure_message(&self) -> Option<&str> {
        match self {
            Self::CommandFailure(message) => message.as_deref(),
            _ => None,
        }
    }
}

impl From<ShellError> for Error {
    fn from(err: ShellError) -> Self {
        Self::Configuration(err.to_string())
    }
}
