//! Failure reporting hook.

use async_trait::async_trait;

use crate::error::Error;

/// Receives per-command failures instead of the caller.
///
/// When a handler is registered on a session, every command failure,
/// command timeout and shell exit observed by a waiting command is passed
/// here and the command itself completes with no value. Session-level
/// errors are never routed to the handler.
#[async_trait]
pub trait FailureHandler: Send + Sync {
    /// Handle the failure of `command`.
    async fn on_failure(&self, command: &str, error: Error);
}

/// Handler that records failures through `tracing`.
#[derive(Debug, Default, Clone)]
pub struct LogFailureHandler;

#[async_trait]
impl FailureHandler for LogFailureHandler {
    async fn on_failure(&self, command: &str, error: Error) {
        tracing::warn!(command, %error, "Shell command failed");
    }
}

/// Adapter turning a closure into a [`FailureHandler`].
pub struct FnFailureHandler<F>(F);

impl<F> FnFailureHandler<F>
where
    F: Fn(&str, Error) + Send + Sync,
{
    #[must_use]
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> FailureHandler for FnFailureHandler<F>
where
    F: Fn(&str, Error) + Send + Sync,
{
    async fn on_failure(&self, command: &str, error: Error) {
        (self.0)(command, error);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[tokio::test]
    async fn test_fn_handler_receives_failure() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = FnFailureHandler::new(move |command: &str, error: Error| {
            sink.lock().unwrap().push(format!("{command}: {error}"));
        });

        handler
            .on_failure("false", Error::CommandFailure(None))
            .await;

        assert_eq!(*seen.lock().unwrap(), vec!["false: Command failed".to_string()]);
    }
}
