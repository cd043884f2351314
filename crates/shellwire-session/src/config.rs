//! Session and command configuration.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use shellwire_shell::validate_executable_path;

use crate::error::{Error, Result};

const DEFAULT_REDIRECT_SHELL: &str = "/bin/sh";
const DEFAULT_CLOSE_GRACE_MS: u64 = 5_000;

/// Construction options for a [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Absolute path to the shell executable.
    pub path: PathBuf,
    /// Extra arguments passed to the shell.
    pub args: Vec<String>,
    /// Whole-session deadline in milliseconds; `0` disables it.
    pub session_timeout_ms: u64,
    /// Mirror decoded output batches to the session's message store.
    pub verbose: bool,
    /// Absolute path of a file receiving raw stdout and stderr bytes.
    pub log_file: Option<PathBuf>,
    /// Working directory of the shell.
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables for the shell.
    pub env: HashMap<String, String>,
    /// Strict shell used to echo the sentinel onto stderr.
    pub redirect_shell: PathBuf,
    /// Source the shell's rc file right after spawning.
    pub source_rc: bool,
    /// How long close waits for the shell to exit before killing it.
    pub close_grace_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            args: Vec::new(),
            session_timeout_ms: 0,
            verbose: false,
            log_file: None,
            working_dir: None,
            env: HashMap::new(),
            redirect_shell: PathBuf::from(DEFAULT_REDIRECT_SHELL),
            source_rc: false,
            close_grace_ms: DEFAULT_CLOSE_GRACE_MS,
        }
    }
}

impl SessionConfig {
    /// Create a config for the shell at `path` with all other options defaulted.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Session deadline, `None` when disabled.
    #[must_use]
    pub const fn session_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.session_timeout_ms)
    }

    #[must_use]
    pub const fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    /// Log file to mirror into; relative paths are not eligible.
    #[must_use]
    pub fn mirrored_log_file(&self) -> Option<&PathBuf> {
        self.log_file.as_ref().filter(|p| p.is_absolute())
    }

    /// Check construction input without touching any process.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if the shell path is not an absolute,
    /// well-formed executable, or the redirect shell is not absolute.
    pub fn validate(&self) -> Result<()> {
        validate_executable_path(&self.path)?;
        if !self.redirect_shell.is_absolute() {
            return Err(Error::Configuration(format!(
                "Redirect shell must be absolute: {}",
                self.redirect_shell.display()
            )));
        }
        Ok(())
    }
}

/// Options for a single command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Per-command deadline; zero disables it.
    pub timeout: Duration,
    /// `false` selects the fire-and-forget path.
    pub wait: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            wait: true,
        }
    }
}

impl RunOptions {
    /// Wait for completion with the given deadline.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    /// Write the command and return without waiting.
    #[must_use]
    pub fn no_wait() -> Self {
        Self {
            wait: false,
            ..Self::default()
        }
    }

    /// Command deadline, `None` when disabled.
    #[must_use]
    pub fn deadline(&self) -> Option<Duration> {
        (!self.timeout.is_zero()).then_some(self.timeout)
    }
}

const fn non_zero_millis(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}
