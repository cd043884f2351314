//! Long-lived shell session with request/response command semantics.

use std::{
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use shellwire_core::{LogSink, MsgStore, OutputStream};
use shellwire_shell::{Sentinel, UnixShell};
use tokio::{
    process::Command,
    sync::{Mutex, broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{
    config::{RunOptions, SessionConfig},
    driver::{Driver, Request, SharedStdin, ShellInput, pump_output, write_input},
    error::{Error, Result},
    handler::FailureHandler,
    state::{SessionEvent, SessionState, Shared},
};

/// Resources released by [`Session::close`].
struct Lifecycle {
    child: AsyncGroupChild,
    driver: JoinHandle<()>,
    pumps: Vec<JoinHandle<()>>,
    shutdown: oneshot::Sender<()>,
    log_sink: Option<LogSink>,
}

/// Builder for opening a [`Session`].
#[derive(Default)]
pub struct SessionBuilder {
    config: SessionConfig,
    failure_handler: Option<Arc<dyn FailureHandler>>,
    msg_store: Option<Arc<MsgStore>>,
}

impl SessionBuilder {
    /// Start a builder for the shell at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::from_config(SessionConfig::new(path))
    }

    /// Start a builder from a full configuration.
    #[must_use]
    pub fn from_config(config: SessionConfig) -> Self {
        Self {
            config,
            failure_handler: None,
            msg_store: None,
        }
    }

    /// Whole-session deadline; zero disables it.
    #[must_use]
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Push commands and their output lines to the session's [`MsgStore`].
    #[must_use]
    pub const fn verbose(mut self, verbose: bool) -> Self {
        self.config.verbose = verbose;
        self
    }

    /// Mirror raw output bytes to `path` (must be absolute).
    #[must_use]
    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.log_file = Some(path.into());
        self
    }

    /// Start the shell in `dir`.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.working_dir = Some(dir.into());
        self
    }

    /// Set an environment variable for the shell.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.insert(key.into(), value.into());
        self
    }

    /// Append a command-line argument for the shell.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.config.args.push(arg.into());
        self
    }

    /// Source the shell's rc file right after it starts.
    #[must_use]
    pub const fn source_rc(mut self, source_rc: bool) -> Self {
        self.config.source_rc = source_rc;
        self
    }

    /// How long [`Session::close`] waits for the shell to exit before killing it.
    #[must_use]
    pub fn close_grace(mut self, grace: Duration) -> Self {
        self.config.close_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Route per-command failures to `handler` instead of the caller.
    #[must_use]
    pub fn on_error(mut self, handler: impl FailureHandler + 'static) -> Self {
        self.failure_handler = Some(Arc::new(handler));
        self
    }

    /// Use an existing store as the verbose observation sink.
    #[must_use]
    pub fn msg_store(mut self, store: Arc<MsgStore>) -> Self {
        self.msg_store = Some(store);
        self
    }

    /// Validate the configuration and spawn the shell.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] before anything is spawned if the
    /// shell path is invalid, or a spawn/I/O error if the shell or log file
    /// cannot be opened.
    pub async fn open(self) -> Result<Session> {
        let Self {
            config,
            failure_handler,
            msg_store,
        } = self;

        config.validate()?;
        let sentinel = Sentinel::new().with_redirect_shell(&config.redirect_shell)?;
        let shell = UnixShell::from_path(&config.path)
            .ok_or_else(|| Error::Configuration(format!("Invalid shell path: {}", config.path.display())))?;

        let log_sink = match config.mirrored_log_file() {
            Some(path) => Some(LogSink::open_file(path).await?),
            None => {
                if let Some(path) = &config.log_file {
                    tracing::warn!(path = %path.display(), "Ignoring relative log file path");
                }
                None
            }
        };

        let mut cmd = Command::new(&config.path);
        cmd.args(&config.args)
            .envs(&config.env)
            .env("TERM", "dumb")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.group_spawn().map_err(|source| Error::Spawn {
            path: config.path.clone(),
            source,
        })?;
        let (Some(stdin), Some(stdout), Some(stderr)) = (
            child.inner().stdin.take(),
            child.inner().stdout.take(),
            child.inner().stderr.take(),
        ) else {
            // Unreachable with piped stdio, but never leave the shell running.
            let _ = child.start_kill();
            return Err(Error::Io(std::io::Error::other("shell stdio was not piped")));
        };

        let id = Uuid::new_v4();
        tracing::info!(
            session_id = %id,
            shell = %config.path.display(),
            pid = ?child.id(),
            "Spawned shell session"
        );

        let shell_input: ShellInput = Box::new(stdin);
        let stdin: SharedStdin = Arc::new(Mutex::new(Some(shell_input)));
        let shared = Arc::new(Shared::new());
        let msg_store = msg_store.unwrap_or_default();
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (output_tx, output) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown) = oneshot::channel();

        let pumps = vec![
            tokio::spawn(pump_output(
                OutputStream::Stdout,
                stdout,
                output_tx.clone(),
                log_sink.clone(),
            )),
            tokio::spawn(pump_output(
                OutputStream::Stderr,
                stderr,
                output_tx,
                log_sink.clone(),
            )),
        ];

        let driver = tokio::spawn(
            Driver {
                session_id: id,
                sentinel,
                stdin: Arc::clone(&stdin),
                requests,
                output,
                shutdown,
                shared: Arc::clone(&shared),
                observer: config.verbose.then(|| Arc::clone(&msg_store)),
                session_timeout: config.session_timeout(),
            }
            .run(),
        );

        let session = Session {
            id,
            shell,
            verbose: config.verbose,
            close_grace: config.close_grace(),
            stdin,
            requests: requests_tx,
            shared,
            msg_store,
            failure_handler,
            lifecycle: Mutex::new(Some(Lifecycle {
                child,
                driver,
                pumps,
                shutdown: shutdown_tx,
                log_sink,
            })),
        };

        if config.source_rc {
            if let Some(source) = session.shell.source_command() {
                tracing::debug!(session_id = %id, source, "Sourcing shell rc file");
                session.send(&source).await?;
            }
        }

        Ok(session)
    }
}

/// A wrapped shell process.
///
/// Waiting commands are serialized through an internal queue, so a session
/// can be shared by reference between tasks. Fire-and-forget commands bypass
/// the queue and go straight to the shell's input.
pub struct Session {
    id: Uuid,
    shell: UnixShell,
    verbose: bool,
    close_grace: Duration,
    stdin: SharedStdin,
    requests: mpsc::UnboundedSender<Request>,
    shared: Arc<Shared>,
    msg_store: Arc<MsgStore>,
    failure_handler: Option<Arc<dyn FailureHandler>>,
    lifecycle: Mutex<Option<Lifecycle>>,
}

impl Session {
    /// Open a session from a configuration with no failure handler.
    ///
    /// # Errors
    /// See [`SessionBuilder::open`].
    pub async fn open(config: SessionConfig) -> Result<Self> {
        SessionBuilder::from_config(config).open().await
    }

    /// Start a builder for the shell at `path`.
    #[must_use]
    pub fn builder(path: impl Into<PathBuf>) -> SessionBuilder {
        SessionBuilder::new(path)
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub const fn shell(&self) -> &UnixShell {
        &self.shell
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// The first session-level fault, if one occurred.
    #[must_use]
    pub fn fault(&self) -> Option<SessionEvent> {
        self.shared.fault()
    }

    /// Subscribe to session-level events (session timeout, shell exit).
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.subscribe()
    }

    /// Observation sink receiving output batches when verbose.
    #[must_use]
    pub fn msg_store(&self) -> Arc<MsgStore> {
        Arc::clone(&self.msg_store)
    }

    /// Run `command` and wait for its output.
    ///
    /// # Errors
    /// See [`run_with`](Self::run_with).
    pub async fn run(&self, command: &str) -> Result<Option<String>> {
        self.run_with(command, RunOptions::default()).await
    }

    /// Run `command` with explicit options.
    ///
    /// Waiting commands resolve with their stdout (`None` if empty) or fail
    /// with [`Error::CommandFailure`] carrying their stderr. With
    /// `wait: false` the command is written and `Ok(None)` returned at once.
    ///
    /// # Errors
    /// Returns the command's failure, timeout or the shell's exit unless a
    /// failure handler absorbs it; session errors always propagate.
    pub async fn run_with(&self, command: &str, options: RunOptions) -> Result<Option<String>> {
        if !options.wait {
            self.send(command).await?;
            return Ok(None);
        }
        self.shared.check()?;

        let (reply, rx) = oneshot::channel();
        let request = Request {
            command: command.to_string(),
            timeout: options.deadline(),
            reply,
        };
        self.requests
            .send(request)
            .map_err(|_| self.shared.rejection())?;
        let result = rx.await.unwrap_or_else(|_| Err(self.shared.rejection()));

        match (result, &self.failure_handler) {
            (Err(err), Some(handler)) if err.is_command_failure() => {
                handler.on_failure(command, err).await;
                Ok(None)
            }
            (result, _) => result,
        }
    }

    /// Write `command` without waiting for or capturing its output.
    ///
    /// # Errors
    /// Returns error if the session is closed or faulted, or the write fails.
    pub async fn send(&self, command: &str) -> Result<()> {
        self.shared.check()?;
        if self.verbose {
            self.msg_store.push_command(command);
        }
        tracing::debug!(session_id = %self.id, command, "Sending command without waiting");
        write_input(&self.stdin, format!("{command}\n").as_bytes()).await
    }

    /// End the session. Idempotent.
    ///
    /// Closes the shell's input, lets an in-flight command finish, waits for
    /// the shell to exit (killing it after the grace period), then flushes
    /// and closes the log file.
    ///
    /// # Errors
    /// Returns error if the log file cannot be flushed.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.lifecycle.lock().await;
        let Some(lifecycle) = guard.take() else {
            return Ok(());
        };
        let Lifecycle {
            mut child,
            driver,
            pumps,
            shutdown,
            log_sink,
        } = lifecycle;

        self.shared.mark_closed();
        drop(self.stdin.lock().await.take());
        let _ = shutdown.send(());

        match tokio::time::timeout(self.close_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(session_id = %self.id, %status, "Shell exited");
            }
            Ok(Err(err)) => {
                tracing::warn!(session_id = %self.id, %err, "Failed to wait for shell");
            }
            Err(_) => {
                tracing::warn!(
                    session_id = %self.id,
                    grace = ?self.close_grace,
                    "Shell did not exit in time, killing"
                );
                if let Err(err) = child.kill().await {
                    tracing::warn!(session_id = %self.id, %err, "Failed to kill shell");
                }
            }
        }

        // Background jobs may keep the pipes open after the shell exits.
        for mut pump in pumps {
            if tokio::time::timeout(self.close_grace, &mut pump).await.is_err() {
                pump.abort();
            }
        }
        if let Err(err) = driver.await {
            tracing::warn!(session_id = %self.id, %err, "Driver task failed");
        }

        if self.verbose {
            self.msg_store.push_finished();
        }
        if let Some(sink) = log_sink {
            sink.close().await?;
        }
        tracing::info!(session_id = %self.id, "Session closed");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(lifecycle) = self.lifecycle.get_mut().as_mut() {
            if let Err(err) = lifecycle.child.start_kill() {
                tracing::debug!(session_id = %self.id, %err, "Failed to kill shell on drop");
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("shell", &self.shell)
            .field("state", &self.state())
            .field("fault", &self.fault())
            .finish_non_exhaustive()
    }
}
