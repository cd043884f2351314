//! Line-oriented REPL over a shellwire session.
//!
//! Run with: cargo run -p shellwire-repl -- --help
//!
//! Each input line runs as a waiting command; lines starting with `&` are
//! sent fire-and-forget. Output goes to stdout, failures to stderr, or to
//! the log with `--absorb`.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use shellwire_session::{Error, LogFailureHandler, RunOptions, Session, SessionEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Line-oriented REPL over a shellwire session
#[derive(Parser, Debug)]
#[command(name = "shellwire-repl")]
#[command(version)]
struct Args {
    /// Shell to wrap; a path or a name looked up on PATH (default: $SHELL)
    shell: Option<String>,

    /// Echo shell output as it arrives
    #[arg(short, long)]
    verbose: bool,

    /// Log command failures instead of printing them
    #[arg(long)]
    absorb: bool,

    /// Per-command timeout in milliseconds; 0 disables it
    #[arg(long = "timeout-ms", default_value_t = 0)]
    timeout_ms: u64,

    /// Mirror raw shell output to this file
    #[arg(long = "log")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let timeout = Duration::from_millis(args.timeout_ms);
    let shell = match args.shell {
        Some(name) => shellwire_shell::resolve_executable_path(&name)
            .await
            .with_context(|| format!("shell not found: {name}"))?,
        None => shellwire_shell::get_interactive_shell(),
    };

    let mut builder = Session::builder(&shell).verbose(args.verbose);
    if args.absorb {
        builder = builder.on_error(LogFailureHandler);
    }
    if let Some(log_file) = args.log_file {
        builder = builder.log_file(log_file);
    }
    let session = builder
        .open()
        .await
        .with_context(|| format!("failed to open {}", shell.display()))?;

    if args.verbose {
        let store = session.msg_store();
        let mut stdout = store.stdout_chunked_stream();
        let mut stderr = store.stderr_chunked_stream();
        tokio::spawn(async move {
            while let Some(batch) = stdout.next().await {
                eprintln!("[stdout] {batch}");
            }
        });
        tokio::spawn(async move {
            while let Some(batch) = stderr.next().await {
                eprintln!("[stderr] {batch}");
            }
        });
    }

    let mut events = session.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::TimedOut { after } => eprintln!("session timed out after {after:?}"),
                SessionEvent::ProcessExited => eprintln!("shell exited"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let (command, options) = match line.strip_prefix('&') {
            Some(rest) => (rest, RunOptions::no_wait()),
            None => (line.as_str(), RunOptions::with_timeout(timeout)),
        };

        match session.run_with(command, options).await {
            Ok(Some(output)) => println!("{output}"),
            Ok(None) => {}
            Err(Error::CommandFailure(message)) => {
                eprintln!("failed{}", message.map(|m| format!(": {m}")).unwrap_or_default());
            }
            Err(err) if err.is_command_failure() => eprintln!("{err}"),
            Err(err) => {
                tracing::error!(%err, "Session unusable");
                break;
            }
        }
    }

    session.close().await?;
    Ok(())
}
