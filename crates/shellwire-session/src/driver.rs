//! Event loop serving waiting commands against the shared shell streams.
//!
//! One driver task runs per session. It owns the queue of waiting commands
//! and attaches at most one [`PendingCommand`] to the output streams at a
//! time; further commands wait in FIFO order until the current one
//! resolves, times out, or the shell exits.

use std::{sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use shellwire_core::{LogMsg, LogSink, MsgStore, OutputStream};
use shellwire_shell::Sentinel;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{Mutex, mpsc, oneshot},
    time::Instant,
};
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    responder::PendingCommand,
    state::{SessionEvent, Shared},
};

const READ_CHUNK: usize = 8 * 1024;

pub(crate) type ShellInput = Box<dyn AsyncWrite + Send + Unpin>;
pub(crate) type SharedStdin = Arc<Mutex<Option<ShellInput>>>;
pub(crate) type Reply = oneshot::Sender<Result<Option<String>>>;

/// Output observed by a stream pump.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Chunk { stream: OutputStream, data: Bytes },
    Closed(OutputStream),
}

/// A waiting command queued for the driver.
pub(crate) struct Request {
    pub command: String,
    pub timeout: Option<Duration>,
    pub reply: Reply,
}

struct Active {
    pending: PendingCommand,
    reply: Reply,
}

impl Active {
    fn resolve(self, result: Result<Option<String>>) {
        if self.reply.send(result).is_err() {
            tracing::debug!(seq = self.pending.seq(), "Caller dropped before command resolved");
        }
    }
}

pub(crate) struct Driver {
    pub session_id: Uuid,
    pub sentinel: Sentinel,
    pub stdin: SharedStdin,
    pub requests: mpsc::UnboundedReceiver<Request>,
    pub output: mpsc::UnboundedReceiver<StreamEvent>,
    pub shutdown: oneshot::Receiver<()>,
    pub shared: Arc<Shared>,
    pub observer: Option<Arc<MsgStore>>,
    pub session_timeout: Option<Duration>,
}

impl Driver {
    pub(crate) async fn run(mut self) {
        let mut session_deadline = self.session_timeout.map(|t| Instant::now() + t);
        let mut active: Option<Active> = None;
        let mut open_streams = 2_u8;
        let mut shutting_down = false;
        let mut next_seq = 0_u64;

        loop {
            let command_deadline = active.as_ref().and_then(|a| a.pending.deadline());

            tokio::select! {
                biased;

                event = self.output.recv(), if open_streams > 0 => match event {
                    Some(StreamEvent::Chunk { stream, data }) => {
                        self.on_chunk(&mut active, stream, &data);
                    }
                    Some(StreamEvent::Closed(stream)) => {
                        tracing::debug!(session_id = %self.session_id, %stream, "Shell stream closed");
                        open_streams -= 1;
                        if open_streams == 0 {
                            self.on_exit(&mut active);
                        }
                    }
                    None => {
                        open_streams = 0;
                        self.on_exit(&mut active);
                    }
                },
                () = sleep_until(command_deadline), if command_deadline.is_some() => {
                    self.on_command_timeout(&mut active);
                }
                () = sleep_until(session_deadline), if session_deadline.is_some() => {
                    session_deadline = None;
                    self.on_session_timeout();
                }
                _ = &mut self.shutdown, if !shutting_down => {
                    tracing::debug!(session_id = %self.session_id, "Driver shutting down");
                    shutting_down = true;
                    session_deadline = None;
                }
                request = self.requests.recv(), if active.is_none() && !shutting_down => {
                    match request {
                        Some(request) => {
                            active = self.attach(request, next_seq).await;
                            next_seq += 1;
                        }
                        None => shutting_down = true,
                    }
                }
            }

            if shutting_down && active.is_none() {
                break;
            }
        }

        self.reject_queued();
    }

    async fn attach(&self, request: Request, seq: u64) -> Option<Active> {
        let Request {
            command,
            timeout,
            reply,
        } = request;

        if reply.is_closed() {
            tracing::debug!(seq, "Skipping command abandoned while queued");
            return None;
        }
        if let Err(err) = self.shared.check() {
            let _ = reply.send(Err(err));
            return None;
        }

        let line = self.sentinel.wrap(&command, seq);
        if let Some(observer) = &self.observer {
            observer.push_command(command.as_str());
        }
        tracing::debug!(session_id = %self.session_id, seq, command, ?timeout, "Attaching command");

        // The deadline starts here, before the command reaches the shell.
        let pending = PendingCommand::new(seq, command, timeout);
        if let Err(err) = write_input(&self.stdin, line.as_bytes()).await {
            tracing::warn!(session_id = %self.session_id, seq, %err, "Failed to write command");
            let _ = reply.send(Err(err));
            return None;
        }

        Some(Active { pending, reply })
    }

    fn on_chunk(&self, active: &mut Option<Active>, stream: OutputStream, data: &[u8]) {
        let Some(current) = active.as_mut() else {
            tracing::trace!(%stream, bytes = data.len(), "Discarding output outside a command");
            return;
        };

        let feed = current.pending.feed(&self.sentinel, stream, data);
        if let Some(observer) = &self.observer {
            if !feed.lines.is_empty() {
                observer.push(LogMsg::output(stream, feed.lines.join("\n")));
            }
        }

        if let Some(outcome) = feed.outcome {
            if let Some(done) = active.take() {
                tracing::debug!(
                    session_id = %self.session_id,
                    seq = done.pending.seq(),
                    %stream,
                    "Command completed"
                );
                done.resolve(outcome.into_result());
            }
        }
    }

    fn on_command_timeout(&self, active: &mut Option<Active>) {
        let Some(mut current) = active.take() else {
            return;
        };
        if let Some(err) = current.pending.expire() {
            tracing::warn!(
                session_id = %self.session_id,
                seq = current.pending.seq(),
                command = current.pending.command(),
                "Command timed out"
            );
            current.resolve(Err(err));
        }
    }

    fn on_session_timeout(&self) {
        let after = self.session_timeout.unwrap_or_default();
        tracing::warn!(session_id = %self.session_id, ?after, "Session timed out");
        self.shared.raise(SessionEvent::TimedOut { after });
    }

    fn on_exit(&self, active: &mut Option<Active>) {
        tracing::info!(session_id = %self.session_id, "Shell process exited");
        self.shared.raise(SessionEvent::ProcessExited);
        if let Some(mut current) = active.take() {
            if current.pending.abandon() {
                current.resolve(Err(Error::ProcessExited));
            }
        }
    }

    fn reject_queued(&mut self) {
        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            let _ = request.reply.send(Err(self.shared.rejection()));
        }
    }
}

/// Write bytes to the shell's input stream.
pub(crate) async fn write_input(stdin: &SharedStdin, bytes: &[u8]) -> Result<()> {
    let mut guard = stdin.lock().await;
    let writer = guard.as_mut().ok_or(Error::Closed)?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Forward one output stream to the driver, mirroring raw bytes to `sink`.
pub(crate) async fn pump_output<R>(
    stream: OutputStream,
    mut reader: R,
    tx: mpsc::UnboundedSender<StreamEvent>,
    sink: Option<LogSink>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buf.reserve(READ_CHUNK);
        match reader.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let data = buf.split().freeze();
                if let Some(sink) = &sink {
                    if let Err(err) = sink.write_raw(&data).await {
                        tracing::warn!(%stream, %err, "Failed to mirror shell output");
                    }
                }
                if tx.send(StreamEvent::Chunk { stream, data }).is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(%stream, %err, "Error reading shell output");
                break;
            }
        }
    }
    let _ = tx.send(StreamEvent::Closed(stream));
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines};
    use tokio_test::assert_ok;

    use super::*;

    /// Driver wired to in-memory pipes standing in for the shell.
    struct Harness {
        requests: mpsc::UnboundedSender<Request>,
        output: mpsc::UnboundedSender<StreamEvent>,
        shutdown: Option<oneshot::Sender<()>>,
        shared: Arc<Shared>,
        sentinel: Sentinel,
        input: Lines<BufReader<DuplexStream>>,
        handle: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        fn spawn(session_timeout: Option<Duration>) -> Self {
            let (requests_tx, requests) = mpsc::unbounded_channel();
            let (output_tx, output) = mpsc::unbounded_channel();
            let (shutdown_tx, shutdown) = oneshot::channel();
            let (stdin, shell_side) = tokio::io::duplex(4096);
            let shared = Arc::new(Shared::new());
            let sentinel = Sentinel::with_token("drv");
            let stdin: ShellInput = Box::new(stdin);
            let driver = Driver {
                session_id: Uuid::new_v4(),
                sentinel: sentinel.clone(),
                stdin: Arc::new(Mutex::new(Some(stdin))),
                requests,
                output,
                shutdown,
                shared: Arc::clone(&shared),
                observer: None,
                session_timeout,
            };
            Self {
                requests: requests_tx,
                output: output_tx,
                shutdown: Some(shutdown_tx),
                shared,
                sentinel,
                input: BufReader::new(shell_side).lines(),
                handle: tokio::spawn(driver.run()),
            }
        }

        fn submit(
            &self,
            command: &str,
            timeout: Option<Duration>,
        ) -> oneshot::Receiver<Result<Option<String>>> {
            let (reply, rx) = oneshot::channel();
            assert_ok!(self.requests.send(Request {
                command: command.into(),
                timeout,
                reply,
            }));
            rx
        }

        async fn next_input(&mut self) -> String {
            self.input.next_line().await.unwrap().unwrap()
        }

        fn emit(&self, stream: OutputStream, text: &str) {
            assert_ok!(self.output.send(StreamEvent::Chunk {
                stream,
                data: Bytes::copy_from_slice(text.as_bytes()),
            }));
        }

        /// Emit what the shell prints before running command `seq`.
        fn begin(&self, seq: u64) {
            let marker = format!("{}\n", self.sentinel.begin_marker(seq));
            self.emit(OutputStream::Stdout, &marker);
            self.emit(OutputStream::Stderr, &marker);
        }
    }

    #[tokio::test]
    async fn test_command_resolves_from_stdout() {
        let mut h = Harness::spawn(None);
        let rx = h.submit("echo hi", None);

        let line = h.next_input().await;
        assert_eq!(line, h.sentinel.wrap("echo hi", 0).trim_end());

        h.begin(0);
        h.emit(OutputStream::Stdout, &format!("hi\n{}\n", h.sentinel.marker(0)));
        assert_eq!(rx.await.unwrap().unwrap(), Some("hi".to_string()));
    }

    #[tokio::test]
    async fn test_failure_resolves_from_stderr() {
        let mut h = Harness::spawn(None);
        let rx = h.submit("false", None);
        h.next_input().await;

        h.begin(0);
        h.emit(OutputStream::Stderr, &format!("{}\n", h.sentinel.marker(0)));
        assert!(matches!(rx.await.unwrap(), Err(Error::CommandFailure(None))));
    }

    #[tokio::test]
    async fn test_queued_commands_attach_one_at_a_time() {
        let mut h = Harness::spawn(None);
        let first = h.submit("echo one", None);
        let second = h.submit("echo two", None);

        assert!(h.next_input().await.contains(" echo one &&"));
        h.begin(0);
        h.emit(OutputStream::Stdout, &format!("one\n{}\n", h.sentinel.marker(0)));
        assert_eq!(first.await.unwrap().unwrap(), Some("one".to_string()));

        // The second command is only written once the first resolved.
        assert!(h.next_input().await.contains(" echo two &&"));
        h.begin(1);
        h.emit(OutputStream::Stdout, &format!("two\n{}\n", h.sentinel.marker(1)));
        assert_eq!(second.await.unwrap().unwrap(), Some("two".to_string()));
    }

    #[tokio::test]
    async fn test_late_stdout_of_timed_out_command_is_not_misattributed() {
        let mut h = Harness::spawn(None);
        let slow = h.submit("sleep 1; echo late", Some(Duration::from_millis(20)));
        h.next_input().await;
        h.begin(0);
        assert!(matches!(slow.await.unwrap(), Err(Error::CommandTimeout(_))));

        let next = h.submit("echo next", None);
        h.next_input().await;
        h.emit(OutputStream::Stdout, &format!("late\n{}\n", h.sentinel.marker(0)));
        h.begin(1);
        h.emit(OutputStream::Stdout, &format!("next\n{}\n", h.sentinel.marker(1)));
        assert_eq!(next.await.unwrap().unwrap(), Some("next".to_string()));
    }

    #[tokio::test]
    async fn test_late_stderr_of_timed_out_command_is_not_misattributed() {
        let mut h = Harness::spawn(None);
        let slow = h.submit("sleep 1; echo boom >&2; false", Some(Duration::from_millis(20)));
        h.next_input().await;
        h.begin(0);
        assert!(matches!(slow.await.unwrap(), Err(Error::CommandTimeout(_))));

        let next = h.submit("echo err2 >&2; false", None);
        h.next_input().await;
        h.emit(OutputStream::Stderr, &format!("boom\n{}\n", h.sentinel.marker(0)));
        h.begin(1);
        h.emit(OutputStream::Stderr, &format!("err2\n{}\n", h.sentinel.marker(1)));
        let err = next.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::CommandFailure(Some(ref m)) if m == "err2"));
    }

    #[tokio::test]
    async fn test_output_between_commands_is_discarded() {
        let mut h = Harness::spawn(None);
        h.emit(OutputStream::Stdout, "stray\n");
        let rx = h.submit("true", None);
        h.next_input().await;
        h.begin(0);
        h.emit(OutputStream::Stdout, &format!("{}\n", h.sentinel.marker(0)));
        assert_eq!(rx.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn test_output_after_attach_before_begin_is_discarded() {
        let mut h = Harness::spawn(None);
        let rx = h.submit("echo b", None);
        h.next_input().await;
        // A fire-and-forget command ahead in the shell's input still printing.
        h.emit(OutputStream::Stdout, "ff\n");
        h.emit(OutputStream::Stderr, "ff-err\n");
        h.begin(0);
        h.emit(OutputStream::Stdout, &format!("b\n{}\n", h.sentinel.marker(0)));
        assert_eq!(rx.await.unwrap().unwrap(), Some("b".to_string()));
    }

    #[tokio::test]
    async fn test_streams_closing_fails_pending_command() {
        let mut h = Harness::spawn(None);
        let mut events = h.shared.subscribe();
        let rx = h.submit("exit", None);
        h.next_input().await;

        assert_ok!(h.output.send(StreamEvent::Closed(OutputStream::Stdout)));
        assert_ok!(h.output.send(StreamEvent::Closed(OutputStream::Stderr)));
        assert!(matches!(rx.await.unwrap(), Err(Error::ProcessExited)));
        assert_eq!(events.recv().await.unwrap(), SessionEvent::ProcessExited);

        let after = h.submit("echo again", None);
        assert!(matches!(after.await.unwrap(), Err(Error::ProcessExited)));
    }

    #[tokio::test]
    async fn test_session_timeout_rejects_new_commands() {
        let h = Harness::spawn(Some(Duration::from_millis(20)));
        let mut events = h.shared.subscribe();
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::TimedOut {
                after: Duration::from_millis(20)
            }
        );

        let rx = h.submit("echo late", None);
        assert!(matches!(rx.await.unwrap(), Err(Error::SessionTimeout(_))));
    }

    #[tokio::test]
    async fn test_session_timeout_leaves_in_flight_command_running() {
        let mut h = Harness::spawn(Some(Duration::from_millis(20)));
        let mut events = h.shared.subscribe();
        let rx = h.submit("sleep 1", None);
        h.next_input().await;

        events.recv().await.unwrap();
        h.begin(0);
        h.emit(OutputStream::Stdout, &format!("done\n{}\n", h.sentinel.marker(0)));
        assert_eq!(rx.await.unwrap().unwrap(), Some("done".to_string()));
    }

    #[tokio::test]
    async fn test_shutdown_stops_driver() {
        let mut h = Harness::spawn(None);
        h.shared.mark_closed();
        assert_ok!(h.shutdown.take().unwrap().send(()));
        assert_ok!((&mut h.handle).await);

        let (reply, _rx) = oneshot::channel();
        let request = Request {
            command: "echo never".into(),
            timeout: None,
            reply,
        };
        assert!(h.requests.send(request).is_err());
    }

    #[tokio::test]
    async fn test_pump_forwards_and_mirrors() {
        let (client, mut server) = tokio::io::duplex(64);
        let sink = LogSink::new(client);
        let (tx, mut rx) = mpsc::unbounded_channel();

        pump_output(OutputStream::Stderr, &b"raw bytes\n"[..], tx, Some(sink.clone())).await;
        assert_ok!(sink.close().await);

        match rx.recv().await {
            Some(StreamEvent::Chunk { stream, data }) => {
                assert_eq!(stream, OutputStream::Stderr);
                assert_eq!(&data[..], b"raw bytes\n");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            rx.recv().await,
            Some(StreamEvent::Closed(OutputStream::Stderr))
        ));

        let mut mirrored = Vec::new();
        assert_ok!(server.read_to_end(&mut mirrored).await);
        assert_eq!(mirrored, b"raw bytes\n");
    }
}
