//! Per-command output collection and completion detection.
//!
//! A [`PendingCommand`] is created when a waiting command is attached to the
//! shell's output streams and dropped once it resolves. It owns one line
//! buffer per stream; nothing carries over between commands.
//!
//! Each stream only collects lines between the command's begin marker and
//! its end marker. Output that reaches a stream before the begin marker
//! belongs to something else and is dropped.

use std::time::Duration;

use shellwire_core::OutputStream;
use shellwire_shell::{MarkerKind, Sentinel};
use tokio::time::Instant;

use crate::error::{Error, Result};

/// How a command finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Marker seen on stdout; carries the joined stdout lines.
    Success(Option<String>),
    /// Marker seen on stderr; carries the joined stderr lines.
    Failure(Option<String>),
}

impl Outcome {
    pub(crate) fn into_result(self) -> Result<Option<String>> {
        match self {
            Self::Success(output) => Ok(output),
            Self::Failure(message) => Err(Error::CommandFailure(message)),
        }
    }
}

/// Result of feeding one chunk.
#[derive(Debug, Default)]
pub(crate) struct Feed {
    /// Complete lines decoded from this chunk, markers included.
    pub lines: Vec<String>,
    /// Set when this chunk completed the command.
    pub outcome: Option<Outcome>,
}

/// Splits a byte stream into lines, holding back an unterminated tail.
#[derive(Debug, Default)]
struct LineSplitter {
    partial: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);
        let Some(last_newline) = self.partial.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let tail = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, tail);

        complete
            .split(|&b| b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .filter(|line| !line.is_empty())
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }
}

#[derive(Debug, Default)]
struct StreamBuffer {
    splitter: LineSplitter,
    lines: Vec<String>,
    begun: bool,
}

impl StreamBuffer {
    fn joined(&mut self) -> Option<String> {
        if self.lines.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.lines).join("\n"))
        }
    }
}

/// Bookkeeping for the one waiting command attached to the streams.
#[derive(Debug)]
pub(crate) struct PendingCommand {
    seq: u64,
    command: String,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    stdout: StreamBuffer,
    stderr: StreamBuffer,
    completed: bool,
}

impl PendingCommand {
    /// Attach a command; its deadline starts counting now.
    pub(crate) fn new(seq: u64, command: String, timeout: Option<Duration>) -> Self {
        Self {
            seq,
            command,
            timeout,
            deadline: timeout.map(|t| Instant::now() + t),
            stdout: StreamBuffer::default(),
            stderr: StreamBuffer::default(),
            completed: false,
        }
    }

    pub(crate) const fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn command(&self) -> &str {
        &self.command
    }

    pub(crate) const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[cfg(test)]
    pub(crate) const fn is_completed(&self) -> bool {
        self.completed
    }

    /// Consume a chunk of raw bytes from `stream`.
    pub(crate) fn feed(&mut self, sentinel: &Sentinel, stream: OutputStream, chunk: &[u8]) -> Feed {
        if self.completed {
            return Feed::default();
        }

        let seq = self.seq;
        let buffer = self.buffer_mut(stream);
        let lines = buffer.splitter.push(chunk);
        let mut found = false;

        for line in &lines {
            match sentinel.find(line) {
                Some(marker) if marker.seq == seq => match marker.kind {
                    MarkerKind::Begin => {
                        buffer.begun = true;
                        buffer.lines.clear();
                    }
                    MarkerKind::End => {
                        if buffer.begun && !marker.output.is_empty() {
                            buffer.lines.push(marker.output.to_string());
                        }
                        found = true;
                        break;
                    }
                },
                Some(marker) => {
                    tracing::debug!(
                        seq,
                        stale_seq = marker.seq,
                        %stream,
                        "Dropping marker of another command"
                    );
                    buffer.lines.clear();
                }
                None if buffer.begun => buffer.lines.push(line.clone()),
                None => {
                    tracing::trace!(seq, %stream, "Dropping output before begin marker");
                }
            }
        }

        let outcome = found.then(|| self.finish(stream));
        Feed { lines, outcome }
    }

    /// Expire the command's deadline.
    ///
    /// Returns `None` if the command already completed.
    pub(crate) fn expire(&mut self) -> Option<Error> {
        if self.completed {
            return None;
        }
        self.completed = true;
        Some(Error::CommandTimeout(self.timeout.unwrap_or_default()))
    }

    /// Abandon the command, e.g. because the shell exited.
    pub(crate) fn abandon(&mut self) -> bool {
        !std::mem::replace(&mut self.completed, true)
    }

    fn finish(&mut self, stream: OutputStream) -> Outcome {
        self.completed = true;
        match stream {
            OutputStream::Stdout => Outcome::Success(self.stdout.joined()),
            OutputStream::Stderr => Outcome::Failure(self.stderr.joined()),
        }
    }

    const fn buffer_mut(&mut self, stream: OutputStream) -> &mut StreamBuffer {
        match stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentinel() -> Sentinel {
        Sentinel::with_token("test")
    }

    fn pending(seq: u64) -> PendingCommand {
        PendingCommand::new(seq, "cmd".into(), None)
    }

    /// A pending command whose begin marker was already seen on both streams.
    fn begun(s: &Sentinel, seq: u64) -> PendingCommand {
        let mut cmd = pending(seq);
        let begin = format!("{}\n", s.begin_marker(seq));
        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            let feed = cmd.feed(s, stream, begin.as_bytes());
            assert_eq!(feed.outcome, None);
        }
        cmd
    }

    #[test]
    fn test_empty_success_yields_none() {
        let s = sentinel();
        let mut cmd = begun(&s, 1);
        let feed = cmd.feed(&s, OutputStream::Stdout, b"__SHELLWIRE_test_1__\n");
        assert_eq!(feed.outcome, Some(Outcome::Success(None)));
        assert!(cmd.is_completed());
    }

    #[test]
    fn test_multiline_output_joined_in_order() {
        let s = sentinel();
        let mut cmd = begun(&s, 1);
        let feed = cmd.feed(&s, OutputStream::Stdout, b"a\nb\n\nc\n__SHELLWIRE_test_1__\n");
        assert_eq!(feed.outcome, Some(Outcome::Success(Some("a\nb\nc".into()))));
        assert_eq!(feed.lines, vec!["a", "b", "c", "__SHELLWIRE_test_1__"]);
    }

    #[test]
    fn test_partial_lines_across_chunks() {
        let s = sentinel();
        let mut cmd = begun(&s, 2);
        assert!(cmd.feed(&s, OutputStream::Stdout, b"hel").lines.is_empty());
        let feed = cmd.feed(&s, OutputStream::Stdout, b"lo\nwor");
        assert_eq!(feed.lines, vec!["hello"]);
        assert_eq!(feed.outcome, None);
        let feed = cmd.feed(&s, OutputStream::Stdout, b"ld\n__SHELLWIRE_te");
        assert_eq!(feed.outcome, None);
        let feed = cmd.feed(&s, OutputStream::Stdout, b"st_2__\n");
        assert_eq!(
            feed.outcome,
            Some(Outcome::Success(Some("hello\nworld".into())))
        );
    }

    #[test]
    fn test_unterminated_output_before_marker() {
        let s = sentinel();
        let mut cmd = begun(&s, 1);
        let feed = cmd.feed(&s, OutputStream::Stdout, b"hi__SHELLWIRE_test_1__\n");
        assert_eq!(feed.outcome, Some(Outcome::Success(Some("hi".into()))));
    }

    #[test]
    fn test_crlf_stripped() {
        let s = sentinel();
        let mut cmd = begun(&s, 1);
        let feed = cmd.feed(&s, OutputStream::Stdout, b"x\r\n__SHELLWIRE_test_1__\r\n");
        assert_eq!(feed.outcome, Some(Outcome::Success(Some("x".into()))));
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let s = sentinel();
        let mut cmd = begun(&s, 1);
        let bytes = "héllo\n".as_bytes();
        cmd.feed(&s, OutputStream::Stdout, &bytes[..2]);
        cmd.feed(&s, OutputStream::Stdout, &bytes[2..]);
        let feed = cmd.feed(&s, OutputStream::Stdout, b"__SHELLWIRE_test_1__\n");
        assert_eq!(feed.outcome, Some(Outcome::Success(Some("héllo".into()))));
    }

    #[test]
    fn test_failure_stream_completes_with_stderr_text() {
        let s = sentinel();
        let mut cmd = begun(&s, 4);
        cmd.feed(&s, OutputStream::Stdout, b"partial stdout\n");
        let feed = cmd.feed(&s, OutputStream::Stderr, b"oops\n__SHELLWIRE_test_4__\n");
        assert_eq!(feed.outcome, Some(Outcome::Failure(Some("oops".into()))));
    }

    #[test]
    fn test_empty_failure_still_fails() {
        let s = sentinel();
        let mut cmd = begun(&s, 1);
        let feed = cmd.feed(&s, OutputStream::Stderr, b"__SHELLWIRE_test_1__\n");
        let outcome = feed.outcome.unwrap();
        assert_eq!(outcome, Outcome::Failure(None));
        assert!(matches!(outcome.into_result(), Err(Error::CommandFailure(None))));
    }

    #[test]
    fn test_lines_after_end_marker_are_not_collected() {
        let s = sentinel();
        let mut cmd = begun(&s, 1);
        let feed = cmd.feed(&s, OutputStream::Stdout, b"a\n__SHELLWIRE_test_1__\nb\n");
        assert_eq!(feed.outcome, Some(Outcome::Success(Some("a".into()))));
        assert_eq!(feed.lines.len(), 3);
    }

    #[test]
    fn test_output_before_begin_marker_is_dropped() {
        let s = sentinel();
        let mut cmd = pending(3);
        let feed = cmd.feed(
            &s,
            OutputStream::Stdout,
            b"ff\nhalf__SHELLWIRE_test_3_BEGIN__\nmine\n__SHELLWIRE_test_3__\n",
        );
        assert_eq!(feed.outcome, Some(Outcome::Success(Some("mine".into()))));
    }

    #[test]
    fn test_late_output_of_timed_out_command_is_dropped() {
        let s = sentinel();
        let mut cmd = pending(1);
        cmd.feed(&s, OutputStream::Stdout, b"late\n__SHELLWIRE_test_0__\n");
        let feed = cmd.feed(
            &s,
            OutputStream::Stdout,
            b"__SHELLWIRE_test_1_BEGIN__\nnext\n__SHELLWIRE_test_1__\n",
        );
        assert_eq!(feed.outcome, Some(Outcome::Success(Some("next".into()))));

        let mut cmd = pending(1);
        cmd.feed(&s, OutputStream::Stderr, b"boom\n__SHELLWIRE_test_0__\n");
        cmd.feed(&s, OutputStream::Stderr, b"__SHELLWIRE_test_1_BEGIN__\nerr2\n");
        let feed = cmd.feed(&s, OutputStream::Stderr, b"__SHELLWIRE_test_1__\n");
        assert_eq!(feed.outcome, Some(Outcome::Failure(Some("err2".into()))));
    }

    #[test]
    fn test_stale_marker_clears_buffered_lines() {
        let s = sentinel();
        let mut cmd = begun(&s, 5);
        let feed = cmd.feed(&s, OutputStream::Stdout, b"old\n__SHELLWIRE_test_4__\nnew\n");
        assert_eq!(feed.outcome, None);
        let feed = cmd.feed(&s, OutputStream::Stdout, b"__SHELLWIRE_test_5__\n");
        assert_eq!(feed.outcome, Some(Outcome::Success(Some("new".into()))));
    }

    #[test]
    fn test_nothing_accepted_after_completion() {
        let s = sentinel();
        let mut cmd = begun(&s, 1);
        cmd.feed(&s, OutputStream::Stdout, b"__SHELLWIRE_test_1__\n");
        let feed = cmd.feed(&s, OutputStream::Stderr, b"__SHELLWIRE_test_1__\n");
        assert!(feed.lines.is_empty());
        assert_eq!(feed.outcome, None);
        assert!(cmd.expire().is_none());
        assert!(!cmd.abandon());
    }

    #[tokio::test]
    async fn test_expire_reports_timeout_once() {
        let mut cmd = PendingCommand::new(1, "sleep".into(), Some(Duration::from_millis(5)));
        assert!(cmd.deadline().is_some());
        assert!(matches!(
            cmd.expire(),
            Some(Error::CommandTimeout(t)) if t == Duration::from_millis(5)
        ));
        assert!(cmd.expire().is_none());

        let s = sentinel();
        let feed = cmd.feed(&s, OutputStream::Stdout, b"__SHELLWIRE_test_1__\n");
        assert_eq!(feed.outcome, None);
    }
}
