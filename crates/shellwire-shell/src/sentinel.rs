//! Completion sentinel and command rewriting.
//!
//! A waiting command `C` is sent to the shell as
//!
//! ```text
//! /bin/sh -c 'echo <begin>; echo <begin> 1>&2'; C && echo <end> || /bin/sh -c 'echo <end> 1>&2'
//! ```
//!
//! The begin marker opens the command's output on both streams, so anything
//! printed earlier (fire-and-forget commands, late output of a command that
//! timed out) can be told apart. The end marker lands on stdout when `C`
//! exits 0 and on stderr otherwise. Stderr echoes go through a strict POSIX
//! shell because some interpreters' built-in `echo` cannot redirect to the
//! failure stream.
//!
//! End markers are `__SHELLWIRE_<token>_<seq>__` and begin markers
//! `__SHELLWIRE_<token>_<seq>_BEGIN__`: `token` is random per [`Sentinel`],
//! `seq` is chosen by the caller per command. Commands whose text contains
//! the marker prefix produce undefined results.

use std::path::Path;

use uuid::Uuid;

use crate::ShellError;

const MARKER_HEAD: &str = "__SHELLWIRE_";
const MARKER_TAIL: &str = "__";
const BEGIN_TAG: &str = "_BEGIN";
const DEFAULT_REDIRECT_SHELL: &str = "/bin/sh";

/// Which end of a command's output a marker delimits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Begin,
    End,
}

/// A marker found in an output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerMatch<'a> {
    /// Command sequence number the marker was issued for.
    pub seq: u64,
    pub kind: MarkerKind,
    /// Output that preceded the marker on the same line (unterminated output).
    pub output: &'a str,
}

/// Completion marker generator and matcher for one session.
#[derive(Debug, Clone)]
pub struct Sentinel {
    prefix: String,
    redirect_shell: String,
}

impl Default for Sentinel {
    fn default() -> Self {
        Self::new()
    }
}

impl Sentinel {
    /// Create a sentinel with a fresh random token.
    #[must_use]
    pub fn new() -> Self {
        Self::with_token(&Uuid::new_v4().simple().to_string())
    }

    /// Create a sentinel with a fixed token.
    ///
    /// The token should contain only ASCII alphanumerics.
    #[must_use]
    pub fn with_token(token: &str) -> Self {
        Self {
            prefix: format!("{MARKER_HEAD}{token}_"),
            redirect_shell: DEFAULT_REDIRECT_SHELL.to_string(),
        }
    }

    /// Use `shell` for the failure-stream echo instead of `/bin/sh`.
    ///
    /// # Errors
    /// Returns error if the path is not absolute or cannot be quoted.
    pub fn with_redirect_shell(mut self, shell: &Path) -> Result<Self, ShellError> {
        if !shell.is_absolute() {
            return Err(ShellError::NotAbsolute(shell.to_path_buf()));
        }
        self.redirect_shell = shlex::try_quote(shell.to_string_lossy().as_ref())
            .map_err(|_| ShellError::Malformed(shell.to_path_buf()))?
            .into_owned();
        Ok(self)
    }

    /// Marker text for command `seq`.
    #[must_use]
    pub fn marker(&self, seq: u64) -> String {
        format!("{}{seq}{MARKER_TAIL}", self.prefix)
    }

    /// Begin marker text for command `seq`.
    #[must_use]
    pub fn begin_marker(&self, seq: u64) -> String {
        format!("{}{seq}{BEGIN_TAG}{MARKER_TAIL}", self.prefix)
    }

    /// Clause that prints the begin marker on both streams.
    #[must_use]
    pub fn begin_clause(&self, seq: u64) -> String {
        let marker = self.begin_marker(seq);
        format!(
            "{} -c 'echo {marker}; echo {marker} 1>&2';",
            self.redirect_shell
        )
    }

    /// Clause that prints the marker on stdout when the preceding command succeeds.
    #[must_use]
    pub fn success_clause(&self, seq: u64) -> String {
        format!("&& echo {}", self.marker(seq))
    }

    /// Clause that prints the marker on stderr when the preceding command fails.
    #[must_use]
    pub fn failure_clause(&self, seq: u64) -> String {
        format!(
            "|| {} -c 'echo {} 1>&2'",
            self.redirect_shell,
            self.marker(seq)
        )
    }

    /// Rewrite `command` into the line actually written to the shell.
    ///
    /// Trailing whitespace and `;` are trimmed so the clauses attach to the
    /// command; an empty command becomes the `:` no-op.
    #[must_use]
    pub fn wrap(&self, command: &str, seq: u64) -> String {
        let trimmed = command.trim_end().trim_end_matches(';').trim_end();
        let command = if trimmed.trim().is_empty() { ":" } else { trimmed };
        format!(
            "{} {command} {} {}\n",
            self.begin_clause(seq),
            self.success_clause(seq),
            self.failure_clause(seq)
        )
    }

    /// Find a begin or end marker of this sentinel at the end of `line`.
    ///
    /// Matches any sequence number; the caller decides whether it is current.
    #[must_use]
    pub fn find<'a>(&self, line: &'a str) -> Option<MarkerMatch<'a>> {
        let start = line.rfind(&self.prefix)?;
        let body = line[start + self.prefix.len()..].strip_suffix(MARKER_TAIL)?;
        let (digits, kind) = match body.strip_suffix(BEGIN_TAG) {
            Some(digits) => (digits, MarkerKind::Begin),
            None => (body, MarkerKind::End),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let seq = digits.parse().ok()?;
        Some(MarkerMatch {
            seq,
            kind,
            output: &line[..start],
        })
    }
}
