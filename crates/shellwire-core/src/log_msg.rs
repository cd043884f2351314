//! Typed messages surfaced to observers of a shell session.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the two output streams of the wrapped shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    /// Standard output, the success stream.
    Stdout,
    /// Standard error, the failure stream.
    Stderr,
}

impl OutputStream {
    /// Stream name as used in log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message observed on a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum LogMsg {
    /// Command text as issued by the caller.
    Command(String),
    /// A batch of decoded stdout lines, newline-joined.
    Stdout(String),
    /// A batch of decoded stderr lines, newline-joined.
    Stderr(String),
    /// The session closed; no further messages follow.
    Finished,
}

impl LogMsg {
    /// Build an output message for the given stream.
    #[must_use]
    pub fn output(stream: OutputStream, text: String) -> Self {
        match stream {
            OutputStream::Stdout => Self::Stdout(text),
            OutputStream::Stderr => Self::Stderr(text),
        }
    }

    /// Rough in-memory size, used for history accounting.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = 8;
        match self {
            Self::Command(s) | Self::Stdout(s) | Self::Stderr(s) => OVERHEAD + s.len(),
            Self::Finished => OVERHEAD,
        }
    }
}
