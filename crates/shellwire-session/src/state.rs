//! Lifecycle state shared between a session and its driver task.

use std::{
    sync::{
        OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Error;

const EVENT_CAPACITY: usize = 16;

/// Formal session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Closed,
}

/// Session-level condition reported outside any single command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The whole-session deadline expired.
    TimedOut { after: Duration },
    /// The shell closed both output streams.
    ProcessExited,
}

impl SessionEvent {
    fn to_error(self) -> Error {
        match self {
            Self::TimedOut { after } => Error::SessionTimeout(after),
            Self::ProcessExited => Error::ProcessExited,
        }
    }
}

pub(crate) struct Shared {
    closed: AtomicBool,
    fault: OnceLock<SessionEvent>,
    events: broadcast::Sender<SessionEvent>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            closed: AtomicBool::new(false),
            fault: OnceLock::new(),
            events,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        if self.closed.load(Ordering::Acquire) {
            SessionState::Closed
        } else {
            SessionState::Open
        }
    }

    /// Mark closed; returns `false` if it already was.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// First fault raised on this session.
    pub(crate) fn fault(&self) -> Option<SessionEvent> {
        self.fault.get().copied()
    }

    /// Record a fault and notify subscribers. The first fault sticks.
    pub(crate) fn raise(&self, event: SessionEvent) {
        let _ = self.fault.set(event);
        // Nobody listening is fine; the fault stays queryable.
        let _ = self.events.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Whether new commands may be issued.
    pub(crate) fn check(&self) -> Result<(), Error> {
        if self.state() == SessionState::Closed {
            return Err(Error::Closed);
        }
        self.fault().map_or(Ok(()), |fault| Err(fault.to_error()))
    }

    /// Error for a command that can no longer be served.
    pub(crate) fn rejection(&self) -> Error {
        self.check().err().unwrap_or(Error::Closed)
    }
}
