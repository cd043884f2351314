//! Broadcast + history store for observed session output.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::{StreamExt, future, stream::BoxStream};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::LogMsg;

/// Default history size limit (8 MB).
const HISTORY_BYTES: usize = 8 * 1024 * 1024;

/// Live channel capacity; slow receivers skip lagged messages.
const CHANNEL_CAPACITY: usize = 4096;

struct StoredMsg {
    msg: LogMsg,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredMsg>,
    total_bytes: usize,
}

/// Message store with broadcast and history support.
///
/// Observers that attach late receive the retained history first, then
/// follow live output. History is bounded by size; the oldest messages
/// are evicted first.
pub struct MsgStore {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<LogMsg>,
    history_limit: usize,
}

impl Default for MsgStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgStore {
    /// Create a new message store with the default history limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_history_limit(HISTORY_BYTES)
    }

    /// Create a message store retaining at most `history_limit` bytes of history.
    #[must_use]
    pub fn with_history_limit(history_limit: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
            }),
            sender,
            history_limit,
        }
    }

    /// Push a message to both live listeners and history.
    pub fn push(&self, msg: LogMsg) {
        // No live receivers is not an error; history still records it.
        let _ = self.sender.send(msg.clone());
        let bytes = msg.approx_bytes();

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        while inner.total_bytes.saturating_add(bytes) > self.history_limit {
            if let Some(front) = inner.history.pop_front() {
                inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
            } else {
                break;
            }
        }
        inner.history.push_back(StoredMsg { msg, bytes });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    /// Push the text of an issued command.
    pub fn push_command<S: Into<String>>(&self, s: S) {
        self.push(LogMsg::Command(s.into()));
    }

    /// Push stdout message.
    pub fn push_stdout<S: Into<String>>(&self, s: S) {
        self.push(LogMsg::Stdout(s.into()));
    }

    /// Push stderr message.
    pub fn push_stderr<S: Into<String>>(&self, s: S) {
        self.push(LogMsg::Stderr(s.into()));
    }

    /// Push finished notification.
    pub fn push_finished(&self) {
        self.push(LogMsg::Finished);
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<LogMsg> {
        self.sender.subscribe()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn get_history(&self) -> Vec<LogMsg> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .map(|s| s.msg.clone())
            .collect()
    }

    /// Stream that yields history first, then live updates.
    #[must_use]
    pub fn history_plus_stream(&self) -> BoxStream<'static, LogMsg> {
        // Subscribe before snapshotting so nothing pushed in between is lost;
        // a message may then appear in both, which observers tolerate.
        let rx = self.get_receiver();
        let history = self.get_history();

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| future::ready(res.ok()));

        hist.chain(live).boxed()
    }

    /// Stream of stdout batches (until Finished).
    #[must_use]
    pub fn stdout_chunked_stream(&self) -> BoxStream<'static, String> {
        self.until_finished()
            .filter_map(|msg| {
                future::ready(match msg {
                    LogMsg::Stdout(s) => Some(s),
                    _ => None,
                })
            })
            .boxed()
    }

    /// Stream of stderr batches (until Finished).
    #[must_use]
    pub fn stderr_chunked_stream(&self) -> BoxStream<'static, String> {
        self.until_finished()
            .filter_map(|msg| {
                future::ready(match msg {
                    LogMsg::Stderr(s) => Some(s),
                    _ => None,
                })
            })
            .boxed()
    }

    fn until_finished(&self) -> BoxStream<'static, LogMsg> {
        self.history_plus_stream()
            .take_while(|msg| future::ready(!matches!(msg, LogMsg::Finished)))
            .boxed()
    }
}
