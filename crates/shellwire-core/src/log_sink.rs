//! Raw byte mirror for shell output.

use std::{path::Path, sync::Arc};

use tokio::{
    fs::OpenOptions,
    io::{AsyncWrite, AsyncWriteExt, BufWriter},
    sync::Mutex,
};

type BoxedWriter = BufWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// Shared, cloneable byte sink.
///
/// Every clone writes into the same underlying writer. Once closed, further
/// writes are silently dropped.
#[derive(Clone)]
pub struct LogSink {
    writer: Arc<Mutex<Option<BoxedWriter>>>,
}

impl LogSink {
    /// Create a new sink around any async writer.
    #[must_use]
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Some(BufWriter::new(Box::new(writer))))),
        }
    }

    /// Open (or create) `path` in append mode.
    ///
    /// # Errors
    /// Returns error if the file cannot be opened.
    pub async fn open_file(path: &Path) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self::new(file))
    }

    /// Write raw bytes and flush them through.
    ///
    /// # Errors
    /// Returns error if write fails.
    pub async fn write_raw(&self, bytes: &[u8]) -> Result<(), std::io::Error> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Ok(());
        };
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Whether [`close`](Self::close) has already run.
    pub async fn is_closed(&self) -> bool {
        self.writer.lock().await.is_none()
    }

    /// Flush buffered bytes and shut the writer down. Idempotent.
    ///
    /// # Errors
    /// Returns error if flushing or shutting down fails.
    pub async fn close(&self) -> Result<(), std::io::Error> {
        let Some(mut writer) = self.writer.lock().await.take() else {
            return Ok(());
        };
        writer.flush().await?;
        writer.shutdown().await
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink").finish_non_exhaustive()
    }
}
