//! Durable destinations for access-log batches.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use super::LogRecord;
use crate::error::SinkError;

/// Future returned by [`LogSink::write_batch`].
pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;

/// Bulk-insert target. A batch succeeds or fails as a unit.
pub trait LogSink: Send + Sync + 'static {
    fn write_batch<'a>(&'a self, batch: &'a [LogRecord]) -> SinkFuture<'a>;
}

/// Keeps every persisted batch in memory, in flush order.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    batches: Arc<Mutex<Vec<Vec<LogRecord>>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<Vec<LogRecord>> {
        self.batches.lock().clone()
    }

    /// All persisted records, flattened.
    pub fn records(&self) -> Vec<LogRecord> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

impl LogSink for MemorySink {
    fn write_batch<'a>(&'a self, batch: &'a [LogRecord]) -> SinkFuture<'a> {
        self.batches.lock().push(batch.to_vec());
        Box::pin(async { Ok(()) })
    }
}

/// Appends each batch to a file as newline-delimited JSON.
///
/// The whole batch is encoded up front and written with one `write_all`, so
/// an encoding failure persists nothing.
#[derive(Clone, Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, batch: &[LogRecord]) -> Result<(), SinkError> {
        let mut buf = Vec::with_capacity(batch.len() * 256);
        for record in batch {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buf).await?;
        file.sync_data().await?;
        Ok(())
    }
}

impl LogSink for JsonLinesSink {
    fn write_batch<'a>(&'a self, batch: &'a [LogRecord]) -> SinkFuture<'a> {
        Box::pin(self.append(batch))
    }
}
