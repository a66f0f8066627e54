//! Access-log ingestion.
//!
//! Request handlers hand finished-request records to a [`LogPipeline`]; a
//! single [`LogDrainer`] task persists them to a [`LogSink`] in batches. The
//! two sides meet at a bounded channel:
//!
//! ```text
//!  request tasks ──submit()──▶ [ bounded buffer ] ──run()──▶ LogSink::write_batch
//!   (never wait)                (full → shed)       (batches of ≤ batch_size)
//! ```
//!
//! `submit` never waits. When the buffer is full the record is shed and
//! counted in [`PipelineStats::dropped`], so a slow database can cost access
//! logs but never request latency.
//!
//! The drainer cycles `WAITING → DRAINING → FLUSHING → WAITING`:
//!
//! - **WAITING**: block until one record arrives or `flush_interval` passes.
//! - **DRAINING**: pull whatever else is already buffered, up to `batch_size`.
//! - **FLUSHING**: one `write_batch` call. A failed batch is discarded,
//!   counted in [`PipelineStats::lost`], and the loop carries on.
//!
//! After [`LogPipeline::stop`] the drainer closes the buffer, flushes
//! everything already accepted, and returns.

pub mod sink;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::context::RequestContext;

pub use sink::{JsonLinesSink, LogSink, MemorySink};

/// One finished request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    request_id: String,
    timestamp: DateTime<Utc>,
    client_addr: String,
    subject: Option<String>,
    method: String,
    path: String,
    status: u16,
    latency_ms: f64,
    error: bool,
}

impl LogRecord {
    pub fn new(ctx: &RequestContext, status: u16, latency: Duration) -> Self {
        Self {
            request_id: ctx.request_id().to_owned(),
            timestamp: Utc::now(),
            client_addr: ctx.client_addr().to_owned(),
            subject: ctx.subject().map(str::to_owned),
            method: ctx.method().as_str().to_owned(),
            path: ctx.path().to_owned(),
            status,
            latency_ms: latency.as_secs_f64() * 1_000.0,
            error: status >= 400,
        }
    }

    pub fn request_id(&self) -> &str { &self.request_id }
    pub fn timestamp(&self) -> DateTime<Utc> { self.timestamp }
    pub fn client_addr(&self) -> &str { &self.client_addr }
    pub fn subject(&self) -> Option<&str> { self.subject.as_deref() }
    pub fn method(&self) -> &str { &self.method }
    pub fn path(&self) -> &str { &self.path }
    pub fn status(&self) -> u16 { self.status }
    pub fn latency_ms(&self) -> f64 { self.latency_ms }
    pub fn is_error(&self) -> bool { self.error }
}

/// Access-log settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub buffer_capacity: usize,
    /// JSON-lines file to append to. `None` keeps records in memory.
    pub path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval_ms: 5_000,
            buffer_capacity: 10_000,
            path: None,
        }
    }
}

impl LogConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Point-in-time counters for a pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Records taken into the buffer.
    pub accepted: u64,
    /// Records shed at `submit` because the buffer was full or closed.
    pub dropped: u64,
    /// Records persisted by the sink.
    pub flushed: u64,
    /// Batches the sink failed to persist.
    pub failed_batches: u64,
    /// Records inside those failed batches.
    pub lost: u64,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    dropped: AtomicU64,
    flushed: AtomicU64,
    failed_batches: AtomicU64,
    lost: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            flushed: self.flushed.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
        }
    }
}

/// Producer handle. Clone it into every request task.
#[derive(Clone, Debug)]
pub struct LogPipeline {
    tx: mpsc::Sender<LogRecord>,
    stop: Arc<watch::Sender<bool>>,
    counters: Arc<Counters>,
}

/// The consumer side. Spawn [`run`](LogDrainer::run) once.
pub struct LogDrainer {
    rx: mpsc::Receiver<LogRecord>,
    stop: watch::Receiver<bool>,
    sink: Arc<dyn LogSink>,
    batch_size: usize,
    flush_interval: Duration,
    counters: Arc<Counters>,
}

impl LogPipeline {
    pub fn new(config: &LogConfig, sink: Arc<dyn LogSink>) -> (Self, LogDrainer) {
        let (tx, rx) = mpsc::channel(config.buffer_capacity.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());

        let pipeline = Self { tx, stop: Arc::new(stop_tx), counters: Arc::clone(&counters) };
        let drainer = LogDrainer {
            rx,
            stop: stop_rx,
            sink,
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval(),
            counters,
        };
        (pipeline, drainer)
    }

    /// Enqueues `record` without waiting. Sheds it if the buffer is full.
    pub fn submit(&self, record: LogRecord) {
        let reason = match self.tx.try_send(record) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(mpsc::error::TrySendError::Full(_)) => "buffer full",
            Err(mpsc::error::TrySendError::Closed(_)) => "drainer stopped",
        };
        let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        // Warn on 1, 2, 4, 8, ... so a sustained overload stays visible without flooding.
        if dropped.is_power_of_two() {
            warn!(dropped, reason, "access-log record shed");
        }
    }

    /// Asks the drainer to flush what it has and exit.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Records currently waiting in the buffer.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }
}

impl LogDrainer {
    /// Persists batches until [`LogPipeline::stop`] is called or every
    /// producer handle is dropped, then flushes what remains.
    pub async fn run(mut self) -> PipelineStats {
        info!(
            batch_size = self.batch_size,
            flush_interval = ?self.flush_interval,
            "access-log drainer started"
        );

        loop {
            let first = tokio::select! {
                biased;

                _ = self.stop.wait_for(|stopped| *stopped) => break,

                next = tokio::time::timeout(self.flush_interval, self.rx.recv()) => match next {
                    Ok(Some(record)) => record,
                    Ok(None) => break,
                    Err(_) => continue,
                },
            };

            let batch = self.fill(first);
            self.flush(batch).await;
        }

        // STOPPED: no new records get in; everything already accepted goes out.
        self.rx.close();
        while let Some(first) = self.rx.recv().await {
            let batch = self.fill(first);
            self.flush(batch).await;
        }

        let stats = self.counters.snapshot();
        info!(
            flushed = stats.flushed,
            lost = stats.lost,
            dropped = stats.dropped,
            "access-log drainer stopped"
        );
        stats
    }

    fn fill(&mut self, first: LogRecord) -> Vec<LogRecord> {
        let mut batch = Vec::with_capacity(self.batch_size);
        batch.push(first);
        while batch.len() < self.batch_size {
            match self.rx.try_recv() {
                Ok(record) => batch.push(record),
                Err(_) => break,
            }
        }
        batch
    }

    async fn flush(&self, batch: Vec<LogRecord>) {
        let records = batch.len() as u64;
        match self.sink.write_batch(&batch).await {
            Ok(()) => {
                self.counters.flushed.fetch_add(records, Ordering::Relaxed);
                debug!(records, "access-log batch persisted");
            }
            Err(e) => {
                self.counters.failed_batches.fetch_add(1, Ordering::Relaxed);
                self.counters.lost.fetch_add(records, Ordering::Relaxed);
                error!(error = %e, records, "access-log batch discarded");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;
    use crate::access_log::sink::SinkFuture;
    use http::Method;
    use std::sync::atomic::AtomicBool;

    fn record(i: usize) -> LogRecord {
        let ctx = RequestContext::new("192.0.2.1", Method::GET, format!("/items/{i}"));
        LogRecord::new(&ctx, 200, Duration::from_millis(3))
    }

    fn config(batch_size: usize, buffer_capacity: usize) -> LogConfig {
        LogConfig { batch_size, buffer_capacity, ..LogConfig::default() }
    }

    /// Fails its first write, then behaves like a [`MemorySink`].
    #[derive(Default)]
    struct FlakySink {
        failed: AtomicBool,
        inner: MemorySink,
    }

    impl LogSink for FlakySink {
        fn write_batch<'a>(&'a self, batch: &'a [LogRecord]) -> SinkFuture<'a> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Box::pin(async { Err(SinkError::Rejected("connection reset".into())) });
            }
            self.inner.write_batch(batch)
        }
    }

    #[test]
    fn record_derives_error_flag_from_status() {
        let ctx = RequestContext::new("192.0.2.1", Method::DELETE, "/x");
        ctx.set_subject("u-1").unwrap();
        let r = LogRecord::new(&ctx, 404, Duration::from_micros(1_500));
        assert!(r.is_error());
        assert_eq!(r.subject(), Some("u-1"));
        assert_eq!(r.method(), "DELETE");
        assert!((r.latency_ms() - 1.5).abs() < 1e-9);
        assert!(!LogRecord::new(&ctx, 399, Duration::ZERO).is_error());
    }

    #[test]
    fn submit_sheds_when_full_without_waiting() {
        let (pipeline, _drainer) = LogPipeline::new(&config(10, 2), Arc::new(MemorySink::new()));
        for i in 0..5 {
            pipeline.submit(record(i));
        }
        let stats = pipeline.stats();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.dropped, 3);
        assert_eq!(pipeline.queued(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_split_at_batch_size() {
        let sink = MemorySink::new();
        let (pipeline, drainer) = LogPipeline::new(&config(100, 1_000), Arc::new(sink.clone()));
        let handle = tokio::spawn(drainer.run());

        for i in 0..250 {
            pipeline.submit(record(i));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        let sizes: Vec<usize> = sink.batches().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![100, 100, 50]);

        pipeline.stop();
        let stats = handle.await.unwrap();
        assert_eq!(stats.flushed, 250);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_drainer_keeps_waiting() {
        let sink = MemorySink::new();
        let (pipeline, drainer) = LogPipeline::new(&config(100, 100), Arc::new(sink.clone()));
        let handle = tokio::spawn(drainer.run());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!handle.is_finished());
        assert!(sink.batches().is_empty());

        pipeline.submit(record(0));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sink.records().len(), 1);

        pipeline.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_does_not_stop_the_loop() {
        let sink = Arc::new(FlakySink::default());
        let (pipeline, drainer) = LogPipeline::new(&config(100, 100), sink.clone());
        let handle = tokio::spawn(drainer.run());

        pipeline.submit(record(1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        pipeline.submit(record(2));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = pipeline.stats();
        assert_eq!(stats.failed_batches, 1);
        assert_eq!(stats.lost, 1);
        assert_eq!(stats.flushed, 1);
        assert_eq!(sink.inner.records()[0].path(), "/items/2");

        pipeline.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flushes_everything_accepted() {
        let sink = MemorySink::new();
        let (pipeline, drainer) = LogPipeline::new(&config(4, 100), Arc::new(sink.clone()));
        for i in 0..10 {
            pipeline.submit(record(i));
        }
        pipeline.stop();

        let stats = drainer.run().await;
        assert_eq!(stats.accepted, 10);
        assert_eq!(stats.flushed + stats.lost, stats.accepted);
        let sizes: Vec<usize> = sink.batches().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        pipeline.submit(record(99));
        assert_eq!(pipeline.stats().dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drainer_exits_when_producers_are_gone() {
        let sink = MemorySink::new();
        let (pipeline, drainer) = LogPipeline::new(&config(100, 100), Arc::new(sink.clone()));
        pipeline.submit(record(0));
        drop(pipeline);
        let stats = drainer.run().await;
        assert_eq!(stats.flushed, 1);
    }
}
