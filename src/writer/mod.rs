//! Batching writer
//!
//! Records are submitted into a bounded channel and drained by a single
//! flush task. A batch is flushed when it reaches `max_batch_size` or when
//! the oldest unflushed record has waited `linger`. Batches are written in
//! submission order, one at a time: a batch is either written or
//! dead-lettered before the next one is attempted.
//!
//! ```text
//! submit() ──▶ [bounded mpsc] ──▶ flush task ──▶ breaker.allow()?
//!                                     │              │ yes         │ no
//!                                     │        write + retries   dead-letter
//!                                     │              │
//!                                     │        ok / dead-letter
//! ```

pub mod backend;
pub mod influx;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::breaker::CircuitBreaker;
use crate::dlq::{DeadLetterCategory, DeadLetterPayload, DeadLetterStore};
use crate::error::{BackendError, Error, Result};
use crate::observability::IngestMetrics;
use crate::types::CanonicalRecord;

pub use backend::{encode_line_protocol, BucketTarget, MemoryBackend, StorageBackend};
pub use influx::{InfluxBackend, InfluxConfig};

/// Writer configuration
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Records per batch
    pub max_batch_size: usize,
    /// Maximum time the oldest record waits before a forced flush
    pub linger: Duration,
    /// Capacity of the submission buffer
    pub buffer_capacity: usize,
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// First retry delay
    pub backoff_base: Duration,
    /// Retry delay ceiling
    pub backoff_max: Duration,
    /// Per-attempt write timeout
    pub write_timeout: Duration,
    /// Destination of every batch
    pub target: BucketTarget,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            linger: Duration::from_millis(30_000),
            buffer_capacity: 10_000,
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            target: BucketTarget::default(),
        }
    }
}

/// What caused a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    /// Batch reached `max_batch_size`
    Size,
    /// Oldest record waited `linger`
    Linger,
    /// `flush_now` was called
    Manual,
    /// Final drain on shutdown
    Shutdown,
}

impl FlushTrigger {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Linger => "linger",
            FlushTrigger::Manual => "manual",
            FlushTrigger::Shutdown => "shutdown",
        }
    }

    /// All triggers
    pub fn all() -> [FlushTrigger; 4] {
        [
            FlushTrigger::Size,
            FlushTrigger::Linger,
            FlushTrigger::Manual,
            FlushTrigger::Shutdown,
        ]
    }

    fn index(&self) -> usize {
        match self {
            FlushTrigger::Size => 0,
            FlushTrigger::Linger => 1,
            FlushTrigger::Manual => 2,
            FlushTrigger::Shutdown => 3,
        }
    }
}

/// How a flushed batch was resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending
    Empty,
    /// Batch accepted by the backend
    Written {
        /// Records in the batch
        records: usize,
    },
    /// Breaker denied the call; no request was made
    Rejected {
        /// Dead-letter entry holding the batch
        entry_id: String,
    },
    /// Every attempt failed
    DeadLettered {
        /// Dead-letter entry holding the batch
        entry_id: String,
    },
}

/// Writer counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    /// Records accepted by `submit`
    pub records_submitted: u64,
    /// Records written to the backend
    pub records_written: u64,
    /// Records dead-lettered by the writer
    pub records_dead_lettered: u64,
    /// Batches written
    pub batches_written: u64,
    /// Batches dead-lettered
    pub batches_failed: u64,
    /// Retry attempts
    pub write_retries: u64,
    /// Flushes by size
    pub flushes_size: u64,
    /// Flushes by linger
    pub flushes_linger: u64,
    /// Manual flushes
    pub flushes_manual: u64,
    /// Shutdown flushes
    pub flushes_shutdown: u64,
}

#[derive(Debug, Default)]
struct WriterCounters {
    records_submitted: AtomicU64,
    records_written: AtomicU64,
    records_dead_lettered: AtomicU64,
    batches_written: AtomicU64,
    batches_failed: AtomicU64,
    write_retries: AtomicU64,
    flushes: [AtomicU64; 4],
}

enum WriterCommand {
    /// Record and the instant it was submitted
    Record(CanonicalRecord, Instant),
    Flush(oneshot::Sender<FlushOutcome>),
}

/// State shared by the handle and the flush task
struct WriterCore {
    config: WriterConfig,
    breaker: Arc<CircuitBreaker>,
    backend: Arc<dyn StorageBackend>,
    dlq: Arc<DeadLetterStore>,
    metrics: Arc<IngestMetrics>,
    counters: WriterCounters,
}

/// Handle to the batching writer
pub struct BatchingWriter {
    core: Arc<WriterCore>,
    tx: mpsc::Sender<WriterCommand>,
    shutdown_tx: Mutex<Option<oneshot::Sender<Instant>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BatchingWriter {
    /// Spawn the flush task and return its handle
    pub fn spawn(
        config: WriterConfig,
        breaker: Arc<CircuitBreaker>,
        backend: Arc<dyn StorageBackend>,
        dlq: Arc<DeadLetterStore>,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let core = Arc::new(WriterCore {
            config,
            breaker,
            backend,
            dlq,
            metrics,
            counters: WriterCounters::default(),
        });

        info!(
            backend = core.backend.name(),
            max_batch_size = core.config.max_batch_size,
            linger_ms = core.config.linger.as_millis() as u64,
            "Batching writer started"
        );

        let task = tokio::spawn(flush_loop(Arc::clone(&core), rx, shutdown_rx));

        Self {
            core,
            tx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        }
    }

    /// Queue a record, waiting for buffer space when the buffer is full
    ///
    /// A record offered after shutdown is dead-lettered before the error
    /// is returned.
    pub async fn submit(&self, record: CanonicalRecord) -> Result<()> {
        let cmd = WriterCommand::Record(record, Instant::now());
        if let Err(mpsc::error::SendError(cmd)) = self.tx.send(cmd).await {
            if let WriterCommand::Record(record, _) = cmd {
                self.core.dead_letter(
                    vec![record],
                    "batching writer is closed".to_string(),
                    FlushTrigger::Shutdown,
                );
            }
            return Err(Error::Shutdown("batching writer is closed".to_string()));
        }
        self.core
            .counters
            .records_submitted
            .fetch_add(1, Ordering::Relaxed);
        self.core.metrics.set_buffer_depth(self.buffer_depth());
        Ok(())
    }

    /// Flush everything submitted so far and wait for the outcome
    pub async fn flush_now(&self) -> Result<FlushOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Flush(reply_tx))
            .await
            .map_err(|_| Error::Shutdown("batching writer is closed".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::Shutdown("flush task exited".to_string()))
    }

    /// Write records directly, bypassing the buffer
    ///
    /// Guarded by the breaker and retried like a batch, but never
    /// dead-lettered: the caller owns the failure.
    pub async fn write_direct(&self, records: &[CanonicalRecord]) -> std::result::Result<(), BackendError> {
        self.core.write_guarded(records).await
    }

    /// Check that the backend is reachable
    pub async fn ping_backend(&self) -> std::result::Result<(), BackendError> {
        timeout(self.core.config.write_timeout, self.core.backend.ping())
            .await
            .unwrap_or(Err(BackendError::Timeout(self.core.config.write_timeout)))
    }

    /// Records waiting in the buffer
    pub fn buffer_depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Buffer capacity
    pub fn buffer_capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Whether the flush task has stopped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Counters snapshot
    pub fn stats(&self) -> WriterStats {
        self.core.stats()
    }

    /// Drain the buffer and stop the flush task
    ///
    /// Pending records get one best-effort flush bounded by `grace`;
    /// whatever is not written by then is dead-lettered.
    pub async fn shutdown(&self, grace: Duration) -> Result<WriterStats> {
        let deadline = Instant::now() + grace;
        let signal = self.shutdown_tx.lock().take();
        if let Some(tx) = signal {
            let _ = tx.send(deadline);
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await
                .map_err(|e| Error::Shutdown(format!("flush task failed: {}", e)))?;
        }
        Ok(self.stats())
    }
}

impl WriterCore {
    fn stats(&self) -> WriterStats {
        let c = &self.counters;
        let flushes = |t: FlushTrigger| c.flushes[t.index()].load(Ordering::Relaxed);
        WriterStats {
            records_submitted: c.records_submitted.load(Ordering::Relaxed),
            records_written: c.records_written.load(Ordering::Relaxed),
            records_dead_lettered: c.records_dead_lettered.load(Ordering::Relaxed),
            batches_written: c.batches_written.load(Ordering::Relaxed),
            batches_failed: c.batches_failed.load(Ordering::Relaxed),
            write_retries: c.write_retries.load(Ordering::Relaxed),
            flushes_size: flushes(FlushTrigger::Size),
            flushes_linger: flushes(FlushTrigger::Linger),
            flushes_manual: flushes(FlushTrigger::Manual),
            flushes_shutdown: flushes(FlushTrigger::Shutdown),
        }
    }

    /// Resolve one batch: written, or dead-lettered exactly once
    ///
    /// Cancelling the returned future leaves the batch with the caller and
    /// reports the abandoned call to the breaker as a failure.
    async fn flush(&self, batch: &[CanonicalRecord], trigger: FlushTrigger) -> FlushOutcome {
        if batch.is_empty() {
            return FlushOutcome::Empty;
        }
        self.counters.flushes[trigger.index()].fetch_add(1, Ordering::Relaxed);
        self.metrics.record_flush(trigger);

        let Some(permit) = self.breaker.try_acquire() else {
            let detail = format!(
                "circuit breaker '{}' is open; batch not attempted",
                self.breaker.name()
            );
            let entry_id = self.dead_letter(batch.to_vec(), detail, trigger);
            return FlushOutcome::Rejected { entry_id };
        };

        let started = Instant::now();
        let result = self.write_with_retries(batch).await;
        permit.complete(result.is_ok());

        match result {
            Ok(()) => {
                let n = batch.len();
                self.counters
                    .records_written
                    .fetch_add(n as u64, Ordering::Relaxed);
                self.counters.batches_written.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_write(n, started.elapsed());
                debug!(
                    records = n,
                    trigger = trigger.as_str(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Batch written"
                );
                FlushOutcome::Written { records: n }
            }
            Err(e) => {
                self.metrics.record_write_error();
                let entry_id = self.dead_letter(batch.to_vec(), e.to_string(), trigger);
                FlushOutcome::DeadLettered { entry_id }
            }
        }
    }

    /// Breaker-guarded write used outside the flush loop
    async fn write_guarded(&self, records: &[CanonicalRecord]) -> std::result::Result<(), BackendError> {
        if records.is_empty() {
            return Ok(());
        }
        let Some(permit) = self.breaker.try_acquire() else {
            return Err(BackendError::CircuitOpen(self.breaker.name().to_string()));
        };
        let started = Instant::now();
        let result = self.write_with_retries(records).await;
        permit.complete(result.is_ok());
        match &result {
            Ok(()) => {
                self.counters
                    .records_written
                    .fetch_add(records.len() as u64, Ordering::Relaxed);
                self.metrics.record_write(records.len(), started.elapsed());
            }
            Err(_) => self.metrics.record_write_error(),
        }
        result
    }

    async fn write_with_retries(&self, records: &[CanonicalRecord]) -> std::result::Result<(), BackendError> {
        let mut attempt = 0u32;
        loop {
            let result = match timeout(
                self.config.write_timeout,
                self.backend.write(&self.config.target, records),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout(self.config.write_timeout)),
            };

            let err = match result {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if !err.is_retryable() || attempt >= self.config.max_retries {
                warn!(
                    records = records.len(),
                    attempts = attempt + 1,
                    retryable = err.is_retryable(),
                    error = %err,
                    "Batch write failed"
                );
                return Err(err);
            }

            let delay = self.backoff(attempt);
            debug!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying batch write"
            );
            self.counters.write_retries.fetch_add(1, Ordering::Relaxed);
            self.metrics.record_retry();
            sleep(delay).await;
            attempt += 1;
        }
    }

    /// Exponential backoff capped at `backoff_max`, with 50-100% jitter
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt));
        let capped = exp.min(self.config.backoff_max);
        let factor = rand::thread_rng().gen_range(0.5..=1.0);
        capped.mul_f64(factor)
    }

    fn dead_letter(&self, batch: Vec<CanonicalRecord>, detail: String, trigger: FlushTrigger) -> String {
        let n = batch.len();
        let entry_id = self.dlq.record(
            DeadLetterPayload::Records(batch),
            DeadLetterCategory::WriteError,
            detail.clone(),
        );
        self.counters
            .records_dead_lettered
            .fetch_add(n as u64, Ordering::Relaxed);
        self.counters.batches_failed.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_dead_letter(DeadLetterCategory::WriteError);
        warn!(
            records = n,
            trigger = trigger.as_str(),
            entry_id = %entry_id,
            reason = %detail,
            "Batch dead-lettered"
        );
        entry_id
    }
}

async fn flush_loop(
    core: Arc<WriterCore>,
    mut rx: mpsc::Receiver<WriterCommand>,
    mut shutdown_rx: oneshot::Receiver<Instant>,
) {
    let max = core.config.max_batch_size.max(1);
    let mut pending: Vec<CanonicalRecord> = Vec::with_capacity(max);
    let mut oldest: Option<Instant> = None;
    // Set once the shutdown signal was consumed during a flush
    let mut stop: Option<Instant> = None;

    let deadline = loop {
        if let Some(deadline) = stop {
            break deadline;
        }
        let linger_deadline = oldest.map(|t| t + core.config.linger);

        tokio::select! {
            biased;

            signal = &mut shutdown_rx => {
                break signal.unwrap_or_else(|_| Instant::now());
            }

            cmd = rx.recv() => match cmd {
                Some(WriterCommand::Record(record, submitted_at)) => {
                    if pending.is_empty() {
                        oldest = Some(submitted_at);
                    }
                    pending.push(record);
                    if pending.len() >= max {
                        let batch = std::mem::replace(&mut pending, Vec::with_capacity(max));
                        oldest = None;
                        flush_until_shutdown(&core, batch, FlushTrigger::Size, &mut shutdown_rx, &mut stop).await;
                    }
                }
                Some(WriterCommand::Flush(reply)) => {
                    let batch = std::mem::replace(&mut pending, Vec::with_capacity(max));
                    oldest = None;
                    let outcome =
                        flush_until_shutdown(&core, batch, FlushTrigger::Manual, &mut shutdown_rx, &mut stop).await;
                    let _ = reply.send(outcome);
                }
                // Every handle is gone; nobody can request a graceful stop
                None => break Instant::now(),
            },

            _ = sleep_until(linger_deadline.unwrap_or_else(Instant::now)), if linger_deadline.is_some() => {
                let batch = std::mem::replace(&mut pending, Vec::with_capacity(max));
                oldest = None;
                flush_until_shutdown(&core, batch, FlushTrigger::Linger, &mut shutdown_rx, &mut stop).await;
            }
        }
    };

    drain_on_shutdown(&core, rx, pending, deadline).await;
}

/// Flush one batch from the main loop
///
/// A shutdown signal arriving mid-flush bounds the rest of the flush by the
/// shutdown deadline; the batch is dead-lettered if the deadline wins.
async fn flush_until_shutdown(
    core: &WriterCore,
    batch: Vec<CanonicalRecord>,
    trigger: FlushTrigger,
    shutdown_rx: &mut oneshot::Receiver<Instant>,
    stop: &mut Option<Instant>,
) -> FlushOutcome {
    let mut flush = Box::pin(core.flush(&batch, trigger));
    let deadline = tokio::select! {
        biased;

        outcome = &mut flush => return outcome,
        signal = &mut *shutdown_rx => signal.unwrap_or_else(|_| Instant::now()),
    };
    *stop = Some(deadline);

    let result = timeout_at(deadline, flush).await;
    match result {
        Ok(outcome) => outcome,
        Err(_) => {
            let entry_id = core.dead_letter(
                batch,
                "shutdown deadline elapsed during flush".to_string(),
                trigger,
            );
            FlushOutcome::DeadLettered { entry_id }
        }
    }
}

async fn drain_on_shutdown(
    core: &WriterCore,
    mut rx: mpsc::Receiver<WriterCommand>,
    mut pending: Vec<CanonicalRecord>,
    deadline: Instant,
) {
    rx.close();
    let mut waiters = Vec::new();
    while let Ok(cmd) = rx.try_recv() {
        match cmd {
            WriterCommand::Record(record, _) => pending.push(record),
            WriterCommand::Flush(reply) => waiters.push(reply),
        }
    }

    let total = pending.len();
    let max = core.config.max_batch_size.max(1);
    let mut written = 0usize;
    let mut batches = Vec::new();
    while !pending.is_empty() {
        let rest = pending.split_off(pending.len().min(max));
        batches.push(std::mem::replace(&mut pending, rest));
    }

    let mut remaining = batches.into_iter();
    for batch in remaining.by_ref() {
        let n = batch.len();
        let result = timeout_at(deadline, core.flush(&batch, FlushTrigger::Shutdown)).await;
        match result {
            Ok(FlushOutcome::Written { .. }) => written += n,
            Ok(_) => {}
            Err(_) => {
                core.dead_letter(
                    batch,
                    "shutdown deadline elapsed during final flush".to_string(),
                    FlushTrigger::Shutdown,
                );
                break;
            }
        }
    }
    for batch in remaining {
        core.dead_letter(
            batch,
            "shutdown deadline elapsed before final flush".to_string(),
            FlushTrigger::Shutdown,
        );
    }

    for waiter in waiters {
        let _ = waiter.send(FlushOutcome::Empty);
    }
    core.metrics.set_buffer_depth(0);

    if written == total {
        info!(records = total, "Batching writer drained");
    } else {
        error!(
            records = total,
            written,
            dead_lettered = total - written,
            "Batching writer stopped with unwritten records"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, BreakerState};
    use crate::dlq::{DeadLetterConfig, DeadLetterFilter};
    use crate::types::MetricFamily;
    use chrono::{TimeZone, Utc};

    struct Harness {
        writer: BatchingWriter,
        backend: Arc<MemoryBackend>,
        breaker: Arc<CircuitBreaker>,
        dlq: Arc<DeadLetterStore>,
    }

    fn harness(config: WriterConfig, backend: MemoryBackend) -> Harness {
        let backend = Arc::new(backend);
        let breaker = Arc::new(CircuitBreaker::new("test", BreakerConfig::default()));
        let dlq = Arc::new(DeadLetterStore::new(DeadLetterConfig::default()));
        let metrics = Arc::new(IngestMetrics::new().unwrap());
        let writer = BatchingWriter::spawn(
            config,
            Arc::clone(&breaker),
            backend.clone(),
            Arc::clone(&dlq),
            metrics,
        );
        Harness {
            writer,
            backend,
            breaker,
            dlq,
        }
    }

    fn record(i: u32) -> CanonicalRecord {
        let ts = Utc.timestamp_opt(1_705_000_000 + i as i64, 0).unwrap().fixed_offset();
        CanonicalRecord::builder(MetricFamily::Activity, ts, "phone")
            .field("steps", i as f64)
            .build()
    }

    fn config(batch: usize) -> WriterConfig {
        WriterConfig {
            max_batch_size: batch,
            linger: Duration::from_secs(30),
            max_retries: 0,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_then_linger_flush() {
        let h = harness(config(10), MemoryBackend::new());
        for i in 0..15 {
            h.writer.submit(record(i)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.backend.batch_sizes(), vec![10]);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.backend.batch_sizes(), vec![10, 5]);

        let stats = h.writer.stats();
        assert_eq!(stats.flushes_size, 1);
        assert_eq!(stats.flushes_linger, 1);
        assert_eq!(stats.records_written, 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_now() {
        let h = harness(config(100), MemoryBackend::new());
        h.writer.submit(record(1)).await.unwrap();
        h.writer.submit(record(2)).await.unwrap();
        assert_eq!(
            h.writer.flush_now().await.unwrap(),
            FlushOutcome::Written { records: 2 }
        );
        assert_eq!(h.writer.flush_now().await.unwrap(), FlushOutcome::Empty);
        assert_eq!(h.writer.stats().flushes_manual, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_success() {
        let backend = MemoryBackend::new();
        backend.script([
            Err(BackendError::Connection("refused".into())),
            Err(BackendError::Rejected {
                status: 503,
                message: "busy".into(),
            }),
        ]);
        let h = harness(
            WriterConfig {
                max_retries: 3,
                ..config(100)
            },
            backend,
        );
        h.writer.submit(record(1)).await.unwrap();
        assert_eq!(
            h.writer.flush_now().await.unwrap(),
            FlushOutcome::Written { records: 1 }
        );
        assert_eq!(h.backend.calls(), 3);
        assert_eq!(h.writer.stats().write_retries, 2);
        assert_eq!(h.breaker.stats().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_dead_letters_once() {
        let backend = MemoryBackend::new();
        backend.fail_with(BackendError::Rejected {
            status: 401,
            message: "unauthorized".into(),
        });
        let h = harness(
            WriterConfig {
                max_retries: 3,
                ..config(100)
            },
            backend,
        );
        h.writer.submit(record(1)).await.unwrap();
        h.writer.submit(record(2)).await.unwrap();
        let outcome = h.writer.flush_now().await.unwrap();
        assert!(matches!(outcome, FlushOutcome::DeadLettered { .. }));
        assert_eq!(h.backend.calls(), 1);

        let entries = h.dlq.list(&DeadLetterFilter::default());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].category, DeadLetterCategory::WriteError);
        assert_eq!(entries[0].payload.record_count(), 2);
        assert_eq!(h.breaker.stats().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_skips_backend() {
        let h = harness(config(100), MemoryBackend::new());
        for _ in 0..5 {
            h.breaker.record_outcome(false);
        }
        assert_eq!(h.breaker.state(), BreakerState::Open);

        h.writer.submit(record(1)).await.unwrap();
        let outcome = h.writer.flush_now().await.unwrap();
        assert!(matches!(outcome, FlushOutcome::Rejected { .. }));
        assert_eq!(h.backend.calls(), 0);
        assert_eq!(h.dlq.stats().pending, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_pending() {
        let h = harness(config(100), MemoryBackend::new());
        for i in 0..7 {
            h.writer.submit(record(i)).await.unwrap();
        }
        let stats = h.writer.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(stats.records_written, 7);
        assert_eq!(stats.flushes_shutdown, 1);
        assert!(h.writer.submit(record(99)).await.is_err());
        assert_eq!(h.dlq.stats().pending, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_deadline_dead_letters_leftovers() {
        let backend = MemoryBackend::new().with_latency(Duration::from_secs(60));
        let h = harness(config(100), backend);
        for i in 0..3 {
            h.writer.submit(record(i)).await.unwrap();
        }
        let stats = h.writer.shutdown(Duration::from_secs(2)).await.unwrap();
        assert_eq!(stats.records_written, 0);
        assert_eq!(stats.records_dead_lettered, 3);
        assert_eq!(h.dlq.stats().pending, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_direct_respects_breaker() {
        let h = harness(config(100), MemoryBackend::new());
        h.writer.write_direct(&[record(1)]).await.unwrap();
        assert_eq!(h.backend.point_count(), 1);

        for _ in 0..5 {
            h.breaker.record_outcome(false);
        }
        let err = h.writer.write_direct(&[record(2)]).await.unwrap_err();
        assert!(matches!(err, BackendError::CircuitOpen(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_backend() {
        let h = harness(config(100), MemoryBackend::new());
        h.writer.ping_backend().await.unwrap();
        h.backend.fail_with(BackendError::Connection("refused".into()));
        assert!(h.writer.ping_backend().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_linger_counts_from_submission() {
        let backend = MemoryBackend::new().with_latency(Duration::from_secs(10));
        let h = harness(config(2), backend);
        h.writer.submit(record(1)).await.unwrap();
        h.writer.submit(record(2)).await.unwrap();

        // Queued while the size flush is still writing
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.writer.submit(record(3)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(h.writer.stats().flushes_linger, 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.writer.stats().flushes_linger, 1);
    }

    fn half_open(breaker: &CircuitBreaker) {
        for _ in 0..5 {
            breaker.record_outcome(false);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_bounds_in_flight_flush() {
        let backend = MemoryBackend::new().with_latency(Duration::from_secs(20));
        let h = harness(config(3), backend);
        half_open(&h.breaker);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.breaker.state(), BreakerState::HalfOpen);

        for i in 0..3 {
            h.writer.submit(record(i)).await.unwrap();
        }
        // The size flush holds the probe slot
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = Instant::now();
        let stats = h.writer.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(started.elapsed() <= Duration::from_millis(1100));
        assert_eq!(stats.records_written, 0);
        assert_eq!(stats.records_dead_lettered, 3);
        assert_eq!(h.dlq.stats().pending, 1);
        assert_eq!(h.backend.calls(), 0);

        // The abandoned probe reopened the breaker instead of wedging it
        assert_eq!(h.breaker.state(), BreakerState::Open);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(h.breaker.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drain_releases_half_open_slot() {
        let backend = MemoryBackend::new().with_latency(Duration::from_secs(20));
        let h = harness(config(100), backend);
        half_open(&h.breaker);
        tokio::time::sleep(Duration::from_secs(30)).await;

        for i in 0..4 {
            h.writer.submit(record(i)).await.unwrap();
        }
        let started = Instant::now();
        let stats = h.writer.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(started.elapsed() <= Duration::from_millis(1100));
        assert_eq!(stats.records_dead_lettered, 4);

        assert_eq!(h.breaker.state(), BreakerState::Open);
        tokio::time::sleep(Duration::from_secs(30)).await;
        h.backend.set_latency(Duration::ZERO);
        h.writer.write_direct(&[record(9)]).await.unwrap();
        assert_eq!(h.breaker.state(), BreakerState::Closed);
    }
}
