//! Ingestion metrics
//!
//! Plain counters and gauges are atomics read through [`MetricsSnapshot`].
//! Labeled series and the write-duration histogram live in a private
//! prometheus registry that the exporter encodes alongside the snapshot.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry};

use crate::breaker::BreakerState;
use crate::dlq::DeadLetterCategory;
use crate::types::MetricFamily;
use crate::writer::FlushTrigger;

/// Ingestion metrics
pub struct IngestMetrics {
    payloads_received: AtomicU64,
    payloads_rejected: AtomicU64,
    payloads_duplicate: AtomicU64,
    records_routed: AtomicU64,
    route_failures: AtomicU64,
    duplicates: AtomicU64,
    points_written: AtomicU64,
    batches_written: AtomicU64,
    write_errors: AtomicU64,
    write_retries: AtomicU64,
    write_time_us: AtomicU64,
    buffer_depth: AtomicU64,
    breaker_state: AtomicI64,
    breaker_trips: AtomicU64,
    gate_size: AtomicU64,
    gate_evictions: AtomicU64,
    dlq_pending: AtomicU64,
    started_at: Instant,

    registry: Registry,
    records_by_family: IntCounterVec,
    flushes: IntCounterVec,
    dead_letters: IntCounterVec,
    write_duration: Histogram,
}

/// Point-in-time copy of the scalar metrics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    /// Payloads handed to the pipeline
    pub payloads_received: u64,
    /// Payloads that produced no record and at least one failure
    pub payloads_rejected: u64,
    /// Payloads made only of duplicates
    pub payloads_duplicate: u64,
    /// Records produced by the router
    pub records_routed: u64,
    /// Items that failed routing
    pub route_failures: u64,
    /// Records suppressed by the gate
    pub duplicates: u64,
    /// Points accepted by the backend
    pub points_written: u64,
    /// Batches accepted by the backend
    pub batches_written: u64,
    /// Batches that failed all attempts
    pub write_errors: u64,
    /// Retry attempts
    pub write_retries: u64,
    /// Mean successful write latency in microseconds
    pub avg_write_latency_us: u64,
    /// Records waiting in the writer buffer
    pub buffer_depth: u64,
    /// Breaker state gauge (0 closed, 1 half-open, 2 open)
    pub breaker_state: i64,
    /// Breaker trips
    pub breaker_trips: u64,
    /// Live gate entries
    pub gate_size: u64,
    /// Gate LRU evictions
    pub gate_evictions: u64,
    /// Pending dead-letter entries
    pub dlq_pending: u64,
    /// Time since the metrics were created
    pub uptime: Duration,
}

impl MetricsSnapshot {
    /// Fraction of batches written on their final attempt (0.0-1.0)
    pub fn write_success_rate(&self) -> f64 {
        let total = self.batches_written + self.write_errors;
        if total == 0 {
            1.0
        } else {
            self.batches_written as f64 / total as f64
        }
    }
}

impl std::fmt::Debug for IngestMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl IngestMetrics {
    /// Create metrics with a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let records_by_family = IntCounterVec::new(
            Opts::new(
                "health_ingest_records_by_family_total",
                "Records routed per metric family",
            ),
            &["family"],
        )?;
        let flushes = IntCounterVec::new(
            Opts::new("health_ingest_flushes_total", "Batch flushes by trigger"),
            &["trigger"],
        )?;
        let dead_letters = IntCounterVec::new(
            Opts::new(
                "health_ingest_dead_letters_total",
                "Dead-letter entries recorded by category",
            ),
            &["category"],
        )?;
        let write_duration = Histogram::with_opts(
            HistogramOpts::new(
                "health_ingest_write_duration_seconds",
                "Backend write duration including retries",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;

        registry.register(Box::new(records_by_family.clone()))?;
        registry.register(Box::new(flushes.clone()))?;
        registry.register(Box::new(dead_letters.clone()))?;
        registry.register(Box::new(write_duration.clone()))?;

        Ok(Self {
            payloads_received: AtomicU64::new(0),
            payloads_rejected: AtomicU64::new(0),
            payloads_duplicate: AtomicU64::new(0),
            records_routed: AtomicU64::new(0),
            route_failures: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            points_written: AtomicU64::new(0),
            batches_written: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            write_retries: AtomicU64::new(0),
            write_time_us: AtomicU64::new(0),
            buffer_depth: AtomicU64::new(0),
            breaker_state: AtomicI64::new(BreakerState::Closed.as_gauge()),
            breaker_trips: AtomicU64::new(0),
            gate_size: AtomicU64::new(0),
            gate_evictions: AtomicU64::new(0),
            dlq_pending: AtomicU64::new(0),
            started_at: Instant::now(),
            registry,
            records_by_family,
            flushes,
            dead_letters,
            write_duration,
        })
    }

    /// Registry holding the labeled series
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// A payload entered the pipeline
    pub fn record_payload(&self) {
        self.payloads_received.fetch_add(1, Ordering::Relaxed);
    }

    /// A payload was rejected as a whole
    pub fn record_payload_rejected(&self) {
        self.payloads_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// A payload contained nothing but duplicates
    pub fn record_payload_duplicate(&self) {
        self.payloads_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    /// The router produced a record
    pub fn record_routed(&self, family: MetricFamily) {
        self.records_routed.fetch_add(1, Ordering::Relaxed);
        self.records_by_family
            .with_label_values(&[family.measurement()])
            .inc();
    }

    /// The router failed an item
    pub fn record_route_failure(&self) {
        self.route_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// The gate suppressed a record
    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    /// A batch was written
    pub fn record_write(&self, points: usize, duration: Duration) {
        self.points_written.fetch_add(points as u64, Ordering::Relaxed);
        self.batches_written.fetch_add(1, Ordering::Relaxed);
        self.write_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.write_duration.observe(duration.as_secs_f64());
    }

    /// A batch failed every attempt
    pub fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// A write attempt is being retried
    pub fn record_retry(&self) {
        self.write_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// A flush happened
    pub fn record_flush(&self, trigger: FlushTrigger) {
        self.flushes.with_label_values(&[trigger.as_str()]).inc();
    }

    /// An entry was dead-lettered
    pub fn record_dead_letter(&self, category: DeadLetterCategory) {
        self.dead_letters
            .with_label_values(&[category.as_str()])
            .inc();
    }

    /// Current writer buffer depth
    pub fn set_buffer_depth(&self, depth: usize) {
        self.buffer_depth.store(depth as u64, Ordering::Relaxed);
    }

    /// Current breaker state and trip count
    pub fn set_breaker(&self, state: BreakerState, trips: u64) {
        self.breaker_state.store(state.as_gauge(), Ordering::Relaxed);
        self.breaker_trips.store(trips, Ordering::Relaxed);
    }

    /// Current gate size and evictions
    pub fn set_gate(&self, size: usize, evictions: u64) {
        self.gate_size.store(size as u64, Ordering::Relaxed);
        self.gate_evictions.store(evictions, Ordering::Relaxed);
    }

    /// Current pending dead-letter count
    pub fn set_dlq_pending(&self, pending: usize) {
        self.dlq_pending.store(pending as u64, Ordering::Relaxed);
    }

    /// Flushes recorded for one trigger
    pub fn flush_count(&self, trigger: FlushTrigger) -> u64 {
        self.flushes.with_label_values(&[trigger.as_str()]).get()
    }

    /// Dead-letter entries recorded for one category
    pub fn dead_letter_count(&self, category: DeadLetterCategory) -> u64 {
        self.dead_letters
            .with_label_values(&[category.as_str()])
            .get()
    }

    /// Read every scalar metric
    pub fn snapshot(&self) -> MetricsSnapshot {
        let batches = self.batches_written.load(Ordering::Relaxed);
        let write_time = self.write_time_us.load(Ordering::Relaxed);
        MetricsSnapshot {
            payloads_received: self.payloads_received.load(Ordering::Relaxed),
            payloads_rejected: self.payloads_rejected.load(Ordering::Relaxed),
            payloads_duplicate: self.payloads_duplicate.load(Ordering::Relaxed),
            records_routed: self.records_routed.load(Ordering::Relaxed),
            route_failures: self.route_failures.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            points_written: self.points_written.load(Ordering::Relaxed),
            batches_written: batches,
            write_errors: self.write_errors.load(Ordering::Relaxed),
            write_retries: self.write_retries.load(Ordering::Relaxed),
            avg_write_latency_us: if batches == 0 { 0 } else { write_time / batches },
            buffer_depth: self.buffer_depth.load(Ordering::Relaxed),
            breaker_state: self.breaker_state.load(Ordering::Relaxed),
            breaker_trips: self.breaker_trips.load(Ordering::Relaxed),
            gate_size: self.gate_size.load(Ordering::Relaxed),
            gate_evictions: self.gate_evictions.load(Ordering::Relaxed),
            dlq_pending: self.dlq_pending.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_updates() {
        let metrics = IngestMetrics::new().unwrap();
        metrics.record_payload();
        metrics.record_routed(MetricFamily::Heart);
        metrics.record_routed(MetricFamily::Sleep);
        metrics.record_duplicate();
        metrics.record_write(2, Duration::from_millis(4));
        metrics.record_write_error();
        metrics.set_breaker(BreakerState::Open, 3);

        let snap = metrics.snapshot();
        assert_eq!(snap.payloads_received, 1);
        assert_eq!(snap.records_routed, 2);
        assert_eq!(snap.duplicates, 1);
        assert_eq!(snap.points_written, 2);
        assert_eq!(snap.avg_write_latency_us, 4000);
        assert_eq!(snap.breaker_state, 2);
        assert_eq!(snap.breaker_trips, 3);
        assert_eq!(snap.write_success_rate(), 0.5);
    }

    #[test]
    fn test_labeled_counters() {
        let metrics = IngestMetrics::new().unwrap();
        metrics.record_flush(FlushTrigger::Size);
        metrics.record_flush(FlushTrigger::Size);
        metrics.record_flush(FlushTrigger::Linger);
        metrics.record_dead_letter(DeadLetterCategory::WriteError);

        assert_eq!(metrics.flush_count(FlushTrigger::Size), 2);
        assert_eq!(metrics.flush_count(FlushTrigger::Manual), 0);
        assert_eq!(metrics.dead_letter_count(DeadLetterCategory::WriteError), 1);
        let names: Vec<String> = metrics
            .registry()
            .gather()
            .iter()
            .map(|mf| mf.get_name().to_string())
            .collect();
        assert!(names.contains(&"health_ingest_flushes_total".to_string()));
        assert!(names.contains(&"health_ingest_write_duration_seconds".to_string()));
    }
}
