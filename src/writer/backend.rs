//! Storage backend seam
//!
//! The writer only knows [`StorageBackend`]. A backend stores points under
//! their [`WriteKey`](crate::types::WriteKey), so writing the same record
//! twice overwrites rather than duplicates.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::BackendError;
use crate::types::{timestamp_nanos, CanonicalRecord, WriteKey};

/// Organization and bucket a batch is written to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketTarget {
    /// Organization
    pub org: String,
    /// Bucket
    pub bucket: String,
}

impl Default for BucketTarget {
    fn default() -> Self {
        Self {
            org: "health".to_string(),
            bucket: "apple_health".to_string(),
        }
    }
}

/// Time-series storage backend
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Backend name for logs and breaker naming
    fn name(&self) -> &str;

    /// Write one batch; the batch is either fully accepted or rejected
    async fn write(&self, target: &BucketTarget, records: &[CanonicalRecord]) -> Result<(), BackendError>;

    /// Cheap reachability check
    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

// ============================================================================
// Line protocol
// ============================================================================

/// Encode records as InfluxDB line protocol, one line per record
pub fn encode_line_protocol(records: &[CanonicalRecord]) -> String {
    let mut out = String::with_capacity(records.len() * 96);
    for record in records {
        encode_record(&mut out, record);
        out.push('\n');
    }
    out
}

fn encode_record(out: &mut String, record: &CanonicalRecord) {
    escape_into(out, record.family().measurement(), &[',', ' ']);
    out.push_str(",source=");
    escape_into(out, record.source_tag(), &[',', '=', ' ']);
    for (key, value) in record.extra_tags() {
        out.push(',');
        escape_into(out, key, &[',', '=', ' ']);
        out.push('=');
        escape_into(out, value, &[',', '=', ' ']);
    }

    let mut first = true;
    for (name, value) in record.fields() {
        out.push(if first { ' ' } else { ',' });
        first = false;
        escape_into(out, name, &[',', '=', ' ']);
        let _ = write!(out, "={}", value);
    }
    let _ = write!(out, " {}", timestamp_nanos(&record.timestamp()));
}

fn escape_into(out: &mut String, s: &str, special: &[char]) {
    for c in s.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    points: BTreeMap<WriteKey, CanonicalRecord>,
    calls: u64,
    batch_sizes: Vec<usize>,
    scripted: VecDeque<Result<(), BackendError>>,
    failing: Option<BackendError>,
    latency: Option<Duration>,
}

/// In-memory backend with scripted failures
///
/// Stores points keyed by write key. Scripted outcomes are consumed one per
/// call before the standing failure (if any) applies.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fixed delay to every write
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    /// Change the delay applied to subsequent writes
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = Some(latency);
    }

    /// Queue outcomes for the next calls
    pub fn script(&self, outcomes: impl IntoIterator<Item = Result<(), BackendError>>) {
        self.state.lock().scripted.extend(outcomes);
    }

    /// Fail every call with `error` until cleared
    pub fn fail_with(&self, error: BackendError) {
        self.state.lock().failing = Some(error);
    }

    /// Stop failing
    pub fn recover(&self) {
        let mut state = self.state.lock();
        state.failing = None;
        state.scripted.clear();
    }

    /// Number of write calls made
    pub fn calls(&self) -> u64 {
        self.state.lock().calls
    }

    /// Sizes of every batch passed to `write`, accepted or not
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().batch_sizes.clone()
    }

    /// Number of distinct points stored
    pub fn point_count(&self) -> usize {
        self.state.lock().points.len()
    }

    /// Stored points in write-key order
    pub fn points(&self) -> Vec<CanonicalRecord> {
        self.state.lock().points.values().cloned().collect()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write(&self, _target: &BucketTarget, records: &[CanonicalRecord]) -> Result<(), BackendError> {
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        state.calls += 1;
        state.batch_sizes.push(records.len());

        let outcome = match state.scripted.pop_front() {
            Some(outcome) => outcome,
            None => match &state.failing {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            },
        };
        outcome?;

        for record in records {
            state.points.insert(record.write_key(), record.clone());
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), BackendError> {
        match &self.state.lock().failing {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetricFamily;
    use chrono::DateTime;

    fn record(source: &str, bpm: f64) -> CanonicalRecord {
        let ts = DateTime::parse_from_rfc3339("2024-01-15T08:30:00Z").unwrap();
        CanonicalRecord::builder(MetricFamily::Heart, ts, source)
            .field("bpm", bpm)
            .build()
    }

    #[test]
    fn test_line_protocol() {
        let ts = DateTime::parse_from_rfc3339("2024-01-15T08:30:00Z").unwrap();
        let record = CanonicalRecord::builder(MetricFamily::Other, ts, "Apple Watch")
            .tag("metric_type", "mindful_minutes")
            .field("value", 10.0)
            .field("max", 12.5)
            .build();
        let line = encode_line_protocol(&[record]);
        assert_eq!(
            line,
            "other,source=Apple\\ Watch,metric_type=mindful_minutes max=12.5,value=10 1705307400000000000\n"
        );
    }

    #[tokio::test]
    async fn test_memory_backend_overwrites_by_write_key() {
        let backend = MemoryBackend::new();
        let target = BucketTarget::default();
        backend.write(&target, &[record("watch", 70.0)]).await.unwrap();
        backend.write(&target, &[record("watch", 71.0)]).await.unwrap();
        backend.write(&target, &[record("phone", 71.0)]).await.unwrap();

        assert_eq!(backend.calls(), 3);
        assert_eq!(backend.point_count(), 2);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let backend = MemoryBackend::new();
        backend.script([Err(BackendError::Connection("refused".into())), Ok(())]);
        let target = BucketTarget::default();

        assert!(backend.write(&target, &[record("w", 1.0)]).await.is_err());
        assert!(backend.write(&target, &[record("w", 1.0)]).await.is_ok());
        assert_eq!(backend.batch_sizes(), vec![1, 1]);
        assert_eq!(backend.point_count(), 1);

        backend.fail_with(BackendError::Timeout(Duration::from_secs(1)));
        assert!(backend.write(&target, &[record("w", 2.0)]).await.is_err());
        assert!(backend.ping().await.is_err());
        backend.recover();
        assert!(backend.ping().await.is_ok());
    }
}
