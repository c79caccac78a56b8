//! Ingestion pipeline
//!
//! ```text
//!  bytes ──▶ utf-8 ──▶ json ──▶ Router ──▶ Gate ──▶ BatchingWriter ──▶ backend
//!             │         │         │                      │
//!             └─────────┴─────────┴──────────────────────┴──▶ DeadLetterStore
//! ```
//!
//! Routing and admission run on the caller's task. Only the coarse
//! [`IngestOutcome`] leaves [`Pipeline::ingest`]; every failure along the
//! way is classified and recorded in the dead-letter store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::breaker::CircuitBreaker;
use crate::config::PipelineConfig;
use crate::dlq::{
    DeadLetterCategory, DeadLetterPayload, DeadLetterStore, ReplayReport, ReplaySelector,
    ReplayTarget,
};
use crate::error::{BackendError, Error, Result, SchemaError};
use crate::gate::{Admission, DuplicateGate};
use crate::observability::IngestMetrics;
use crate::router::{validate_item, Router};
use crate::services::{
    DeadLetterMaintenance, GateCheckpointer, HealthChecker, HealthReport, ServiceManager,
};
use crate::types::CanonicalRecord;
use crate::writer::{BatchingWriter, StorageBackend, WriterStats};

/// Result of ingesting one payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// At least one record was admitted, or the payload held no items
    Accepted {
        /// Records handed to the writer
        admitted: usize,
        /// Records suppressed by the gate
        duplicates: usize,
        /// Items dead-lettered by the router
        failed: usize,
    },
    /// Every routed record had been seen inside the duplicate window
    Duplicate,
    /// Nothing could be routed; the first failure is reported
    Rejected {
        /// Failure category
        category: DeadLetterCategory,
        /// Dead-letter entry holding the failed input
        entry_id: String,
    },
}

/// Router, gate, writer and dead-letter store wired together
pub struct Pipeline {
    router: Router,
    gate: Arc<DuplicateGate>,
    breaker: Arc<CircuitBreaker>,
    writer: Arc<BatchingWriter>,
    dlq: Arc<DeadLetterStore>,
    metrics: Arc<IngestMetrics>,
    health: Arc<HealthChecker>,
    services: ServiceManager,
}

impl Pipeline {
    /// Build every component, restore persisted state and start the
    /// background services
    ///
    /// An unreadable gate checkpoint only costs duplicate suppression and is
    /// logged; an unreadable dead-letter snapshot fails startup.
    pub async fn start(config: PipelineConfig, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        let metrics = Arc::new(IngestMetrics::new()?);

        let gate = Arc::new(DuplicateGate::new(config.gate));
        if let Some(path) = gate.config().checkpoint_path.clone() {
            if let Err(e) = gate.restore(&path).await {
                error!(path = %path.display(), error = %e, "Gate checkpoint unusable, starting empty");
            }
        }

        let dlq = Arc::new(DeadLetterStore::open(config.dlq).await?);
        let breaker = Arc::new(CircuitBreaker::new(backend.name(), config.breaker));
        let writer = Arc::new(BatchingWriter::spawn(
            config.writer,
            breaker.clone(),
            backend,
            dlq.clone(),
            metrics.clone(),
        ));
        let health = Arc::new(HealthChecker::new(
            config.health,
            breaker.clone(),
            writer.clone(),
            dlq.clone(),
            gate.clone(),
            metrics.clone(),
        ));

        let services = ServiceManager::new();
        services.register(Arc::new(GateCheckpointer::new(
            gate.clone(),
            dlq.clone(),
            metrics.clone(),
        )));
        services.register(Arc::new(DeadLetterMaintenance::new(dlq.clone(), metrics.clone())));
        services.register(health.clone());
        services
            .start_all()
            .map_err(|e| Error::Configuration(e.to_string()))?;

        info!(
            gate_entries = gate.len(),
            dead_letters = dlq.len(),
            "Ingestion pipeline started"
        );

        Ok(Self {
            router: Router::new(config.router),
            gate,
            breaker,
            writer,
            dlq,
            metrics,
            health,
            services,
        })
    }

    /// Ingest raw request bytes
    ///
    /// Undecodable UTF-8 and malformed JSON are dead-lettered with the
    /// input as text.
    pub async fn ingest_bytes(&self, body: &[u8]) -> IngestOutcome {
        let text = match std::str::from_utf8(body) {
            Ok(text) => text,
            Err(e) => {
                self.metrics.record_payload();
                let lossy = String::from_utf8_lossy(body).into_owned();
                return self.reject(
                    DeadLetterPayload::Raw(lossy),
                    DeadLetterCategory::UnicodeDecodeError,
                    e.to_string(),
                );
            }
        };

        match serde_json::from_str::<Value>(text) {
            Ok(payload) => self.ingest(&payload).await,
            Err(e) => {
                self.metrics.record_payload();
                self.reject(
                    DeadLetterPayload::Raw(text.to_string()),
                    DeadLetterCategory::JsonParseError,
                    e.to_string(),
                )
            }
        }
    }

    /// Ingest a parsed payload
    pub async fn ingest(&self, payload: &Value) -> IngestOutcome {
        self.metrics.record_payload();

        let routed = match self.router.route(payload) {
            Ok(routed) => routed,
            Err(e) => {
                return self.reject(
                    DeadLetterPayload::Payload(payload.clone()),
                    e.category(),
                    e.to_string(),
                );
            }
        };

        let mut first_failure = None;
        let failed = routed.failures.len();
        for failure in routed.failures {
            self.metrics.record_route_failure();
            let entry_id = self.dead_letter(
                DeadLetterPayload::Item(failure.item),
                failure.category,
                failure.detail,
            );
            first_failure.get_or_insert((failure.category, entry_id));
        }

        let routed_records = routed.records.len();
        let mut admitted = 0;
        let mut duplicates = 0;
        for record in routed.records {
            self.metrics.record_routed(record.family());
            match self.gate.admit(&record) {
                Admission::Admitted => {
                    admitted += 1;
                    // A closed writer dead-letters the record itself
                    if let Err(e) = self.writer.submit(record).await {
                        warn!(error = %e, "Record submitted after writer shutdown");
                    }
                }
                Admission::Duplicate => {
                    duplicates += 1;
                    self.metrics.record_duplicate();
                }
            }
        }

        let gate = self.gate.stats();
        self.metrics.set_gate(gate.size, gate.evictions);

        debug!(
            records = routed_records,
            admitted,
            duplicates,
            failed,
            "Payload ingested"
        );

        if routed_records == 0 {
            if let Some((category, entry_id)) = first_failure {
                self.metrics.record_payload_rejected();
                return IngestOutcome::Rejected { category, entry_id };
            }
        } else if admitted == 0 && failed == 0 {
            self.metrics.record_payload_duplicate();
            return IngestOutcome::Duplicate;
        }
        IngestOutcome::Accepted {
            admitted,
            duplicates,
            failed,
        }
    }

    /// Replay dead-lettered entries back through the pipeline
    pub async fn replay(&self, selector: &ReplaySelector, dry_run: bool) -> ReplayReport {
        let report = self.dlq.replay(selector, dry_run, self).await;
        self.metrics.set_dlq_pending(self.dlq.pending_count());
        report
    }

    /// Stop services, drain the writer and persist final state
    ///
    /// `grace` bounds the whole sequence; records the writer cannot flush
    /// before the deadline are dead-lettered, then both snapshots are
    /// written.
    pub async fn shutdown(&self, grace: Duration) -> Result<WriterStats> {
        let deadline = Instant::now() + grace;
        info!(grace_ms = grace.as_millis() as u64, "Ingestion pipeline shutting down");

        for e in self.services.shutdown(grace).await {
            warn!(error = %e, "Service did not stop cleanly");
        }

        let stats = self
            .writer
            .shutdown(deadline.saturating_duration_since(Instant::now()))
            .await?;

        // Dead letters first: the gate checkpoint must not cover records
        // whose entries never reached disk
        let mut result = self.dlq.persist_if_dirty().await.map(|_| ());
        if result.is_ok() {
            if let Some(path) = self.gate.config().checkpoint_path.clone() {
                if self.gate.is_dirty() {
                    result = self.gate.checkpoint(&path).await.map(|_| ());
                }
            }
        }
        let result = result.map_err(Error::Persistence);

        self.metrics.set_dlq_pending(self.dlq.pending_count());
        info!(
            written = stats.records_written,
            dead_lettered = stats.records_dead_lettered,
            pending_dead_letters = self.dlq.pending_count(),
            "Ingestion pipeline stopped"
        );
        result.map(|_| stats)
    }

    /// Check that the storage backend answers
    pub async fn ping_backend(&self) -> std::result::Result<(), BackendError> {
        self.writer.ping_backend().await
    }

    /// Run the health checks now
    pub fn health(&self) -> HealthReport {
        self.health.run_health_checks()
    }

    /// Duplicate gate
    pub fn gate(&self) -> &Arc<DuplicateGate> {
        &self.gate
    }

    /// Circuit breaker guarding the backend
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Batching writer
    pub fn writer(&self) -> &Arc<BatchingWriter> {
        &self.writer
    }

    /// Dead-letter store
    pub fn dead_letters(&self) -> &Arc<DeadLetterStore> {
        &self.dlq
    }

    /// Metrics
    pub fn metrics(&self) -> &Arc<IngestMetrics> {
        &self.metrics
    }

    fn dead_letter(
        &self,
        payload: DeadLetterPayload,
        category: DeadLetterCategory,
        detail: String,
    ) -> String {
        self.metrics.record_dead_letter(category);
        let entry_id = self.dlq.record(payload, category, detail.clone());
        warn!(
            entry_id = %entry_id,
            category = category.as_str(),
            reason = %detail,
            "Input dead-lettered"
        );
        entry_id
    }

    fn reject(
        &self,
        payload: DeadLetterPayload,
        category: DeadLetterCategory,
        detail: String,
    ) -> IngestOutcome {
        self.metrics.record_payload_rejected();
        let entry_id = self.dead_letter(payload, category, detail);
        IngestOutcome::Rejected { category, entry_id }
    }

    /// Route a replayed payload; any failing item fails the replay
    fn reroute(&self, payload: &Value) -> Result<Vec<CanonicalRecord>> {
        let routed = self.router.route(payload)?;
        if let Some(failure) = routed.failures.into_iter().next() {
            return Err(Error::Schema(SchemaError::InvalidField {
                field: failure.path,
                reason: failure.detail,
            }));
        }
        Ok(routed.records)
    }
}

#[async_trait]
impl ReplayTarget for Pipeline {
    /// Re-run the failed stage and write the result directly
    ///
    /// Records are admitted to the gate only after the write succeeds, so a
    /// failed replay never leaves them marked as seen.
    async fn replay(&self, payload: &DeadLetterPayload) -> Result<()> {
        let records = match payload {
            DeadLetterPayload::Records(records) => records.clone(),
            DeadLetterPayload::Item(item) => {
                let metric = validate_item("$", item)?;
                vec![self.router.dispatch(&metric)?]
            }
            DeadLetterPayload::Payload(value) => self.reroute(value)?,
            DeadLetterPayload::Raw(text) => {
                let value: Value = serde_json::from_str(text)
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                self.reroute(&value)?
            }
        };

        self.writer.write_direct(&records).await?;
        for record in &records {
            self.gate.admit(record);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::{DeadLetterFilter, DeadLetterStatus};
    use crate::error::BackendError;
    use crate::writer::MemoryBackend;
    use serde_json::json;

    async fn start(backend: Arc<MemoryBackend>) -> Pipeline {
        Pipeline::start(PipelineConfig::default(), backend).await.unwrap()
    }

    fn heart_payload(bpm: f64) -> Value {
        json!({
            "data": {
                "metrics": [{
                    "name": "heart_rate",
                    "units": "count/min",
                    "data": [{"date": "2024-01-15 08:00:00 +0000", "qty": bpm}]
                }]
            }
        })
    }

    #[tokio::test]
    async fn test_accepts_then_suppresses_duplicate() {
        let backend = Arc::new(MemoryBackend::new());
        let pipeline = start(backend.clone()).await;

        let outcome = pipeline.ingest(&heart_payload(62.0)).await;
        assert_eq!(
            outcome,
            IngestOutcome::Accepted {
                admitted: 1,
                duplicates: 0,
                failed: 0
            }
        );
        assert_eq!(pipeline.ingest(&heart_payload(62.0)).await, IngestOutcome::Duplicate);

        let stats = pipeline.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(stats.records_written, 1);
        assert_eq!(backend.point_count(), 1);
        assert_eq!(pipeline.metrics().snapshot().duplicates, 1);
    }

    #[tokio::test]
    async fn test_bad_bytes_are_classified() {
        let pipeline = start(Arc::new(MemoryBackend::new())).await;

        let outcome = pipeline.ingest_bytes(&[0x7b, 0xff, 0xfe]).await;
        let IngestOutcome::Rejected { category, entry_id } = outcome else {
            panic!("expected rejection");
        };
        assert_eq!(category, DeadLetterCategory::UnicodeDecodeError);
        assert!(matches!(
            pipeline.dead_letters().get(&entry_id).unwrap().payload,
            DeadLetterPayload::Raw(_)
        ));

        let outcome = pipeline.ingest_bytes(b"{\"data\": [").await;
        assert!(matches!(
            outcome,
            IngestOutcome::Rejected {
                category: DeadLetterCategory::JsonParseError,
                ..
            }
        ));

        let outcome = pipeline.ingest_bytes(b"[1, 2, 3]").await;
        assert!(matches!(
            outcome,
            IngestOutcome::Rejected {
                category: DeadLetterCategory::UnknownError,
                ..
            }
        ));
        assert_eq!(pipeline.metrics().snapshot().payloads_rejected, 3);
        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_failure_is_accepted() {
        let pipeline = start(Arc::new(MemoryBackend::new())).await;
        let payload = json!({
            "data": {
                "metrics": [
                    {"name": "step_count", "units": "count",
                     "data": [{"date": "2024-01-15 08:00:00 +0000", "qty": 1200}]},
                    {"name": "step_count", "units": "count",
                     "data": [{"qty": 50}]}
                ]
            }
        });

        let outcome = pipeline.ingest(&payload).await;
        assert_eq!(
            outcome,
            IngestOutcome::Accepted {
                admitted: 1,
                duplicates: 0,
                failed: 1
            }
        );
        let entries = pipeline
            .dead_letters()
            .list(&DeadLetterFilter::category(DeadLetterCategory::ValidationError));
        assert_eq!(entries.len(), 1);
        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_records_after_fix() {
        let backend = Arc::new(MemoryBackend::new());
        let pipeline = start(backend.clone()).await;

        let record = {
            let routed = pipeline.router.route(&heart_payload(70.0)).unwrap();
            routed.records.into_iter().next().unwrap()
        };
        let id = pipeline.dead_letters().record(
            DeadLetterPayload::Records(vec![record]),
            DeadLetterCategory::WriteError,
            "refused",
        );
        let selector = ReplaySelector::Ids(vec![id.clone()]);

        let dry = pipeline.replay(&selector, true).await;
        assert_eq!(dry.selected, vec![id.clone()]);
        assert_eq!(backend.calls(), 0);

        backend.fail_with(BackendError::Connection("refused".into()));
        let report = pipeline.replay(&selector, false).await;
        assert_eq!(report.failed, 1);
        let entry = pipeline.dead_letters().get(&id).unwrap();
        assert_eq!(entry.status, DeadLetterStatus::Pending);
        assert_eq!(entry.retry_count, 1);

        backend.recover();
        let report = pipeline.replay(&selector, false).await;
        assert_eq!(report.resolved, 1);
        assert_eq!(
            pipeline.dead_letters().get(&id).unwrap().status,
            DeadLetterStatus::Resolved
        );
        assert_eq!(backend.point_count(), 1);
        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_replay_failed_item_reroutes() {
        let backend = Arc::new(MemoryBackend::new());
        let pipeline = start(backend.clone()).await;

        // Missing its date, the item fails validation again on replay
        let outcome = pipeline
            .ingest(&json!({"data": [{"name": "step_count", "qty": 10}]}))
            .await;
        let IngestOutcome::Rejected { category, .. } = outcome else {
            panic!("expected rejection");
        };
        assert_eq!(category, DeadLetterCategory::ValidationError);

        let report = pipeline
            .replay(&ReplaySelector::Category(DeadLetterCategory::ValidationError), false)
            .await;
        assert_eq!(report.failed, 1);
        assert_eq!(backend.calls(), 0);
        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
