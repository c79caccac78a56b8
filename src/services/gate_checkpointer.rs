//! Gate Checkpointer Service
//!
//! Expires stale fingerprints and writes the gate checkpoint:
//! - every `checkpoint_interval`, when the table changed since the last one
//! - once more on shutdown
//!
//! The dead-letter store is persisted before each checkpoint. A fingerprint
//! on disk must never outlive the dead-letter entry holding its record, or a
//! resend after a crash would be suppressed with nothing left to replay.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant};

use crate::dlq::DeadLetterStore;
use crate::gate::DuplicateGate;
use crate::observability::IngestMetrics;

use super::framework::{Service, ServiceError, ServiceStatus};

/// Statistics collected by the checkpointer
#[derive(Debug, Default, Clone)]
pub struct CheckpointerStats {
    /// Completed cycles
    pub cycles: u64,
    /// Checkpoints written
    pub checkpoints_written: u64,
    /// Checkpoints that failed
    pub checkpoint_failures: u64,
    /// Fingerprints expired by cleanup
    pub entries_expired: u64,
    /// When the last cycle ran
    pub last_cycle: Option<Instant>,
}

/// Background service persisting the duplicate gate
pub struct GateCheckpointer {
    gate: Arc<DuplicateGate>,
    dlq: Arc<DeadLetterStore>,
    metrics: Arc<IngestMetrics>,
    status: RwLock<ServiceStatus>,
    stats: RwLock<CheckpointerStats>,
}

impl GateCheckpointer {
    /// Create a checkpointer for `gate`, persisting `dlq` ahead of it
    pub fn new(gate: Arc<DuplicateGate>, dlq: Arc<DeadLetterStore>, metrics: Arc<IngestMetrics>) -> Self {
        Self {
            gate,
            dlq,
            metrics,
            status: RwLock::new(ServiceStatus::Stopped),
            stats: RwLock::new(CheckpointerStats::default()),
        }
    }

    /// Current statistics
    pub fn stats(&self) -> CheckpointerStats {
        self.stats.read().clone()
    }

    /// Run one cycle: expire, then checkpoint if dirty
    pub async fn run_cycle(&self) -> Result<(), ServiceError> {
        let expired = self.gate.cleanup_expired();
        let gate_stats = self.gate.stats();
        self.metrics.set_gate(gate_stats.size, gate_stats.evictions);

        let result = self.checkpoint_if_dirty().await;

        let mut stats = self.stats.write();
        stats.cycles += 1;
        stats.entries_expired += expired as u64;
        stats.last_cycle = Some(Instant::now());
        match &result {
            Ok(true) => stats.checkpoints_written += 1,
            Ok(false) => {}
            Err(_) => stats.checkpoint_failures += 1,
        }
        result.map(|_| ())
    }

    async fn checkpoint_if_dirty(&self) -> Result<bool, ServiceError> {
        let Some(path) = self.gate.config().checkpoint_path.clone() else {
            return Ok(false);
        };
        if !self.gate.is_dirty() {
            return Ok(false);
        }
        // On failure the gate stays dirty and the next cycle tries again
        self.dlq.persist_if_dirty().await?;
        self.gate.checkpoint(&path).await?;
        Ok(true)
    }
}

#[async_trait::async_trait]
impl Service for GateCheckpointer {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        let period = self.gate.config().checkpoint_interval;
        tracing::debug!(interval_secs = period.as_secs(), "Gate checkpointer started");

        let mut ticker = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                            tracing::debug!("Gate checkpointer received shutdown signal");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(missed = n, "Gate checkpointer broadcast receiver lagged");
                        }
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        tracing::error!(error = %e, "Gate checkpoint failed");
                    }
                }
            }
        }

        *self.status.write() = ServiceStatus::Stopping;
        let result = self.run_cycle().await;
        *self.status.write() = match &result {
            Ok(()) => ServiceStatus::Stopped,
            Err(e) => ServiceStatus::Failed(e.to_string()),
        };
        tracing::debug!("Gate checkpointer stopped");
        result
    }

    fn name(&self) -> &'static str {
        "gate_checkpointer"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}
