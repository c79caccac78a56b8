//! Dead-letter maintenance service
//!
//! Applies retention and capacity purging on an interval, persists the
//! store as soon as an entry is recorded and keeps the pending gauge
//! current.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant};

use crate::dlq::{DeadLetterStore, PurgeReport};
use crate::observability::IngestMetrics;

use super::framework::{Service, ServiceError, ServiceStatus};

/// Statistics collected by the maintenance service
#[derive(Debug, Default, Clone)]
pub struct MaintenanceStats {
    /// Completed cycles
    pub cycles: u64,
    /// Entries purged
    pub purged: u64,
    /// Snapshots written
    pub snapshots_written: u64,
    /// Snapshots that failed
    pub snapshot_failures: u64,
    /// Snapshots triggered by a new entry rather than the interval
    pub prompt_snapshots: u64,
}

/// Background service maintaining the dead-letter store
pub struct DeadLetterMaintenance {
    dlq: Arc<DeadLetterStore>,
    metrics: Arc<IngestMetrics>,
    status: RwLock<ServiceStatus>,
    stats: RwLock<MaintenanceStats>,
}

impl DeadLetterMaintenance {
    /// Create the service for `dlq`
    pub fn new(dlq: Arc<DeadLetterStore>, metrics: Arc<IngestMetrics>) -> Self {
        Self {
            dlq,
            metrics,
            status: RwLock::new(ServiceStatus::Stopped),
            stats: RwLock::new(MaintenanceStats::default()),
        }
    }

    /// Current statistics
    pub fn stats(&self) -> MaintenanceStats {
        self.stats.read().clone()
    }

    /// Purge, persist if dirty and refresh the pending gauge
    pub async fn run_cycle(&self) -> Result<PurgeReport, ServiceError> {
        let report = self.dlq.purge(Utc::now());
        let persisted = self.dlq.persist_if_dirty().await;
        self.metrics.set_dlq_pending(self.dlq.pending_count());

        let mut stats = self.stats.write();
        stats.cycles += 1;
        stats.purged += report.total() as u64;
        match persisted {
            Ok(Some(_)) => stats.snapshots_written += 1,
            Ok(None) => {}
            Err(e) => {
                stats.snapshot_failures += 1;
                return Err(e.into());
            }
        }
        Ok(report)
    }

    /// Persist right away after new entries arrived
    pub async fn persist_recorded(&self) -> Result<(), ServiceError> {
        let persisted = self.dlq.persist_if_dirty().await;
        self.metrics.set_dlq_pending(self.dlq.pending_count());

        let mut stats = self.stats.write();
        match persisted {
            Ok(Some(_)) => {
                stats.snapshots_written += 1;
                stats.prompt_snapshots += 1;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                stats.snapshot_failures += 1;
                Err(e.into())
            }
        }
    }
}

#[async_trait::async_trait]
impl Service for DeadLetterMaintenance {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        let period = self.dlq.config().maintenance_interval;
        tracing::debug!(interval_secs = period.as_secs(), "Dead-letter maintenance started");

        let mut ticker = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(missed = n, "Dead-letter maintenance receiver lagged");
                        }
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        tracing::error!(error = %e, "Dead-letter maintenance failed");
                    }
                }

                _ = self.dlq.recorded() => {
                    if let Err(e) = self.persist_recorded().await {
                        tracing::error!(error = %e, "Dead-letter snapshot after new entry failed");
                    }
                }
            }
        }

        // The writer may still dead-letter while draining; the pipeline
        // persists once more after it stops
        *self.status.write() = ServiceStatus::Stopped;
        tracing::debug!("Dead-letter maintenance stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "dlq_maintenance"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}
