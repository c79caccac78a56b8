//! Health Check Service
//!
//! Watches the ingestion path and refreshes the gauges it reads:
//! - Breaker state (backend reachable)
//! - Writer buffer fill (backpressure)
//! - Writer task liveness
//! - Pending dead-letter backlog

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant};

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::dlq::DeadLetterStore;
use crate::gate::DuplicateGate;
use crate::observability::IngestMetrics;
use crate::writer::BatchingWriter;

use super::framework::{Service, ServiceError, ServiceStatus};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the health check service
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Interval between health checks
    pub check_interval: Duration,

    /// Buffer fill ratio above which the writer counts as backed up
    pub buffer_warn_ratio: f64,

    /// Pending dead-letter entries above which the backlog check fails
    pub max_pending_dead_letters: usize,

    /// Number of consecutive failures before a check counts as failing
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            buffer_warn_ratio: 0.8,
            max_pending_dead_letters: 1_000,
            failure_threshold: 3,
        }
    }
}

// ============================================================================
// Health Status
// ============================================================================

/// Overall health status of the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Everything is fine
    Healthy,

    /// Some checks fail but records are still accepted
    Degraded,

    /// Most checks fail
    Unhealthy,

    /// Health status is unknown (checks haven't run yet)
    Unknown,
}

impl HealthStatus {
    /// Check if the status indicates the pipeline is operational
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    /// Check if the status indicates the pipeline is fully healthy
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

// ============================================================================
// Individual Check Results
// ============================================================================

/// Result of a single health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    /// Name of the check
    pub name: &'static str,

    /// Whether the check passed
    pub passed: bool,

    /// Optional message with details
    pub message: Option<String>,

    /// When the check was performed
    pub checked_at: Instant,
}

impl CheckResult {
    /// Create a passing check result
    pub fn pass(name: &'static str) -> Self {
        Self {
            name,
            passed: true,
            message: None,
            checked_at: Instant::now(),
        }
    }

    /// Create a failing check result
    pub fn fail(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            message: Some(message.into()),
            checked_at: Instant::now(),
        }
    }
}

// ============================================================================
// Health Report
// ============================================================================

/// Complete health report with all check results
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Overall health status
    pub status: HealthStatus,

    /// Individual check results
    pub checks: Vec<CheckResult>,

    /// When the report was generated
    pub generated_at: Instant,
}

impl Default for HealthReport {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            checks: Vec::new(),
            generated_at: Instant::now(),
        }
    }
}

impl HealthReport {
    /// Create a new health report from check results
    pub fn from_checks(checks: Vec<CheckResult>) -> Self {
        let failed_count = checks.iter().filter(|c| !c.passed).count();

        // Less than half failing is degraded, half or more is unhealthy
        let status = if failed_count == 0 {
            HealthStatus::Healthy
        } else if failed_count * 2 < checks.len() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        Self {
            status,
            checks,
            generated_at: Instant::now(),
        }
    }

    /// Get all failed checks
    pub fn failed_checks(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| !c.passed).collect()
    }

    /// Get one check by name
    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }
}

// ============================================================================
// Health Checker Service
// ============================================================================

/// Background watchdog over the ingestion path
pub struct HealthChecker {
    config: HealthConfig,
    breaker: Arc<CircuitBreaker>,
    writer: Arc<BatchingWriter>,
    dlq: Arc<DeadLetterStore>,
    gate: Arc<DuplicateGate>,
    metrics: Arc<IngestMetrics>,

    /// Current service status
    status: RwLock<ServiceStatus>,

    /// Latest health report
    report: RwLock<HealthReport>,

    /// Consecutive failure counts per check
    failure_counts: RwLock<HashMap<&'static str, u32>>,
}

impl HealthChecker {
    /// Create a new health checker service
    pub fn new(
        config: HealthConfig,
        breaker: Arc<CircuitBreaker>,
        writer: Arc<BatchingWriter>,
        dlq: Arc<DeadLetterStore>,
        gate: Arc<DuplicateGate>,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        Self {
            config,
            breaker,
            writer,
            dlq,
            gate,
            metrics,
            status: RwLock::new(ServiceStatus::Stopped),
            report: RwLock::new(HealthReport::default()),
            failure_counts: RwLock::new(HashMap::new()),
        }
    }

    /// Get the latest health report
    pub fn report(&self) -> HealthReport {
        self.report.read().clone()
    }

    /// Get the current health status
    pub fn health_status(&self) -> HealthStatus {
        self.report.read().status.clone()
    }

    /// Run all health checks, refresh the gauges and store the report
    pub fn run_health_checks(&self) -> HealthReport {
        let checks = vec![
            self.check_breaker(),
            self.check_buffer(),
            self.check_writer_task(),
            self.check_dead_letters(),
        ];
        self.update_check_counters(&checks);

        let gate = self.gate.stats();
        self.metrics.set_gate(gate.size, gate.evictions);

        let report = HealthReport::from_checks(checks);
        *self.report.write() = report.clone();

        tracing::debug!(status = ?report.status, "Health check completed");
        report
    }

    fn check_breaker(&self) -> CheckResult {
        let stats = self.breaker.stats();
        self.metrics.set_breaker(stats.state, stats.total_trips);
        match stats.state {
            BreakerState::Closed => CheckResult::pass("breaker"),
            BreakerState::HalfOpen => CheckResult::fail("breaker", "probing backend"),
            BreakerState::Open => CheckResult::fail(
                "breaker",
                format!(
                    "open after {} consecutive failures",
                    stats.consecutive_failures
                ),
            ),
        }
    }

    fn check_buffer(&self) -> CheckResult {
        let depth = self.writer.buffer_depth();
        let capacity = self.writer.buffer_capacity().max(1);
        self.metrics.set_buffer_depth(depth);

        let ratio = depth as f64 / capacity as f64;
        if ratio > self.config.buffer_warn_ratio {
            tracing::warn!(depth, capacity, "Writer buffer is filling up");
            CheckResult::fail("buffer", format!("{}/{} records buffered", depth, capacity))
        } else {
            CheckResult::pass("buffer")
        }
    }

    fn check_writer_task(&self) -> CheckResult {
        if self.writer.is_closed() {
            CheckResult::fail("writer", "flush task has stopped")
        } else {
            CheckResult::pass("writer")
        }
    }

    fn check_dead_letters(&self) -> CheckResult {
        let pending = self.dlq.pending_count();
        self.metrics.set_dlq_pending(pending);
        if pending > self.config.max_pending_dead_letters {
            CheckResult::fail("dead_letters", format!("{} entries pending", pending))
        } else {
            CheckResult::pass("dead_letters")
        }
    }

    fn update_check_counters(&self, checks: &[CheckResult]) {
        let mut failures = self.failure_counts.write();
        for check in checks {
            if check.passed {
                failures.remove(check.name);
            } else {
                *failures.entry(check.name).or_insert(0) += 1;
            }
        }
    }

    /// Consecutive failures of one check
    pub fn failure_count(&self, check_name: &str) -> u32 {
        self.failure_counts
            .read()
            .get(check_name)
            .copied()
            .unwrap_or(0)
    }

    /// Check if a specific check has exceeded the failure threshold
    pub fn is_check_failing(&self, check_name: &str) -> bool {
        self.failure_count(check_name) >= self.config.failure_threshold
    }
}

#[async_trait::async_trait]
impl Service for HealthChecker {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError> {
        *self.status.write() = ServiceStatus::Running;
        tracing::info!(
            interval_secs = self.config.check_interval.as_secs(),
            "Health checker started"
        );

        // The first tick completes immediately
        let mut check_interval = interval(self.config.check_interval);

        loop {
            tokio::select! {
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                            tracing::info!("Health checker received shutdown signal");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(missed = n, "Health checker broadcast receiver lagged");
                        }
                    }
                }

                _ = check_interval.tick() => {
                    let report = self.run_health_checks();
                    if !report.status.is_healthy() {
                        tracing::warn!(
                            status = ?report.status,
                            failed = report.failed_checks().len(),
                            "Pipeline health degraded"
                        );
                    }
                }
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        tracing::info!("Health checker stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "health_checker"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}

// ============================================================================
// Tests
// ============================================================================
