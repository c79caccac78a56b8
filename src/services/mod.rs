//! Background Services Module
//!
//! Long-running tasks that keep the pipeline's durable state and gauges
//! current. Each one stops on the manager's broadcast shutdown signal.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌──────────────────┐
//! │ GateCheckpointer │────▶│ gate checkpoint  │
//! └──────────────────┘     └──────────────────┘
//! ┌──────────────────┐     ┌──────────────────┐
//! │ DLQ Maintenance  │────▶│ dead-letter snap │
//! └──────────────────┘     └──────────────────┘
//! ┌──────────────────┐     ┌──────────────────┐
//! │  HealthChecker   │────▶│  IngestMetrics   │
//! └──────────────────┘     └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = ServiceManager::new();
//! manager.register(Arc::new(GateCheckpointer::new(gate, dlq, metrics)));
//! manager.start_all()?;
//!
//! // Graceful shutdown
//! manager.shutdown(Duration::from_secs(5)).await;
//! ```

pub mod dlq_maintenance;
pub mod framework;
pub mod gate_checkpointer;
pub mod health;

pub use dlq_maintenance::{DeadLetterMaintenance, MaintenanceStats};
pub use framework::{Service, ServiceError, ServiceManager, ServiceStatus};
pub use gate_checkpointer::{CheckpointerStats, GateCheckpointer};
pub use health::{CheckResult, HealthChecker, HealthConfig, HealthReport, HealthStatus};
