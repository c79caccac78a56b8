//! Observability for the ingestion pipeline
//!
//! ```text
//!   router / gate / writer / dead-letter store
//!                  │
//!        ┌─────────▼─────────┐
//!        │   IngestMetrics   │  atomics + labeled registry
//!        └─────────┬─────────┘
//!                  │
//!        ┌─────────▼─────────┐
//!        │ PrometheusExporter│  text exposition
//!        └───────────────────┘
//! ```

pub mod metrics;
pub mod prometheus_exporter;

pub use metrics::{IngestMetrics, MetricsSnapshot};
pub use prometheus_exporter::{PrometheusConfig, PrometheusExporter};
