//! Resilient ingestion core for health-metric payloads
//!
//! Payloads from a mobile health exporter are normalized into canonical
//! records, filtered through a duplicate gate and written in batches to a
//! time-series backend behind a circuit breaker. Anything that cannot be
//! processed lands in a persisted dead-letter store and can be replayed.
//!
//! ```rust,ignore
//! use health_ingest::{config::Settings, pipeline::Pipeline, writer::InfluxBackend};
//!
//! let settings = Settings::load()?;
//! health_ingest::telemetry::init_tracing(&settings.log)?;
//! let backend = Arc::new(InfluxBackend::new(settings.influx_config())?);
//! let pipeline = Pipeline::start(settings.pipeline_config(), backend).await?;
//!
//! let outcome = pipeline.ingest_bytes(body).await;
//! pipeline.shutdown(Duration::from_secs(10)).await?;
//! ```

pub mod breaker;
pub mod config;
pub mod dlq;
pub mod error;
pub mod gate;
pub mod observability;
pub mod pipeline;
pub mod router;
pub mod services;
pub mod telemetry;
pub mod types;
pub mod writer;

mod snapshot;

pub use error::{Error, Result};
pub use pipeline::{IngestOutcome, Pipeline};
pub use types::{CanonicalRecord, Fingerprint, MetricFamily, TimeRange, WriteKey};
