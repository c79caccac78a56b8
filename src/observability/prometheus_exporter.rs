//! Prometheus metrics exporter for the ingestion pipeline
//!
//! Formats the scalar snapshot by hand and appends the labeled series from
//! the metrics registry encoded with the text encoder.

use std::fmt::Write;
use std::sync::Arc;

use prometheus::{Encoder, TextEncoder};

use super::metrics::{IngestMetrics, MetricsSnapshot};

/// Configuration for Prometheus exporter
#[derive(Debug, Clone)]
pub struct PrometheusConfig {
    /// Prefix for the scalar metric names (default: "health_ingest")
    pub metric_prefix: String,
    /// Append the registry's labeled series
    pub include_labeled: bool,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            metric_prefix: "health_ingest".to_string(),
            include_labeled: true,
        }
    }
}

/// Prometheus metrics exporter
pub struct PrometheusExporter {
    config: PrometheusConfig,
    metrics: Arc<IngestMetrics>,
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter
    pub fn new(config: PrometheusConfig, metrics: Arc<IngestMetrics>) -> Self {
        Self { config, metrics }
    }

    /// Export metrics in Prometheus text exposition format
    pub fn export(&self) -> String {
        let mut output = String::new();
        let snapshot = self.metrics.snapshot();
        self.export_scalars(&mut output, &self.config.metric_prefix, &snapshot);

        if self.config.include_labeled {
            match self.export_registry() {
                Ok(labeled) => output.push_str(&labeled),
                Err(e) => tracing::warn!(error = %e, "Failed to encode labeled metrics"),
            }
        }
        output
    }

    /// Export as an HTTP body with its content type
    pub fn export_http(&self) -> (String, &'static str) {
        (self.export(), "text/plain; version=0.0.4; charset=utf-8")
    }

    fn export_scalars(&self, output: &mut String, prefix: &str, s: &MetricsSnapshot) {
        let counters: [(&str, &str, u64); 10] = [
            ("payloads_received_total", "Payloads handed to the pipeline", s.payloads_received),
            ("payloads_rejected_total", "Payloads rejected as a whole", s.payloads_rejected),
            ("payloads_duplicate_total", "Payloads made only of duplicates", s.payloads_duplicate),
            ("records_routed_total", "Records produced by the router", s.records_routed),
            ("route_failures_total", "Items that failed validation or transformation", s.route_failures),
            ("duplicates_total", "Records suppressed by the duplicate gate", s.duplicates),
            ("points_written_total", "Points accepted by the storage backend", s.points_written),
            ("batches_written_total", "Batches accepted by the storage backend", s.batches_written),
            ("write_errors_total", "Batches that failed every write attempt", s.write_errors),
            ("write_retries_total", "Write retry attempts", s.write_retries),
        ];
        for (name, help, value) in counters {
            write_metric(output, prefix, name, help, "counter", value);
        }

        let gauges: [(&str, &str, i64); 7] = [
            ("buffer_depth", "Records waiting in the writer buffer", s.buffer_depth as i64),
            (
                "circuit_breaker_state",
                "Circuit breaker state (0 closed, 1 half-open, 2 open)",
                s.breaker_state,
            ),
            ("circuit_breaker_trips", "Times the circuit breaker opened", s.breaker_trips as i64),
            ("dedup_cache_size", "Live duplicate gate entries", s.gate_size as i64),
            ("dedup_evictions", "Duplicate gate LRU evictions", s.gate_evictions as i64),
            ("dlq_pending", "Pending dead-letter entries", s.dlq_pending as i64),
            ("uptime_seconds", "Time since start in seconds", s.uptime.as_secs() as i64),
        ];
        for (name, help, value) in gauges {
            write_metric(output, prefix, name, help, "gauge", value);
        }

        let _ = writeln!(
            output,
            "# HELP {}_write_latency_avg_microseconds Average write latency in microseconds",
            prefix
        );
        let _ = writeln!(output, "# TYPE {}_write_latency_avg_microseconds gauge", prefix);
        let _ = writeln!(
            output,
            "{}_write_latency_avg_microseconds {}\n",
            prefix, s.avg_write_latency_us
        );

        let _ = writeln!(
            output,
            "# HELP {}_write_success_rate Write success rate (0.0-1.0)",
            prefix
        );
        let _ = writeln!(output, "# TYPE {}_write_success_rate gauge", prefix);
        let _ = writeln!(
            output,
            "{}_write_success_rate {:.4}\n",
            prefix,
            s.write_success_rate()
        );
    }

    fn export_registry(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let families = self.metrics.registry().gather();
        let mut buffer = vec![];

        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| format!("Failed to encode metrics: {}", e))?;

        String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
    }
}

fn write_metric(
    output: &mut String,
    prefix: &str,
    name: &str,
    help: &str,
    kind: &str,
    value: impl std::fmt::Display,
) {
    let _ = writeln!(output, "# HELP {}_{} {}", prefix, name, help);
    let _ = writeln!(output, "# TYPE {}_{} {}", prefix, name, kind);
    let _ = writeln!(output, "{}_{} {}\n", prefix, name, value);
}
