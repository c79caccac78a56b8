//! InfluxDB 2.x backend
//!
//! Batches are posted to `/api/v2/write` as line protocol with nanosecond
//! precision. A 2xx response accepts the whole batch; any other status
//! rejects it, and the status decides whether the writer retries.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder};
use tracing::debug;

use super::backend::{encode_line_protocol, BucketTarget, StorageBackend};
use crate::error::BackendError;
use crate::types::CanonicalRecord;

/// Longest backend error message kept in a dead-letter entry
const MAX_MESSAGE_LEN: usize = 512;

/// Connection settings
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    /// Base URL, e.g. `http://localhost:8086`
    pub url: String,
    /// API token; requests are unauthenticated without one
    pub token: Option<String>,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".to_string(),
            token: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Backend writing to an InfluxDB 2.x server over HTTP
#[derive(Debug, Clone)]
pub struct InfluxBackend {
    client: Client,
    config: InfluxConfig,
}

impl InfluxBackend {
    /// Build the HTTP client; no request is made
    pub fn new(config: InfluxConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BackendError::Connection(format!("http client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.url.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => request.header(AUTHORIZATION, format!("Token {}", token)),
            None => request,
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Timeout(self.config.request_timeout)
        } else {
            BackendError::Connection(err.to_string())
        }
    }
}

#[async_trait]
impl StorageBackend for InfluxBackend {
    fn name(&self) -> &str {
        "influxdb"
    }

    async fn write(&self, target: &BucketTarget, records: &[CanonicalRecord]) -> Result<(), BackendError> {
        let body = encode_line_protocol(records);
        let request = self
            .client
            .post(self.endpoint("api/v2/write"))
            .query(&[
                ("org", target.org.as_str()),
                ("bucket", target.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body);

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status.is_success() {
            debug!(records = records.len(), bucket = %target.bucket, "Batch accepted by InfluxDB");
            return Ok(());
        }

        let mut message = response.text().await.unwrap_or_default();
        if message.len() > MAX_MESSAGE_LEN {
            let mut cut = MAX_MESSAGE_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        Err(BackendError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let response = self
            .authorize(self.client.get(self.endpoint("ping")))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(BackendError::Rejected {
                status: status.as_u16(),
                message: "ping failed".to_string(),
            })
        }
    }
}
