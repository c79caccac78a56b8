//! Error types for the ingestion core
//!
//! Every failure a component can produce maps to exactly one
//! [`DeadLetterCategory`] through its `category()` method, so a failure that
//! reaches the dead-letter store is always classified.

use thiserror::Error;

use crate::dlq::DeadLetterCategory;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    /// Payload schema error
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Item transformation error
    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    /// Storage backend error
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Persistence (checkpoint / snapshot) error
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The pipeline or one of its tasks has shut down
    #[error("Shut down: {0}")]
    Shutdown(String),
}

impl Error {
    /// Dead-letter category for this error
    pub fn category(&self) -> DeadLetterCategory {
        match self {
            Error::Schema(e) => e.category(),
            Error::Transform(e) => e.category(),
            Error::Backend(_) | Error::Shutdown(_) => DeadLetterCategory::WriteError,
            Error::Serialization(_) => DeadLetterCategory::JsonParseError,
            Error::Persistence(_)
            | Error::Configuration(_)
            | Error::Io(_)
            | Error::Metrics(_) => {
                DeadLetterCategory::UnknownError
            }
        }
    }
}

/// Payload-level schema errors, each naming the offending field
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    /// The payload is not a shape the router recognizes
    #[error("Unrecognized payload shape at '{field}': {reason}")]
    UnrecognizedShape {
        /// Offending field path
        field: String,
        /// Human readable reason
        reason: String,
    },

    /// A required field is missing or null
    #[error("Missing required field '{field}'")]
    MissingField {
        /// Offending field path
        field: String,
    },

    /// A field is present but has the wrong type or an invalid value
    #[error("Invalid field '{field}': {reason}")]
    InvalidField {
        /// Offending field path
        field: String,
        /// Human readable reason
        reason: String,
    },
}

impl SchemaError {
    /// Name of the offending field
    pub fn field(&self) -> &str {
        match self {
            SchemaError::UnrecognizedShape { field, .. }
            | SchemaError::MissingField { field }
            | SchemaError::InvalidField { field, .. } => field,
        }
    }

    /// Dead-letter category for this error
    pub fn category(&self) -> DeadLetterCategory {
        match self {
            SchemaError::UnrecognizedShape { .. } => DeadLetterCategory::UnknownError,
            SchemaError::MissingField { .. } | SchemaError::InvalidField { .. } => {
                DeadLetterCategory::ValidationError
            }
        }
    }
}

/// Errors raised by a family handler while building a canonical record
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    /// The handler matched the metric name but cannot handle this item;
    /// dispatch continues with the next matching handler
    #[error("Handler '{handler}' declined item: {reason}")]
    Declined {
        /// Handler that declined
        handler: &'static str,
        /// Why it declined
        reason: String,
    },

    /// The transform produced no fields at all
    #[error("No fields produced for metric '{metric}'")]
    NoFields {
        /// Metric name
        metric: String,
    },

    /// A converted value is NaN or infinite
    #[error("Non-finite value for field '{field}'")]
    NonFinite {
        /// Field name
        field: String,
    },
}

impl TransformError {
    /// Dead-letter category for this error
    pub fn category(&self) -> DeadLetterCategory {
        DeadLetterCategory::TransformError
    }
}

/// Storage backend errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// Backend could not be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// Backend rejected the request
    #[error("Request rejected with status {status}: {message}")]
    Rejected {
        /// Backend status code
        status: u16,
        /// Backend message
        message: String,
    },

    /// Write did not complete in time
    #[error("Write timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Breaker denied the call; no request was made
    #[error("Circuit breaker '{0}' is open")]
    CircuitOpen(String),
}

impl BackendError {
    /// Whether retrying could succeed; authorization failures never will
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Rejected { status, .. } => !matches!(status, 400 | 401 | 403),
            BackendError::CircuitOpen(_) => false,
            BackendError::Connection(_) | BackendError::Timeout(_) => true,
        }
    }

    /// Dead-letter category for this error
    pub fn category(&self) -> DeadLetterCategory {
        DeadLetterCategory::WriteError
    }
}

/// Checkpoint and snapshot persistence errors
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot could not be encoded or decoded
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Snapshot checksum mismatch
    #[error("Corrupted snapshot {path}: expected checksum {expected:016x}, got {actual:016x}")]
    Corrupted {
        /// Snapshot path
        path: String,
        /// Recorded checksum
        expected: u64,
        /// Computed checksum
        actual: u64,
    },

    /// Snapshot format version is newer than this build understands
    #[error("Unsupported snapshot version: {0}")]
    UnsupportedVersion(u16),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
