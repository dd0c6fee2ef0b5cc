//! Error types for chute-clickhouse
//!
//! Every failure is surfaced to the owning worker. The sink never retries a
//! network operation and never logs-and-continues on a data-integrity error;
//! the only soft failure (a non-deduplicating table engine) is reported by the
//! reconciler as a warning, not as an error.

use arrow_schema::{ArrowError, DataType};
use thiserror::Error;

/// Result type alias for sink operations
pub type Result<T> = std::result::Result<T, SinkError>;

/// Errors raised while setting up the sink or flushing record blocks
#[derive(Debug, Error)]
pub enum SinkError {
    /// Missing or invalid configuration (fatal at construction)
    #[error("configuration error: {0}")]
    Config(String),

    /// Network failure talking to ClickHouse
    #[error("connection error: {0}")]
    Connection(String),

    /// Credentials rejected by ClickHouse
    #[error("authentication error: {0}")]
    Auth(String),

    /// Destination schema problem, or record blocks that cannot be concatenated
    #[error("schema error: {0}")]
    Schema(String),

    /// Batch records do not match the declared record schema
    #[error("conversion error: {0}")]
    Conversion(#[from] ConversionError),

    /// ClickHouse rejected the columnar insert
    #[error("delivery error: {0}")]
    Delivery(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SinkError {
    /// Check if an external supervisor may reasonably retry after this error.
    ///
    /// The sink itself never acts on this.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Errors that mean a batch could not be written as-is.
    pub fn is_data_integrity(&self) -> bool {
        matches!(
            self,
            Self::Conversion(_) | Self::Schema(_) | Self::Delivery(_)
        )
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a schema error
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a delivery error
    pub fn delivery(msg: impl Into<String>) -> Self {
        Self::Delivery(msg.into())
    }
}

/// Row-to-column conversion failures.
///
/// Rows are 0-based positions inside the batch being converted.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("row {row}: expected {expected} values, found {found}")]
    Arity {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("row {row}, field '{field}': cannot store {found} in a {expected} column")]
    Type {
        row: usize,
        field: String,
        expected: DataType,
        found: &'static str,
    },

    #[error("row {row}, field '{field}': value {value} out of range for the column type")]
    Overflow {
        row: usize,
        field: String,
        value: String,
    },

    #[error("row {row}, field '{field}': null in a non-nullable column")]
    Null { row: usize, field: String },

    #[error("field '{field}': unsupported column type {data_type}")]
    UnsupportedType { field: String, data_type: DataType },

    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),
}

/// Classify a `clickhouse::error::Error` into a typed `SinkError`.
pub(crate) fn classify_clickhouse_error(err: &clickhouse::error::Error) -> SinkError {
    classify_message(err.to_string())
}

/// Whether a ClickHouse failure message reports rejected credentials.
pub(crate) fn is_auth_message(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    lower.contains("authentication")
        || lower.contains("access denied")
        || lower.contains("wrong password")
}

/// Map a metadata or DDL failure message onto the error taxonomy.
///
/// Inserts do not go through here: a rejected insert is always a delivery
/// failure, whatever the server blames.
pub(crate) fn classify_message(msg: String) -> SinkError {
    let lower = msg.to_lowercase();

    if is_auth_message(&msg) {
        SinkError::Auth(msg)
    } else if lower.contains("no such column")
        || lower.contains("unknown table")
        || lower.contains("type mismatch")
        || lower.contains("expected column")
        || lower.contains("cannot convert")
        || lower.contains("cannot parse")
    {
        SinkError::Schema(msg)
    } else if lower.contains("connection")
        || lower.contains("network")
        || lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("broken pipe")
        || lower.contains("reset by peer")
        || lower.contains("service_unavailable")
    {
        SinkError::Connection(msg)
    } else {
        SinkError::Delivery(msg)
    }
}
