//! Error types for HDX

use thiserror::Error;

/// Result type alias for HDX operations
pub type Result<T> = std::result::Result<T, HdxError>;

/// Main error type for HDX
///
/// Per-record problems are not represented here: they are recoverable and
/// are counted by the pipeline instead of being raised.
#[derive(Error, Debug)]
pub enum HdxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The export cannot be scanned any further (non-XML, truncated, ...)
    #[error("Structural parse error at byte {position}: {message}")]
    StructuralParse { position: u64, message: String },

    /// A flush to a metric table failed; only that metric is affected
    #[error("Persistence error for metric '{metric}': {message}")]
    Persistence { metric: String, message: String },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    #[error("Manifest not found in {0}. Run preprocessing first.")]
    ManifestNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Run cancelled before completion")]
    Cancelled,

    /// A worker task panicked or was aborted
    #[error("Task failed: {0}")]
    Task(String),
}

impl HdxError {
    /// Create a structural parse error
    pub fn structural(position: u64, message: impl Into<String>) -> Self {
        Self::StructuralParse {
            position,
            message: message.into(),
        }
    }

    /// Create a persistence error for a metric table
    pub fn persistence(metric: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Persistence {
            metric: metric.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
