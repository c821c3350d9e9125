//! Per-record errors
//!
//! These never abort a run. The pipeline counts them per metric (or per
//! tag when no metric can be attributed) and reports them in the summary.

use thiserror::Error;

/// Which normalization step could not decide on a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmbiguityKind {
    Source,
    Timestamp,
}

impl std::fmt::Display for AmbiguityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AmbiguityKind::Source => f.write_str("source"),
            AmbiguityKind::Timestamp => f.write_str("timestamp"),
        }
    }
}

/// A single record was skipped
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("Malformed element at byte {position}: {message}")]
    Malformed { position: u64, message: String },

    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Invalid value for '{field}': {value:?}")]
    InvalidValue { field: &'static str, value: String },

    #[error("Invalid timestamp: {0:?}")]
    InvalidTimestamp(String),

    #[error("No routing rule for type '{0}'")]
    Unroutable(String),

    #[error("Ambiguous {kind}: {detail}")]
    Ambiguity { kind: AmbiguityKind, detail: String },
}

impl RecordError {
    pub fn invalid_value(field: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            value: value.into(),
        }
    }

    pub fn ambiguity(kind: AmbiguityKind, detail: impl Into<String>) -> Self {
        Self::Ambiguity {
            kind,
            detail: detail.into(),
        }
    }
}

/// Item error of the record stream
#[derive(Error, Debug)]
pub enum ParseError {
    /// The element was skipped; the scan goes on
    #[error(transparent)]
    Record(#[from] RecordError),

    /// The scan cannot go on; no more items follow
    #[error("Structural parse error at byte {position}: {message}")]
    Structural { position: u64, message: String },
}

impl ParseError {
    pub fn structural(position: u64, message: impl Into<String>) -> Self {
        Self::Structural {
            position,
            message: message.into(),
        }
    }
}
