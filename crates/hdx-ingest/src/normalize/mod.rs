//! Field normalizers applied before routing

pub mod source;
pub mod timestamp;

pub use source::{SourceNormalizer, SourceRule};
pub use timestamp::{NormalizedTimestamp, TimestampNormalizer};
