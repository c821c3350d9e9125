//! HDX Ingest Library
//!
//! Turns a health data export (one large XML document plus optional GPX
//! route files) into one CSV table per metric and a `manifest.json`
//! describing them.
//!
//! # Pipeline
//!
//! - [`parser`]: streams `Record` and `Workout` elements out of the export
//! - [`normalize`]: canonical device names and reference-zone timestamps
//! - [`router`]: maps type tags to metrics and extracts their fields
//! - [`writer`]: batched, deduplicating appends per metric
//! - [`store`]: the tables themselves
//! - [`manifest`]: one scan per finalized table
//!
//! # Example
//!
//! ```no_run
//! use hdx_ingest::{Pipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::new("apple_health_export/export.xml", "processed_data")
//!         .with_reference_timezone("Europe/Berlin");
//!     let report = Pipeline::new(config)?.run().await?;
//!     println!("{}", report.summary.to_table());
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod error;
pub mod manifest;
pub mod normalize;
pub mod parser;
pub mod pipeline;
pub mod router;
pub mod routes;
pub mod store;
pub mod summary;
pub mod writer;

pub use config::{DedupScope, DstPolicy, PipelineConfig};
pub use error::{ParseError, RecordError};
pub use pipeline::{preprocess, Pipeline, RunReport};
pub use summary::{MetricStats, RunSummary};
