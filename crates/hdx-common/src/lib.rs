//! HDX Common Library
//!
//! Shared vocabulary for the health data export preprocessor and for
//! anything that reads its output.
//!
//! - **Error Handling**: [`HdxError`] and the [`Result`] alias
//! - **Logging**: subscriber setup driven by `LOG_*` variables
//! - **Types**: the closed [`MetricKind`] set and each table's columns
//! - **Manifest**: load/save of `manifest.json` and table lookup by metric
//! - **Checksums**: table checksums and row fingerprints
//!
//! # Example
//!
//! ```no_run
//! use hdx_common::{manifest::Manifest, MetricKind, Result};
//! use std::path::Path;
//!
//! fn heart_rate_table(output: &Path) -> Result<()> {
//!     let manifest = Manifest::load(output)?;
//!     if let Some(path) = manifest.table_path(output, MetricKind::HeartRate) {
//!         println!("heart rate rows live in {}", path.display());
//!     }
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod types;

pub use error::{HdxError, Result};
pub use types::MetricKind;
