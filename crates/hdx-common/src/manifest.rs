//! The processing manifest and table lookup helpers
//!
//! A run writes one table per metric into the output directory plus a
//! `manifest.json` describing them. Consumers should go through
//! [`Manifest::load`] and [`Manifest::table_path`] rather than building
//! file names themselves: a metric missing from the manifest has not been
//! processed, even if a stale table file is lying around.

use crate::checksum::verify_file_checksum;
use crate::error::{HdxError, Result};
use crate::types::MetricKind;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const SCHEMA_VERSION: u32 = 1;
pub const TABLE_EXTENSION: &str = "csv";

/// Per-metric entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub row_count: u64,
    pub earliest_timestamp: Option<NaiveDateTime>,
    pub latest_timestamp: Option<NaiveDateTime>,
    pub distinct_sources: BTreeSet<String>,
    pub columns: Vec<String>,
    pub sha256: String,
}

/// Description of one completed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub reference_timezone: String,
    /// File name of the export the tables were produced from
    pub input: Option<String>,
    /// Records seen per raw type tag, routed or not
    #[serde(default)]
    pub raw_type_counts: BTreeMap<String, u64>,
    pub metrics: BTreeMap<MetricKind, MetricSummary>,
}

impl Manifest {
    pub fn new(reference_timezone: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            generated_at: Utc::now(),
            reference_timezone: reference_timezone.into(),
            input: None,
            raw_type_counts: BTreeMap::new(),
            metrics: BTreeMap::new(),
        }
    }

    /// Location of the manifest inside an output directory
    pub fn path(output_dir: &Path) -> PathBuf {
        output_dir.join(MANIFEST_FILE)
    }

    /// Load the manifest of an output directory
    pub fn load(output_dir: &Path) -> Result<Self> {
        let path = Self::path(output_dir);
        if !path.exists() {
            return Err(HdxError::ManifestNotFound(output_dir.display().to_string()));
        }

        let content = std::fs::read_to_string(&path)?;
        let manifest: Manifest = serde_json::from_str(&content)?;
        if manifest.schema_version != SCHEMA_VERSION {
            return Err(HdxError::config(format!(
                "Unsupported manifest schema version {} (expected {})",
                manifest.schema_version, SCHEMA_VERSION
            )));
        }
        Ok(manifest)
    }

    /// Write the manifest through a temporary file and a rename
    pub fn save(&self, output_dir: &Path) -> Result<()> {
        let path = Self::path(output_dir);
        let tmp = path.with_extension("json.tmp");

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn get(&self, metric: MetricKind) -> Option<&MetricSummary> {
        self.metrics.get(&metric)
    }

    /// Look an entry up by table name
    pub fn get_by_name(&self, name: &str) -> Result<Option<&MetricSummary>> {
        let metric: MetricKind = name.parse()?;
        Ok(self.get(metric))
    }

    pub fn is_processed(&self, metric: MetricKind) -> bool {
        self.metrics.contains_key(&metric)
    }

    /// Path of a processed metric's table, `None` when not processed
    pub fn table_path(&self, output_dir: &Path, metric: MetricKind) -> Option<PathBuf> {
        self.is_processed(metric)
            .then(|| table_path(output_dir, metric))
    }

    /// Check a table file against the checksum recorded for it
    pub fn verify_table(&self, output_dir: &Path, metric: MetricKind) -> Result<()> {
        let summary = self
            .get(metric)
            .ok_or_else(|| HdxError::UnknownMetric(metric.to_string()))?;
        verify_file_checksum(table_path(output_dir, metric), &summary.sha256)
    }
}

/// File location of a metric table, whether or not it has been produced
pub fn table_path(output_dir: &Path, metric: MetricKind) -> PathBuf {
    output_dir.join(format!("{}.{}", metric.as_str(), TABLE_EXTENSION))
}
