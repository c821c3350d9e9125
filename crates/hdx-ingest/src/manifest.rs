//! Manifest construction from finalized tables

use crate::store::TableStore;
use chrono::NaiveDateTime;
use hdx_common::manifest::{Manifest, MetricSummary};
use hdx_common::types::TIMESTAMP_FORMAT;
use hdx_common::{HdxError, MetricKind, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error};

const TIMESTAMP_COLUMN: usize = 0;
const SOURCE_COLUMN: usize = 4;

pub struct ManifestBuilder<'a> {
    store: &'a dyn TableStore,
    manifest: Manifest,
}

impl<'a> ManifestBuilder<'a> {
    pub fn new(store: &'a dyn TableStore, reference_timezone: &str) -> Self {
        Self {
            store,
            manifest: Manifest::new(reference_timezone),
        }
    }

    pub fn input(mut self, name: Option<String>) -> Self {
        self.manifest.input = name;
        self
    }

    pub fn raw_type_counts(mut self, counts: BTreeMap<String, u64>) -> Self {
        self.manifest.raw_type_counts = counts;
        self
    }

    /// Scan each finalized table once.
    ///
    /// Tables that cannot be read are left out and returned with the reason.
    pub fn build(mut self, metrics: &[MetricKind]) -> (Manifest, BTreeMap<MetricKind, String>) {
        let mut failures = BTreeMap::new();
        for &metric in metrics {
            match summarize(self.store, metric) {
                Ok(summary) => {
                    debug!(metric = %metric, rows = summary.row_count, "Summarized table");
                    self.manifest.metrics.insert(metric, summary);
                },
                Err(e) => {
                    error!(metric = %metric, error = %e, "Failed to summarize table");
                    failures.insert(metric, e.to_string());
                },
            }
        }
        (self.manifest, failures)
    }
}

fn summarize(store: &dyn TableStore, metric: MetricKind) -> Result<MetricSummary> {
    let mut row_count = 0u64;
    let mut earliest: Option<NaiveDateTime> = None;
    let mut latest: Option<NaiveDateTime> = None;
    let mut sources = BTreeSet::new();

    let sha256 = store.scan(metric, &mut |row| {
        row_count += 1;

        let ts = row
            .get(TIMESTAMP_COLUMN)
            .and_then(|s| NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).ok())
            .ok_or_else(|| {
                HdxError::persistence(
                    metric.as_str(),
                    format!("row {row_count} has no valid timestamp"),
                )
            })?;
        earliest = Some(earliest.map_or(ts, |e| e.min(ts)));
        latest = Some(latest.map_or(ts, |l| l.max(ts)));

        if let Some(source) = row.into_iter().nth(SOURCE_COLUMN) {
            sources.insert(source);
        }
        Ok(())
    })?;

    Ok(MetricSummary {
        row_count,
        earliest_timestamp: earliest,
        latest_timestamp: latest,
        distinct_sources: sources,
        columns: metric.columns().into_iter().map(String::from).collect(),
        sha256,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CsvTableStore, Row};
    use hdx_common::checksum::compute_file_checksum;
    use tempfile::TempDir;

    fn row(values: &[&str]) -> Row {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_build_from_tables() {
        let dir = TempDir::new().unwrap();
        let store = CsvTableStore::new(dir.path());

        let mut table = store.create(MetricKind::HeartRate).unwrap();
        table
            .append(&[
                row(&["2023-01-02T10:00:00", "", "75", "count/min", "iPhone", "iphone"]),
                row(&["2023-01-01T18:20:00", "", "72", "count/min", "Apple Watch", "Watch"]),
                row(&["2023-01-01T19:00:00", "", "70", "count/min", "iPhone", "iPhone"]),
            ])
            .unwrap();
        table.finalize().unwrap();
        store.create(MetricKind::Weight).unwrap().finalize().unwrap();

        let (manifest, failures) = ManifestBuilder::new(&store, "UTC")
            .input(Some("export.xml".to_string()))
            .build(&[MetricKind::HeartRate, MetricKind::Weight, MetricKind::StepCount]);

        let hr = manifest.get(MetricKind::HeartRate).unwrap();
        assert_eq!(hr.row_count, 3);
        assert_eq!(
            hr.earliest_timestamp.unwrap().format(TIMESTAMP_FORMAT).to_string(),
            "2023-01-01T18:20:00"
        );
        assert_eq!(
            hr.latest_timestamp.unwrap().format(TIMESTAMP_FORMAT).to_string(),
            "2023-01-02T10:00:00"
        );
        assert_eq!(hr.distinct_sources.len(), 2);
        // Checksum taken during the row scan matches a separate read
        assert_eq!(
            hr.sha256,
            compute_file_checksum(dir.path().join("heart_rate.csv")).unwrap()
        );

        let weight = manifest.get(MetricKind::Weight).unwrap();
        assert_eq!(weight.row_count, 0);
        assert_eq!(weight.earliest_timestamp, None);

        // Never finalized, so it cannot be listed
        assert!(!manifest.is_processed(MetricKind::StepCount));
        assert!(failures.contains_key(&MetricKind::StepCount));
    }
}
