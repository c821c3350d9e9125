//! Run summary

use crate::error::{AmbiguityKind, RecordError};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Table};
use hdx_common::MetricKind;
use std::collections::BTreeMap;
use std::time::Duration;

/// Counters of one metric
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricStats {
    /// Records classified into the metric
    pub routed: u64,
    /// Rows persisted to the table
    pub written: u64,
    /// Records skipped for a missing or invalid field
    pub skipped: u64,
    /// Exact duplicates not written again
    pub deduplicated: u64,
    /// Rows lost to a persistence failure
    pub dropped: u64,
    pub source_ambiguities: u64,
    pub timestamp_ambiguities: u64,
    /// Rows whose timestamp had no usable offset
    pub timestamp_fallbacks: u64,
}

impl MetricStats {
    /// Count a record error against this metric
    pub fn record_error(&mut self, err: &RecordError) {
        match err {
            RecordError::Ambiguity {
                kind: AmbiguityKind::Source,
                ..
            } => self.source_ambiguities += 1,
            RecordError::Ambiguity {
                kind: AmbiguityKind::Timestamp,
                ..
            } => self.timestamp_ambiguities += 1,
            _ => self.skipped += 1,
        }
    }

    /// Every routed record ends up in exactly one bucket
    pub fn is_balanced(&self) -> bool {
        self.routed
            == self.written
                + self.skipped
                + self.deduplicated
                + self.dropped
                + self.source_ambiguities
                + self.timestamp_ambiguities
    }
}

/// Outcome of one preprocessing run
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Collected elements, malformed ones included
    pub records_seen: u64,
    /// Elements skipped before routing
    pub malformed: u64,
    /// Records of metrics disabled by configuration
    pub excluded: u64,
    /// Records without a routing rule, by type tag
    pub unroutable: BTreeMap<String, u64>,
    /// Records per raw type tag, routed or not
    pub raw_type_counts: BTreeMap<String, u64>,
    pub metrics: BTreeMap<MetricKind, MetricStats>,
    /// Metrics whose table could not be completed
    pub failed_metrics: BTreeMap<MetricKind, String>,
    /// Nested elements dropped by the per-record cap
    pub dropped_children: u64,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn metric_mut(&mut self, metric: MetricKind) -> &mut MetricStats {
        self.metrics.entry(metric).or_default()
    }

    pub fn count_tag(&mut self, tag: &str) {
        *self.raw_type_counts.entry(tag.to_string()).or_default() += 1;
    }

    pub fn count_unroutable(&mut self, tag: &str) {
        *self.unroutable.entry(tag.to_string()).or_default() += 1;
    }

    pub fn total_written(&self) -> u64 {
        self.metrics.values().map(|s| s.written).sum()
    }

    pub fn total_unroutable(&self) -> u64 {
        self.unroutable.values().sum()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed_metrics.is_empty()
    }

    /// Per-metric table for terminal output
    pub fn to_table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec![
                "Metric",
                "Routed",
                "Written",
                "Skipped",
                "Dedup",
                "Dropped",
                "Src ambig.",
                "TS ambig.",
                "TS fallback",
                "Status",
            ]);

        for (metric, stats) in &self.metrics {
            let status = match self.failed_metrics.get(metric) {
                Some(_) => "FAILED",
                None => "ok",
            };
            table.add_row(vec![
                Cell::new(metric.as_str()),
                Cell::new(stats.routed),
                Cell::new(stats.written),
                Cell::new(stats.skipped),
                Cell::new(stats.deduplicated),
                Cell::new(stats.dropped),
                Cell::new(stats.source_ambiguities),
                Cell::new(stats.timestamp_ambiguities),
                Cell::new(stats.timestamp_fallbacks),
                Cell::new(status),
            ]);
        }
        table
    }

    /// Unroutable tags, most frequent first
    pub fn unroutable_table(&self) -> Table {
        let mut tags: Vec<(&String, &u64)> = self.unroutable.iter().collect();
        tags.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec!["Unroutable type", "Records"]);
        for (tag, count) in tags {
            table.add_row(vec![Cell::new(tag), Cell::new(count)]);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_error_buckets() {
        let mut stats = MetricStats::default();
        stats.record_error(&RecordError::MissingField("value"));
        stats.record_error(&RecordError::ambiguity(AmbiguityKind::Source, "empty"));
        stats.record_error(&RecordError::ambiguity(AmbiguityKind::Timestamp, "gap"));
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.source_ambiguities, 1);
        assert_eq!(stats.timestamp_ambiguities, 1);

        stats.routed = 4;
        stats.written = 1;
        assert!(stats.is_balanced());
    }

    #[test]
    fn test_totals_and_tables() {
        let mut summary = RunSummary::default();
        summary.metric_mut(MetricKind::HeartRate).written = 2;
        summary.metric_mut(MetricKind::HeartRate).written += 1;
        summary.count_unroutable("HKQuantityTypeIdentifierMood");
        summary.count_unroutable("HKQuantityTypeIdentifierMood");
        assert!(!summary.has_failures());
        summary
            .failed_metrics
            .insert(MetricKind::Weight, "disk full".to_string());

        assert_eq!(summary.total_written(), 3);
        assert_eq!(summary.total_unroutable(), 2);
        assert!(summary.has_failures());

        let rendered = summary.to_table().to_string();
        assert!(rendered.contains("heart_rate"));
        assert!(summary.unroutable_table().to_string().contains("Mood"));
    }
}
