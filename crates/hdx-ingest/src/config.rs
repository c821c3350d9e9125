//! Pipeline configuration
//!
//! Sources are layered, later ones winning: built-in defaults, an optional
//! TOML file, `HDX_*` environment variables, then command-line flags.

use crate::normalize::source::{SourceNormalizer, SourceRule};
use crate::normalize::timestamp::TimestampNormalizer;
use chrono_tz::Tz;
use hdx_common::{HdxError, MetricKind, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Resolution of local times that are ambiguous or skipped by a DST change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DstPolicy {
    /// Earlier of two instants; gaps move forward one hour
    #[default]
    Earliest,
    /// Later of two instants; gaps move forward one hour
    Latest,
    /// Both cases skip the record as a timestamp ambiguity
    Reject,
}

impl std::str::FromStr for DstPolicy {
    type Err = HdxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "earliest" => Ok(DstPolicy::Earliest),
            "latest" => Ok(DstPolicy::Latest),
            "reject" => Ok(DstPolicy::Reject),
            other => Err(HdxError::config(format!(
                "Invalid DST policy '{other}' (expected earliest, latest or reject)"
            ))),
        }
    }
}

/// How far back exact duplicates are detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupScope {
    /// Everything written to the table during this run
    #[default]
    Table,
    /// Only the rows buffered for the current flush
    Batch,
}

impl std::str::FromStr for DedupScope {
    type Err = HdxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "table" => Ok(DedupScope::Table),
            "batch" => Ok(DedupScope::Batch),
            other => Err(HdxError::config(format!(
                "Invalid dedup scope '{other}' (expected table or batch)"
            ))),
        }
    }
}

/// Everything a preprocessing run needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// The export document
    pub input_path: PathBuf,

    /// Directory receiving the tables and the manifest
    pub output_dir: PathBuf,

    /// IANA name of the timezone all timestamps are rendered in
    pub reference_timezone: String,

    /// Rows buffered per metric before a flush
    pub batch_size: usize,

    /// Only these metrics are produced (empty = all)
    pub include_metrics: Vec<MetricKind>,

    /// Never produced, even if included
    pub exclude_metrics: Vec<MetricKind>,

    /// Source rules checked ahead of the built-in ones
    pub source_rules: Vec<SourceRule>,

    /// Use `source_rules` alone
    pub replace_default_source_rules: bool,

    pub dst_policy: DstPolicy,
    pub dedup_scope: DedupScope,

    /// One writer task per metric instead of a single loop
    pub parallel: bool,

    /// Bounded capacity of each per-metric channel in parallel mode
    pub channel_capacity: usize,

    /// Read referenced GPX files to fill the workout route columns
    pub summarize_routes: bool,

    /// Stop after this many records
    pub parse_limit: Option<usize>,

    pub show_progress: bool,
}

fn default_batch_size() -> usize {
    1000
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_path: PathBuf::from("apple_health_export/export.xml"),
            output_dir: PathBuf::from("processed_data"),
            reference_timezone: "UTC".to_string(),
            batch_size: default_batch_size(),
            include_metrics: Vec::new(),
            exclude_metrics: Vec::new(),
            source_rules: Vec::new(),
            replace_default_source_rules: false,
            dst_policy: DstPolicy::default(),
            dedup_scope: DedupScope::default(),
            parallel: false,
            channel_capacity: default_channel_capacity(),
            summarize_routes: true,
            parse_limit: None,
            show_progress: false,
        }
    }
}

impl PipelineConfig {
    pub fn new(input_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    /// Read a TOML file; missing keys keep their defaults
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| HdxError::config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| HdxError::config(e.to_string()))
    }

    /// Overlay the `HDX_*` environment variables that are set
    ///
    /// Recognized: `HDX_INPUT_PATH`, `HDX_OUTPUT_DIR`,
    /// `HDX_REFERENCE_TIMEZONE`, `HDX_BATCH_SIZE`, `HDX_INCLUDE_METRICS`,
    /// `HDX_EXCLUDE_METRICS` (comma separated), `HDX_DST_POLICY`,
    /// `HDX_DEDUP_SCOPE`, `HDX_PARALLEL`, `HDX_SUMMARIZE_ROUTES`,
    /// `HDX_PARSE_LIMIT`, `HDX_SHOW_PROGRESS`.
    pub fn merge_env(self) -> Result<Self> {
        self.merge_vars(|key| std::env::var(key).ok())
    }

    pub(crate) fn merge_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(path) = var("HDX_INPUT_PATH") {
            self.input_path = PathBuf::from(path);
        }
        if let Some(dir) = var("HDX_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(tz) = var("HDX_REFERENCE_TIMEZONE") {
            self.reference_timezone = tz;
        }
        if let Some(size) = var("HDX_BATCH_SIZE") {
            self.batch_size = parse_number("HDX_BATCH_SIZE", &size)?;
        }
        if let Some(list) = var("HDX_INCLUDE_METRICS") {
            self.include_metrics = parse_metric_list(&list)?;
        }
        if let Some(list) = var("HDX_EXCLUDE_METRICS") {
            self.exclude_metrics = parse_metric_list(&list)?;
        }
        if let Some(policy) = var("HDX_DST_POLICY") {
            self.dst_policy = policy.parse()?;
        }
        if let Some(scope) = var("HDX_DEDUP_SCOPE") {
            self.dedup_scope = scope.parse()?;
        }
        if let Some(flag) = var("HDX_PARALLEL") {
            self.parallel = parse_flag("HDX_PARALLEL", &flag)?;
        }
        if let Some(flag) = var("HDX_SUMMARIZE_ROUTES") {
            self.summarize_routes = parse_flag("HDX_SUMMARIZE_ROUTES", &flag)?;
        }
        if let Some(limit) = var("HDX_PARSE_LIMIT") {
            self.parse_limit = Some(parse_number("HDX_PARSE_LIMIT", &limit)?);
        }
        if let Some(flag) = var("HDX_SHOW_PROGRESS") {
            self.show_progress = parse_flag("HDX_SHOW_PROGRESS", &flag)?;
        }
        Ok(self)
    }

    pub fn with_reference_timezone(mut self, tz: impl Into<String>) -> Self {
        self.reference_timezone = tz.into();
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_include_metrics(mut self, metrics: Vec<MetricKind>) -> Self {
        self.include_metrics = metrics;
        self
    }

    pub fn with_exclude_metrics(mut self, metrics: Vec<MetricKind>) -> Self {
        self.exclude_metrics = metrics;
        self
    }

    pub fn with_source_rules(mut self, rules: Vec<SourceRule>, replace_defaults: bool) -> Self {
        self.source_rules = rules;
        self.replace_default_source_rules = replace_defaults;
        self
    }

    pub fn with_dst_policy(mut self, policy: DstPolicy) -> Self {
        self.dst_policy = policy;
        self
    }

    pub fn with_dedup_scope(mut self, scope: DedupScope) -> Self {
        self.dedup_scope = scope;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_summarize_routes(mut self, summarize: bool) -> Self {
        self.summarize_routes = summarize;
        self
    }

    /// Set parse limit for testing
    pub fn with_parse_limit(mut self, limit: usize) -> Self {
        self.parse_limit = Some(limit);
        self
    }

    /// Reject values no run could work with
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(HdxError::config("batch_size must be greater than 0"));
        }
        if self.channel_capacity == 0 {
            return Err(HdxError::config("channel_capacity must be greater than 0"));
        }
        self.timezone()?;
        self.source_normalizer()?;
        if self.replace_default_source_rules && self.source_rules.is_empty() {
            return Err(HdxError::config(
                "replace_default_source_rules is set but no source_rules are given",
            ));
        }
        Ok(())
    }

    pub fn timezone(&self) -> Result<Tz> {
        self.reference_timezone.parse::<Tz>().map_err(|_| {
            HdxError::config(format!(
                "Unknown reference timezone '{}'",
                self.reference_timezone
            ))
        })
    }

    /// Whether rows of `metric` are produced by this run
    pub fn is_metric_enabled(&self, metric: MetricKind) -> bool {
        (self.include_metrics.is_empty() || self.include_metrics.contains(&metric))
            && !self.exclude_metrics.contains(&metric)
    }

    /// Metrics a run with this configuration produces tables for
    pub fn enabled_metrics(&self) -> Vec<MetricKind> {
        MetricKind::ALL
            .into_iter()
            .filter(|m| self.is_metric_enabled(*m))
            .collect()
    }

    /// Active source rules in priority order
    pub fn effective_source_rules(&self) -> Vec<SourceRule> {
        let mut rules = self.source_rules.clone();
        if !self.replace_default_source_rules {
            rules.extend(SourceRule::defaults());
        }
        rules
    }

    pub fn source_normalizer(&self) -> Result<SourceNormalizer> {
        SourceNormalizer::new(self.effective_source_rules())
    }

    pub fn timestamp_normalizer(&self) -> Result<TimestampNormalizer> {
        Ok(TimestampNormalizer::new(self.timezone()?, self.dst_policy))
    }

    /// Directory GPX route references are resolved against
    pub fn export_dir(&self) -> PathBuf {
        self.input_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| HdxError::config(format!("{key} must be a non-negative integer, got '{value}'")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(HdxError::config(format!("{key} must be a boolean, got '{value}'"))),
    }
}

/// Parse a comma separated list of table names
pub fn parse_metric_list(list: &str) -> Result<Vec<MetricKind>> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            name.parse::<MetricKind>()
                .map_err(|_| HdxError::config(format!("Unknown metric name '{name}'")))
        })
        .collect()
}
