//! Preprocessing pipeline
//!
//! A run streams the export once, routes every record to its metric, and
//! writes one table per enabled metric plus the manifest. The manifest is
//! the commit point: it is removed once parsing has succeeded and written
//! again only after every table has been finalized, so it never describes
//! tables of a mixed or unfinished run.
//!
//! Two execution modes share the per-record logic:
//!
//! - **sequential**: one blocking loop owns every writer
//! - **parallel**: the parser feeds one bounded channel per metric, and
//!   each metric has its own writer task

use crate::config::{DedupScope, PipelineConfig};
use crate::error::{ParseError, RecordError};
use crate::manifest::ManifestBuilder;
use crate::parser::{ExportParser, RawRecord};
use crate::router::{NormalizedRecord, Router, RoutingTable};
use crate::routes::RouteSummarizer;
use crate::store::{CsvTableStore, TableStore};
use crate::summary::RunSummary;
use crate::writer::{BatchWriter, MetricWriter, WriterReport};
use hdx_common::manifest::Manifest;
use hdx_common::{HdxError, MetricKind, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const READ_BUFFER_SIZE: usize = 1 << 20;

/// Result of a completed run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: RunSummary,
    pub manifest: Manifest,
}

#[derive(Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn TableStore>,
    routing: Arc<RoutingTable>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Pipeline writing CSV tables to the configured output directory
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(CsvTableStore::new(&config.output_dir));
        Ok(Self {
            config,
            store,
            routing: Arc::new(RoutingTable::apple_health()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_store(mut self, store: Arc<dyn TableStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_routing_table(mut self, table: RoutingTable) -> Self {
        self.routing = Arc::new(table);
        self
    }

    /// Observe `token`; once cancelled the run stops between records
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Preprocess the configured export
    pub async fn run(&self) -> Result<RunReport> {
        info!(
            input = %self.config.input_path.display(),
            output = %self.config.output_dir.display(),
            timezone = %self.config.reference_timezone,
            parallel = self.config.parallel,
            "Starting preprocessing"
        );

        let file = File::open(&self.config.input_path)?;
        let progress = self.progress_bar(file.metadata()?.len());
        let reader = BufReader::with_capacity(READ_BUFFER_SIZE, progress.wrap_read(file));

        let result = if self.config.parallel {
            self.run_parallel(reader).await
        } else {
            let this = self.clone();
            tokio::task::spawn_blocking(move || this.run_sequential(reader))
                .await
                .map_err(task_error)?
        };

        progress.finish_and_clear();
        if let Err(e) = &result {
            error!(error = %e, "Preprocessing failed");
        }
        result
    }

    /// Single loop owning every metric writer
    pub fn run_sequential<R: BufRead>(&self, reader: R) -> Result<RunReport> {
        let started = Instant::now();
        let router = self.router()?;
        self.store.prepare()?;

        let mut summary = RunSummary::default();
        let mut writers = BatchWriter::new(
            Arc::clone(&self.store),
            self.config.batch_size,
            self.config.dedup_scope,
        );
        let mut stream = self.parser().stream(reader);

        for item in stream.by_ref() {
            if self.cancel.is_cancelled() {
                warn!(records = summary.records_seen, "Run cancelled");
                writers.discard();
                return Err(HdxError::Cancelled);
            }
            match self.route(&router, item, &mut summary) {
                Ok(Some(record)) => {
                    writers.accept(&record);
                },
                Ok(None) => {},
                Err(e) => {
                    writers.discard();
                    return Err(e);
                },
            }
        }
        summary.dropped_children = stream.dropped_children();

        if self.cancel.is_cancelled() {
            warn!(records = summary.records_seen, "Run cancelled");
            writers.discard();
            return Err(HdxError::Cancelled);
        }

        if let Err(e) = self.invalidate_manifest() {
            writers.discard();
            return Err(e);
        }
        let reports = writers.finish(&self.config.enabled_metrics());
        self.commit(summary, reports, started)
    }

    /// Parser task feeding one writer task per enabled metric
    pub async fn run_parallel<R>(&self, reader: R) -> Result<RunReport>
    where
        R: BufRead + Send + 'static,
    {
        let started = Instant::now();
        let router = self.router()?;
        self.store.prepare()?;

        // Cancelled only by the producer stopping early. Once the export has
        // been parsed the run commits, whatever the caller's token says.
        let abort = CancellationToken::new();
        let metrics = self.config.enabled_metrics();

        let mut senders = HashMap::with_capacity(metrics.len());
        let mut handles = Vec::with_capacity(metrics.len());
        for &metric in &metrics {
            let (tx, rx) = mpsc::channel(self.config.channel_capacity);
            senders.insert(metric, tx);

            let store = Arc::clone(&self.store);
            let abort = abort.clone();
            let (batch_size, scope) = (self.config.batch_size, self.config.dedup_scope);
            handles.push(tokio::task::spawn_blocking(move || {
                write_metric(metric, rx, store, batch_size, scope, abort)
            }));
        }
        debug!(workers = handles.len(), "Spawned metric writers");

        let this = self.clone();
        let producer_abort = abort.clone();
        let produced = tokio::task::spawn_blocking(move || {
            this.produce(reader, router, senders, producer_abort)
        })
        .await;

        let mut reports = Vec::with_capacity(handles.len());
        let mut worker_error = None;
        for handle in handles {
            match handle.await {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {},
                Err(e) => {
                    error!(error = %e, "Metric writer task failed");
                    worker_error = Some(task_error(e));
                },
            }
        }

        let summary = produced.map_err(task_error)??;
        if let Some(e) = worker_error {
            return Err(e);
        }
        if reports.len() != metrics.len() {
            return Err(HdxError::Task(format!(
                "{} of {} metric writers did not finish",
                metrics.len() - reports.len(),
                metrics.len()
            )));
        }
        self.commit(summary, reports, started)
    }

    /// Parse and route, sending each record to its metric's channel
    fn produce<R: BufRead>(
        &self,
        reader: R,
        router: Router,
        senders: HashMap<MetricKind, mpsc::Sender<NormalizedRecord>>,
        abort: CancellationToken,
    ) -> Result<RunSummary> {
        // Any early return, panics included, aborts the writers
        let guard = abort.drop_guard();

        let mut summary = RunSummary::default();
        let mut stream = self.parser().stream(reader);
        for item in stream.by_ref() {
            if self.cancel.is_cancelled() {
                warn!(records = summary.records_seen, "Run cancelled");
                return Err(HdxError::Cancelled);
            }
            let Some(record) = self.route(&router, item, &mut summary)? else {
                continue;
            };
            let metric = record.metric;
            let Some(tx) = senders.get(&metric) else {
                continue;
            };
            if tx.blocking_send(record).is_err() {
                summary.metric_mut(metric).dropped += 1;
            }
        }
        summary.dropped_children = stream.dropped_children();

        if self.cancel.is_cancelled() {
            warn!(records = summary.records_seen, "Run cancelled");
            return Err(HdxError::Cancelled);
        }
        self.invalidate_manifest()?;
        guard.disarm();
        Ok(summary)
    }

    /// Count and route one parser item.
    ///
    /// Returns the record to persist, `None` when it was skipped, or the
    /// error that ends the run.
    fn route(
        &self,
        router: &Router,
        item: std::result::Result<RawRecord, ParseError>,
        summary: &mut RunSummary,
    ) -> Result<Option<NormalizedRecord>> {
        let raw = match item {
            Ok(raw) => raw,
            Err(ParseError::Record(e)) => {
                summary.records_seen += 1;
                summary.malformed += 1;
                debug!(error = %e, "Skipped malformed element");
                return Ok(None);
            },
            Err(ParseError::Structural { position, message }) => {
                return Err(HdxError::structural(position, message));
            },
        };

        summary.records_seen += 1;
        if let Some(tag) = raw.type_tag() {
            summary.count_tag(tag);
        }

        let route = match router.classify(&raw) {
            Ok(route) => route,
            Err(RecordError::Unroutable(tag)) => {
                summary.count_unroutable(&tag);
                return Ok(None);
            },
            Err(e) => {
                summary.malformed += 1;
                debug!(position = raw.position, error = %e, "Skipped record");
                return Ok(None);
            },
        };

        if !self.config.is_metric_enabled(route.metric) {
            summary.excluded += 1;
            return Ok(None);
        }

        let stats = summary.metric_mut(route.metric);
        stats.routed += 1;
        match router.extract(&raw, route) {
            Ok(routed) => {
                if routed.timestamp_fallback {
                    stats.timestamp_fallbacks += 1;
                }
                Ok(Some(routed.record))
            },
            Err(e) => {
                debug!(metric = %route.metric, position = raw.position, error = %e, "Skipped record");
                stats.record_error(&e);
                Ok(None)
            },
        }
    }

    /// Fold writer reports into the summary and write the manifest
    fn commit(
        &self,
        mut summary: RunSummary,
        reports: Vec<WriterReport>,
        started: Instant,
    ) -> Result<RunReport> {
        let mut finalized = Vec::with_capacity(reports.len());
        for report in reports {
            let stats = summary.metric_mut(report.metric);
            stats.written += report.written;
            stats.deduplicated += report.deduplicated;
            stats.dropped += report.dropped;
            match report.failure {
                Some(reason) => {
                    summary.failed_metrics.insert(report.metric, reason);
                },
                None => finalized.push(report.metric),
            }
        }

        let (manifest, scan_failures) =
            ManifestBuilder::new(self.store.as_ref(), &self.config.reference_timezone)
                .input(self.input_name())
                .raw_type_counts(summary.raw_type_counts.clone())
                .build(&finalized);
        summary.failed_metrics.extend(scan_failures);

        let keep: BTreeSet<MetricKind> = manifest.metrics.keys().copied().collect();
        self.store.remove_stale(&keep)?;
        manifest.save(&self.config.output_dir)?;

        summary.elapsed = started.elapsed();
        for (metric, reason) in &summary.failed_metrics {
            warn!(metric = %metric, reason = %reason, "Metric table incomplete");
        }
        info!(
            records = summary.records_seen,
            written = summary.total_written(),
            malformed = summary.malformed,
            unroutable = summary.total_unroutable(),
            tables = manifest.metrics.len(),
            failed = summary.failed_metrics.len(),
            duration_secs = summary.elapsed.as_secs_f64(),
            "Preprocessing complete"
        );

        Ok(RunReport { summary, manifest })
    }

    /// Remove the manifest of a previous run before tables are replaced
    fn invalidate_manifest(&self) -> Result<()> {
        std::fs::create_dir_all(&self.config.output_dir)?;
        let path = Manifest::path(&self.config.output_dir);
        if path.exists() {
            debug!(path = %path.display(), "Invalidating previous manifest");
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn router(&self) -> Result<Router> {
        let router = Router::new(
            (*self.routing).clone(),
            self.config.source_normalizer()?,
            self.config.timestamp_normalizer()?,
        );
        Ok(if self.config.summarize_routes {
            router.with_route_summarizer(RouteSummarizer::new(self.config.export_dir()))
        } else {
            router
        })
    }

    fn parser(&self) -> ExportParser {
        match self.config.parse_limit {
            Some(limit) => ExportParser::with_limit(limit),
            None => ExportParser::new(),
        }
    }

    fn input_name(&self) -> Option<String> {
        self.config
            .input_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }

    fn progress_bar(&self, total: u64) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total);
        match ProgressStyle::default_bar().template(
            "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
        ) {
            Ok(style) => pb.set_style(style.progress_chars("#>-")),
            Err(e) => debug!(error = %e, "Invalid progress template"),
        }
        pb.set_message(format!("Parsing {}", self.input_name().unwrap_or_default()));
        pb
    }
}

/// Writer task of one metric in parallel mode
fn write_metric(
    metric: MetricKind,
    mut rx: mpsc::Receiver<NormalizedRecord>,
    store: Arc<dyn TableStore>,
    batch_size: usize,
    scope: DedupScope,
    abort: CancellationToken,
) -> Option<WriterReport> {
    let mut writer = MetricWriter::new(metric, batch_size, scope);
    while let Some(record) = rx.blocking_recv() {
        writer.accept(&record, store.as_ref());
    }

    if abort.is_cancelled() {
        debug!(metric = %metric, "Discarding unfinished table");
        writer.discard();
        None
    } else {
        Some(writer.finish(store.as_ref()))
    }
}

fn task_error(err: tokio::task::JoinError) -> HdxError {
    HdxError::Task(err.to_string())
}

/// Preprocess with a default CSV pipeline
pub async fn preprocess(config: PipelineConfig) -> Result<RunReport> {
    Pipeline::new(config)?.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    const EXPORT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<HealthData locale="en_US">
 <Record type="HKQuantityTypeIdentifierHeartRate" sourceName="iPhone" unit="count/min" startDate="2023-01-01 18:20:00 +0000" endDate="2023-01-01 18:20:00 +0000" value="72"/>
 <Record type="HKQuantityTypeIdentifierStepCount" sourceName="Apple Watch" unit="count" startDate="2023-01-01 18:00:00 +0000" endDate="2023-01-01 18:10:00 +0000" value="420"/>
 <Record type="HKQuantityTypeIdentifierMystery" sourceName="iPhone" startDate="2023-01-01 18:00:00 +0000" value="1"/>
 <Record sourceName="iPhone" value="1"/>
</HealthData>
"#;

    fn pipeline(dir: &TempDir) -> Pipeline {
        let config = PipelineConfig::new(dir.path().join("export.xml"), dir.path().join("out"))
            .with_summarize_routes(false);
        Pipeline::new(config).unwrap()
    }

    #[test]
    fn test_sequential_counts() {
        let dir = TempDir::new().unwrap();
        let report = pipeline(&dir)
            .run_sequential(Cursor::new(EXPORT.as_bytes()))
            .unwrap();

        let summary = &report.summary;
        assert_eq!(summary.records_seen, 4);
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.total_unroutable(), 1);
        assert_eq!(summary.total_written(), 2);
        assert!(summary.metrics.values().all(|s| s.is_balanced()));

        assert_eq!(report.manifest.metrics.len(), MetricKind::ALL.len());
        assert_eq!(report.manifest.get(MetricKind::HeartRate).unwrap().row_count, 1);
        assert!(Manifest::path(&dir.path().join("out")).exists());
    }

    #[test]
    fn test_excluded_metrics_get_no_table() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig::new(dir.path().join("export.xml"), dir.path().join("out"))
            .with_include_metrics(vec![MetricKind::HeartRate]);
        let report = Pipeline::new(config)
            .unwrap()
            .run_sequential(Cursor::new(EXPORT.as_bytes()))
            .unwrap();

        assert_eq!(report.summary.excluded, 1);
        assert_eq!(report.manifest.metrics.len(), 1);
        assert!(!dir.path().join("out/step_count.csv").exists());
    }

    #[test]
    fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir);
        pipeline.cancellation_token().cancel();

        let err = pipeline
            .run_sequential(Cursor::new(EXPORT.as_bytes()))
            .unwrap_err();
        assert!(matches!(err, HdxError::Cancelled));
        assert!(!Manifest::path(&dir.path().join("out")).exists());
    }
}
