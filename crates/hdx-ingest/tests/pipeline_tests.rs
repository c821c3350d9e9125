//! End-to-end preprocessing tests
//!
//! Each test writes a small export into a temporary directory and runs the
//! full pipeline against it, checking the tables and the manifest.

use anyhow::Result;
use hdx_common::manifest::Manifest;
use hdx_common::{HdxError, MetricKind};
use hdx_ingest::store::{CsvTableStore, MetricTable, Row, TableStore};
use hdx_ingest::{Pipeline, PipelineConfig};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hdx_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

fn heart_rate(source: &str, date: &str, value: &str) -> String {
    format!(
        r#" <Record type="HKQuantityTypeIdentifierHeartRate" sourceName="{source}" unit="count/min" creationDate="{date}" startDate="{date}" endDate="{date}" value="{value}"/>"#
    )
}

fn export(records: &[String]) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<HealthData locale=\"en_US\">\n{}\n</HealthData>\n",
        records.join("\n")
    )
}

/// A varied export touching several extraction kinds
fn mixed_export() -> String {
    let mut records = vec![
        heart_rate("iPhone 13 Pro", "2023-01-01 23:50:00 +0530", "72"),
        heart_rate("Apple Watch Series 8", "2023-01-02 08:00:00 +0100", "64"),
        r#" <Record type="HKQuantityTypeIdentifierStepCount" sourceName="Apple Watch" unit="count" startDate="2023-01-02 09:00:00 +0100" endDate="2023-01-02 09:10:00 +0100" value="812"/>"#.to_string(),
        r#" <Record type="HKQuantityTypeIdentifierBodyFatPercentage" sourceName="Withings" unit="%" startDate="2023-01-02 07:00:00 +0100" endDate="2023-01-02 07:00:00 +0100" value="0.21"/>"#.to_string(),
        r#" <Record type="HKQuantityTypeIdentifierDietaryProtein" sourceName="MyFitnessPal" unit="g" startDate="2023-01-02 12:30:00 +0100" endDate="2023-01-02 12:30:00 +0100" value="31.5"/>"#.to_string(),
        r#" <Record type="HKCategoryTypeIdentifierSleepAnalysis" sourceName="Apple Watch" startDate="2023-01-01 23:00:00 +0100" endDate="2023-01-02 06:30:00 +0100" value="HKCategoryValueSleepAnalysisAsleepCore"/>"#.to_string(),
        r#" <Workout workoutActivityType="HKWorkoutActivityTypeRunning" duration="30" durationUnit="min" totalDistance="5.2" totalDistanceUnit="km" totalEnergyBurned="320" totalEnergyBurnedUnit="kcal" sourceName="Apple Watch" startDate="2023-01-02 17:00:00 +0100" endDate="2023-01-02 17:30:00 +0100"/>"#.to_string(),
        r#" <Record type="HKQuantityTypeIdentifierMysteryMetric" sourceName="iPhone" startDate="2023-01-02 07:00:00 +0100" value="1"/>"#.to_string(),
    ];
    for minute in 0..40 {
        records.push(heart_rate(
            "iPhone",
            &format!("2023-01-03 10:{minute:02}:00 +0000"),
            &format!("{}", 60 + minute % 7),
        ));
    }
    export(&records)
}

fn setup(xml: &str) -> Result<(TempDir, PipelineConfig)> {
    let dir = TempDir::new()?;
    let input = dir.path().join("export.xml");
    std::fs::write(&input, xml)?;
    let config = PipelineConfig::new(input, dir.path().join("out")).with_batch_size(8);
    Ok((dir, config))
}

fn table_rows(dir: &Path, metric: MetricKind) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    CsvTableStore::new(dir).scan(metric, &mut |row| {
        rows.push(row);
        Ok(())
    })?;
    Ok(rows)
}

fn read_tables(dir: &Path) -> Result<Vec<(PathBuf, Vec<u8>)>> {
    let mut tables = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "csv") {
            tables.push((path.clone(), std::fs::read(&path)?));
        }
    }
    tables.sort();
    Ok(tables)
}

#[tokio::test]
async fn test_end_to_end_heart_rate() -> Result<()> {
    init_tracing();

    let a = heart_rate("iPhone 13 Pro", "2023-01-01 23:50:00 +0530", "72");
    let b = heart_rate("iphone", "2023-01-02 00:05:00 +0530", "75");
    let (_dir, config) = setup(&export(&[a.clone(), b, a]))?;
    let out = config.output_dir.clone();

    let report = Pipeline::new(config)?.run().await?;
    info!(written = report.summary.total_written(), "Run finished");

    let rows = table_rows(&out, MetricKind::HeartRate)?;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][0], "2023-01-01T18:20:00");
    assert_eq!(rows[0][2], "72");
    assert_eq!(rows[1][0], "2023-01-01T18:35:00");
    assert_eq!(rows[1][2], "75");
    assert!(rows.iter().all(|row| row[4] == "iPhone"));
    assert_eq!(rows[0][5], "iPhone 13 Pro");

    let stats = report.summary.metrics[&MetricKind::HeartRate];
    assert_eq!(stats.deduplicated, 1);
    assert!(stats.is_balanced());

    let manifest = Manifest::load(&out)?;
    let hr = manifest
        .get(MetricKind::HeartRate)
        .expect("heart_rate should be listed");
    assert_eq!(hr.row_count, 2);
    assert_eq!(
        hr.distinct_sources,
        BTreeSet::from(["iPhone".to_string()])
    );
    assert_eq!(manifest.input.as_deref(), Some("export.xml"));
    manifest.verify_table(&out, MetricKind::HeartRate)?;
    Ok(())
}

#[tokio::test]
async fn test_rerun_is_idempotent() -> Result<()> {
    init_tracing();

    let (_dir, config) = setup(&mixed_export())?;
    let out = config.output_dir.clone();
    let pipeline = Pipeline::new(config)?;

    let first = pipeline.run().await?;
    let first_tables = read_tables(&out)?;
    let second = pipeline.run().await?;
    let second_tables = read_tables(&out)?;

    assert_eq!(first_tables, second_tables);
    for (metric, summary) in &first.manifest.metrics {
        assert_eq!(second.manifest.metrics[metric].row_count, summary.row_count);
        assert_eq!(second.manifest.metrics[metric].sha256, summary.sha256);
    }
    Ok(())
}

#[tokio::test]
async fn test_malformed_records_do_not_stop_the_run() -> Result<()> {
    init_tracing();

    let mut records = Vec::new();
    for i in 0..10 {
        records.push(heart_rate(
            "Apple Watch",
            &format!("2023-03-01 12:{i:02}:00 +0000"),
            "70",
        ));
        match i % 4 {
            // duplicate attribute: rejected by the parser
            0 => records.push(
                r#" <Record type="HKQuantityTypeIdentifierHeartRate" value="1" value="2"/>"#
                    .to_string(),
            ),
            1 => records.push(heart_rate("Apple Watch", "not a date", "70")),
            2 => records.push(heart_rate("Apple Watch", "2023-03-01 13:00:00 +0000", "fast")),
            _ => records.push(
                r#" <Record type="HKQuantityTypeIdentifierHeartRate" sourceName="Apple Watch" startDate="2023-03-01 13:00:00 +0000"/>"#
                    .to_string(),
            ),
        }
    }
    let (_dir, config) = setup(&export(&records))?;
    let out = config.output_dir.clone();

    let report = Pipeline::new(config)?.run().await?;

    assert_eq!(report.manifest.get(MetricKind::HeartRate).map(|s| s.row_count), Some(10));
    assert_eq!(report.summary.malformed, 3);
    assert_eq!(report.summary.metrics[&MetricKind::HeartRate].skipped, 7);
    assert_eq!(table_rows(&out, MetricKind::HeartRate)?.len(), 10);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_parallel_matches_sequential() -> Result<()> {
    init_tracing();

    let (_seq_dir, sequential) = setup(&mixed_export())?;
    let (_par_dir, parallel) = setup(&mixed_export())?;
    let parallel = parallel.with_parallel(true);
    let (seq_out, par_out) = (sequential.output_dir.clone(), parallel.output_dir.clone());

    let seq = Pipeline::new(sequential)?.run().await?;
    let par = Pipeline::new(parallel)?.run().await?;

    let names = |tables: Vec<(PathBuf, Vec<u8>)>| -> Vec<(String, Vec<u8>)> {
        tables
            .into_iter()
            .map(|(path, bytes)| (path.file_name().unwrap().to_string_lossy().into_owned(), bytes))
            .collect()
    };
    assert_eq!(names(read_tables(&seq_out)?), names(read_tables(&par_out)?));
    assert_eq!(seq.summary.total_written(), par.summary.total_written());
    assert_eq!(seq.summary.metrics, par.summary.metrics);
    assert_eq!(seq.manifest.metrics, par.manifest.metrics);
    Ok(())
}

/// CSV store whose tables of one metric refuse every write
struct FailingStore {
    inner: CsvTableStore,
    broken: MetricKind,
}

impl TableStore for FailingStore {
    fn prepare(&self) -> hdx_common::Result<()> {
        self.inner.prepare()
    }

    fn create(&self, metric: MetricKind) -> hdx_common::Result<Box<dyn MetricTable>> {
        if metric == self.broken {
            return Err(HdxError::persistence(metric.as_str(), "disk full"));
        }
        self.inner.create(metric)
    }

    fn scan(
        &self,
        metric: MetricKind,
        visit: &mut dyn FnMut(Row) -> hdx_common::Result<()>,
    ) -> hdx_common::Result<String> {
        self.inner.scan(metric, visit)
    }

    fn remove_stale(&self, keep: &BTreeSet<MetricKind>) -> hdx_common::Result<()> {
        self.inner.remove_stale(keep)
    }
}

#[tokio::test]
async fn test_failing_metric_does_not_block_others() -> Result<()> {
    init_tracing();

    for parallel in [false, true] {
        let (_dir, config) = setup(&mixed_export())?;
        let out = config.output_dir.clone();
        let store = Arc::new(FailingStore {
            inner: CsvTableStore::new(&out),
            broken: MetricKind::StepCount,
        });

        let report = Pipeline::new(config.with_parallel(parallel))?
            .with_store(store)
            .run()
            .await?;

        assert!(report.summary.has_failures());
        assert!(report.summary.failed_metrics.contains_key(&MetricKind::StepCount));
        assert_eq!(report.summary.metrics[&MetricKind::StepCount].dropped, 1);
        assert!(!report.manifest.is_processed(MetricKind::StepCount));

        let manifest = Manifest::load(&out)?;
        assert_eq!(manifest.get(MetricKind::HeartRate).map(|s| s.row_count), Some(42));
        assert!(manifest.is_processed(MetricKind::Workout));
        assert!(!out.join("step_count.csv").exists());
    }
    Ok(())
}

#[tokio::test]
async fn test_cancelled_run_keeps_previous_output() -> Result<()> {
    init_tracing();

    let (_dir, config) = setup(&mixed_export())?;
    let out = config.output_dir.clone();
    Pipeline::new(config.clone())?.run().await?;
    let before = read_tables(&out)?;
    let manifest_before = std::fs::read(Manifest::path(&out))?;

    for parallel in [false, true] {
        let pipeline = Pipeline::new(config.clone().with_parallel(parallel))?;
        pipeline.cancellation_token().cancel();

        let err = pipeline.run().await.unwrap_err();
        assert!(matches!(err, HdxError::Cancelled));
        assert_eq!(read_tables(&out)?, before);
        assert_eq!(std::fs::read(Manifest::path(&out))?, manifest_before);
    }
    Ok(())
}

/// CSV store that cancels the run on the first row write
struct CancelOnWrite {
    inner: CsvTableStore,
    token: CancellationToken,
}

struct CancellingTable {
    table: Box<dyn MetricTable>,
    token: CancellationToken,
}

impl MetricTable for CancellingTable {
    fn append(&mut self, rows: &[Row]) -> hdx_common::Result<()> {
        self.token.cancel();
        self.table.append(rows)
    }

    fn finalize(self: Box<Self>) -> hdx_common::Result<()> {
        self.table.finalize()
    }

    fn discard(self: Box<Self>) {
        self.table.discard()
    }
}

impl TableStore for CancelOnWrite {
    fn prepare(&self) -> hdx_common::Result<()> {
        self.inner.prepare()
    }

    fn create(&self, metric: MetricKind) -> hdx_common::Result<Box<dyn MetricTable>> {
        Ok(Box::new(CancellingTable {
            table: self.inner.create(metric)?,
            token: self.token.clone(),
        }))
    }

    fn scan(
        &self,
        metric: MetricKind,
        visit: &mut dyn FnMut(Row) -> hdx_common::Result<()>,
    ) -> hdx_common::Result<String> {
        self.inner.scan(metric, visit)
    }

    fn remove_stale(&self, keep: &BTreeSet<MetricKind>) -> hdx_common::Result<()> {
        self.inner.remove_stale(keep)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_after_parsing_still_commits_parallel_run() -> Result<()> {
    init_tracing();

    // Batches larger than the export: rows are only written once the
    // parser has finished and the writers drain their channels.
    let (_dir, config) = setup(&mixed_export())?;
    let config = config.with_batch_size(1000).with_parallel(true);
    let out = config.output_dir.clone();
    Pipeline::new(config.clone())?.run().await?;
    let before = read_tables(&out)?;

    let token = CancellationToken::new();
    let store = Arc::new(CancelOnWrite {
        inner: CsvTableStore::new(&out),
        token: token.clone(),
    });
    let report = Pipeline::new(config)?
        .with_store(store)
        .with_cancellation(token.clone())
        .run()
        .await?;

    assert!(token.is_cancelled());
    assert!(!report.summary.has_failures());
    assert!(report.summary.metrics.values().all(|s| s.is_balanced()));
    assert_eq!(report.manifest.get(MetricKind::HeartRate).map(|s| s.row_count), Some(42));
    assert_eq!(Manifest::load(&out)?.metrics, report.manifest.metrics);
    assert_eq!(read_tables(&out)?, before);
    Ok(())
}

#[tokio::test]
async fn test_truncated_export_writes_no_manifest() -> Result<()> {
    init_tracing();

    let mut xml = export(&[heart_rate("iPhone", "2023-01-01 10:00:00 +0000", "70")]);
    xml.truncate(xml.len() - "</HealthData>\n".len());
    let (_dir, config) = setup(&xml)?;
    let out = config.output_dir.clone();

    for parallel in [false, true] {
        let err = Pipeline::new(config.clone().with_parallel(parallel))?
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, HdxError::StructuralParse { .. }), "got {err}");
        assert!(!Manifest::path(&out).exists());
        assert!(read_tables(&out)?.is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn test_stale_tables_are_removed() -> Result<()> {
    init_tracing();

    let (_dir, config) = setup(&mixed_export())?;
    let out = config.output_dir.clone();
    Pipeline::new(config.clone())?.run().await?;
    assert!(out.join("step_count.csv").exists());

    let narrowed = config.with_include_metrics(vec![MetricKind::HeartRate, MetricKind::Workout]);
    let report = Pipeline::new(narrowed)?.run().await?;

    assert_eq!(report.manifest.metrics.len(), 2);
    assert!(!out.join("step_count.csv").exists());
    assert!(out.join("heart_rate.csv").exists());
    assert!(out.join("workout.csv").exists());
    Ok(())
}
