//! Persistent per-metric tables
//!
//! [`TableStore`] is the seam between the batch writer and the storage
//! medium. [`CsvTableStore`] keeps one CSV file per metric in the output
//! directory: rows go to `<metric>.csv.partial` and the file is renamed to
//! `<metric>.csv` when finalized, so a finalized table is always complete.

use hdx_common::checksum::HashingReader;
use hdx_common::manifest::{table_path, TABLE_EXTENSION};
use hdx_common::{HdxError, MetricKind, Result};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// One table row in column order
pub type Row = Vec<String>;

const PARTIAL_SUFFIX: &str = "partial";

/// Storage for all metric tables of a run
pub trait TableStore: Send + Sync {
    /// Clear leftovers of an interrupted run
    fn prepare(&self) -> Result<()>;

    /// Start a fresh table for `metric`, replacing any unfinished one
    fn create(&self, metric: MetricKind) -> Result<Box<dyn MetricTable>>;

    /// Read a finalized table once: every row (header excluded) goes to
    /// `visit`, and the SHA-256 of the stored table is returned
    fn scan(&self, metric: MetricKind, visit: &mut dyn FnMut(Row) -> Result<()>)
        -> Result<String>;

    /// Delete finalized tables of metrics outside `keep`
    fn remove_stale(&self, keep: &BTreeSet<MetricKind>) -> Result<()>;
}

/// A table being written during a run
pub trait MetricTable: Send {
    /// Append rows as one unit: either all of them persist or none do
    fn append(&mut self, rows: &[Row]) -> Result<()>;

    /// Make the table visible under its final name
    fn finalize(self: Box<Self>) -> Result<()>;

    /// Drop the unfinished table
    fn discard(self: Box<Self>);
}

/// CSV files in a directory
#[derive(Debug, Clone)]
pub struct CsvTableStore {
    dir: PathBuf,
}

impl CsvTableStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn partial_path(&self, metric: MetricKind) -> PathBuf {
        self.dir
            .join(format!("{}.{}.{}", metric.as_str(), TABLE_EXTENSION, PARTIAL_SUFFIX))
    }
}

impl TableStore for CsvTableStore {
    fn prepare(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        for metric in MetricKind::ALL {
            let partial = self.partial_path(metric);
            if partial.exists() {
                debug!(path = %partial.display(), "Removing unfinished table");
                std::fs::remove_file(&partial)?;
            }
        }
        Ok(())
    }

    fn create(&self, metric: MetricKind) -> Result<Box<dyn MetricTable>> {
        let partial = self.partial_path(metric);
        let persistence = |e: std::io::Error| HdxError::persistence(metric.as_str(), e.to_string());

        if partial.exists() {
            std::fs::remove_file(&partial).map_err(persistence)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&partial)
            .map_err(persistence)?;

        let mut table = CsvTable {
            metric,
            file,
            committed: 0,
            partial,
            target: table_path(&self.dir, metric),
        };
        let header: Row = metric.columns().into_iter().map(String::from).collect();
        table.append(&[header])?;
        Ok(Box::new(table))
    }

    fn scan(
        &self,
        metric: MetricKind,
        visit: &mut dyn FnMut(Row) -> Result<()>,
    ) -> Result<String> {
        let persistence = |e: String| HdxError::persistence(metric.as_str(), e);
        let file = File::open(table_path(&self.dir, metric)).map_err(|e| persistence(e.to_string()))?;
        let mut hashing = HashingReader::new(BufReader::new(file));

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(&mut hashing);
        for record in reader.records() {
            let record = record.map_err(|e| persistence(e.to_string()))?;
            visit(record.iter().map(String::from).collect())?;
        }
        drop(reader);

        // The csv reader stops at the last record; hash whatever trails it
        std::io::copy(&mut hashing, &mut std::io::sink()).map_err(|e| persistence(e.to_string()))?;
        Ok(hashing.finish())
    }

    fn remove_stale(&self, keep: &BTreeSet<MetricKind>) -> Result<()> {
        for metric in MetricKind::ALL.into_iter().filter(|m| !keep.contains(m)) {
            let path = table_path(&self.dir, metric);
            if path.exists() {
                info!(metric = %metric, "Removing table from a previous run");
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

struct CsvTable {
    metric: MetricKind,
    file: File,
    /// Length of the file after the last successful append
    committed: u64,
    partial: PathBuf,
    target: PathBuf,
}

impl CsvTable {
    fn encode(rows: &[Row]) -> std::result::Result<Vec<u8>, String> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        for row in rows {
            writer.write_record(row).map_err(|e| e.to_string())?;
        }
        writer.into_inner().map_err(|e| e.to_string())
    }

    fn rollback(&mut self) {
        if let Err(e) = self.file.set_len(self.committed) {
            warn!(metric = %self.metric, error = %e, "Failed to truncate table after a failed write");
        }
    }
}

impl MetricTable for CsvTable {
    fn append(&mut self, rows: &[Row]) -> Result<()> {
        let bytes = Self::encode(rows)
            .map_err(|e| HdxError::persistence(self.metric.as_str(), e))?;

        let written = self
            .file
            .write_all(&bytes)
            .and_then(|()| self.file.sync_data());
        match written {
            Ok(()) => {
                self.committed += bytes.len() as u64;
                Ok(())
            },
            Err(e) => {
                self.rollback();
                Err(HdxError::persistence(self.metric.as_str(), e.to_string()))
            },
        }
    }

    fn finalize(self: Box<Self>) -> Result<()> {
        let CsvTable {
            metric,
            file,
            partial,
            target,
            ..
        } = *self;
        let persistence = |e: std::io::Error| HdxError::persistence(metric.as_str(), e.to_string());

        file.sync_all().map_err(persistence)?;
        drop(file);
        std::fs::rename(&partial, &target).map_err(persistence)?;
        Ok(())
    }

    fn discard(self: Box<Self>) {
        let CsvTable {
            metric,
            file,
            partial,
            ..
        } = *self;
        drop(file);
        if let Err(e) = std::fs::remove_file(&partial) {
            debug!(metric = %metric, error = %e, "Could not remove unfinished table");
        }
    }
}
