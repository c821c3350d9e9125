//! Batched, deduplicating table writers
//!
//! A [`MetricWriter`] owns the buffer, the fingerprints and the open table
//! of one metric. [`BatchWriter`] keeps one per metric for the sequential
//! pipeline; the parallel pipeline gives each worker its own.

use crate::config::DedupScope;
use crate::router::NormalizedRecord;
use crate::store::{MetricTable, Row, TableStore};
use hdx_common::checksum::Fingerprint;
use hdx_common::{HdxError, MetricKind};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error};

/// What happened to an accepted record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    Buffered,
    Duplicate,
    /// The metric already failed; the record is lost
    Dropped,
}

/// Final counters of one metric writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterReport {
    pub metric: MetricKind,
    pub written: u64,
    pub deduplicated: u64,
    pub dropped: u64,
    /// Set when the table could not be completed
    pub failure: Option<String>,
}

pub struct MetricWriter {
    metric: MetricKind,
    batch_size: usize,
    scope: DedupScope,
    buffer: Vec<Row>,
    pending: HashSet<Fingerprint>,
    flushed: HashSet<Fingerprint>,
    table: Option<Box<dyn MetricTable>>,
    failure: Option<String>,
    written: u64,
    deduplicated: u64,
    dropped: u64,
}

impl MetricWriter {
    pub fn new(metric: MetricKind, batch_size: usize, scope: DedupScope) -> Self {
        Self {
            metric,
            batch_size: batch_size.max(1),
            scope,
            buffer: Vec::with_capacity(batch_size.max(1)),
            pending: HashSet::new(),
            flushed: HashSet::new(),
            table: None,
            failure: None,
            written: 0,
            deduplicated: 0,
            dropped: 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Buffer a record, flushing when the batch is full
    pub fn accept(&mut self, record: &NormalizedRecord, store: &dyn TableStore) -> Accepted {
        if self.is_failed() {
            self.dropped += 1;
            return Accepted::Dropped;
        }

        let row = record.to_row();
        let fingerprint = record.fingerprint(&row);
        if self.pending.contains(&fingerprint)
            || (self.scope == DedupScope::Table && self.flushed.contains(&fingerprint))
        {
            self.deduplicated += 1;
            return Accepted::Duplicate;
        }

        self.pending.insert(fingerprint);
        self.buffer.push(row);
        if self.buffer.len() >= self.batch_size {
            self.flush(store);
        }
        Accepted::Buffered
    }

    /// Persist the buffer as one append
    pub fn flush(&mut self, store: &dyn TableStore) {
        if self.buffer.is_empty() || self.is_failed() {
            return;
        }

        let result = match self.table.as_mut() {
            Some(table) => table.append(&self.buffer),
            None => store.create(self.metric).and_then(|mut table| {
                let appended = table.append(&self.buffer);
                self.table = Some(table);
                appended
            }),
        };

        match result {
            Ok(()) => {
                debug!(metric = %self.metric, rows = self.buffer.len(), "Flushed batch");
                self.written += self.buffer.len() as u64;
                self.buffer.clear();
                let pending = std::mem::take(&mut self.pending);
                if self.scope == DedupScope::Table {
                    self.flushed.extend(pending);
                }
            },
            Err(e) => self.fail(e),
        }
    }

    fn fail(&mut self, err: HdxError) {
        error!(
            metric = %self.metric,
            error = %err,
            lost_rows = self.buffer.len(),
            "Table write failed; later records of this metric are dropped"
        );
        self.dropped += self.buffer.len() as u64;
        self.buffer.clear();
        self.pending.clear();
        self.flushed.clear();
        self.failure = Some(err.to_string());
    }

    /// Flush what is left and finalize the table (header-only when empty)
    pub fn finish(mut self, store: &dyn TableStore) -> WriterReport {
        self.flush(store);

        if !self.is_failed() {
            let table = match self.table.take() {
                Some(table) => Ok(table),
                None => store.create(self.metric),
            };
            if let Err(e) = table.and_then(|table| table.finalize()) {
                self.fail(e);
            }
        }

        WriterReport {
            metric: self.metric,
            written: self.written,
            deduplicated: self.deduplicated,
            dropped: self.dropped,
            failure: self.failure,
        }
    }

    /// Abandon the run for this metric: nothing is flushed or finalized
    pub fn discard(mut self) {
        if let Some(table) = self.table.take() {
            table.discard();
        }
    }
}

/// One writer per metric, created on first use
pub struct BatchWriter {
    store: Arc<dyn TableStore>,
    batch_size: usize,
    scope: DedupScope,
    writers: BTreeMap<MetricKind, MetricWriter>,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn TableStore>, batch_size: usize, scope: DedupScope) -> Self {
        Self {
            store,
            batch_size,
            scope,
            writers: BTreeMap::new(),
        }
    }

    pub fn accept(&mut self, record: &NormalizedRecord) -> Accepted {
        let (batch_size, scope) = (self.batch_size, self.scope);
        self.writers
            .entry(record.metric)
            .or_insert_with(|| MetricWriter::new(record.metric, batch_size, scope))
            .accept(record, self.store.as_ref())
    }

    /// Finish every metric in `metrics`, creating empty tables as needed
    pub fn finish(mut self, metrics: &[MetricKind]) -> Vec<WriterReport> {
        metrics
            .iter()
            .map(|metric| {
                let writer = self.writers.remove(metric).unwrap_or_else(|| {
                    MetricWriter::new(*metric, self.batch_size, self.scope)
                });
                writer.finish(self.store.as_ref())
            })
            .collect()
    }

    pub fn discard(self) {
        for writer in self.writers.into_values() {
            writer.discard();
        }
    }
}
