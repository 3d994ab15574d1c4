use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, trace};

use super::catalog::CodeCatalog;
use super::record::ResultRecord;
use crate::log::{LogError, LogMessage};
use crate::process::StageHandler;

/// Per-year code counts. Counts only grow; years are never removed.
pub struct Aggregator {
    catalog: Arc<CodeCatalog>,
    table: Mutex<BTreeMap<i32, Vec<u64>>>,
}

#[derive(Serialize)]
struct CodeCount<'a> {
    #[serde(rename = "Description")]
    description: &'a str,
    #[serde(rename = "Count")]
    count: u64,
}

impl Aggregator {
    pub fn new(catalog: Arc<CodeCatalog>) -> Self {
        Self {
            catalog,
            table: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn catalog(&self) -> &CodeCatalog {
        &self.catalog
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<i32, Vec<u64>>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn row<'t>(&self, table: &'t mut BTreeMap<i32, Vec<u64>>, year: i32) -> &'t mut Vec<u64> {
        table.entry(year).or_insert_with(|| {
            debug!(year, "first result for year");
            vec![0; self.catalog.len()]
        })
    }

    /// Creates the zero-seeded row for `year` if it is not there yet.
    pub fn ensure_year(&self, year: i32) {
        let mut table = self.lock();
        self.row(&mut table, year);
    }

    /// Counts one occurrence of `code`. Codes outside the catalog are
    /// ignored and return `false`.
    pub fn increment(&self, year: i32, code: i32) -> bool {
        let Some(idx) = self.catalog.index(code) else {
            trace!(year, code, "ignoring code outside catalog");
            return false;
        };
        let mut table = self.lock();
        self.row(&mut table, year)[idx] += 1;
        true
    }

    /// Applies a whole record, returning how many codes were counted.
    pub fn apply(&self, record: &ResultRecord) -> usize {
        self.ensure_year(record.year);
        record
            .codes
            .iter()
            .filter(|&&c| self.increment(record.year, c))
            .count()
    }

    /// Parses and applies a `year:codes` message. Unparseable messages are
    /// dropped and count nothing.
    pub fn apply_wire(&self, payload: &str) -> usize {
        match ResultRecord::parse(payload) {
            Ok(r) => self.apply(&r),
            Err(e) => {
                debug!(error = %e, "discarding malformed result");
                0
            }
        }
    }

    /// `None` when the year has not been seen or the code is unknown.
    pub fn count(&self, year: i32, code: i32) -> Option<u64> {
        let idx = self.catalog.index(code)?;
        self.lock().get(&year).map(|row| row[idx])
    }

    /// Sum of every count in the table.
    pub fn total(&self) -> u64 {
        self.lock().values().flatten().sum()
    }

    /// Owned copy of the counts, indexed by catalog slot.
    pub fn snapshot(&self) -> BTreeMap<i32, Vec<u64>> {
        self.lock().clone()
    }

    /// Serializes the table joined with catalog descriptions, under a single
    /// lock acquisition.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        let table = self.lock();
        let view: BTreeMap<i32, BTreeMap<i32, CodeCount<'_>>> = table
            .iter()
            .map(|(&year, row)| {
                let codes = self
                    .catalog
                    .iter()
                    .zip(row)
                    .map(|((code, description), &count)| (code, CodeCount { description, count }))
                    .collect();
                (year, codes)
            })
            .collect();
        serde_json::to_vec(&view)
    }
}

/// Stage handler feeding results-topic messages into an aggregator.
pub struct AggregateStage {
    aggregator: Arc<Aggregator>,
    delay: Duration,
}

impl AggregateStage {
    pub fn new(aggregator: Arc<Aggregator>, delay: Duration) -> Self {
        Self { aggregator, delay }
    }
}

#[async_trait]
impl StageHandler for AggregateStage {
    async fn handle(&mut self, msg: &LogMessage) -> Result<(), LogError> {
        let counted = self.aggregator.apply_wire(&msg.text());
        debug!(offset = msg.offset, counted, "result applied");
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(())
    }
}
