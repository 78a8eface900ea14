//! Per-run metric cache.
//!
//! Several test cases often target the same metric. The runner computes each
//! `(table, metric, column)` once per table run and clears the cache before
//! the next run starts, so nothing outlives the run it was computed in.

use crate::metrics::{MetricKind, MetricValue};
use crate::models::TableReference;
use std::collections::HashMap;

/// Table a cached metric belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricScope {
    pub database: Option<String>,
    pub schema: Option<String>,
    pub table: String,
}

impl From<&TableReference> for MetricScope {
    fn from(table: &TableReference) -> Self {
        let context = table.context();
        Self {
            database: context.database,
            schema: context.schema,
            table: table.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricKey {
    pub scope: MetricScope,
    pub metric: MetricKind,
    pub column: Option<String>,
}

impl MetricKey {
    pub fn new(table: &TableReference, metric: MetricKind, column: Option<&str>) -> Self {
        Self {
            scope: MetricScope::from(table),
            metric,
            column: column.map(str::to_string),
        }
    }
}

/// What computing a metric produced.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricOutcome {
    Computed(MetricValue),
    /// The metric ran but had nothing to summarize, e.g. a mean of no values
    Empty,
    /// The metric does not apply to the column type
    NotApplicable(String),
}

#[derive(Debug, Default)]
pub struct MetricCache {
    entries: HashMap<MetricKey, MetricOutcome>,
    hits: usize,
}

impl MetricCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks a metric up, counting hits.
    pub fn get(&mut self, key: &MetricKey) -> Option<MetricOutcome> {
        let found = self.entries.get(key).cloned();
        if found.is_some() {
            self.hits += 1;
        }
        found
    }

    pub fn insert(&mut self, key: MetricKey, outcome: MetricOutcome) {
        self.entries.insert(key, outcome);
    }

    /// Drops every entry. Called at the start of each table run.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.hits = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> usize {
        self.hits
    }
}
