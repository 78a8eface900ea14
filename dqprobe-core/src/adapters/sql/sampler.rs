//! Sampling through generated SQL.
//!
//! The sampler never pulls the whole table: `random_sample` returns a query
//! and `fetch_sample_data` asks the source for at most `sample_limit` rows of
//! it.

use super::{SqlSource, TableMapping};
use crate::models::{Sample, TableReference};
use crate::sampling::config::{PartitionInterval, SampleConfig, SampleSize};
use crate::sampling::frame::{DataFrameChunk, materialize};
use crate::sampling::{SampledData, Sampler};
use crate::{ProbeError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub struct SqlSampler {
    source: Arc<dyn SqlSource>,
    mapping: Arc<TableMapping>,
    table: TableReference,
    config: SampleConfig,
}

impl std::fmt::Debug for SqlSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlSampler")
            .field("table", &self.mapping.qualified_name)
            .field("dialect", &self.mapping.dialect)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SqlSampler {
    pub fn new(
        source: Arc<dyn SqlSource>,
        mapping: Arc<TableMapping>,
        table: TableReference,
        config: SampleConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            mapping,
            table,
            config,
        })
    }

    pub fn mapping(&self) -> &TableMapping {
        &self.mapping
    }

    /// Builds the sampling query for the configuration at `now`.
    pub fn sample_query(&self, now: DateTime<Utc>) -> Result<String> {
        if let Some(selection) = &self.config.custom_selection {
            return Ok(selection.trim().trim_end_matches(';').to_string());
        }

        let dialect = self.mapping.dialect;
        let mut predicates = Vec::new();

        if let Some(partition) = &self.config.partition {
            let column = dialect.quote_ident(&partition.column);
            predicates.push(match &partition.interval {
                PartitionInterval::ColumnValue { values } => format!(
                    "{} IN ({})",
                    column,
                    values
                        .iter()
                        .map(|v| dialect.literal(v))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                PartitionInterval::IntegerRange { start, end } => {
                    format!("{} BETWEEN {} AND {}", column, start, end)
                }
                PartitionInterval::TimeUnit { unit, interval } => {
                    let threshold = unit.threshold(*interval, now)?;
                    format!(
                        "{} >= {}",
                        column,
                        super::quote_literal(&threshold.literal())
                    )
                }
            });
        }

        let size = self.config.size_limit()?;
        if let Some(SampleSize::Fraction(fraction)) = size
            && fraction < 1.0
        {
            let percentage = (fraction * 100.0 * 1e6).round() / 1e6;
            predicates.push(dialect.random_percentage_predicate(percentage));
        }

        let mut query = format!("SELECT * FROM {}", self.mapping.qualified_name);
        if !predicates.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&predicates.join(" AND "));
        }
        if let Some(SampleSize::Rows(rows)) = size {
            query.push_str(&format!(" ORDER BY {} LIMIT {}", dialect.random_order(), rows));
        }
        Ok(query)
    }
}

#[async_trait]
impl Sampler for SqlSampler {
    fn table(&self) -> &TableReference {
        &self.table
    }

    fn sample_config(&self) -> &SampleConfig {
        &self.config
    }

    async fn random_sample(&mut self) -> Result<SampledData> {
        let query = self.sample_query(Utc::now())?;
        tracing::debug!(
            "Sampling {} on {}: {}",
            self.mapping.qualified_name,
            self.mapping.dialect.name(),
            query
        );
        Ok(SampledData::Query(query))
    }

    async fn fetch_sample_data(&mut self) -> Result<Sample> {
        let SampledData::Query(query) = self.random_sample().await? else {
            return Err(ProbeError::query_failed("SQL sampler produced in-memory data"));
        };
        let records = self
            .source
            .fetch_rows(&query, self.config.sample_limit)
            .await?;

        if records.is_empty() {
            return Ok(Sample::new(self.mapping.column_names()));
        }
        let chunk = DataFrameChunk::from_records(records);
        Ok(materialize(&[chunk], Some(self.config.sample_limit)))
    }
}
