//! Sampling over in-memory chunks.

use super::config::{PartitionConfig, PartitionInterval, SampleConfig, SampleSize};
use super::expression::{Expression, values_equal};
use super::frame::{DataFrameChunk, materialize};
use super::{SampledData, Sampler};
use crate::models::{Sample, TableReference};
use crate::{ProbeError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use tracing::debug;

/// Samples tables held as a list of [`DataFrameChunk`]s.
///
/// Each chunk is sampled on its own with a seed drawn from the sampler's
/// generator, so a configured seed makes the whole pass reproducible.
pub struct DataFrameSampler {
    table: TableReference,
    chunks: Vec<DataFrameChunk>,
    config: SampleConfig,
    selection: Option<Expression>,
    rng: StdRng,
}

impl std::fmt::Debug for DataFrameSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFrameSampler")
            .field("table", &self.table.fully_qualified_name())
            .field("chunks", &self.chunks.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DataFrameSampler {
    /// Validates the configuration and parses any custom selection up front.
    pub fn new(
        table: TableReference,
        chunks: Vec<DataFrameChunk>,
        config: SampleConfig,
    ) -> Result<Self> {
        config.validate()?;
        let selection = config
            .custom_selection
            .as_deref()
            .map(Expression::parse)
            .transpose()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            table,
            chunks,
            config,
            selection,
            rng,
        })
    }

    pub fn chunks(&self) -> &[DataFrameChunk] {
        &self.chunks
    }

    fn sample_frames(&mut self, now: DateTime<Utc>) -> Result<Vec<DataFrameChunk>> {
        if let Some(selection) = &self.selection {
            debug!(
                "Applying custom selection to {} chunk(s) of {}",
                self.chunks.len(),
                self.table.name
            );
            return self
                .chunks
                .iter()
                .map(|chunk| chunk.filter_expression(selection))
                .collect();
        }

        let mut frames = match &self.config.partition {
            Some(partition) => apply_partition(&self.chunks, partition, now)?,
            None => self.chunks.clone(),
        };

        let Some(size) = self.config.size_limit()? else {
            return Ok(frames);
        };

        frames.shuffle(&mut self.rng);

        match size {
            SampleSize::Fraction(fraction) => Ok(frames
                .iter()
                .map(|chunk| {
                    #[allow(
                        clippy::cast_possible_truncation,
                        clippy::cast_sign_loss,
                        clippy::cast_precision_loss
                    )]
                    let n = (fraction * chunk.len() as f64).round() as usize;
                    let seed: u64 = self.rng.random();
                    sample_with_replacement(chunk, n, seed)
                })
                .collect()),
            SampleSize::Rows(budget) => {
                if frames.is_empty() {
                    return Ok(frames);
                }
                let total: usize = frames.iter().map(DataFrameChunk::len).sum();
                let per_chunk = budget / frames.len() as u64;
                if per_chunk > total as u64 {
                    debug!(
                        "Row budget {} exceeds the {} rows of {}, keeping all rows",
                        budget, total, self.table.name
                    );
                    return Ok(frames);
                }
                let per_chunk = usize::try_from(per_chunk).unwrap_or(usize::MAX);
                Ok(frames
                    .iter()
                    .map(|chunk| {
                        let seed: u64 = self.rng.random();
                        sample_with_replacement(chunk, per_chunk, seed)
                    })
                    .collect())
            }
        }
    }
}

/// Draws `n` rows uniformly with replacement. Empty chunks stay empty.
fn sample_with_replacement(chunk: &DataFrameChunk, n: usize, seed: u64) -> DataFrameChunk {
    if chunk.is_empty() {
        return chunk.clone();
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let indices: Vec<usize> = (0..n).map(|_| rng.random_range(0..chunk.len())).collect();
    chunk.select_rows(&indices)
}

/// Keeps only the rows inside the partition.
pub fn apply_partition(
    chunks: &[DataFrameChunk],
    partition: &PartitionConfig,
    now: DateTime<Utc>,
) -> Result<Vec<DataFrameChunk>> {
    let threshold = match &partition.interval {
        PartitionInterval::TimeUnit { unit, interval } => Some(unit.threshold(*interval, now)?),
        _ => None,
    };

    chunks
        .iter()
        .map(|chunk| {
            if chunk.is_empty() {
                return Ok(chunk.clone());
            }
            let idx = chunk.column_index(&partition.column).ok_or_else(|| {
                ProbeError::configuration(format!(
                    "partition column '{}' not found",
                    partition.column
                ))
            })?;
            Ok(chunk.filter(|row| {
                let value = &row[idx];
                match &partition.interval {
                    PartitionInterval::ColumnValue { values } => {
                        values.iter().any(|v| values_equal(v, value))
                    }
                    PartitionInterval::IntegerRange { start, end } => {
                        integer_of(value).is_some_and(|n| n >= *start && n <= *end)
                    }
                    PartitionInterval::TimeUnit { .. } => {
                        threshold.is_some_and(|t| t.admits(value))
                    }
                }
            }))
        })
        .collect()
}

#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn integer_of(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        _ => None,
    }
}

#[async_trait]
impl Sampler for DataFrameSampler {
    fn table(&self) -> &TableReference {
        &self.table
    }

    fn sample_config(&self) -> &SampleConfig {
        &self.config
    }

    async fn random_sample(&mut self) -> Result<SampledData> {
        self.sample_frames(Utc::now()).map(SampledData::Frames)
    }

    async fn fetch_sample_data(&mut self) -> Result<Sample> {
        match self.random_sample().await? {
            SampledData::Frames(frames) => Ok(materialize(&frames, Some(self.config.sample_limit))),
            SampledData::Query(_) => Err(ProbeError::unsupported_feature(
                "query sampling",
                "in-memory tables",
            )),
        }
    }

    async fn release(&mut self) -> Result<()> {
        self.chunks.clear();
        Ok(())
    }
}
