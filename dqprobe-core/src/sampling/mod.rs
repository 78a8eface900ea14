//! Samplers turn a source handle plus a [`SampleConfig`] into a bounded sample.
//!
//! Every backend implements the same two steps:
//!
//! - [`Sampler::random_sample`] applies the custom selection, or the partition
//!   predicate followed by the size limit, and returns backend-native data
//!   (in-memory chunks or a query).
//! - [`Sampler::fetch_sample_data`] materializes that data, truncated to
//!   `sample_limit`, with nested columns reconstructed.

pub mod config;
pub mod dataframe;
pub mod document;
pub mod expression;
pub mod frame;

pub use config::{
    IntervalUnit, PartitionConfig, PartitionInterval, ProfileSample, SampleConfig, SampleMode,
    SampleSize,
};
pub use dataframe::DataFrameSampler;
pub use document::DocumentSampler;
pub use expression::Expression;
pub use frame::DataFrameChunk;

use crate::Result;
use crate::models::{Sample, TableReference};
use async_trait::async_trait;

/// Backend-native result of [`Sampler::random_sample`].
#[derive(Debug, Clone, PartialEq)]
pub enum SampledData {
    /// In-memory chunks, already filtered and sampled
    Frames(Vec<DataFrameChunk>),
    /// A query selecting the sampled rows, for relational backends
    Query(String),
}

impl SampledData {
    /// Total rows held, for in-memory data.
    pub fn row_count(&self) -> Option<usize> {
        match self {
            SampledData::Frames(frames) => Some(frames.iter().map(DataFrameChunk::len).sum()),
            SampledData::Query(_) => None,
        }
    }
}

/// Draws samples from one table.
#[async_trait]
pub trait Sampler: Send + Sync {
    fn table(&self) -> &TableReference;

    fn sample_config(&self) -> &SampleConfig;

    /// Applies selection, partitioning and size limiting.
    async fn random_sample(&mut self) -> Result<SampledData>;

    /// Materializes at most `sample_limit` rows of the sampled data.
    async fn fetch_sample_data(&mut self) -> Result<Sample>;

    /// Releases connections or buffers held by the sampler.
    async fn release(&mut self) -> Result<()> {
        Ok(())
    }
}
