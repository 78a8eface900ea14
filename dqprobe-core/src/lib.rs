//! Sampling, metric and test-suite engine for dqprobe.
//!
//! dqprobe draws bounded, representative samples from relational databases,
//! document stores and local JSON tables, computes metrics over them and
//! evaluates data-quality assertions against the results.
//!
//! # Guarantees
//! - Sources are only read; relational sessions are forced read-only
//! - Connection strings are redacted in every log line and error
//! - Materialized samples never exceed the configured `sample_limit`
//!
//! # Architecture
//! - [`sampling`]: sample configuration and the per-backend samplers
//! - [`adapters`]: source adaptors and connection building
//! - [`metrics`]: metrics with pushdown and local evaluation
//! - [`runner`]: backend registry, evaluators and the test-suite runner

pub mod adapters;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod runner;
pub mod sampling;

// Re-export commonly used types
pub use adapters::{
    BackendHandle, ConnectionBuilder, DefaultConnectionBuilder, NoSqlAdaptor, SourceCapability,
    TableDataLoader,
};
pub use error::{ProbeError, Result};
pub use logging::{LogFormat, init_logging};
pub use metrics::{Metric, MetricKind, MetricValue, Pushdown};
pub use models::{
    ColumnDef, ConnectionDescriptor, ConnectionType, DataType, Sample, ServiceCategory,
    TableContext, TableReference,
};
pub use runner::{
    Assertion, BackendRegistry, CancellationFlag, RunPlan, RunSummary, TableJob, TableReport,
    TestCaseDefinition, TestCaseResult, TestStatus, TestSuiteRunner,
};
pub use sampling::{PartitionConfig, SampleConfig, SampleMode, SampledData, Sampler};
