//! Test-suite runner.
//!
//! A table run validates its configuration, connects, resolves the sampler
//! and evaluator from the [`BackendRegistry`], computes each test case's
//! metric through the per-run [`MetricCache`] and applies the assertion.
//!
//! Error policy:
//!
//! - configuration errors stop the table before any data is touched and are
//!   returned as `Err`;
//! - adaptor and metric errors abort the affected test cases with a trace;
//! - an assertion that does not hold fails its test case.
//!
//! The backend handle is released on every path once it was acquired.

pub mod cache;
pub mod evaluator;
pub mod registry;
pub mod test_case;

pub use cache::{MetricCache, MetricKey, MetricOutcome};
pub use evaluator::{DocumentEvaluator, LocalEvaluator, SqlEvaluator, TestSuiteEvaluator};
pub use registry::{BackendContext, BackendRegistry, RegistryKey};
pub use test_case::{
    Assertion, AssertionOutcome, TestCaseDefinition, TestCaseResult, TestCaseState, TestStatus,
};

use crate::adapters::sql::TableMapping;
use crate::adapters::{BackendHandle, ConnectionBuilder};
use crate::models::{ConnectionDescriptor, ConnectionType, Sample, ServiceCategory, TableReference};
use crate::sampling::SampleConfig;
use crate::{ProbeError, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One table to profile: where it lives, how to sample it, what to check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableJob {
    pub table: TableReference,
    pub connection: ConnectionDescriptor,
    #[serde(default)]
    pub service: ServiceCategory,
    #[serde(default)]
    pub sample: SampleConfig,
    #[serde(default)]
    pub test_cases: Vec<TestCaseDefinition>,
}

impl TableJob {
    pub fn new(table: TableReference, connection: ConnectionDescriptor) -> Self {
        Self {
            table,
            connection,
            service: ServiceCategory::Database,
            sample: SampleConfig::default(),
            test_cases: Vec::new(),
        }
    }

    pub fn with_sample(mut self, sample: SampleConfig) -> Self {
        self.sample = sample;
        self
    }

    pub fn with_test_case(mut self, test_case: TestCaseDefinition) -> Self {
        self.test_cases.push(test_case);
        self
    }

    pub fn registry_key(&self) -> RegistryKey {
        (self.service, self.connection.connection_type)
    }

    /// Checks sampling and test case settings without touching the source.
    pub fn validate(&self) -> Result<()> {
        if self.table.name.trim().is_empty() {
            return Err(ProbeError::configuration("table name must not be empty"));
        }
        self.sample.validate()?;
        let mut names = HashSet::new();
        for test_case in &self.test_cases {
            test_case.validate()?;
            if !names.insert(test_case.name.as_str()) {
                return Err(ProbeError::configuration(format!(
                    "duplicate test case name '{}' for {}",
                    test_case.name,
                    self.table.fully_qualified_name()
                )));
            }
        }
        Ok(())
    }
}

/// A list of table jobs, as read from a JSON plan file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunPlan {
    #[serde(default)]
    pub name: Option<String>,
    pub tables: Vec<TableJob>,
}

impl RunPlan {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ProbeError::serialization("Failed to parse run plan", e))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ProbeError::io(format!("Failed to read run plan {}", path.display()), e)
        })?;
        Self::from_json(&json)
    }
}

/// Results for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableReport {
    pub table: String,
    pub connection_type: ConnectionType,
    pub results: Vec<TestCaseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<Sample>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TableReport {
    pub fn count(&self, status: TestStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn has_failures(&self) -> bool {
        self.results.iter().any(|r| r.status != TestStatus::Success)
    }
}

/// A table whose run never started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableError {
    pub table: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tables: Vec<TableReport>,
    pub configuration_errors: Vec<TableError>,
    /// Tables left unprocessed after cancellation
    pub skipped: Vec<String>,
}

impl RunSummary {
    fn start() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            tables: Vec::new(),
            configuration_errors: Vec::new(),
            skipped: Vec::new(),
        }
    }

    fn record(&mut self, table: String, outcome: Result<TableReport>) {
        match outcome {
            Ok(report) => self.tables.push(report),
            Err(e) => {
                warn!("Table {} was not run: {}", table, e);
                self.configuration_errors.push(TableError {
                    table,
                    message: e.to_string(),
                });
            }
        }
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        info!(
            "Run {} finished: {} table(s), {} passed, {} failed, {} aborted, {} not run",
            self.run_id,
            self.tables.len(),
            self.count(TestStatus::Success),
            self.count(TestStatus::Failed),
            self.count(TestStatus::Aborted),
            self.configuration_errors.len() + self.skipped.len()
        );
        self
    }

    pub fn count(&self, status: TestStatus) -> usize {
        self.tables.iter().map(|t| t.count(status)).sum()
    }

    /// True when any test failed or aborted, or any table could not run.
    pub fn has_failures(&self) -> bool {
        !self.configuration_errors.is_empty() || self.tables.iter().any(TableReport::has_failures)
    }

    pub fn is_cancelled(&self) -> bool {
        !self.skipped.is_empty()
    }
}

/// Shared stop signal, checked between table runs.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs test suites table by table.
pub struct TestSuiteRunner {
    registry: Arc<BackendRegistry>,
    connector: Arc<dyn ConnectionBuilder>,
    cache: MetricCache,
    include_sample: bool,
}

impl TestSuiteRunner {
    pub fn new(registry: Arc<BackendRegistry>, connector: Arc<dyn ConnectionBuilder>) -> Self {
        Self {
            registry,
            connector,
            cache: MetricCache::new(),
            include_sample: false,
        }
    }

    /// Attach the bounded sample to each table report.
    pub fn with_include_sample(mut self, include_sample: bool) -> Self {
        self.include_sample = include_sample;
        self
    }

    pub fn cache(&self) -> &MetricCache {
        &self.cache
    }

    /// Runs every test case of one table.
    ///
    /// Returns `Err` only for configuration errors; everything else is
    /// reported as aborted test cases.
    pub async fn run_table(&mut self, job: &TableJob) -> Result<TableReport> {
        self.cache.reset();
        let started_at = Utc::now();
        let table_name = job.table.fully_qualified_name();

        job.validate()?;
        let key = job.registry_key();
        let sampler_factory = self.registry.sampler_factory(key)?;
        let evaluator_factory = self.registry.evaluator_factory(key)?;

        info!(
            "Running {} test case(s) for {} on {}",
            job.test_cases.len(),
            table_name,
            job.connection.connection_type
        );

        let handle = match self.connector.connect(&job.connection, &job.table).await {
            Ok(handle) => handle,
            Err(e) if e.is_configuration() => return Err(e),
            Err(e) => {
                warn!("Could not reach {}: {}", table_name, e);
                return Ok(aborted_report(job, &e, started_at));
            }
        };

        let outcome = self
            .evaluate(job, &handle, sampler_factory, evaluator_factory, started_at)
            .await;

        if let Err(e) = handle.release().await {
            warn!("Failed to release connection for {}: {}", table_name, e);
        }
        outcome
    }

    async fn evaluate(
        &mut self,
        job: &TableJob,
        handle: &BackendHandle,
        sampler_factory: registry::SamplerFactory,
        evaluator_factory: registry::EvaluatorFactory,
        started_at: DateTime<Utc>,
    ) -> Result<TableReport> {
        let mapping = build_mapping(job, handle)?;
        let ctx = BackendContext {
            handle,
            table: &job.table,
            mapping,
        };

        let built = sampler_factory(&ctx, job.sample.clone())
            .and_then(|sampler| evaluator_factory(&ctx, sampler));
        let mut evaluator = match built {
            Ok(evaluator) => evaluator,
            Err(e) if e.is_configuration() => return Err(e),
            Err(e) => {
                warn!("Cannot evaluate {}: {}", job.table.fully_qualified_name(), e);
                return Ok(aborted_report(job, &e, started_at));
            }
        };
        debug!(
            "Using {} evaluator for {}",
            evaluator.name(),
            job.table.fully_qualified_name()
        );

        let mut results = Vec::with_capacity(job.test_cases.len());
        for test_case in &job.test_cases {
            let mut state = TestCaseState::Pending;
            let result = self.evaluate_case(job, test_case, evaluator.as_mut()).await;
            debug!("Test case {} finished: {}", test_case.name, result.status);
            state.finish(result)?;
            if let Some(result) = state.into_result() {
                results.push(result);
            }
        }

        let sample = if self.include_sample {
            match evaluator.sample().await {
                Ok(sample) => Some(sample),
                Err(e) => {
                    warn!("Could not fetch sample for {}: {}", job.table.fully_qualified_name(), e);
                    None
                }
            }
        } else {
            None
        };

        if let Err(e) = evaluator.release().await {
            warn!("Failed to release sampler for {}: {}", job.table.fully_qualified_name(), e);
        }

        Ok(TableReport {
            table: job.table.fully_qualified_name(),
            connection_type: job.connection.connection_type,
            results,
            sample,
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn evaluate_case(
        &mut self,
        job: &TableJob,
        test_case: &TestCaseDefinition,
        evaluator: &mut dyn TestSuiteEvaluator,
    ) -> TestCaseResult {
        let metric = match test_case.metric.bind(test_case.column.as_deref()) {
            Ok(metric) => metric,
            Err(e) => return TestCaseResult::from_error(test_case, &e),
        };

        let key = MetricKey::new(&job.table, metric.kind(), metric.column());
        let outcome = match self.cache.get(&key) {
            Some(outcome) => outcome,
            None => match evaluator.compute(metric.as_ref()).await {
                Ok(outcome) => {
                    self.cache.insert(key, outcome.clone());
                    outcome
                }
                Err(e) => {
                    warn!(
                        "Metric {} failed for test case {}: {}",
                        metric.name(),
                        test_case.name,
                        e
                    );
                    return TestCaseResult::from_error(test_case, &e);
                }
            },
        };

        match outcome {
            MetricOutcome::Computed(value) => match test_case.assertion.check(&value) {
                Ok(check) if check.passed => TestCaseResult::success(test_case, value, check.message),
                Ok(check) => TestCaseResult::failed(test_case, value, check.message),
                Err(e) => TestCaseResult::from_error(test_case, &e),
            },
            MetricOutcome::Empty => {
                let message = format!("metric {} produced no value", metric.name());
                TestCaseResult::aborted(test_case, message.clone(), message)
            }
            MetricOutcome::NotApplicable(reason) => {
                TestCaseResult::aborted(test_case, reason.clone(), reason)
            }
        }
    }

    /// Runs the plan one table after another.
    ///
    /// Cancellation is checked before each table; remaining tables are listed
    /// as skipped.
    pub async fn run_plan(&mut self, plan: &RunPlan, cancel: &CancellationFlag) -> RunSummary {
        let mut summary = RunSummary::start();
        for job in &plan.tables {
            let table = job.table.fully_qualified_name();
            if cancel.is_cancelled() {
                summary.skipped.push(table);
                continue;
            }
            let outcome = self.run_table(job).await;
            summary.record(table, outcome);
        }
        summary.finish()
    }

    /// Runs up to `concurrency` tables at once, each in an independent runner
    /// with its own cache and connection.
    pub async fn run_concurrent(
        &self,
        plan: &RunPlan,
        concurrency: usize,
        cancel: &CancellationFlag,
    ) -> RunSummary {
        let mut summary = RunSummary::start();

        let mut outcomes: Vec<(usize, String, Option<Result<TableReport>>)> =
            futures::stream::iter(plan.tables.iter().enumerate())
                .map(|(index, job)| {
                    let mut runner =
                        TestSuiteRunner::new(Arc::clone(&self.registry), Arc::clone(&self.connector))
                            .with_include_sample(self.include_sample);
                    let cancel = cancel.clone();
                    async move {
                        let table = job.table.fully_qualified_name();
                        if cancel.is_cancelled() {
                            return (index, table, None);
                        }
                        let outcome = runner.run_table(job).await;
                        (index, table, Some(outcome))
                    }
                })
                .buffer_unordered(concurrency.max(1))
                .collect()
                .await;

        outcomes.sort_by_key(|(index, _, _)| *index);
        for (_, table, outcome) in outcomes {
            match outcome {
                Some(outcome) => summary.record(table, outcome),
                None => summary.skipped.push(table),
            }
        }
        summary.finish()
    }
}

/// Quoted names for relational backends, shared by sampler and evaluator.
fn build_mapping(job: &TableJob, handle: &BackendHandle) -> Result<Option<Arc<TableMapping>>> {
    if !job.connection.connection_type.requires_table_mapping() {
        return Ok(None);
    }
    match handle {
        BackendHandle::Sql(source) => Ok(Some(Arc::new(TableMapping::new(
            &job.table,
            source.dialect(),
        )))),
        other => Err(ProbeError::configuration(format!(
            "{} tables need a relational handle, got {:?}",
            job.connection.connection_type, other
        ))),
    }
}

/// Every test case aborted by the same error.
fn aborted_report(job: &TableJob, error: &ProbeError, started_at: DateTime<Utc>) -> TableReport {
    TableReport {
        table: job.table.fully_qualified_name(),
        connection_type: job.connection.connection_type,
        results: job
            .test_cases
            .iter()
            .map(|test_case| TestCaseResult::from_error(test_case, error))
            .collect(),
        sample: None,
        started_at,
        finished_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests;
