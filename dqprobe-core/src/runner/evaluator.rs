//! Evaluators compute metrics for one table run.
//!
//! Each evaluator owns the sampler built for the run and materializes the
//! sampled data at most once; every metric in the run reads that copy.

use super::cache::MetricOutcome;
use crate::adapters::sql::{SqlSource, TableMapping};
use crate::adapters::{NoSqlAdaptor, SourceCapability};
use crate::metrics::{Metric, MetricKind, MetricValue, Pushdown, QueryContext};
use crate::models::{DataType, Sample, TableReference};
use crate::sampling::frame::materialize;
use crate::sampling::{DataFrameChunk, SampledData, Sampler};
use crate::{ProbeError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Computes metrics against one backend.
#[async_trait]
pub trait TestSuiteEvaluator: Send {
    fn name(&self) -> &'static str;

    /// Computes one metric.
    async fn compute(&mut self, metric: &dyn Metric) -> Result<MetricOutcome>;

    /// Bounded sample for reporting.
    async fn sample(&mut self) -> Result<Sample>;

    /// Releases the sampler and any buffered data.
    async fn release(&mut self) -> Result<()>;
}

/// Declared type of `column`, or one inferred from sampled values.
fn resolve_column_type(
    table: &TableReference,
    mapping: Option<&TableMapping>,
    sample: Option<&Sample>,
    column: &str,
) -> DataType {
    let declared = mapping
        .and_then(|m| m.column(column))
        .or_else(|| table.column(column))
        .map_or(DataType::Unknown, |c| c.data_type);
    if declared != DataType::Unknown {
        return declared;
    }
    sample
        .and_then(|s| s.column_values(column))
        .map_or(DataType::Unknown, DataType::infer)
}

fn not_applicable(metric: &dyn Metric, column: &str, data_type: DataType) -> MetricOutcome {
    let reason = format!(
        "metric {} does not apply to column '{}' of type {:?}",
        metric.name(),
        column,
        data_type
    );
    debug!("{}", reason);
    MetricOutcome::NotApplicable(reason)
}

/// Maps the single value of a pushed-down query to an outcome.
fn scalar_outcome(metric: &dyn Metric, value: Value) -> Result<MetricOutcome> {
    let computed = match value {
        Value::Null => return Ok(MetricOutcome::Empty),
        Value::Number(n) => n.as_f64().map(MetricValue::Number),
        Value::String(s) => Some(MetricValue::Text(s)),
        Value::Bool(b) => Some(MetricValue::Bool(b)),
        Value::Array(_) | Value::Object(_) => None,
    };
    computed.map(MetricOutcome::Computed).ok_or_else(|| {
        ProbeError::query_failed(format!("{} query returned a non-scalar value", metric.name()))
    })
}

/// Computes a metric over an in-memory sample.
fn compute_local(
    table: &TableReference,
    mapping: Option<&TableMapping>,
    sample: &Sample,
    metric: &dyn Metric,
) -> Result<MetricOutcome> {
    if let Some(column) = metric.column() {
        if sample.column_index(column).is_none() {
            return Err(ProbeError::query_failed(format!(
                "column '{}' not found in {}",
                column,
                table.fully_qualified_name()
            )));
        }
        let data_type = resolve_column_type(table, mapping, Some(sample), column);
        if !metric.applies_to(data_type) {
            return Ok(not_applicable(metric, column, data_type));
        }
    }
    Ok(metric
        .local(sample)
        .map_or(MetricOutcome::Empty, MetricOutcome::Computed))
}

/// Evaluates metrics over sampled in-memory chunks.
pub struct LocalEvaluator {
    table: TableReference,
    sampler: Box<dyn Sampler>,
    data: Option<Sample>,
}

impl LocalEvaluator {
    pub fn new(table: TableReference, sampler: Box<dyn Sampler>) -> Self {
        Self {
            table,
            sampler,
            data: None,
        }
    }

    /// All sampled rows, without the `sample_limit` bound.
    async fn data(&mut self) -> Result<&Sample> {
        if self.data.is_none() {
            let frames = match self.sampler.random_sample().await? {
                SampledData::Frames(frames) => frames,
                SampledData::Query(_) => {
                    return Err(ProbeError::unsupported_feature(
                        "query sampling",
                        "local evaluation",
                    ));
                }
            };
            let sample = materialize(&frames, None);
            debug!(
                "Materialized {} sampled rows of {}",
                sample.len(),
                self.table.fully_qualified_name()
            );
            self.data = Some(sample);
        }
        self.data
            .as_ref()
            .ok_or_else(|| ProbeError::query_failed("sampled data was not materialized"))
    }
}

#[async_trait]
impl TestSuiteEvaluator for LocalEvaluator {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn compute(&mut self, metric: &dyn Metric) -> Result<MetricOutcome> {
        let table = self.table.clone();
        let data = self.data().await?;
        compute_local(&table, None, data, metric)
    }

    /// Leading rows of the materialized data, so the report shows rows the
    /// metrics were computed over.
    async fn sample(&mut self) -> Result<Sample> {
        let limit = self.sampler.sample_config().sample_limit;
        Ok(self.data().await?.head(limit))
    }

    async fn release(&mut self) -> Result<()> {
        self.data = None;
        self.sampler.release().await
    }
}

/// Document stores: row counts from the store, everything else locally.
pub struct DocumentEvaluator {
    adaptor: Arc<dyn NoSqlAdaptor>,
    local: LocalEvaluator,
}

impl DocumentEvaluator {
    pub fn new(
        adaptor: Arc<dyn NoSqlAdaptor>,
        table: TableReference,
        sampler: Box<dyn Sampler>,
    ) -> Self {
        Self {
            adaptor,
            local: LocalEvaluator::new(table, sampler),
        }
    }
}

#[async_trait]
impl TestSuiteEvaluator for DocumentEvaluator {
    fn name(&self) -> &'static str {
        "document"
    }

    #[allow(clippy::cast_precision_loss)]
    async fn compute(&mut self, metric: &dyn Metric) -> Result<MetricOutcome> {
        if metric.kind() == MetricKind::RowCount
            && self.adaptor.supports(SourceCapability::RowCount)
        {
            let count = self.adaptor.row_count(&self.local.table).await?;
            return Ok(MetricOutcome::Computed(MetricValue::Number(count as f64)));
        }
        self.local.compute(metric).await
    }

    async fn sample(&mut self) -> Result<Sample> {
        self.local.sample().await
    }

    async fn release(&mut self) -> Result<()> {
        self.local.release().await
    }
}

/// Relational sources: metrics run as queries over the sampled query.
///
/// When the dialect cannot express a metric, it is computed locally over
/// every row of the sampled query instead, with a warning.
pub struct SqlEvaluator {
    source: Arc<dyn SqlSource>,
    mapping: Arc<TableMapping>,
    table: TableReference,
    sampler: Box<dyn Sampler>,
    query: Option<String>,
    fallback: Option<Sample>,
}

impl SqlEvaluator {
    pub fn new(
        source: Arc<dyn SqlSource>,
        mapping: Arc<TableMapping>,
        table: TableReference,
        sampler: Box<dyn Sampler>,
    ) -> Self {
        Self {
            source,
            mapping,
            table,
            sampler,
            query: None,
            fallback: None,
        }
    }

    /// The sampled query, built once per run.
    async fn sampled_query(&mut self) -> Result<String> {
        if let Some(query) = &self.query {
            return Ok(query.clone());
        }
        let query = match self.sampler.random_sample().await? {
            SampledData::Query(query) => query,
            SampledData::Frames(_) => {
                return Err(ProbeError::unsupported_feature(
                    "in-memory sampling",
                    self.mapping.dialect.name(),
                ));
            }
        };
        self.query = Some(query.clone());
        Ok(query)
    }

    /// Every row of the sampled query, not only the first `sample_limit`.
    async fn fallback_sample(&mut self) -> Result<&Sample> {
        if self.fallback.is_none() {
            let query = self.sampled_query().await?;
            let records = self.source.fetch_rows(&query, usize::MAX).await?;
            let sample = if records.is_empty() {
                Sample::new(self.mapping.column_names())
            } else {
                materialize(&[DataFrameChunk::from_records(records)], None)
            };
            debug!(
                "Fetched {} sampled rows of {} for local evaluation",
                sample.len(),
                self.mapping.qualified_name
            );
            self.fallback = Some(sample);
        }
        self.fallback
            .as_ref()
            .ok_or_else(|| ProbeError::query_failed("fallback sample was not fetched"))
    }
}

#[async_trait]
impl TestSuiteEvaluator for SqlEvaluator {
    fn name(&self) -> &'static str {
        "sql"
    }

    async fn compute(&mut self, metric: &dyn Metric) -> Result<MetricOutcome> {
        let from = format!("({}) AS sampled", self.sampled_query().await?);
        let column_type = metric.column().map_or(DataType::Unknown, |column| {
            resolve_column_type(&self.table, Some(self.mapping.as_ref()), None, column)
        });
        let ctx = QueryContext {
            dialect: self.mapping.dialect,
            from: &from,
            column_type,
        };

        match metric.pushdown(&ctx) {
            Pushdown::Query(sql) => scalar_outcome(metric, self.source.fetch_scalar(&sql).await?),
            Pushdown::NotApplicable(reason) => {
                debug!("Skipping {} on {}: {}", metric.name(), self.mapping.qualified_name, reason);
                Ok(MetricOutcome::NotApplicable(reason))
            }
            Pushdown::Unsupported(reason) => {
                warn!(
                    "Computing {} for {} locally over the sample: {}",
                    metric.name(),
                    self.mapping.qualified_name,
                    reason
                );
                let table = self.table.clone();
                let mapping = Arc::clone(&self.mapping);
                let sample = self.fallback_sample().await?;
                compute_local(&table, Some(mapping.as_ref()), sample, metric)
            }
        }
    }

    async fn sample(&mut self) -> Result<Sample> {
        match &self.fallback {
            Some(sample) => Ok(sample.head(self.sampler.sample_config().sample_limit)),
            None => self.sampler.fetch_sample_data().await,
        }
    }

    async fn release(&mut self) -> Result<()> {
        self.fallback = None;
        self.query = None;
        self.sampler.release().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::adapters::sql::SqlDialect;
    use crate::sampling::{DataFrameChunk, DataFrameSampler, SampleConfig};
    use serde_json::{Map, json};
    use std::sync::Mutex;

    fn frames_evaluator(rows: Vec<Value>) -> LocalEvaluator {
        frames_evaluator_with(rows, SampleConfig::new())
    }

    fn frames_evaluator_with(rows: Vec<Value>, config: SampleConfig) -> LocalEvaluator {
        let table = TableReference::new("events");
        let records = rows.into_iter().filter_map(|r| match r {
            Value::Object(map) => Some(map),
            _ => None,
        });
        let chunk = DataFrameChunk::from_records(records);
        let sampler =
            DataFrameSampler::new(table.clone(), vec![chunk], config).unwrap();
        LocalEvaluator::new(table, Box::new(sampler))
    }

    #[tokio::test]
    async fn test_local_evaluator_uses_all_sampled_rows() {
        let rows = (0..80).map(|i| json!({"n": i})).collect();
        let mut evaluator = frames_evaluator(rows);

        let row_count = MetricKind::RowCount.bind(None).unwrap();
        assert_eq!(
            evaluator.compute(row_count.as_ref()).await.unwrap(),
            MetricOutcome::Computed(MetricValue::Number(80.0))
        );
        // the report sample stays bounded
        assert_eq!(evaluator.sample().await.unwrap().len(), 50);
    }

    #[tokio::test]
    async fn test_local_report_sample_comes_from_computed_rows() {
        let rows = (0..400).map(|i| json!({"n": i})).collect();
        let mut evaluator = frames_evaluator_with(rows, SampleConfig::percentage(50.0));

        let row_count = MetricKind::RowCount.bind(None).unwrap();
        evaluator.compute(row_count.as_ref()).await.unwrap();
        let data = evaluator.data.clone().unwrap();

        let first = evaluator.sample().await.unwrap();
        assert_eq!(first.len(), data.len().min(50));
        assert_eq!(first.rows[..], data.rows[..first.len()]);
        assert_eq!(evaluator.sample().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_local_evaluator_infers_types() {
        let rows = vec![json!({"name": "a"}), json!({"name": "b"})];
        let mut evaluator = frames_evaluator(rows);

        let mean = MetricKind::Mean.bind(Some("name")).unwrap();
        assert!(matches!(
            evaluator.compute(mean.as_ref()).await.unwrap(),
            MetricOutcome::NotApplicable(_)
        ));

        let missing = MetricKind::Mean.bind(Some("price")).unwrap();
        assert!(evaluator.compute(missing.as_ref()).await.is_err());
    }

    struct ScriptedSource {
        dialect: SqlDialect,
        scalar: Value,
        queries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SqlSource for ScriptedSource {
        fn dialect(&self) -> SqlDialect {
            self.dialect
        }

        async fn fetch_rows(&self, sql: &str, limit: usize) -> Result<Vec<Map<String, Value>>> {
            self.queries.lock().unwrap().push(sql.to_string());
            Ok((1..=80)
                .take(limit)
                .filter_map(|i| match json!({"price": i}) {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect())
        }

        async fn fetch_scalar(&self, sql: &str) -> Result<Value> {
            self.queries.lock().unwrap().push(sql.to_string());
            Ok(self.scalar.clone())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn sql_evaluator(dialect: SqlDialect, scalar: Value) -> (Arc<ScriptedSource>, SqlEvaluator) {
        let table = TableReference::new("orders").with_column("price", DataType::Float);
        let source = Arc::new(ScriptedSource {
            dialect,
            scalar,
            queries: Mutex::new(Vec::new()),
        });
        let mapping = Arc::new(TableMapping::new(&table, dialect));
        let sampler = crate::adapters::sql::SqlSampler::new(
            source.clone(),
            mapping.clone(),
            table.clone(),
            SampleConfig::new(),
        )
        .unwrap();
        let evaluator = SqlEvaluator::new(source.clone(), mapping, table, Box::new(sampler));
        (source, evaluator)
    }

    #[tokio::test]
    async fn test_sql_evaluator_pushes_down_over_sampled_query() {
        let (source, mut evaluator) = sql_evaluator(SqlDialect::Postgres, json!(2.5));
        let median = MetricKind::Median.bind(Some("price")).unwrap();

        assert_eq!(
            evaluator.compute(median.as_ref()).await.unwrap(),
            MetricOutcome::Computed(MetricValue::Number(2.5))
        );
        let queries = source.queries.lock().unwrap();
        assert_eq!(queries.len(), 1);
        assert!(queries[0].contains("percentile_cont(0.5)"));
        assert!(queries[0].ends_with("FROM (SELECT * FROM \"orders\") AS sampled"));
    }

    #[tokio::test]
    async fn test_sql_evaluator_falls_back_to_local_without_window_functions() {
        let dialect = SqlDialect::Sqlite {
            window_functions: false,
        };
        let (source, mut evaluator) = sql_evaluator(dialect, Value::Null);
        let median = MetricKind::Median.bind(Some("price")).unwrap();

        // all 80 sampled rows, not the first 50
        assert_eq!(
            evaluator.compute(median.as_ref()).await.unwrap(),
            MetricOutcome::Computed(MetricValue::Number(40.5))
        );
        // the fallback sample is fetched once and reused
        evaluator.compute(median.as_ref()).await.unwrap();
        assert_eq!(source.queries.lock().unwrap().len(), 1);

        assert_eq!(evaluator.sample().await.unwrap().len(), 50);
        assert_eq!(source.queries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sql_evaluator_date_extremes_are_text() {
        let (source, mut evaluator) = sql_evaluator(SqlDialect::Postgres, json!("2000-01-01"));
        let min = MetricKind::Min.bind(Some("price")).unwrap();

        assert_eq!(
            evaluator.compute(min.as_ref()).await.unwrap(),
            MetricOutcome::Computed(MetricValue::Text("2000-01-01".into()))
        );
        assert!(source.queries.lock().unwrap()[0].starts_with("SELECT MIN(\"price\") AS value"));
    }

    #[tokio::test]
    async fn test_sql_evaluator_rejects_non_scalar_results() {
        let (_, mut evaluator) = sql_evaluator(SqlDialect::Postgres, json!([1, 2]));
        let max = MetricKind::Max.bind(Some("price")).unwrap();
        assert!(evaluator.compute(max.as_ref()).await.is_err());
    }

    #[tokio::test]
    async fn test_sql_evaluator_null_scalar_is_empty() {
        let (_, mut evaluator) = sql_evaluator(SqlDialect::Postgres, Value::Null);
        let mean = MetricKind::Mean.bind(Some("price")).unwrap();
        assert_eq!(
            evaluator.compute(mean.as_ref()).await.unwrap(),
            MetricOutcome::Empty
        );
    }
}
