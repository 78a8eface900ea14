#![allow(clippy::unwrap_used)]

use super::*;
use crate::adapters::{NoSqlAdaptor, SourceCapability};
use crate::metrics::{MetricKind, MetricValue};
use crate::models::DataType;
use crate::sampling::DataFrameChunk;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::atomic::AtomicUsize;

/// Document store whose counts come from a fixed list, or fail.
struct FakeStore {
    count: Option<u64>,
    count_calls: AtomicUsize,
    closed: AtomicUsize,
}

impl FakeStore {
    fn counting(count: u64) -> Arc<Self> {
        Arc::new(Self {
            count: Some(count),
            count_calls: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        })
    }

    fn broken() -> Arc<Self> {
        Arc::new(Self {
            count: None,
            count_calls: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl NoSqlAdaptor for FakeStore {
    fn source_type(&self) -> ConnectionType {
        ConnectionType::MongoDB
    }

    async fn row_count(&self, table: &TableReference) -> Result<u64> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        self.count.ok_or_else(|| {
            ProbeError::source_failed(
                format!("Failed to count documents in '{}'", table.name),
                std::io::Error::other("server selection timed out"),
            )
        })
    }

    fn supports(&self, _capability: SourceCapability) -> bool {
        true
    }

    async fn sample_documents(
        &self,
        _table: &TableReference,
        _limit: Option<u64>,
    ) -> Result<Vec<Map<String, Value>>> {
        Ok(Vec::new())
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out a fixed backend handle, or a connection error.
struct FixedConnector {
    handle: Option<BackendHandle>,
    connects: AtomicUsize,
}

impl FixedConnector {
    fn new(handle: BackendHandle) -> Arc<Self> {
        Arc::new(Self {
            handle: Some(handle),
            connects: AtomicUsize::new(0),
        })
    }

    fn unreachable() -> Arc<Self> {
        Arc::new(Self {
            handle: None,
            connects: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ConnectionBuilder for FixedConnector {
    async fn connect(
        &self,
        _descriptor: &ConnectionDescriptor,
        _table: &TableReference,
    ) -> Result<BackendHandle> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.handle.clone().ok_or_else(|| {
            ProbeError::connection_failed(
                "Failed to reach orders",
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused"),
            )
        })
    }
}

fn runner(connector: Arc<dyn ConnectionBuilder>) -> TestSuiteRunner {
    TestSuiteRunner::new(Arc::new(BackendRegistry::with_defaults()), connector)
}

fn between(min: f64, max: f64) -> Assertion {
    Assertion::Between {
        min_value: Some(min),
        max_value: Some(max),
    }
}

fn mongo_job(name: &str) -> TableJob {
    TableJob::new(
        TableReference::new(name).with_schema("shop"),
        ConnectionDescriptor::new(ConnectionType::MongoDB, "mongodb://localhost:27017/shop"),
    )
}

fn frames_handle(values: &[i64]) -> BackendHandle {
    let records = values.iter().map(|v| match json!({ "amount": v }) {
        Value::Object(map) => map,
        _ => unreachable!(),
    });
    BackendHandle::Frames(vec![DataFrameChunk::from_records(records)])
}

fn datalake_job() -> TableJob {
    TableJob::new(
        TableReference::new("payments").with_column("amount", DataType::Integer),
        ConnectionDescriptor::new(ConnectionType::Datalake, "/data/lake"),
    )
}

#[tokio::test]
async fn test_adaptor_error_aborts_with_trace() {
    let store = FakeStore::broken();
    let connector = FixedConnector::new(BackendHandle::Document(store.clone()));
    let job = mongo_job("orders").with_test_case(TestCaseDefinition::new(
        "has rows",
        MetricKind::RowCount,
        between(1.0, 100.0),
    ));

    let report = runner(connector).run_table(&job).await.unwrap();

    let result = &report.results[0];
    assert_eq!(result.status, TestStatus::Aborted);
    assert!(result.metric_value.is_none());
    let trace = result.diagnostic_trace.as_deref().unwrap();
    assert!(trace.contains("server selection timed out"));
    assert_eq!(store.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_assertion_miss_fails_without_trace() {
    let connector = FixedConnector::new(frames_handle(&[1, 2, 3, 4]));
    let job = datalake_job()
        .with_test_case(
            TestCaseDefinition::new("median in range", MetricKind::Median, between(2.0, 3.0))
                .with_column("amount"),
        )
        .with_test_case(
            TestCaseDefinition::new("sum too small", MetricKind::Sum, between(0.0, 5.0))
                .with_column("amount"),
        );

    let report = runner(connector).run_table(&job).await.unwrap();

    assert_eq!(report.results[0].status, TestStatus::Success);
    assert_eq!(report.results[0].metric_value, Some(MetricValue::Number(2.5)));

    let failed = &report.results[1];
    assert_eq!(failed.status, TestStatus::Failed);
    assert_eq!(failed.metric_value, Some(MetricValue::Number(10.0)));
    assert!(failed.diagnostic_trace.is_none());
    assert!(report.has_failures());
}

#[tokio::test]
async fn test_not_applicable_metric_aborts_with_message() {
    let records = [json!({"label": "a"}), json!({"label": "b"})]
        .into_iter()
        .filter_map(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        });
    let connector = FixedConnector::new(BackendHandle::Frames(vec![
        DataFrameChunk::from_records(records),
    ]));
    let job = TableJob::new(
        TableReference::new("labels"),
        ConnectionDescriptor::new(ConnectionType::Datalake, "/data/lake"),
    )
    .with_test_case(
        TestCaseDefinition::new("label mean", MetricKind::Mean, between(0.0, 1.0))
            .with_column("label"),
    );

    let report = runner(connector).run_table(&job).await.unwrap();
    let result = &report.results[0];
    assert_eq!(result.status, TestStatus::Aborted);
    assert!(result.message.contains("does not apply"));
}

#[tokio::test]
async fn test_configuration_error_stops_before_connecting() {
    let connector = FixedConnector::new(frames_handle(&[1]));
    let job = datalake_job().with_sample(
        SampleConfig::percentage(10.0)
            .with_custom_selection("amount > 1")
            .with_partition(crate::sampling::PartitionConfig::integer_range("amount", 0, 5)),
    );

    let err = runner(connector.clone()).run_table(&job).await.unwrap_err();
    assert!(err.is_configuration());
    assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_handle_released_when_configuration_fails_after_connect() {
    let store = FakeStore::counting(3);
    let connector = FixedConnector::new(BackendHandle::Document(store.clone()));
    // a relational job that receives a document handle
    let job = TableJob::new(
        TableReference::new("orders"),
        ConnectionDescriptor::new(ConnectionType::Postgres, "postgres://localhost/db"),
    );

    let err = runner(connector).run_table(&job).await.unwrap_err();
    assert!(err.is_configuration());
    assert_eq!(store.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unreachable_source_aborts_every_case() {
    let job = mongo_job("orders")
        .with_test_case(TestCaseDefinition::new(
            "rows",
            MetricKind::RowCount,
            between(0.0, 10.0),
        ))
        .with_test_case(
            TestCaseDefinition::new(
                "ids",
                MetricKind::DistinctCount,
                Assertion::Equals {
                    expected: json!(3),
                },
            )
            .with_column("_id"),
        );

    let report = runner(FixedConnector::unreachable()).run_table(&job).await.unwrap();
    assert_eq!(report.count(TestStatus::Aborted), 2);
    assert!(
        report.results[0]
            .diagnostic_trace
            .as_deref()
            .unwrap()
            .contains("connection refused")
    );
}

#[tokio::test]
async fn test_metric_is_computed_once_per_run() {
    let store = FakeStore::counting(3);
    let connector = FixedConnector::new(BackendHandle::Document(store.clone()));
    let job = mongo_job("orders")
        .with_test_case(TestCaseDefinition::new(
            "exactly three",
            MetricKind::RowCount,
            Assertion::Equals {
                expected: json!(3),
            },
        ))
        .with_test_case(TestCaseDefinition::new(
            "at most ten",
            MetricKind::RowCount,
            Assertion::Expression {
                expression: "value <= 10".into(),
            },
        ));

    let mut runner = runner(connector);
    let report = runner.run_table(&job).await.unwrap();

    assert_eq!(report.count(TestStatus::Success), 2);
    assert_eq!(store.count_calls.load(Ordering::SeqCst), 1);
    assert_eq!(runner.cache().hits(), 1);

    // the cache does not survive into the next run
    runner.run_table(&job).await.unwrap();
    assert_eq!(store.count_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_include_sample_attaches_bounded_sample() {
    let values: Vec<i64> = (0..120).collect();
    let connector = FixedConnector::new(frames_handle(&values));
    let job = datalake_job().with_sample(SampleConfig::new().with_sample_limit(10));

    let report = runner(connector)
        .with_include_sample(true)
        .run_table(&job)
        .await
        .unwrap();
    assert_eq!(report.sample.unwrap().len(), 10);
}

#[tokio::test]
async fn test_run_plan_records_configuration_errors_and_cancellation() {
    let connector = FixedConnector::new(frames_handle(&[1, 2]));
    let good = datalake_job().with_test_case(
        TestCaseDefinition::new("rows", MetricKind::RowCount, between(2.0, 2.0)),
    );
    let bad = datalake_job().with_sample(SampleConfig::new().with_sample_limit(0));
    let plan = RunPlan {
        name: None,
        tables: vec![good.clone(), bad],
    };

    let mut runner = runner(connector);
    let summary = runner.run_plan(&plan, &CancellationFlag::new()).await;
    assert_eq!(summary.tables.len(), 1);
    assert_eq!(summary.count(TestStatus::Success), 1);
    assert_eq!(summary.configuration_errors.len(), 1);
    assert!(summary.has_failures());

    let cancel = CancellationFlag::new();
    cancel.cancel();
    let summary = runner.run_plan(&plan, &cancel).await;
    assert!(summary.tables.is_empty());
    assert_eq!(summary.skipped.len(), 2);
    assert!(summary.is_cancelled());
}

#[tokio::test]
async fn test_run_concurrent_keeps_plan_order() {
    let connector = FixedConnector::new(frames_handle(&[5, 6, 7]));
    let tables = (0..6)
        .map(|i| {
            let mut job = datalake_job().with_test_case(TestCaseDefinition::new(
                "rows",
                MetricKind::RowCount,
                Assertion::Equals {
                    expected: json!(3),
                },
            ));
            job.table.name = format!("payments_{}", i);
            job
        })
        .collect();
    let plan = RunPlan { name: None, tables };

    let summary = runner(connector.clone())
        .run_concurrent(&plan, 3, &CancellationFlag::new())
        .await;

    let names: Vec<&str> = summary.tables.iter().map(|t| t.table.as_str()).collect();
    assert_eq!(
        names,
        vec!["payments_0", "payments_1", "payments_2", "payments_3", "payments_4", "payments_5"]
    );
    assert!(!summary.has_failures());
    assert_eq!(connector.connects.load(Ordering::SeqCst), 6);
}

#[test]
fn test_run_plan_from_json() {
    let plan = RunPlan::from_json(
        r#"{
            "tables": [{
                "table": {"name": "orders", "schema": "shop"},
                "connection": {"connection_type": "mongodb", "url": "mongodb://localhost/shop"},
                "sample": {"mode": "fixed_count", "value": 100},
                "test_cases": [{
                    "name": "has rows",
                    "metric": "row_count",
                    "assertion": {"type": "between", "min_value": 1}
                }]
            }]
        }"#,
    )
    .unwrap();

    let job = &plan.tables[0];
    assert_eq!(job.service, ServiceCategory::Database);
    assert_eq!(job.sample.sample_limit, 50);
    assert_eq!(job.registry_key().1, ConnectionType::MongoDB);
    job.validate().unwrap();

    assert!(RunPlan::from_json("{\"tables\": 3}").is_err());
}

#[test]
fn test_duplicate_test_case_names_are_rejected() {
    let case = TestCaseDefinition::new("rows", MetricKind::RowCount, between(0.0, 1.0));
    let job = datalake_job().with_test_case(case.clone()).with_test_case(case);
    assert!(job.validate().unwrap_err().is_configuration());
}
