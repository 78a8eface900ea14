//! MongoDB test-suite runs using testcontainers.

#![cfg(feature = "mongodb")]
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use dqprobe_core::adapters::NoSqlAdaptor;
use dqprobe_core::adapters::mongodb::MongoAdaptor;
use dqprobe_core::{
    Assertion, BackendRegistry, ConnectionDescriptor, ConnectionType, DefaultConnectionBuilder,
    MetricKind, SampleConfig, TableJob, TableReference, TestCaseDefinition, TestStatus,
    TestSuiteRunner,
};
use mongodb::bson::doc;
use serde_json::json;
use std::sync::Arc;
use testcontainers_modules::mongo::Mongo;
use testcontainers_modules::testcontainers::runners::AsyncRunner;

async fn insert_orders(connection_string: &str) {
    let client = mongodb::Client::with_uri_str(connection_string)
        .await
        .expect("Failed to connect to MongoDB");

    client
        .database("shop")
        .collection::<mongodb::bson::Document>("orders")
        .insert_many(vec![
            doc! { "sku": "pen", "amount": 2.0 },
            doc! { "sku": "ink", "amount": 4.0 },
            doc! { "sku": "pad", "amount": mongodb::bson::Bson::Null },
        ])
        .await
        .expect("Failed to insert documents");
}

fn row_count_job(connection_string: &str, expected: u64) -> TableJob {
    TableJob::new(
        TableReference::new("orders"),
        ConnectionDescriptor::new(ConnectionType::MongoDB, connection_string),
    )
    .with_test_case(TestCaseDefinition::new(
        "row count",
        MetricKind::RowCount,
        Assertion::Equals {
            expected: json!(expected),
        },
    ))
}

fn runner() -> TestSuiteRunner {
    TestSuiteRunner::new(
        Arc::new(BackendRegistry::with_defaults()),
        Arc::new(DefaultConnectionBuilder),
    )
}

#[tokio::test]
async fn test_mongodb_row_count() {
    let container = Mongo::default()
        .start()
        .await
        .expect("Failed to start MongoDB container");
    let port = container
        .get_host_port_ipv4(27017)
        .await
        .expect("Failed to get MongoDB port");
    let connection_string = format!("mongodb://localhost:{}/shop", port);

    // Collection does not exist yet
    let report = runner()
        .run_table(&row_count_job(&connection_string, 0))
        .await
        .expect("run should start");
    assert_eq!(report.count(TestStatus::Success), 1, "{:?}", report.results);

    insert_orders(&connection_string).await;

    let report = runner()
        .run_table(&row_count_job(&connection_string, 3))
        .await
        .expect("run should start");
    assert_eq!(report.count(TestStatus::Success), 1, "{:?}", report.results);

    let adaptor = MongoAdaptor::new(&connection_string).await.unwrap();
    assert_eq!(adaptor.row_count(&TableReference::new("orders")).await.unwrap(), 3);
    adaptor.close().await.unwrap();
}

#[tokio::test]
async fn test_mongodb_sampled_metrics() {
    let container = Mongo::default()
        .start()
        .await
        .expect("Failed to start MongoDB container");
    let port = container
        .get_host_port_ipv4(27017)
        .await
        .expect("Failed to get MongoDB port");
    let connection_string = format!("mongodb://localhost:{}/shop", port);
    insert_orders(&connection_string).await;

    let job = TableJob::new(
        TableReference::new("orders"),
        ConnectionDescriptor::new(ConnectionType::MongoDB, &connection_string),
    )
    .with_sample(SampleConfig::fixed_count(3))
    .with_test_case(
        TestCaseDefinition::new(
            "mean amount",
            MetricKind::Mean,
            Assertion::Between {
                min_value: Some(3.0),
                max_value: Some(3.0),
            },
        )
        .with_column("amount"),
    )
    .with_test_case(
        TestCaseDefinition::new(
            "null amounts",
            MetricKind::NullCount,
            Assertion::Expression {
                expression: "value == 1".into(),
            },
        )
        .with_column("amount"),
    );

    let mut runner = runner().with_include_sample(true);
    let report = runner.run_table(&job).await.expect("run should start");

    assert_eq!(report.count(TestStatus::Success), 2, "{:?}", report.results);
    let sample = report.sample.expect("sample requested");
    assert_eq!(sample.len(), 3);
    assert!(sample.column_index("sku").is_some());
}
