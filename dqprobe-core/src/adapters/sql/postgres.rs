//! PostgreSQL source.

use super::{SqlDialect, SqlSource};
use crate::error::redact_database_url;
use crate::{ProbeError, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use url::Url;

const STATEMENT_TIMEOUT_SECS: u64 = 30;

/// Read-only PostgreSQL source over a lazily connected pool.
#[derive(Debug, Clone)]
pub struct PostgresSource {
    pool: PgPool,
}

impl PostgresSource {
    /// Creates a lazy pool; the first query opens the connection.
    ///
    /// Every pooled connection is forced read-only, gets a statement timeout
    /// and runs in UTC.
    pub async fn connect(connection_string: &str) -> Result<Self> {
        use sqlx::Executor;

        Self::validate_connection_string(connection_string)?;

        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .test_before_acquire(true)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    conn.execute(
                        format!("SET statement_timeout = '{}s'", STATEMENT_TIMEOUT_SECS).as_str(),
                    )
                    .await?;
                    let app_name = format!("dqprobe-{}", env!("CARGO_PKG_VERSION"));
                    conn.execute(format!("SET application_name = '{}'", app_name).as_str())
                        .await?;
                    conn.execute("SET default_transaction_read_only = on").await?;
                    conn.execute("SET timezone = 'UTC'").await?;
                    Ok(())
                })
            })
            .connect_lazy(connection_string)
            .map_err(|e| {
                ProbeError::connection_failed(
                    format!(
                        "Failed to create PostgreSQL connection pool to {}",
                        redact_database_url(connection_string)
                    ),
                    e,
                )
            })?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn validate_connection_string(connection_string: &str) -> Result<()> {
        let url = Url::parse(connection_string).map_err(|e| {
            ProbeError::configuration(format!(
                "Invalid PostgreSQL connection string format: {}",
                e
            ))
        })?;
        if !matches!(url.scheme(), "postgres" | "postgresql") {
            return Err(ProbeError::configuration(
                "Connection string must use postgres:// or postgresql:// scheme",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SqlSource for PostgresSource {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Postgres
    }

    async fn fetch_rows(&self, sql: &str, limit: usize) -> Result<Vec<Map<String, Value>>> {
        // row_to_json keeps column order and maps every type to JSON
        let query = format!(
            "SELECT row_to_json(sample.*) AS row_data FROM ({}) AS sample LIMIT $1",
            sql
        );
        tracing::debug!("Fetching up to {} rows: {}", limit, query);

        let rows: Vec<Value> = sqlx::query_scalar(&query)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ProbeError::source_failed("Failed to fetch sample rows", e))?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match row {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect())
    }

    async fn fetch_scalar(&self, sql: &str) -> Result<Value> {
        tracing::debug!("Running metric query: {}", sql);
        let query = format!("SELECT row_to_json(metric_row.*) FROM ({}) AS metric_row", sql);
        let row = sqlx::query_scalar::<_, Value>(&query)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ProbeError::source_failed("Failed to run metric query", e))?;

        Ok(match row {
            Some(Value::Object(map)) => map.into_iter().next().map_or(Value::Null, |(_, v)| v),
            _ => Value::Null,
        })
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
