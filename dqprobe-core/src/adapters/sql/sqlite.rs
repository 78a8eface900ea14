//! SQLite source.
//!
//! Accepts `sqlite://path.db`, bare `*.db`/`*.sqlite`/`*.sqlite3` paths and
//! `:memory:`. File databases are opened read-only. In-memory databases use a
//! single connection that never expires, since the data lives in it.

use super::{SqlDialect, SqlSource};
use crate::{ProbeError, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;

/// First SQLite release with window functions.
const WINDOW_FUNCTIONS_SINCE: (u32, u32) = (3, 25);

#[derive(Debug, Clone)]
pub struct SqliteSource {
    pool: SqlitePool,
    dialect: SqlDialect,
}

impl SqliteSource {
    pub async fn connect(connection_string: &str) -> Result<Self> {
        let normalized = normalize_connection_string(connection_string)?;
        let in_memory = is_in_memory(&normalized);

        let mut options = SqliteConnectOptions::from_str(&normalized).map_err(|e| {
            ProbeError::configuration(format!("Invalid SQLite connection string: {}", e))
        })?;
        if !in_memory {
            options = options.read_only(true);
        }

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(Some(Duration::from_secs(600)))
        };

        let pool = pool_options
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| ProbeError::connection_failed("Failed to open SQLite database", e))?;

        Self::from_pool(pool).await
    }

    /// Wraps an existing pool, detecting window-function support.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let version: String = sqlx::query_scalar("SELECT sqlite_version()")
            .fetch_one(&pool)
            .await
            .map_err(|e| ProbeError::source_failed("Failed to read SQLite version", e))?;
        let window_functions = parse_version(&version).is_some_and(|v| v >= WINDOW_FUNCTIONS_SINCE);
        tracing::debug!(
            "SQLite {} (window functions: {})",
            version,
            window_functions
        );

        Ok(Self {
            pool,
            dialect: SqlDialect::Sqlite { window_functions },
        })
    }

    /// Forces a dialect, for exercising fallbacks on modern builds.
    pub fn with_dialect(mut self, dialect: SqlDialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn is_in_memory(connection_string: &str) -> bool {
    connection_string.contains(":memory:") || connection_string.contains("mode=memory")
}

fn normalize_connection_string(connection_string: &str) -> Result<String> {
    if connection_string == ":memory:" {
        return Ok("sqlite::memory:".to_string());
    }
    if connection_string.starts_with("sqlite:") {
        return Ok(connection_string.to_string());
    }
    if [".db", ".sqlite", ".sqlite3"]
        .iter()
        .any(|ext| connection_string.ends_with(ext))
    {
        return Ok(format!("sqlite://{}", connection_string));
    }
    Err(ProbeError::configuration(
        "Invalid SQLite connection string format: expected sqlite:// URL, file path, or :memory:",
    ))
}

fn parse_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Converts one row to a JSON record, keeping column order.
///
/// SQLite is dynamically typed, so each value is probed as text, integer,
/// real, boolean and finally blob. Blobs are base64 encoded.
fn row_to_record(row: &SqliteRow) -> Map<String, Value> {
    row.columns()
        .iter()
        .map(|column| {
            let name = column.name();
            (name.to_string(), column_value(row, name))
        })
        .collect()
}

fn column_value(row: &SqliteRow, name: &str) -> Value {
    if let Ok(v) = row.try_get::<Option<String>, _>(name) {
        return v.map_or(Value::Null, Value::String);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(name) {
        return v.map_or(Value::Null, |n| Value::Number(n.into()));
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(name) {
        return v
            .and_then(serde_json::Number::from_f64)
            .map_or(Value::Null, Value::Number);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(name) {
        return v.map_or(Value::Null, Value::Bool);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(name) {
        return v.map_or(Value::Null, |bytes| {
            use base64::Engine;
            Value::String(format!(
                "base64:{}",
                base64::engine::general_purpose::STANDARD.encode(&bytes)
            ))
        });
    }
    Value::Null
}

#[async_trait]
impl SqlSource for SqliteSource {
    fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    async fn fetch_rows(&self, sql: &str, limit: usize) -> Result<Vec<Map<String, Value>>> {
        let query = format!("SELECT * FROM ({}) AS sample LIMIT ?", sql);
        tracing::debug!("Fetching up to {} rows: {}", limit, query);

        let rows = sqlx::query(&query)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ProbeError::source_failed("Failed to fetch sample rows", e))?;

        Ok(rows.iter().map(row_to_record).collect())
    }

    async fn fetch_scalar(&self, sql: &str) -> Result<Value> {
        tracing::debug!("Running metric query: {}", sql);
        let row = sqlx::query(sql)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ProbeError::source_failed("Failed to run metric query", e))?;

        Ok(row.map_or(Value::Null, |row| column_value(&row, row.column(0).name())))
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
