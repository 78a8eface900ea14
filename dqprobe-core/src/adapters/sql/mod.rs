//! Relational sources reached through generated SQL.
//!
//! A [`SqlSource`] only runs queries. Everything dialect specific
//! (identifier quoting, random predicates, percentile support) lives on
//! [`SqlDialect`] so samplers and metrics can build SQL without knowing the
//! driver behind it.

#[cfg(feature = "postgresql")]
pub mod postgres;
pub mod sampler;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use sampler::SqlSampler;

use crate::Result;
use crate::models::{ColumnDef, TableReference};
use async_trait::async_trait;
use serde_json::{Map, Value};

/// SQL flavour of a relational source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    /// `window_functions` is false before SQLite 3.25
    Sqlite { window_functions: bool },
}

impl SqlDialect {
    pub fn name(self) -> &'static str {
        match self {
            SqlDialect::Postgres => "PostgreSQL",
            SqlDialect::Sqlite { .. } => "SQLite",
        }
    }

    pub fn quote_ident(self, name: &str) -> String {
        quote_ident(name)
    }

    /// Predicate keeping roughly `percentage` percent of rows.
    pub fn random_percentage_predicate(self, percentage: f64) -> String {
        match self {
            SqlDialect::Postgres => format!("random() * 100 < {}", percentage),
            // random() is a signed 64-bit integer in SQLite
            SqlDialect::Sqlite { .. } => {
                format!("(abs(random()) % 100000) / 1000.0 < {}", percentage)
            }
        }
    }

    pub fn random_order(self) -> &'static str {
        "random()"
    }

    /// Casts an expression to the dialect's double type.
    pub fn cast_float(self, expr: &str) -> String {
        match self {
            SqlDialect::Postgres => format!("CAST({} AS DOUBLE PRECISION)", expr),
            SqlDialect::Sqlite { .. } => format!("CAST({} AS REAL)", expr),
        }
    }

    /// Native ordered-set aggregate for continuous percentiles.
    pub fn supports_percentile_cont(self) -> bool {
        matches!(self, SqlDialect::Postgres)
    }

    pub fn supports_window_functions(self) -> bool {
        match self {
            SqlDialect::Postgres => true,
            SqlDialect::Sqlite { window_functions } => window_functions,
        }
    }

    /// Renders a JSON scalar as a SQL literal.
    pub fn literal(self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => match self {
                SqlDialect::Postgres => if *b { "TRUE" } else { "FALSE" }.to_string(),
                SqlDialect::Sqlite { .. } => if *b { "1" } else { "0" }.to_string(),
            },
            Value::Number(n) => n.to_string(),
            Value::String(s) => quote_literal(s),
            other => quote_literal(&other.to_string()),
        }
    }
}

/// Double-quotes an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quotes a string literal, doubling embedded quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quoted table and column names for one table, built once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMapping {
    pub dialect: SqlDialect,
    pub qualified_name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableMapping {
    pub fn new(table: &TableReference, dialect: SqlDialect) -> Self {
        let qualified_name = match &table.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&table.name)),
            None => quote_ident(&table.name),
        };
        Self {
            dialect,
            qualified_name,
            columns: table.columns.clone(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// A relational source that executes read-only SQL.
#[async_trait]
pub trait SqlSource: Send + Sync {
    fn dialect(&self) -> SqlDialect;

    /// Runs `sql` and returns at most `limit` rows as JSON records.
    async fn fetch_rows(&self, sql: &str, limit: usize) -> Result<Vec<Map<String, Value>>>;

    /// Runs a single-value query and returns its first column.
    ///
    /// SQL NULL and an empty result are both `Value::Null`. Date and time
    /// values come back as strings.
    async fn fetch_scalar(&self, sql: &str) -> Result<Value>;

    async fn close(&self) -> Result<()>;
}
