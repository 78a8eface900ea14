//! Entity descriptions shared by samplers, metrics and the test-suite runner.

use serde::{Deserialize, Serialize};
use serde_json::Value;

static NULL: Value = Value::Null;

/// Category of service an entity belongs to.
///
/// Only databases are profiled today, but the registry key keeps the category
/// so other service kinds can be added without changing dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceCategory {
    #[default]
    Database,
}

impl std::fmt::Display for ServiceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceCategory::Database => write!(f, "database"),
        }
    }
}

/// Backend kinds the engine knows how to sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Postgres,
    Sqlite,
    #[serde(rename = "mongodb")]
    MongoDB,
    /// Local files materialized as in-memory chunks
    Datalake,
}

impl ConnectionType {
    /// Relational backends share one table mapping between sampler and evaluator.
    pub fn requires_table_mapping(self) -> bool {
        matches!(self, ConnectionType::Postgres | ConnectionType::Sqlite)
    }

    /// All connection types in registration order.
    pub fn all() -> [ConnectionType; 4] {
        [
            ConnectionType::Postgres,
            ConnectionType::Sqlite,
            ConnectionType::MongoDB,
            ConnectionType::Datalake,
        ]
    }
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionType::Postgres => write!(f, "PostgreSQL"),
            ConnectionType::Sqlite => write!(f, "SQLite"),
            ConnectionType::MongoDB => write!(f, "MongoDB"),
            ConnectionType::Datalake => write!(f, "Datalake"),
        }
    }
}

const fn default_chunk_size() -> usize {
    10_000
}

/// How to reach the source holding a table.
///
/// For relational and document backends `url` is a connection string; for
/// the datalake backend it is a directory of JSON files.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub connection_type: ConnectionType,
    pub url: String,
    /// Rows per in-memory chunk for file-backed tables
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl ConnectionDescriptor {
    pub fn new(connection_type: ConnectionType, url: impl Into<String>) -> Self {
        Self {
            connection_type,
            url: url.into(),
            chunk_size: default_chunk_size(),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// URL safe for logs.
    pub fn redacted_url(&self) -> String {
        match self.connection_type {
            ConnectionType::Datalake => self.url.clone(),
            _ => crate::error::redact_database_url(&self.url),
        }
    }
}

impl std::fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("connection_type", &self.connection_type)
            .field("url", &self.redacted_url())
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

/// Logical column types as far as metrics care about them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Integer,
    Float,
    Decimal,
    String,
    Boolean,
    Date,
    DateTime,
    Binary,
    Json,
    Array,
    Struct,
    #[default]
    Unknown,
}

impl DataType {
    /// Numeric types that support sums, averages and quantiles.
    pub fn is_quantifiable(self) -> bool {
        matches!(self, DataType::Integer | DataType::Float | DataType::Decimal)
    }

    /// Types with a meaningful total order for min/max.
    pub fn is_orderable(self) -> bool {
        self.is_quantifiable() || matches!(self, DataType::Date | DataType::DateTime)
    }

    /// Best-effort type of a single JSON value. Nulls yield `Unknown`.
    pub fn of_value(value: &Value) -> Self {
        match value {
            Value::Null => DataType::Unknown,
            Value::Bool(_) => DataType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => DataType::Integer,
            Value::Number(_) => DataType::Float,
            Value::String(_) => DataType::String,
            Value::Array(_) => DataType::Array,
            Value::Object(_) => DataType::Struct,
        }
    }

    /// Infers a column type from sampled values.
    ///
    /// Integer and float values mix into `Float`; any other disagreement
    /// falls back to `Unknown`.
    pub fn infer<'a>(values: impl IntoIterator<Item = &'a Value>) -> Self {
        let mut inferred = DataType::Unknown;
        for value in values {
            let current = DataType::of_value(value);
            inferred = match (inferred, current) {
                (_, DataType::Unknown) => inferred,
                (DataType::Unknown, t) => t,
                (a, b) if a == b => a,
                (DataType::Integer, DataType::Float) | (DataType::Float, DataType::Integer) => {
                    DataType::Float
                }
                _ => return DataType::Unknown,
            };
        }
        inferred
    }
}

/// A column as known from entity metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(default)]
    pub data_type: DataType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Parent context of a table: the database and schema it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct TableContext {
    pub database: Option<String>,
    pub schema: Option<String>,
}

/// Identity and shape of the table being profiled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableReference {
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    pub name: String,
    #[serde(default)]
    pub columns: Vec<ColumnDef>,
}

impl TableReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            database: None,
            schema: None,
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_column(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.columns.push(ColumnDef::new(name, data_type));
        self
    }

    /// `database.schema.name`, skipping unset parts.
    pub fn fully_qualified_name(&self) -> String {
        [self.database.as_deref(), self.schema.as_deref(), Some(self.name.as_str())]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn context(&self) -> TableContext {
        TableContext {
            database: self.database.clone(),
            schema: self.schema.clone(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// A bounded, materialized subset of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Sample {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Sample {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// The first `limit` rows.
    pub fn head(&self, limit: usize) -> Sample {
        Sample {
            columns: self.columns.clone(),
            rows: self.rows.iter().take(limit).cloned().collect(),
        }
    }

    /// Values of one column, in row order. `None` if the column is unknown.
    pub fn column_values(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(name)?;
        Some(
            self.rows
                .iter()
                .map(|row| row.get(idx).unwrap_or(&NULL))
                .collect(),
        )
    }
}
