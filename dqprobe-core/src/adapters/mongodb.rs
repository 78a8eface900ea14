//! MongoDB document-store adaptor.
//!
//! Collections map to tables as `<schema or database>.<name>`: the table's
//! schema names the MongoDB database, falling back to its database, then to the
//! database in the connection string.

use super::{NoSqlAdaptor, SourceCapability};
use crate::error::redact_database_url;
use crate::models::{ConnectionType, TableReference};
use crate::{ProbeError, Result};
use async_trait::async_trait;
use mongodb::Client;
use mongodb::bson::{Bson, Document, doc};
use mongodb::options::ClientOptions;
use serde_json::{Map, Value};
use std::time::Duration;
use url::Url;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Document-store adaptor backed by the official MongoDB driver.
pub struct MongoAdaptor {
    client: Client,
    default_database: Option<String>,
}

impl std::fmt::Debug for MongoAdaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoAdaptor")
            .field("default_database", &self.default_database)
            .finish_non_exhaustive()
    }
}

impl MongoAdaptor {
    /// Creates an adaptor from a connection string.
    ///
    /// The driver connects lazily, so this succeeds for unreachable hosts and
    /// the first command reports the connection failure.
    pub async fn new(connection_string: &str) -> Result<Self> {
        let default_database = Self::validate_connection_string(connection_string)?;

        let mut options = ClientOptions::parse(connection_string).await.map_err(|e| {
            ProbeError::configuration(format!(
                "Failed to parse MongoDB connection options for {}: {}",
                redact_database_url(connection_string),
                e
            ))
        })?;
        options.connect_timeout.get_or_insert(DEFAULT_CONNECT_TIMEOUT);
        options
            .server_selection_timeout
            .get_or_insert(DEFAULT_SERVER_SELECTION_TIMEOUT);
        options.app_name = Some(format!("dqprobe-{}", env!("CARGO_PKG_VERSION")));

        let client = Client::with_options(options).map_err(|e| {
            ProbeError::connection_failed(
                format!(
                    "Failed to create MongoDB client for {}",
                    redact_database_url(connection_string)
                ),
                e,
            )
        })?;

        Ok(Self {
            client,
            default_database,
        })
    }

    /// Wraps an existing client.
    pub fn from_client(client: Client, default_database: Option<String>) -> Self {
        Self {
            client,
            default_database,
        }
    }

    /// Checks scheme and host; returns the database named in the path, if any.
    pub fn validate_connection_string(connection_string: &str) -> Result<Option<String>> {
        let url = Url::parse(connection_string).map_err(|e| {
            ProbeError::configuration(format!("Invalid MongoDB connection string format: {}", e))
        })?;

        if !matches!(url.scheme(), "mongodb" | "mongodb+srv") {
            return Err(ProbeError::configuration(
                "Connection string must use mongodb:// or mongodb+srv:// scheme",
            ));
        }
        if url.host_str().is_none() {
            return Err(ProbeError::configuration(
                "Connection string must specify a host",
            ));
        }

        let path = url.path().trim_start_matches('/');
        Ok((!path.is_empty()).then(|| path.to_string()))
    }

    /// Resolves `(database, collection)` for a table.
    pub fn namespace(&self, table: &TableReference) -> Result<(String, String)> {
        let database = table
            .schema
            .clone()
            .or_else(|| table.database.clone())
            .or_else(|| self.default_database.clone())
            .ok_or_else(|| {
                ProbeError::configuration(format!(
                    "No MongoDB database for collection '{}': set the table schema or \
                     use mongodb://host:port/database_name",
                    table.name
                ))
            })?;
        Ok((database, table.name.clone()))
    }

    fn collection(&self, table: &TableReference) -> Result<(String, mongodb::Collection<Document>)> {
        let (database, name) = self.namespace(table)?;
        let collection = self.client.database(&database).collection::<Document>(&name);
        Ok((format!("{}.{}", database, name), collection))
    }
}

#[async_trait]
impl NoSqlAdaptor for MongoAdaptor {
    fn source_type(&self) -> ConnectionType {
        ConnectionType::MongoDB
    }

    async fn row_count(&self, table: &TableReference) -> Result<u64> {
        let (namespace, collection) = self.collection(table)?;
        let count = collection.count_documents(doc! {}).await.map_err(|e| {
            ProbeError::source_failed(format!("Failed to count documents in '{}'", namespace), e)
        })?;
        tracing::debug!("Collection {} holds {} documents", namespace, count);
        Ok(count)
    }

    fn supports(&self, capability: SourceCapability) -> bool {
        matches!(
            capability,
            SourceCapability::RowCount | SourceCapability::DocumentSampling
        )
    }

    async fn sample_documents(
        &self,
        table: &TableReference,
        limit: Option<u64>,
    ) -> Result<Vec<Map<String, Value>>> {
        let (namespace, collection) = self.collection(table)?;

        let mut cursor = match limit {
            Some(size) => {
                let size = i64::try_from(size).unwrap_or(i64::MAX);
                collection
                    .aggregate(vec![doc! { "$sample": { "size": size } }])
                    .await
            }
            None => collection.aggregate(Vec::<Document>::new()).await,
        }
        .map_err(|e| {
            ProbeError::source_failed(format!("Failed to sample documents from '{}'", namespace), e)
        })?;

        let mut records = Vec::new();
        while cursor.advance().await.map_err(|e| {
            ProbeError::source_failed(format!("Failed to iterate cursor for '{}'", namespace), e)
        })? {
            let document: Document = cursor.deserialize_current().map_err(|e| {
                ProbeError::source_failed(
                    format!("Failed to deserialize document from '{}'", namespace),
                    e,
                )
            })?;
            records.push(document_to_record(document));
        }

        tracing::debug!("Sampled {} documents from {}", records.len(), namespace);
        Ok(records)
    }

    async fn close(&self) -> Result<()> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}

/// Converts a BSON document into a JSON record.
///
/// Object ids become hex strings and dates RFC 3339 strings so they read
/// naturally in samples. Other extended types use relaxed extended JSON.
pub fn document_to_record(document: Document) -> Map<String, Value> {
    document
        .into_iter()
        .map(|(key, value)| (key, bson_to_json(value)))
        .collect()
}

fn bson_to_json(value: Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(b),
        Bson::Int32(n) => Value::from(n),
        Bson::Int64(n) => Value::from(n),
        Bson::Double(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        Bson::String(s) => Value::String(s),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => dt
            .try_to_rfc3339_string()
            .map_or_else(|_| Value::from(dt.timestamp_millis()), Value::String),
        Bson::Array(items) => Value::Array(items.into_iter().map(bson_to_json).collect()),
        Bson::Document(inner) => Value::Object(document_to_record(inner)),
        other => other.into_relaxed_extjson(),
    }
}
