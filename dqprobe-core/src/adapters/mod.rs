//! Source adaptors and connection building.
//!
//! Backends differ a lot in what they can do. Relational sources run
//! generated SQL, document stores count and sample documents, and datalake
//! tables are loaded into memory as chunks. Each is reached through a
//! [`BackendHandle`] produced by a [`ConnectionBuilder`].
//!
//! Document stores only share [`NoSqlAdaptor::row_count`]. Anything else is an
//! optional [`SourceCapability`] that callers must check before use.

pub mod datalake;

#[cfg(feature = "mongodb")]
pub mod mongodb;

pub mod sql;

use crate::models::{ConnectionDescriptor, ConnectionType, TableReference};
use crate::sampling::DataFrameChunk;
use crate::{ProbeError, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

pub use datalake::JsonFileLoader;

/// Optional operations a document-store adaptor may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceCapability {
    /// Count the documents of a collection
    RowCount,
    /// Draw a random set of documents from a collection
    DocumentSampling,
}

/// Minimal contract for schema-less document stores.
#[async_trait]
pub trait NoSqlAdaptor: Send + Sync {
    fn source_type(&self) -> ConnectionType;

    /// Number of documents in the collection backing `table`.
    async fn row_count(&self, table: &TableReference) -> Result<u64>;

    fn supports(&self, capability: SourceCapability) -> bool {
        matches!(capability, SourceCapability::RowCount)
    }

    /// Random documents from the collection, at most `limit` when set.
    async fn sample_documents(
        &self,
        table: &TableReference,
        limit: Option<u64>,
    ) -> Result<Vec<Map<String, Value>>> {
        let _ = (table, limit);
        Err(ProbeError::unsupported_feature(
            "document sampling",
            self.source_type().to_string(),
        ))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Loads a table into memory for the dataframe sampler.
#[async_trait]
pub trait TableDataLoader: Send + Sync {
    async fn load(&self, table: &TableReference) -> Result<Vec<DataFrameChunk>>;
}

/// A live connection, or loaded data, for one table run.
#[derive(Clone)]
pub enum BackendHandle {
    Sql(Arc<dyn sql::SqlSource>),
    Document(Arc<dyn NoSqlAdaptor>),
    Frames(Vec<DataFrameChunk>),
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendHandle::Sql(source) => write!(f, "Sql({:?})", source.dialect()),
            BackendHandle::Document(adaptor) => write!(f, "Document({})", adaptor.source_type()),
            BackendHandle::Frames(frames) => write!(f, "Frames({} chunks)", frames.len()),
        }
    }
}

impl BackendHandle {
    /// Closes the underlying connection, if any.
    pub async fn release(&self) -> Result<()> {
        match self {
            BackendHandle::Sql(source) => source.close().await,
            BackendHandle::Document(adaptor) => adaptor.close().await,
            BackendHandle::Frames(_) => Ok(()),
        }
    }
}

/// Turns a connection descriptor into a live handle bound to the table's database.
#[async_trait]
pub trait ConnectionBuilder: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        table: &TableReference,
    ) -> Result<BackendHandle>;
}

/// Builds handles for the backends compiled into this crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConnectionBuilder;

#[async_trait]
impl ConnectionBuilder for DefaultConnectionBuilder {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        table: &TableReference,
    ) -> Result<BackendHandle> {
        tracing::debug!(
            "Connecting to {} source {} for {}",
            descriptor.connection_type,
            descriptor.redacted_url(),
            table.fully_qualified_name()
        );

        match descriptor.connection_type {
            #[cfg(feature = "postgresql")]
            ConnectionType::Postgres => {
                let source = sql::postgres::PostgresSource::connect(&descriptor.url).await?;
                Ok(BackendHandle::Sql(Arc::new(source)))
            }
            #[cfg(not(feature = "postgresql"))]
            ConnectionType::Postgres => Err(ProbeError::unsupported_feature(
                "PostgreSQL source",
                "Compile with --features postgresql to enable PostgreSQL support",
            )),
            #[cfg(feature = "sqlite")]
            ConnectionType::Sqlite => {
                let source = sql::sqlite::SqliteSource::connect(&descriptor.url).await?;
                Ok(BackendHandle::Sql(Arc::new(source)))
            }
            #[cfg(not(feature = "sqlite"))]
            ConnectionType::Sqlite => Err(ProbeError::unsupported_feature(
                "SQLite source",
                "Compile with --features sqlite to enable SQLite support",
            )),
            #[cfg(feature = "mongodb")]
            ConnectionType::MongoDB => {
                let adaptor = mongodb::MongoAdaptor::new(&descriptor.url).await?;
                Ok(BackendHandle::Document(Arc::new(adaptor)))
            }
            #[cfg(not(feature = "mongodb"))]
            ConnectionType::MongoDB => Err(ProbeError::unsupported_feature(
                "MongoDB source",
                "Compile with --features mongodb to enable MongoDB support",
            )),
            ConnectionType::Datalake => {
                let loader = JsonFileLoader::new(&descriptor.url, descriptor.chunk_size);
                Ok(BackendHandle::Frames(loader.load(table).await?))
            }
        }
    }
}
