//! Sampling over document stores.
//!
//! Documents are pulled through the adaptor's sampling capability, flattened
//! into one chunk, and handed to a [`DataFrameSampler`] so custom selection,
//! partitioning and truncation behave exactly as for in-memory tables.

use super::config::{SampleConfig, SampleSize};
use super::dataframe::DataFrameSampler;
use super::frame::DataFrameChunk;
use super::{SampledData, Sampler};
use crate::adapters::{NoSqlAdaptor, SourceCapability};
use crate::models::{Sample, TableReference};
use crate::{ProbeError, Result};
use async_trait::async_trait;
use std::sync::Arc;

pub struct DocumentSampler {
    adaptor: Arc<dyn NoSqlAdaptor>,
    table: TableReference,
    config: SampleConfig,
    inner: Option<DataFrameSampler>,
}

impl DocumentSampler {
    /// Fails if the adaptor cannot sample documents.
    pub fn new(
        adaptor: Arc<dyn NoSqlAdaptor>,
        table: TableReference,
        config: SampleConfig,
    ) -> Result<Self> {
        config.validate()?;
        if !adaptor.supports(SourceCapability::DocumentSampling) {
            return Err(ProbeError::unsupported_feature(
                "document sampling",
                adaptor.source_type().to_string(),
            ));
        }
        Ok(Self {
            adaptor,
            table,
            config,
            inner: None,
        })
    }

    /// Number of documents to request from the store.
    ///
    /// A custom selection or partition filters after retrieval, so those
    /// paths read the whole collection.
    async fn document_budget(&self) -> Result<Option<u64>> {
        if self.config.custom_selection.is_some() || self.config.partition.is_some() {
            return Ok(None);
        }
        match self.config.size_limit()? {
            None => Ok(None),
            Some(SampleSize::Rows(n)) => Ok(Some(n)),
            Some(SampleSize::Fraction(fraction)) => {
                let total = self.adaptor.row_count(&self.table).await?;
                #[allow(
                    clippy::cast_possible_truncation,
                    clippy::cast_sign_loss,
                    clippy::cast_precision_loss
                )]
                let budget = (fraction * total as f64).ceil() as u64;
                Ok(Some(budget))
            }
        }
    }

    async fn loaded(&mut self) -> Result<&mut DataFrameSampler> {
        if self.inner.is_none() {
            let budget = self.document_budget().await?;
            let documents = self.adaptor.sample_documents(&self.table, budget).await?;
            tracing::debug!(
                "Loaded {} documents from {} (budget {:?})",
                documents.len(),
                self.table.fully_qualified_name(),
                budget
            );

            // The store already applied the size limit
            let mut config = self.config.clone();
            if budget.is_some() {
                config.value = None;
            }
            let chunk = DataFrameChunk::from_records(documents);
            self.inner = Some(DataFrameSampler::new(self.table.clone(), vec![chunk], config)?);
        }
        self.inner
            .as_mut()
            .ok_or_else(|| ProbeError::query_failed("document sample was not loaded"))
    }
}

#[async_trait]
impl Sampler for DocumentSampler {
    fn table(&self) -> &TableReference {
        &self.table
    }

    fn sample_config(&self) -> &SampleConfig {
        &self.config
    }

    async fn random_sample(&mut self) -> Result<SampledData> {
        self.loaded().await?.random_sample().await
    }

    async fn fetch_sample_data(&mut self) -> Result<Sample> {
        self.loaded().await?.fetch_sample_data().await
    }

    async fn release(&mut self) -> Result<()> {
        self.inner = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConnectionType;
    use serde_json::{Map, Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct InMemoryStore {
        documents: Vec<Map<String, Value>>,
        sample_calls: AtomicUsize,
    }

    impl InMemoryStore {
        fn with_documents(n: i64) -> Self {
            Self {
                documents: (0..n)
                    .map(|i| match json!({"_id": i, "meta": {"even": i % 2 == 0}}) {
                        Value::Object(map) => map,
                        _ => unreachable!(),
                    })
                    .collect(),
                sample_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl NoSqlAdaptor for InMemoryStore {
        fn source_type(&self) -> ConnectionType {
            ConnectionType::MongoDB
        }

        async fn row_count(&self, _table: &TableReference) -> Result<u64> {
            Ok(self.documents.len() as u64)
        }

        fn supports(&self, _capability: SourceCapability) -> bool {
            true
        }

        async fn sample_documents(
            &self,
            _table: &TableReference,
            limit: Option<u64>,
        ) -> Result<Vec<Map<String, Value>>> {
            self.sample_calls.fetch_add(1, Ordering::SeqCst);
            let take = limit.map_or(self.documents.len(), |l| l as usize);
            Ok(self.documents.iter().take(take).cloned().collect())
        }
    }

    struct CountOnlyStore;

    #[async_trait]
    impl NoSqlAdaptor for CountOnlyStore {
        fn source_type(&self) -> ConnectionType {
            ConnectionType::MongoDB
        }

        async fn row_count(&self, _table: &TableReference) -> Result<u64> {
            Ok(0)
        }
    }

    #[test]
    fn test_requires_document_sampling_capability() {
        let err = DocumentSampler::new(
            Arc::new(CountOnlyStore),
            TableReference::new("orders"),
            SampleConfig::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ProbeError::UnsupportedFeature { .. }));
    }

    #[tokio::test]
    async fn test_percentage_budget_uses_row_count() {
        let store = Arc::new(InMemoryStore::with_documents(10));
        let mut sampler = DocumentSampler::new(
            store.clone(),
            TableReference::new("orders"),
            SampleConfig::percentage(25.0),
        )
        .unwrap();

        let data = sampler.random_sample().await.unwrap();
        // ceil(10 * 0.25)
        assert_eq!(data.row_count(), Some(3));
    }

    #[tokio::test]
    async fn test_documents_are_loaded_once_per_sampler() {
        let store = Arc::new(InMemoryStore::with_documents(4));
        let mut sampler = DocumentSampler::new(
            store.clone(),
            TableReference::new("orders"),
            SampleConfig::new(),
        )
        .unwrap();

        sampler.random_sample().await.unwrap();
        let sample = sampler.fetch_sample_data().await.unwrap();

        assert_eq!(store.sample_calls.load(Ordering::SeqCst), 1);
        assert_eq!(sample.columns, vec!["_id", "meta"]);
        assert_eq!(sample.rows[1], vec![json!(1), json!({"even": false})]);
    }

    #[tokio::test]
    async fn test_custom_selection_filters_flattened_documents() {
        let store = Arc::new(InMemoryStore::with_documents(6));
        let config = SampleConfig::fixed_count(1).with_custom_selection("`meta.even` == true");
        let mut sampler = DocumentSampler::new(store, TableReference::new("orders"), config).unwrap();

        let sample = sampler.fetch_sample_data().await.unwrap();
        assert_eq!(sample.len(), 3);
    }
}
