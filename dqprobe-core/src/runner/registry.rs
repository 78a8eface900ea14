//! Explicit backend registry.
//!
//! Maps `(ServiceCategory, ConnectionType)` to the factories that build the
//! sampler and the evaluator for a table run. The map is filled at startup;
//! an unregistered pair is an unsupported-feature error.

use super::evaluator::{DocumentEvaluator, LocalEvaluator, SqlEvaluator, TestSuiteEvaluator};
use crate::adapters::BackendHandle;
use crate::adapters::sql::{SqlSampler, TableMapping};
use crate::models::{ConnectionType, ServiceCategory, TableReference};
use crate::sampling::{DataFrameSampler, DocumentSampler, SampleConfig, Sampler};
use crate::{ProbeError, Result};
use std::collections::HashMap;
use std::sync::Arc;

pub type RegistryKey = (ServiceCategory, ConnectionType);

/// Everything a factory may need for one table run.
///
/// `mapping` is built once by the runner for relational backends and shared
/// by the sampler and the evaluator.
pub struct BackendContext<'a> {
    pub handle: &'a BackendHandle,
    pub table: &'a TableReference,
    pub mapping: Option<Arc<TableMapping>>,
}

pub type SamplerFactory = fn(&BackendContext<'_>, SampleConfig) -> Result<Box<dyn Sampler>>;

pub type EvaluatorFactory =
    fn(&BackendContext<'_>, Box<dyn Sampler>) -> Result<Box<dyn TestSuiteEvaluator>>;

#[derive(Default)]
pub struct BackendRegistry {
    samplers: HashMap<RegistryKey, SamplerFactory>,
    evaluators: HashMap<RegistryKey, EvaluatorFactory>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.keys())
            .finish()
    }
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every backend this crate knows.
    ///
    /// Backends compiled out still register; connecting to them reports the
    /// missing feature.
    pub fn with_defaults() -> Self {
        let category = ServiceCategory::Database;
        let mut registry = Self::new();
        for connection_type in ConnectionType::all() {
            let key = (category, connection_type);
            match connection_type {
                ConnectionType::Postgres | ConnectionType::Sqlite => {
                    registry.register(key, sql_sampler, sql_evaluator);
                }
                ConnectionType::MongoDB => {
                    registry.register(key, document_sampler, document_evaluator);
                }
                ConnectionType::Datalake => {
                    registry.register(key, frame_sampler, local_evaluator);
                }
            }
        }
        registry
    }

    pub fn register(
        &mut self,
        key: RegistryKey,
        sampler: SamplerFactory,
        evaluator: EvaluatorFactory,
    ) {
        self.samplers.insert(key, sampler);
        self.evaluators.insert(key, evaluator);
    }

    pub fn sampler_factory(&self, key: RegistryKey) -> Result<SamplerFactory> {
        self.samplers
            .get(&key)
            .copied()
            .ok_or_else(|| unregistered("sampler", key))
    }

    pub fn evaluator_factory(&self, key: RegistryKey) -> Result<EvaluatorFactory> {
        self.evaluators
            .get(&key)
            .copied()
            .ok_or_else(|| unregistered("evaluator", key))
    }

    /// Registered keys in a stable order.
    pub fn keys(&self) -> Vec<RegistryKey> {
        let mut keys: Vec<RegistryKey> = self.samplers.keys().copied().collect();
        keys.sort_by_key(|(category, connection_type)| {
            (
                category.to_string(),
                ConnectionType::all()
                    .iter()
                    .position(|c| c == connection_type),
            )
        });
        keys
    }
}

fn unregistered(kind: &str, key: RegistryKey) -> ProbeError {
    ProbeError::unsupported_feature(format!("{} for {} sources", kind, key.0), key.1.to_string())
}

fn handle_mismatch(expected: &str, handle: &BackendHandle) -> ProbeError {
    ProbeError::configuration(format!(
        "expected a {} backend handle, got {:?}",
        expected, handle
    ))
}

fn frame_sampler(ctx: &BackendContext<'_>, config: SampleConfig) -> Result<Box<dyn Sampler>> {
    let BackendHandle::Frames(chunks) = ctx.handle else {
        return Err(handle_mismatch("in-memory", ctx.handle));
    };
    Ok(Box::new(DataFrameSampler::new(
        ctx.table.clone(),
        chunks.clone(),
        config,
    )?))
}

fn document_sampler(ctx: &BackendContext<'_>, config: SampleConfig) -> Result<Box<dyn Sampler>> {
    let BackendHandle::Document(adaptor) = ctx.handle else {
        return Err(handle_mismatch("document store", ctx.handle));
    };
    Ok(Box::new(DocumentSampler::new(
        Arc::clone(adaptor),
        ctx.table.clone(),
        config,
    )?))
}

fn sql_sampler(ctx: &BackendContext<'_>, config: SampleConfig) -> Result<Box<dyn Sampler>> {
    let BackendHandle::Sql(source) = ctx.handle else {
        return Err(handle_mismatch("relational", ctx.handle));
    };
    let mapping = ctx
        .mapping
        .clone()
        .ok_or_else(|| ProbeError::configuration("relational sampling needs a table mapping"))?;
    Ok(Box::new(SqlSampler::new(
        Arc::clone(source),
        mapping,
        ctx.table.clone(),
        config,
    )?))
}

fn local_evaluator(
    ctx: &BackendContext<'_>,
    sampler: Box<dyn Sampler>,
) -> Result<Box<dyn TestSuiteEvaluator>> {
    Ok(Box::new(LocalEvaluator::new(ctx.table.clone(), sampler)))
}

fn document_evaluator(
    ctx: &BackendContext<'_>,
    sampler: Box<dyn Sampler>,
) -> Result<Box<dyn TestSuiteEvaluator>> {
    let BackendHandle::Document(adaptor) = ctx.handle else {
        return Err(handle_mismatch("document store", ctx.handle));
    };
    Ok(Box::new(DocumentEvaluator::new(
        Arc::clone(adaptor),
        ctx.table.clone(),
        sampler,
    )))
}

fn sql_evaluator(
    ctx: &BackendContext<'_>,
    sampler: Box<dyn Sampler>,
) -> Result<Box<dyn TestSuiteEvaluator>> {
    let BackendHandle::Sql(source) = ctx.handle else {
        return Err(handle_mismatch("relational", ctx.handle));
    };
    let mapping = ctx
        .mapping
        .clone()
        .ok_or_else(|| ProbeError::configuration("relational evaluation needs a table mapping"))?;
    Ok(Box::new(SqlEvaluator::new(
        Arc::clone(source),
        mapping,
        ctx.table.clone(),
        sampler,
    )))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::sampling::DataFrameChunk;

    #[test]
    fn test_defaults_cover_every_connection_type() {
        let registry = BackendRegistry::with_defaults();
        let keys = registry.keys();
        assert_eq!(keys.len(), ConnectionType::all().len());
        assert_eq!(keys[0], (ServiceCategory::Database, ConnectionType::Postgres));
        for key in keys {
            assert!(registry.evaluator_factory(key).is_ok());
        }
    }

    #[test]
    fn test_unregistered_backend_is_unsupported() {
        let registry = BackendRegistry::new();
        let err = registry
            .sampler_factory((ServiceCategory::Database, ConnectionType::Sqlite))
            .err()
            .unwrap();
        assert!(matches!(err, ProbeError::UnsupportedFeature { .. }));
    }

    #[test]
    fn test_factory_rejects_mismatched_handle() {
        let registry = BackendRegistry::with_defaults();
        let factory = registry
            .sampler_factory((ServiceCategory::Database, ConnectionType::Postgres))
            .unwrap();
        let handle = BackendHandle::Frames(vec![DataFrameChunk::default()]);
        let table = TableReference::new("orders");
        let ctx = BackendContext {
            handle: &handle,
            table: &table,
            mapping: None,
        };
        let err = factory(&ctx, SampleConfig::new()).err().unwrap();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_frame_factories_build_a_local_pipeline() {
        let registry = BackendRegistry::with_defaults();
        let key = (ServiceCategory::Database, ConnectionType::Datalake);
        let handle = BackendHandle::Frames(vec![]);
        let table = TableReference::new("events");
        let ctx = BackendContext {
            handle: &handle,
            table: &table,
            mapping: None,
        };

        let sampler = registry.sampler_factory(key).unwrap()(&ctx, SampleConfig::new()).unwrap();
        let evaluator = registry.evaluator_factory(key).unwrap()(&ctx, sampler).unwrap();
        assert_eq!(evaluator.name(), "local");
    }
}
