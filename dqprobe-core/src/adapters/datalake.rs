//! File-backed tables loaded into memory.
//!
//! A datalake root is a directory of JSON files. Table `orders` is read from
//! `orders.json` (an array of records) or `orders.jsonl` (one record per
//! line). When the table has a schema, `<root>/<schema>/` is searched first.

use super::TableDataLoader;
use crate::models::TableReference;
use crate::sampling::DataFrameChunk;
use crate::{ProbeError, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Loads JSON and JSON Lines files into chunks of `chunk_size` rows.
#[derive(Debug, Clone)]
pub struct JsonFileLoader {
    root: PathBuf,
    chunk_size: usize,
}

impl JsonFileLoader {
    pub fn new(root: impl Into<PathBuf>, chunk_size: usize) -> Self {
        Self {
            root: root.into(),
            chunk_size: chunk_size.max(1),
        }
    }

    fn candidates(&self, table: &TableReference) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Some(schema) = &table.schema {
            dirs.push(self.root.join(schema));
        }
        dirs.push(self.root.clone());

        dirs.iter()
            .flat_map(|dir| {
                ["json", "jsonl"]
                    .iter()
                    .map(move |ext| dir.join(format!("{}.{}", table.name, ext)))
            })
            .collect()
    }

    async fn read_records(path: &Path) -> Result<Vec<Map<String, Value>>> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ProbeError::io(format!("Failed to read {}", path.display()), e))?;

        if path.extension().is_some_and(|ext| ext == "jsonl") {
            content
                .lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .map(|(idx, line)| {
                    serde_json::from_str::<Map<String, Value>>(line).map_err(|e| {
                        ProbeError::serialization(
                            format!("Invalid record on line {} of {}", idx + 1, path.display()),
                            e,
                        )
                    })
                })
                .collect()
        } else {
            serde_json::from_str::<Vec<Map<String, Value>>>(&content).map_err(|e| {
                ProbeError::serialization(
                    format!("Expected an array of records in {}", path.display()),
                    e,
                )
            })
        }
    }
}

#[async_trait]
impl TableDataLoader for JsonFileLoader {
    async fn load(&self, table: &TableReference) -> Result<Vec<DataFrameChunk>> {
        let mut path = None;
        for candidate in self.candidates(table) {
            if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                path = Some(candidate);
                break;
            }
        }
        let path = path.ok_or_else(|| {
            ProbeError::io(
                format!(
                    "No JSON or JSON Lines file for table '{}' under {}",
                    table.fully_qualified_name(),
                    self.root.display()
                ),
                std::io::Error::from(std::io::ErrorKind::NotFound),
            )
        })?;

        let records = Self::read_records(&path).await?;
        tracing::debug!(
            "Loaded {} records for {} from {}",
            records.len(),
            table.name,
            path.display()
        );

        Ok(records
            .chunks(self.chunk_size)
            .map(|chunk| DataFrameChunk::from_records(chunk.iter().cloned()))
            .collect())
    }
}
