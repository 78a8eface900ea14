//! In-memory table chunks and nested-column reconstruction.
//!
//! Document-shaped data is held flattened: a field `city` inside an
//! `address` object becomes the column `address.city`. Before rows leave the
//! engine as a [`Sample`], flattened columns are grouped back under their root
//! so callers see one structured value per nested column.

use crate::models::Sample;
use crate::sampling::expression::Expression;
use crate::{ProbeError, Result};
use serde_json::{Map, Value};

/// Separator between a root column and its nested fields.
pub const COMPLEX_COLUMN_SEPARATOR: char = '.';

/// Placeholders that loaders use for missing values.
pub const DEFAULT_NULL_SENTINELS: &[&str] = &["NaN", "NaT"];

/// One in-memory fragment of a table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataFrameChunk {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl DataFrameChunk {
    /// Builds a chunk, checking that every row has one value per column.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self> {
        if let Some((idx, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != columns.len())
        {
            return Err(ProbeError::configuration(format!(
                "row {} has {} values but the chunk has {} columns",
                idx,
                row.len(),
                columns.len()
            )));
        }
        Ok(Self { columns, rows })
    }

    /// Builds a chunk from JSON records, flattening nested objects.
    ///
    /// Columns appear in first-seen order; records missing a column get null.
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = Map<String, Value>>,
    {
        let flattened: Vec<Map<String, Value>> =
            records.into_iter().map(|r| flatten_record(&r)).collect();

        let mut columns: Vec<String> = Vec::new();
        for record in &flattened {
            for key in record.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }

        let rows = flattened
            .into_iter()
            .map(|mut record| {
                columns
                    .iter()
                    .map(|c| record.remove(c).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
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

    /// Keeps the rows for which `predicate` holds.
    pub fn filter<P>(&self, mut predicate: P) -> Self
    where
        P: FnMut(&[Value]) -> bool,
    {
        Self {
            columns: self.columns.clone(),
            rows: self
                .rows
                .iter()
                .filter(|row| predicate(row.as_slice()))
                .cloned()
                .collect(),
        }
    }

    /// Rows at `indices`, in that order. Indices may repeat.
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        Self {
            columns: self.columns.clone(),
            rows: indices
                .iter()
                .filter_map(|&i| self.rows.get(i).cloned())
                .collect(),
        }
    }

    /// Keeps the rows matching a filter expression.
    pub fn filter_expression(&self, expression: &Expression) -> Result<Self> {
        let mut rows = Vec::new();
        for row in &self.rows {
            let resolve = |name: &str| self.column_index(name).map(|idx| row[idx].clone());
            if expression.matches(&resolve)? {
                rows.push(row.clone());
            }
        }
        Ok(Self {
            columns: self.columns.clone(),
            rows,
        })
    }

    /// Groups dotted columns under their root and normalizes null sentinels.
    ///
    /// Returns the root column names and one row per source row. A chunk with
    /// no dotted columns comes back unchanged apart from sentinel values.
    pub fn reconstruct(&self, null_sentinels: &[&str]) -> (Vec<String>, Vec<Vec<Value>>) {
        let mut roots: Vec<String> = Vec::new();
        for column in &self.columns {
            let root = root_of(column);
            if !roots.iter().any(|r| r == root) {
                roots.push(root.to_string());
            }
        }

        let rows = self
            .rows
            .iter()
            .map(|row| {
                let mut flat = Map::new();
                for (column, value) in self.columns.iter().zip(row) {
                    flat.insert(column.clone(), normalize_sentinel(value, null_sentinels));
                }
                let mut nested = unflatten_record(&flat);
                roots
                    .iter()
                    .map(|root| nested.remove(root).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        (roots, rows)
    }
}

fn root_of(column: &str) -> &str {
    column
        .split_once(COMPLEX_COLUMN_SEPARATOR)
        .map_or(column, |(root, _)| root)
}

fn normalize_sentinel(value: &Value, null_sentinels: &[&str]) -> Value {
    match value {
        Value::String(s) if null_sentinels.contains(&s.as_str()) => Value::Null,
        other => other.clone(),
    }
}

/// Flattens nested objects into dotted keys. Empty objects stay as leaves.
pub fn flatten_record(record: &Map<String, Value>) -> Map<String, Value> {
    fn walk(prefix: &str, value: &Value, out: &mut Map<String, Value>) {
        match value {
            Value::Object(map) if !map.is_empty() => {
                for (key, child) in map {
                    walk(
                        &format!("{}{}{}", prefix, COMPLEX_COLUMN_SEPARATOR, key),
                        child,
                        out,
                    );
                }
            }
            other => {
                out.insert(prefix.to_string(), other.clone());
            }
        }
    }

    let mut out = Map::new();
    for (key, value) in record {
        walk(key, value, &mut out);
    }
    out
}

/// Rebuilds nested objects from dotted keys.
///
/// When a plain key collides with a nested path, the nested fields win.
pub fn unflatten_record(record: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in record {
        let mut parts = key.split(COMPLEX_COLUMN_SEPARATOR).peekable();
        let mut cursor = &mut out;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                let nested_exists = matches!(cursor.get(part), Some(Value::Object(_)));
                if !nested_exists {
                    cursor.insert(part.to_string(), value.clone());
                }
                break;
            }
            let slot = cursor
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            let Value::Object(next) = slot else {
                break;
            };
            cursor = next;
        }
    }
    out
}

/// Materializes chunks into a sample, stopping once `limit` rows are taken.
///
/// Chunks whose columns differ are aligned on the union of their root
/// columns, in first-seen order.
pub fn materialize(frames: &[DataFrameChunk], limit: Option<usize>) -> Sample {
    materialize_with(frames, limit, DEFAULT_NULL_SENTINELS)
}

pub fn materialize_with(
    frames: &[DataFrameChunk],
    limit: Option<usize>,
    null_sentinels: &[&str],
) -> Sample {
    let mut columns: Vec<String> = Vec::new();
    let mut records: Vec<Map<String, Value>> = Vec::new();

    for frame in frames {
        if limit.is_some_and(|l| records.len() >= l) {
            break;
        }
        let (frame_columns, rows) = frame.reconstruct(null_sentinels);
        for column in &frame_columns {
            if !columns.contains(column) {
                columns.push(column.clone());
            }
        }
        for row in rows {
            if limit.is_some_and(|l| records.len() >= l) {
                break;
            }
            records.push(frame_columns.iter().cloned().zip(row).collect());
        }
    }

    let rows = records
        .into_iter()
        .map(|mut record| {
            columns
                .iter()
                .map(|c| record.remove(c).unwrap_or(Value::Null))
                .collect()
        })
        .collect();

    Sample { columns, rows }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn record(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("record must be an object"),
        }
    }

    #[test]
    fn test_new_rejects_ragged_rows() {
        let err = DataFrameChunk::new(
            vec!["a".into(), "b".into()],
            vec![vec![json!(1), json!(2)], vec![json!(3)]],
        )
        .unwrap_err();
        assert!(err.to_string().contains("row 1 has 1 values"));
    }

    #[test]
    fn test_from_records_flattens_and_fills_missing() {
        let chunk = DataFrameChunk::from_records(vec![
            record(json!({"id": 1, "address": {"city": "Oslo", "zip": "0150"}})),
            record(json!({"id": 2, "tags": ["a"]})),
        ]);

        assert_eq!(chunk.columns(), &["id", "address.city", "address.zip", "tags"]);
        assert_eq!(chunk.rows()[1], vec![json!(2), json!(null), json!(null), json!(["a"])]);
    }

    #[test]
    fn test_reconstruct_groups_nested_columns() {
        let chunk = DataFrameChunk::new(
            vec![
                "id".into(),
                "address.city".into(),
                "address.geo.lat".into(),
                "note".into(),
            ],
            vec![vec![json!(7), json!("Oslo"), json!(59.9), json!("NaN")]],
        )
        .unwrap();

        let (columns, rows) = chunk.reconstruct(DEFAULT_NULL_SENTINELS);
        assert_eq!(columns, vec!["id", "address", "note"]);
        assert_eq!(
            rows[0],
            vec![
                json!(7),
                json!({"city": "Oslo", "geo": {"lat": 59.9}}),
                json!(null)
            ]
        );
    }

    #[test]
    fn test_reconstruct_is_identity_on_flat_columns() {
        let chunk = DataFrameChunk::new(
            vec!["a".into(), "b".into()],
            vec![vec![json!(1), json!("x")], vec![json!(null), json!(false)]],
        )
        .unwrap();

        let (columns, rows) = chunk.reconstruct(DEFAULT_NULL_SENTINELS);
        assert_eq!(columns, chunk.columns());
        assert_eq!(rows, chunk.rows());
    }

    #[test]
    fn test_reconstruct_twice_is_stable() {
        let chunk = DataFrameChunk::from_records(vec![record(
            json!({"id": 1, "meta": {"source": "api", "ts": "NaT"}}),
        )]);

        let (columns, rows) = chunk.reconstruct(DEFAULT_NULL_SENTINELS);
        let again = DataFrameChunk::new(columns.clone(), rows.clone()).unwrap();
        let (columns2, rows2) = again.reconstruct(DEFAULT_NULL_SENTINELS);

        assert_eq!(columns, columns2);
        assert_eq!(rows, rows2);
        assert_eq!(rows[0][1], json!({"source": "api", "ts": null}));
    }

    #[test]
    fn test_materialize_stops_at_limit() {
        let first = DataFrameChunk::from_records((0..3).map(|i| record(json!({"n": i}))));
        let second = DataFrameChunk::from_records((3..6).map(|i| record(json!({"n": i}))));

        let sample = materialize(&[first, second], Some(4));
        assert_eq!(sample.columns, vec!["n"]);
        assert_eq!(
            sample.rows,
            vec![vec![json!(0)], vec![json!(1)], vec![json!(2)], vec![json!(3)]]
        );
    }

    #[test]
    fn test_materialize_aligns_heterogeneous_chunks() {
        let first = DataFrameChunk::from_records(vec![record(json!({"a": 1}))]);
        let second = DataFrameChunk::from_records(vec![record(json!({"b": {"c": 2}}))]);

        let sample = materialize(&[first, second], None);
        assert_eq!(sample.columns, vec!["a", "b"]);
        assert_eq!(sample.rows[0], vec![json!(1), json!(null)]);
        assert_eq!(sample.rows[1], vec![json!(null), json!({"c": 2})]);
    }

    #[test]
    fn test_filter_expression_on_flattened_column() {
        let chunk = DataFrameChunk::from_records(vec![
            record(json!({"id": 1, "address": {"city": "Oslo"}})),
            record(json!({"id": 2, "address": {"city": "Bergen"}})),
        ]);
        let expr = Expression::parse("`address.city` == 'Bergen'").unwrap();

        let filtered = chunk.filter_expression(&expr).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.rows()[0][0], json!(2));
    }

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(|n| json!(n)),
            "[a-z]{1,6}".prop_map(Value::String),
        ]
    }

    proptest! {
        #[test]
        fn prop_reconstruct_recovers_nested_records(
            values in proptest::collection::vec((leaf(), leaf(), leaf()), 1..20),
            limit in 1usize..30,
        ) {
            let records: Vec<Map<String, Value>> = values
                .iter()
                .map(|(id, city, lat)| record(json!({"id": id, "address": {"city": city, "geo": {"lat": lat}}})))
                .collect();
            let chunk = DataFrameChunk::from_records(records.clone());

            let sample = materialize(&[chunk], Some(limit));

            prop_assert!(sample.rows.len() <= limit);
            prop_assert_eq!(sample.rows.len(), records.len().min(limit));
            prop_assert_eq!(sample.columns.clone(), vec!["id".to_string(), "address".to_string()]);
            for (row, original) in sample.rows.iter().zip(&records) {
                prop_assert_eq!(&row[0], &original["id"]);
                prop_assert_eq!(&row[1], &original["address"]);
            }
        }
    }
}
