//! Metric framework.
//!
//! A [`Metric`] knows two ways to compute itself: as a query pushed down to a
//! relational backend, and locally over a materialized [`Sample`]. Evaluators
//! pick the path that fits their backend and fall back to local evaluation
//! when the dialect lacks a construct.
//!
//! Static metrics aggregate values without ordering. Window metrics
//! (quantiles) need the values sorted.

pub mod aggregate;
pub mod window;

pub use aggregate::AggregateMetric;
pub use window::QuantileMetric;

use crate::adapters::sql::SqlDialect;
use crate::models::{DataType, Sample};
use crate::{ProbeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of value a metric produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    Numeric,
    String,
    Bool,
}

/// Computed metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
    Bool(bool),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(n) => Some(*n),
            MetricValue::Text(_) | MetricValue::Bool(_) => None,
        }
    }

    /// JSON form, as bound to `value` in assertion expressions.
    #[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
    pub fn to_json(&self) -> Value {
        match self {
            MetricValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9.0e15 {
                    Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n).map_or(Value::Null, Value::Number)
                }
            }
            MetricValue::Text(s) => Value::String(s.clone()),
            MetricValue::Bool(b) => Value::Bool(*b),
        }
    }
}

impl std::fmt::Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricValue::Number(n) => write!(f, "{}", n),
            MetricValue::Text(s) => write!(f, "{}", s),
            MetricValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Outcome of asking a metric for a native query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pushdown {
    /// Single-value query to run on the backend
    Query(String),
    /// The metric does not summarize this column type
    NotApplicable(String),
    /// The dialect lacks a construct the metric needs
    Unsupported(String),
}

/// What a metric needs to build its query.
#[derive(Debug, Clone, Copy)]
pub struct QueryContext<'a> {
    pub dialect: SqlDialect,
    /// Table or parenthesized subquery with alias, usable after `FROM`
    pub from: &'a str,
    pub column_type: DataType,
}

/// The metrics the engine computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    RowCount,
    NullCount,
    ValuesCount,
    DistinctCount,
    Mean,
    Sum,
    Min,
    Max,
    Median,
    FirstQuartile,
    ThirdQuartile,
}

impl MetricKind {
    pub const ALL: [MetricKind; 11] = [
        MetricKind::RowCount,
        MetricKind::NullCount,
        MetricKind::ValuesCount,
        MetricKind::DistinctCount,
        MetricKind::Mean,
        MetricKind::Sum,
        MetricKind::Min,
        MetricKind::Max,
        MetricKind::Median,
        MetricKind::FirstQuartile,
        MetricKind::ThirdQuartile,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MetricKind::RowCount => "row_count",
            MetricKind::NullCount => "null_count",
            MetricKind::ValuesCount => "values_count",
            MetricKind::DistinctCount => "distinct_count",
            MetricKind::Mean => "mean",
            MetricKind::Sum => "sum",
            MetricKind::Min => "min",
            MetricKind::Max => "max",
            MetricKind::Median => "median",
            MetricKind::FirstQuartile => "first_quartile",
            MetricKind::ThirdQuartile => "third_quartile",
        }
    }

    /// Table metrics take no column.
    pub fn is_table_metric(self) -> bool {
        matches!(self, MetricKind::RowCount)
    }

    pub fn is_window(self) -> bool {
        self.quantile().is_some()
    }

    fn quantile(self) -> Option<f64> {
        match self {
            MetricKind::Median => Some(0.5),
            MetricKind::FirstQuartile => Some(0.25),
            MetricKind::ThirdQuartile => Some(0.75),
            _ => None,
        }
    }

    /// Binds the metric to a column, or to the table for table metrics.
    pub fn bind(self, column: Option<&str>) -> Result<Box<dyn Metric>> {
        if self.is_table_metric() {
            if let Some(column) = column {
                tracing::debug!("Ignoring column '{}' for table metric {}", column, self.name());
            }
            return Ok(Box::new(AggregateMetric::table(self)));
        }
        let column = column
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                ProbeError::configuration(format!("metric {} requires a column", self.name()))
            })?;
        Ok(match self.quantile() {
            Some(q) => Box::new(QuantileMetric::new(self, column, q)),
            None => Box::new(AggregateMetric::column(self, column)),
        })
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A metric bound to a column or to the whole table.
pub trait Metric: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> MetricKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Bound column; `None` for table metrics.
    fn column(&self) -> Option<&str>;

    fn result_type(&self) -> ResultType;

    fn is_window(&self) -> bool {
        self.kind().is_window()
    }

    /// Whether the metric summarizes columns of this type.
    ///
    /// `Unknown` is accepted; the local path skips values it cannot use.
    fn applies_to(&self, data_type: DataType) -> bool;

    /// Native query computing the metric, if the backend can run one.
    fn pushdown(&self, ctx: &QueryContext<'_>) -> Pushdown;

    /// Computes the metric over a materialized sample.
    ///
    /// `None` when the bound column is missing from the sample.
    fn local(&self, sample: &Sample) -> Option<MetricValue>;
}

/// Numeric view of a value; numeric strings count, other values do not.
pub(crate) fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bind_requires_column_for_column_metrics() {
        let err = MetricKind::Mean.bind(None).unwrap_err();
        assert!(err.is_configuration());

        let metric = MetricKind::RowCount.bind(Some("ignored")).unwrap();
        assert_eq!(metric.column(), None);

        let metric = MetricKind::Median.bind(Some("price")).unwrap();
        assert!(metric.is_window());
        assert_eq!(metric.column(), Some("price"));
        assert!(!MetricKind::Sum.bind(Some("price")).unwrap().is_window());
    }

    #[test]
    fn test_metric_kind_serde_names() {
        let kind: MetricKind = serde_json::from_value(json!("first_quartile")).unwrap();
        assert_eq!(kind, MetricKind::FirstQuartile);
        for kind in MetricKind::ALL {
            assert_eq!(serde_json::to_value(kind).unwrap(), json!(kind.name()));
        }
    }

    #[test]
    fn test_metric_value_json() {
        assert_eq!(MetricValue::Number(3.0).to_json(), json!(3));
        assert_eq!(MetricValue::Number(2.5).to_json(), json!(2.5));
        assert_eq!(MetricValue::Text("a".into()).to_json(), json!("a"));
        assert_eq!(MetricValue::Number(2.5).to_string(), "2.5");
    }

    #[test]
    fn test_numeric_accepts_numeric_strings() {
        assert_eq!(numeric(&json!(4)), Some(4.0));
        assert_eq!(numeric(&json!(" 1.5 ")), Some(1.5));
        assert_eq!(numeric(&json!("NaN")), None);
        assert_eq!(numeric(&json!(true)), None);
    }
}
