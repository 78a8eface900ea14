//! Static metrics: counts and aggregates that need no ordering.

use super::{Metric, MetricKind, MetricValue, Pushdown, QueryContext, ResultType, numeric};
use crate::models::{DataType, Sample};
use crate::sampling::expression::compare_values;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateMetric {
    kind: MetricKind,
    column: Option<String>,
}

impl AggregateMetric {
    pub fn table(kind: MetricKind) -> Self {
        Self { kind, column: None }
    }

    pub fn column(kind: MetricKind, column: impl Into<String>) -> Self {
        Self {
            kind,
            column: Some(column.into()),
        }
    }

    fn sql_expression(&self, ctx: &QueryContext<'_>) -> String {
        let column = self
            .column
            .as_deref()
            .map(|c| ctx.dialect.quote_ident(c))
            .unwrap_or_default();
        match self.kind {
            MetricKind::NullCount => format!(
                "SUM(CASE WHEN {} IS NULL THEN 1 ELSE 0 END)",
                column
            ),
            MetricKind::ValuesCount => format!("COUNT({})", column),
            MetricKind::DistinctCount => format!("COUNT(DISTINCT {})", column),
            MetricKind::Mean => format!("AVG({})", ctx.dialect.cast_float(&column)),
            MetricKind::Sum => format!("SUM({})", ctx.dialect.cast_float(&column)),
            MetricKind::Min => format!("MIN({})", column),
            MetricKind::Max => format!("MAX({})", column),
            _ => "COUNT(*)".to_string(),
        }
    }
}

impl Metric for AggregateMetric {
    fn kind(&self) -> MetricKind {
        self.kind
    }

    fn column(&self) -> Option<&str> {
        self.column.as_deref()
    }

    fn result_type(&self) -> ResultType {
        ResultType::Numeric
    }

    fn applies_to(&self, data_type: DataType) -> bool {
        match self.kind {
            MetricKind::Mean | MetricKind::Sum => {
                data_type.is_quantifiable() || data_type == DataType::Unknown
            }
            MetricKind::Min | MetricKind::Max => {
                data_type.is_orderable() || data_type == DataType::Unknown
            }
            _ => true,
        }
    }

    fn pushdown(&self, ctx: &QueryContext<'_>) -> Pushdown {
        if !self.applies_to(ctx.column_type) {
            return Pushdown::NotApplicable(format!(
                "{} does not summarize {:?} columns",
                self.name(),
                ctx.column_type
            ));
        }
        let expression = self.sql_expression(ctx);
        let selected = match self.kind {
            // extremes keep the column type so dates come back as text
            MetricKind::Min | MetricKind::Max => expression,
            _ => ctx.dialect.cast_float(&expression),
        };
        Pushdown::Query(format!("SELECT {} AS value FROM {}", selected, ctx.from))
    }

    #[allow(clippy::cast_precision_loss)]
    fn local(&self, sample: &Sample) -> Option<MetricValue> {
        let Some(column) = &self.column else {
            return Some(MetricValue::Number(sample.len() as f64));
        };
        let values = sample.column_values(column)?;

        let value = match self.kind {
            MetricKind::NullCount => {
                MetricValue::Number(values.iter().filter(|v| v.is_null()).count() as f64)
            }
            MetricKind::ValuesCount => {
                MetricValue::Number(values.iter().filter(|v| !v.is_null()).count() as f64)
            }
            MetricKind::DistinctCount => {
                let distinct: HashSet<String> = values
                    .iter()
                    .filter(|v| !v.is_null())
                    .map(|v| v.to_string())
                    .collect();
                MetricValue::Number(distinct.len() as f64)
            }
            MetricKind::Sum => {
                MetricValue::Number(values.iter().filter_map(|v| numeric(v)).sum())
            }
            MetricKind::Mean => {
                let numbers: Vec<f64> = values.iter().filter_map(|v| numeric(v)).collect();
                if numbers.is_empty() {
                    return None;
                }
                MetricValue::Number(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
            MetricKind::Min => extreme(&values, Ordering::Less)?,
            MetricKind::Max => extreme(&values, Ordering::Greater)?,
            _ => MetricValue::Number(sample.len() as f64),
        };
        Some(value)
    }
}

/// Smallest (`Less`) or largest (`Greater`) non-null value.
///
/// Numbers win over strings when a column mixes both.
fn extreme(values: &[&Value], wanted: Ordering) -> Option<MetricValue> {
    let numbers: Vec<f64> = values.iter().filter_map(|v| numeric(v)).collect();
    if !numbers.is_empty() {
        let pick = numbers.into_iter().reduce(|a, b| {
            if b.partial_cmp(&a) == Some(wanted) { b } else { a }
        })?;
        return Some(MetricValue::Number(pick));
    }

    let pick = values
        .iter()
        .filter(|v| v.is_string())
        .copied()
        .reduce(|a, b| if compare_values(b, a) == Some(wanted) { b } else { a })?;
    pick.as_str().map(|s| MetricValue::Text(s.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::adapters::sql::SqlDialect;
    use serde_json::json;

    fn sample() -> Sample {
        Sample {
            columns: vec!["qty".into(), "day".into(), "tag".into()],
            rows: vec![
                vec![json!(3), json!("2024-01-02"), json!("a")],
                vec![json!(null), json!("2023-12-31"), json!("b")],
                vec![json!(7), json!(null), json!("a")],
                vec![json!("2"), json!("2024-02-01"), json!(null)],
            ],
        }
    }

    fn local(kind: MetricKind, column: Option<&str>) -> Option<MetricValue> {
        kind.bind(column).unwrap().local(&sample())
    }

    #[test]
    fn test_counts() {
        assert_eq!(local(MetricKind::RowCount, None), Some(MetricValue::Number(4.0)));
        assert_eq!(local(MetricKind::NullCount, Some("qty")), Some(MetricValue::Number(1.0)));
        assert_eq!(local(MetricKind::ValuesCount, Some("qty")), Some(MetricValue::Number(3.0)));
        assert_eq!(
            local(MetricKind::DistinctCount, Some("tag")),
            Some(MetricValue::Number(2.0))
        );
    }

    #[test]
    fn test_numeric_aggregates_skip_nulls() {
        assert_eq!(local(MetricKind::Sum, Some("qty")), Some(MetricValue::Number(12.0)));
        assert_eq!(local(MetricKind::Mean, Some("qty")), Some(MetricValue::Number(4.0)));
        assert_eq!(local(MetricKind::Min, Some("qty")), Some(MetricValue::Number(2.0)));
        assert_eq!(local(MetricKind::Max, Some("qty")), Some(MetricValue::Number(7.0)));
    }

    #[test]
    fn test_date_extremes_are_text() {
        assert_eq!(
            local(MetricKind::Min, Some("day")),
            Some(MetricValue::Text("2023-12-31".into()))
        );
        assert_eq!(
            local(MetricKind::Max, Some("day")),
            Some(MetricValue::Text("2024-02-01".into()))
        );
    }

    #[test]
    fn test_missing_column_yields_none() {
        assert_eq!(local(MetricKind::NullCount, Some("nope")), None);
    }

    #[test]
    fn test_mean_of_empty_column_is_none() {
        let sample = Sample::new(vec!["qty".into()]);
        let metric = MetricKind::Mean.bind(Some("qty")).unwrap();
        assert_eq!(metric.local(&sample), None);
    }

    #[test]
    fn test_pushdown_queries() {
        let ctx = QueryContext {
            dialect: SqlDialect::Postgres,
            from: "\"sales\".\"orders\"",
            column_type: DataType::Integer,
        };
        assert_eq!(
            MetricKind::RowCount.bind(None).unwrap().pushdown(&ctx),
            Pushdown::Query(
                "SELECT CAST(COUNT(*) AS DOUBLE PRECISION) AS value FROM \"sales\".\"orders\""
                    .into()
            )
        );
        assert_eq!(
            MetricKind::Mean.bind(Some("qty")).unwrap().pushdown(&ctx),
            Pushdown::Query(
                "SELECT CAST(AVG(CAST(\"qty\" AS DOUBLE PRECISION)) AS DOUBLE PRECISION) AS value \
                 FROM \"sales\".\"orders\""
                    .into()
            )
        );
    }

    #[test]
    fn test_pushdown_not_applicable_for_strings() {
        let ctx = QueryContext {
            dialect: SqlDialect::Sqlite {
                window_functions: true,
            },
            from: "\"t\"",
            column_type: DataType::String,
        };
        assert!(matches!(
            MetricKind::Sum.bind(Some("name")).unwrap().pushdown(&ctx),
            Pushdown::NotApplicable(_)
        ));
        assert!(matches!(
            MetricKind::NullCount.bind(Some("name")).unwrap().pushdown(&ctx),
            Pushdown::Query(_)
        ));

        let ctx = QueryContext {
            column_type: DataType::Date,
            ..ctx
        };
        assert_eq!(
            MetricKind::Max.bind(Some("day")).unwrap().pushdown(&ctx),
            Pushdown::Query("SELECT MAX(\"day\") AS value FROM \"t\"".into())
        );
    }
}
