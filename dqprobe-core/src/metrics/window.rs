//! Window metrics: quantiles over the sorted non-null values of a column.
//!
//! All paths use the same linear interpolation. For `n` sorted values the
//! quantile `q` sits at position `q * (n - 1)`; a fractional position
//! interpolates between its two neighbours.

use super::{Metric, MetricKind, MetricValue, Pushdown, QueryContext, ResultType, numeric};
use crate::models::{DataType, Sample};

#[derive(Debug, Clone, PartialEq)]
pub struct QuantileMetric {
    kind: MetricKind,
    column: String,
    quantile: f64,
}

impl QuantileMetric {
    pub fn new(kind: MetricKind, column: impl Into<String>, quantile: f64) -> Self {
        Self {
            kind,
            column: column.into(),
            quantile,
        }
    }

    pub fn quantile(&self) -> f64 {
        self.quantile
    }

    /// Interpolation through `ROW_NUMBER()`, for SQLite 3.25 and later.
    ///
    /// `CAST(.. AS INTEGER)` truncates in SQLite, which is the floor here.
    fn window_query(&self, ctx: &QueryContext<'_>) -> String {
        let column = ctx.dialect.quote_ident(&self.column);
        let value = ctx.dialect.cast_float(&column);
        format!(
            "WITH ordered AS (\
             SELECT {value} AS v, ROW_NUMBER() OVER (ORDER BY {value}) - 1 AS rn, \
             COUNT(*) OVER () AS n FROM {from} WHERE {column} IS NOT NULL), \
             bounds AS (SELECT MAX(n) AS n, {q} * (MAX(n) - 1) AS pos FROM ordered) \
             SELECT (SELECT lo.v + (b.pos - lo.rn) * (hi.v - lo.v) \
             FROM bounds b \
             JOIN ordered lo ON lo.rn = CAST(b.pos AS INTEGER) \
             JOIN ordered hi ON hi.rn = MIN(CAST(b.pos AS INTEGER) + 1, b.n - 1)) AS value",
            value = value,
            from = ctx.from,
            column = column,
            q = self.quantile,
        )
    }
}

/// Interpolated quantile of already sorted values.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn interpolate(sorted: &[f64], quantile: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let pos = quantile.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = (lower + 1).min(sorted.len() - 1);
    let weight = pos - lower as f64;
    Some(sorted[lower] + weight * (sorted[upper] - sorted[lower]))
}

impl Metric for QuantileMetric {
    fn kind(&self) -> MetricKind {
        self.kind
    }

    fn column(&self) -> Option<&str> {
        Some(&self.column)
    }

    fn result_type(&self) -> ResultType {
        ResultType::Numeric
    }

    fn applies_to(&self, data_type: DataType) -> bool {
        data_type.is_quantifiable() || data_type == DataType::Unknown
    }

    fn pushdown(&self, ctx: &QueryContext<'_>) -> Pushdown {
        if !self.applies_to(ctx.column_type) {
            tracing::debug!(
                "Skipping {} pushdown for {:?} column {}",
                self.name(),
                ctx.column_type,
                self.column
            );
            return Pushdown::NotApplicable(format!(
                "{} does not summarize {:?} columns",
                self.name(),
                ctx.column_type
            ));
        }

        if ctx.dialect.supports_percentile_cont() {
            let column = ctx.dialect.quote_ident(&self.column);
            return Pushdown::Query(format!(
                "SELECT percentile_cont({}) WITHIN GROUP (ORDER BY {}) AS value FROM {}",
                self.quantile,
                ctx.dialect.cast_float(&column),
                ctx.from
            ));
        }
        if ctx.dialect.supports_window_functions() {
            return Pushdown::Query(self.window_query(ctx));
        }
        Pushdown::Unsupported(format!(
            "{} has neither percentile_cont nor window functions",
            ctx.dialect.name()
        ))
    }

    fn local(&self, sample: &Sample) -> Option<MetricValue> {
        let mut values: Vec<f64> = sample
            .column_values(&self.column)?
            .into_iter()
            .filter_map(numeric)
            .collect();
        values.sort_by(f64::total_cmp);
        interpolate(&values, self.quantile).map(MetricValue::Number)
    }
}
