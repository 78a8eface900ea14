//! Sample configuration.
//!
//! A [`SampleConfig`] decides which rows a sampler draws: a verbatim custom
//! selection, or an optional partition predicate followed by a percentage or
//! fixed-count size limit. `sample_limit` bounds every materialized sample.

use crate::{ProbeError, Result};
use chrono::{DateTime, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default number of rows in a materialized sample.
pub const DEFAULT_SAMPLE_LIMIT: usize = 50;

const fn default_sample_limit() -> usize {
    DEFAULT_SAMPLE_LIMIT
}

/// How `SampleConfig::value` is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SampleMode {
    /// `value` is a percentage of each chunk, in (0, 100]
    #[default]
    Percentage,
    /// `value` is a total row budget spread across chunks
    FixedCount,
}

/// Raw sample value as it arrives from configuration.
///
/// Configuration files are hand written, so strings are accepted and parsed
/// lazily. A string that does not parse is treated as "sample everything" in
/// percentage mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProfileSample {
    Number(f64),
    Text(String),
}

impl ProfileSample {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ProfileSample::Number(n) => Some(*n),
            ProfileSample::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }

    fn is_zero(&self) -> bool {
        self.as_f64() == Some(0.0)
    }
}

impl From<f64> for ProfileSample {
    fn from(value: f64) -> Self {
        ProfileSample::Number(value)
    }
}

impl From<&str> for ProfileSample {
    fn from(value: &str) -> Self {
        ProfileSample::Text(value.to_string())
    }
}

/// Effective size limit resolved from mode and value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleSize {
    /// Fraction of each chunk, in (0, 1]
    Fraction(f64),
    /// Total number of rows across all chunks
    Rows(u64),
}

/// Granularity of a relative time partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Hour,
    Day,
    Month,
    Year,
}

/// Lower bound of a time partition.
///
/// Day and coarser units cut at midnight and compare as plain dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionThreshold {
    pub at: NaiveDateTime,
    pub date_only: bool,
}

impl PartitionThreshold {
    /// Literal usable inside a SQL string constant.
    pub fn literal(&self) -> String {
        if self.date_only {
            self.at.format("%Y-%m-%d").to_string()
        } else {
            self.at.format("%Y-%m-%d %H:%M:%S").to_string()
        }
    }

    /// Whether a row value falls on or after the threshold.
    ///
    /// Strings are parsed as ISO-8601 dates or timestamps; anything else is
    /// outside the partition.
    pub fn admits(&self, value: &Value) -> bool {
        let Value::String(raw) = value else {
            return false;
        };
        match parse_timestamp(raw) {
            Some(ts) if self.date_only => ts.date() >= self.at.date(),
            Some(ts) => ts >= self.at,
            None => false,
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc).naive_utc());
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN))
}

impl IntervalUnit {
    /// Threshold `interval` units before `now`.
    pub fn threshold(self, interval: u32, now: DateTime<Utc>) -> Result<PartitionThreshold> {
        let now = now.naive_utc();
        let out_of_range =
            || ProbeError::configuration(format!("partition interval {} {:?} is out of range", interval, self));

        let at = match self {
            IntervalUnit::Hour => {
                return now
                    .checked_sub_signed(Duration::hours(i64::from(interval)))
                    .map(|at| PartitionThreshold {
                        at,
                        date_only: false,
                    })
                    .ok_or_else(out_of_range);
            }
            IntervalUnit::Day => now.checked_sub_signed(Duration::days(i64::from(interval))),
            IntervalUnit::Month => now.checked_sub_months(Months::new(interval)),
            IntervalUnit::Year => interval
                .checked_mul(12)
                .and_then(|months| now.checked_sub_months(Months::new(months))),
        }
        .ok_or_else(out_of_range)?;

        Ok(PartitionThreshold {
            at: at.date().and_time(NaiveTime::MIN),
            date_only: true,
        })
    }
}

/// Predicate kinds for a partition column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "interval_kind", rename_all = "snake_case")]
pub enum PartitionInterval {
    /// Column value is one of `values`
    ColumnValue { values: Vec<Value> },
    /// Integer column value is within `[start, end]`
    IntegerRange { start: i64, end: i64 },
    /// Time column is on or after `now - interval unit`
    TimeUnit { unit: IntervalUnit, interval: u32 },
}

/// Restricts sampling to one slice of the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub column: String,
    #[serde(flatten)]
    pub interval: PartitionInterval,
}

impl PartitionConfig {
    pub fn values(column: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            column: column.into(),
            interval: PartitionInterval::ColumnValue { values },
        }
    }

    pub fn integer_range(column: impl Into<String>, start: i64, end: i64) -> Self {
        Self {
            column: column.into(),
            interval: PartitionInterval::IntegerRange { start, end },
        }
    }

    pub fn time_unit(column: impl Into<String>, unit: IntervalUnit, interval: u32) -> Self {
        Self {
            column: column.into(),
            interval: PartitionInterval::TimeUnit { unit, interval },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.column.trim().is_empty() {
            return Err(ProbeError::configuration("partition column must not be empty"));
        }
        match &self.interval {
            PartitionInterval::ColumnValue { values } if values.is_empty() => Err(
                ProbeError::configuration(format!("partition on '{}' lists no values", self.column)),
            ),
            PartitionInterval::IntegerRange { start, end } if start > end => {
                Err(ProbeError::configuration(format!(
                    "partition range on '{}' is empty: {} > {}",
                    self.column, start, end
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Sampling settings for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleConfig {
    #[serde(default)]
    pub mode: SampleMode,
    /// Percentage or row budget; unset or zero disables size limiting
    #[serde(default)]
    pub value: Option<ProfileSample>,
    #[serde(default)]
    pub partition: Option<PartitionConfig>,
    /// User-supplied selection applied verbatim instead of size control
    #[serde(default)]
    pub custom_selection: Option<String>,
    /// Maximum rows returned by `fetch_sample_data`
    #[serde(default = "default_sample_limit")]
    pub sample_limit: usize,
    /// Seed for reproducible per-chunk sampling
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            mode: SampleMode::Percentage,
            value: None,
            partition: None,
            custom_selection: None,
            sample_limit: DEFAULT_SAMPLE_LIMIT,
            seed: None,
        }
    }
}

impl SampleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn percentage(value: impl Into<ProfileSample>) -> Self {
        Self {
            mode: SampleMode::Percentage,
            value: Some(value.into()),
            ..Self::default()
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn fixed_count(rows: u64) -> Self {
        Self {
            mode: SampleMode::FixedCount,
            value: Some(ProfileSample::Number(rows as f64)),
            ..Self::default()
        }
    }

    pub fn with_partition(mut self, partition: PartitionConfig) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_custom_selection(mut self, selection: impl Into<String>) -> Self {
        self.custom_selection = Some(selection.into());
        self
    }

    pub fn with_sample_limit(mut self, limit: usize) -> Self {
        self.sample_limit = limit;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Checks the combination of settings before any data is touched.
    pub fn validate(&self) -> Result<()> {
        if let Some(selection) = &self.custom_selection {
            if selection.trim().is_empty() {
                return Err(ProbeError::configuration("custom selection must not be empty"));
            }
            if self.partition.is_some() {
                return Err(ProbeError::configuration(
                    "custom selection and partition cannot be combined",
                ));
            }
        }
        if let Some(partition) = &self.partition {
            partition.validate()?;
        }
        if self.sample_limit == 0 {
            return Err(ProbeError::configuration("sample_limit must be greater than zero"));
        }
        if self.mode == SampleMode::FixedCount
            && let Some(value) = &self.value
        {
            match value.as_f64() {
                Some(n) if n.is_finite() && n >= 0.0 => {}
                _ => {
                    return Err(ProbeError::configuration(format!(
                        "fixed_count sample value must be a non-negative number, got {:?}",
                        value
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolves mode and value into an effective size limit.
    ///
    /// `None` means the data passes through unchanged. Percentages outside
    /// (0, 100] or that are not numbers sample the whole chunk.
    pub fn size_limit(&self) -> Result<Option<SampleSize>> {
        let Some(value) = &self.value else {
            return Ok(None);
        };
        if value.is_zero() {
            return Ok(None);
        }

        match self.mode {
            SampleMode::Percentage => {
                let fraction = match value.as_f64() {
                    Some(pct) if pct > 0.0 && pct <= 100.0 => pct / 100.0,
                    _ => {
                        tracing::warn!(
                            "Sample percentage {:?} is not in (0, 100], sampling 100%",
                            value
                        );
                        1.0
                    }
                };
                Ok(Some(SampleSize::Fraction(fraction)))
            }
            SampleMode::FixedCount => match value.as_f64() {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                Some(n) if n.is_finite() && n >= 0.0 => Ok(Some(SampleSize::Rows(n.floor() as u64))),
                _ => Err(ProbeError::configuration(format!(
                    "fixed_count sample value must be a non-negative number, got {:?}",
                    value
                ))),
            },
        }
    }
}
