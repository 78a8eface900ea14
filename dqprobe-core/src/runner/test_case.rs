//! Test case definitions, assertions and results.

use crate::metrics::{MetricKind, MetricValue};
use crate::sampling::expression::{Expression, values_equal};
use crate::{ProbeError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name bound to the metric value inside assertion expressions.
pub const VALUE_BINDING: &str = "value";

/// Condition a metric value must satisfy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Assertion {
    /// Inclusive bounds; a missing bound is open
    Between {
        #[serde(default)]
        min_value: Option<f64>,
        #[serde(default)]
        max_value: Option<f64>,
    },
    Equals { expected: Value },
    /// Boolean expression over `value`, e.g. `value >= 10 and value < 20`
    Expression { expression: String },
}

/// Whether an assertion held, with a human readable explanation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionOutcome {
    pub passed: bool,
    pub message: String,
}

fn bound(value: Option<f64>, open: &str) -> String {
    value.map_or_else(|| open.to_string(), |v| v.to_string())
}

impl Assertion {
    pub fn validate(&self) -> Result<()> {
        match self {
            Assertion::Between {
                min_value: None,
                max_value: None,
            } => Err(ProbeError::configuration(
                "between assertion needs min_value, max_value or both",
            )),
            Assertion::Between {
                min_value: Some(min),
                max_value: Some(max),
            } if min > max => Err(ProbeError::configuration(format!(
                "between assertion has min_value {} greater than max_value {}",
                min, max
            ))),
            Assertion::Expression { expression } => {
                let parsed = Expression::parse(expression)?;
                if let Some(unknown) = parsed.columns().into_iter().find(|c| *c != VALUE_BINDING) {
                    return Err(ProbeError::expression(
                        expression.clone(),
                        format!("unknown name '{}', only '{}' is bound", unknown, VALUE_BINDING),
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Applies the assertion to a computed value.
    pub fn check(&self, value: &MetricValue) -> Result<AssertionOutcome> {
        match self {
            Assertion::Between {
                min_value,
                max_value,
            } => {
                let number = value.as_f64().ok_or_else(|| {
                    ProbeError::query_failed(format!(
                        "between assertion needs a numeric value, got '{}'",
                        value
                    ))
                })?;
                let passed = min_value.is_none_or(|min| number >= min)
                    && max_value.is_none_or(|max| number <= max);
                let range = format!("[{}, {}]", bound(*min_value, "-inf"), bound(*max_value, "inf"));
                Ok(AssertionOutcome {
                    passed,
                    message: if passed {
                        format!("value {} is within {}", number, range)
                    } else {
                        format!("value {} is outside {}", number, range)
                    },
                })
            }
            Assertion::Equals { expected } => {
                let passed = values_equal(&value.to_json(), expected);
                Ok(AssertionOutcome {
                    passed,
                    message: if passed {
                        format!("value {} equals {}", value, expected)
                    } else {
                        format!("value {} does not equal {}", value, expected)
                    },
                })
            }
            Assertion::Expression { expression } => {
                let parsed = Expression::parse(expression)?;
                let bound_value = value.to_json();
                let resolve =
                    |name: &str| (name == VALUE_BINDING).then(|| bound_value.clone());
                let passed = parsed.matches(&resolve)?;
                Ok(AssertionOutcome {
                    passed,
                    message: format!(
                        "`{}` is {} for value {}",
                        expression,
                        if passed { "true" } else { "false" },
                        value
                    ),
                })
            }
        }
    }
}

/// One configured check: a metric, an optional column and an assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseDefinition {
    pub name: String,
    pub metric: MetricKind,
    #[serde(default)]
    pub column: Option<String>,
    pub assertion: Assertion,
}

impl TestCaseDefinition {
    pub fn new(name: impl Into<String>, metric: MetricKind, assertion: Assertion) -> Self {
        Self {
            name: name.into(),
            metric,
            column: None,
            assertion,
        }
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ProbeError::configuration("test case name must not be empty"));
        }
        self.metric.bind(self.column.as_deref()).map_err(|e| {
            ProbeError::configuration(format!("test case '{}': {}", self.name, e))
        })?;
        self.assertion.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Success,
    /// The assertion did not hold
    Failed,
    /// The metric could not be computed
    Aborted,
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestStatus::Success => write!(f, "Success"),
            TestStatus::Failed => write!(f, "Failed"),
            TestStatus::Aborted => write!(f, "Aborted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub test_case: String,
    pub metric: MetricKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub status: TestStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_value: Option<MetricValue>,
    /// Error chain, only for aborted cases
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic_trace: Option<String>,
    pub evaluated_at: DateTime<Utc>,
}

impl TestCaseResult {
    fn new(case: &TestCaseDefinition, status: TestStatus, message: String) -> Self {
        Self {
            test_case: case.name.clone(),
            metric: case.metric,
            column: case.column.clone(),
            status,
            message,
            metric_value: None,
            diagnostic_trace: None,
            evaluated_at: Utc::now(),
        }
    }

    pub fn success(case: &TestCaseDefinition, value: MetricValue, message: String) -> Self {
        Self {
            metric_value: Some(value),
            ..Self::new(case, TestStatus::Success, message)
        }
    }

    pub fn failed(case: &TestCaseDefinition, value: MetricValue, message: String) -> Self {
        Self {
            metric_value: Some(value),
            ..Self::new(case, TestStatus::Failed, message)
        }
    }

    pub fn aborted(case: &TestCaseDefinition, message: String, trace: String) -> Self {
        Self {
            diagnostic_trace: Some(trace),
            ..Self::new(case, TestStatus::Aborted, message)
        }
    }

    /// Aborted result for an error, with its cause chain as trace.
    pub fn from_error(case: &TestCaseDefinition, error: &ProbeError) -> Self {
        Self::aborted(case, error.to_string(), error.diagnostic_trace())
    }
}

/// Lifecycle of one test case within a run. Finished states are terminal.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TestCaseState {
    #[default]
    Pending,
    Finished(TestCaseResult),
}

impl TestCaseState {
    /// Records the result. A case finishes exactly once; there are no retries.
    pub fn finish(&mut self, result: TestCaseResult) -> Result<()> {
        if let TestCaseState::Finished(previous) = self {
            return Err(ProbeError::query_failed(format!(
                "test case '{}' already finished with status {}",
                previous.test_case, previous.status
            )));
        }
        *self = TestCaseState::Finished(result);
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TestCaseState::Finished(_))
    }

    pub fn status(&self) -> Option<TestStatus> {
        match self {
            TestCaseState::Pending => None,
            TestCaseState::Finished(result) => Some(result.status),
        }
    }

    pub fn into_result(self) -> Option<TestCaseResult> {
        match self {
            TestCaseState::Pending => None,
            TestCaseState::Finished(result) => Some(result),
        }
    }
}
