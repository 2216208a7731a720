//! Predicate evaluation: one condition against one attribute snapshot.
//!
//! Pure function. Text comparisons are case-insensitive. A missing
//! attribute never matches, whatever the operator.

use chrono::{DateTime, Utc};

use crate::error::EvaluationError;
use crate::message::{AttributeValue, Attributes};
use crate::rules::model::{Condition, DAYS_PER_MONTH, Operator};

/// Evaluate `condition` against `attributes` as of `now`.
pub fn evaluate(
    condition: &Condition,
    attributes: &Attributes,
    now: DateTime<Utc>,
) -> Result<bool, EvaluationError> {
    let Some(value) = attributes.get(&condition.field) else {
        return Ok(false);
    };

    let op = &condition.operator;
    match op {
        Operator::Equals(expected) => {
            Ok(text(condition, value)?.to_lowercase() == expected.to_lowercase())
        }
        Operator::NotEquals(expected) => {
            Ok(text(condition, value)?.to_lowercase() != expected.to_lowercase())
        }
        Operator::Contains(needle) => contains(condition, value, needle),
        Operator::NotContains(needle) => contains(condition, value, needle).map(|hit| !hit),
        Operator::Before(ts) => Ok(timestamp(condition, value)? < *ts),
        Operator::After(ts) => Ok(timestamp(condition, value)? > *ts),
        Operator::LessThanDays(n) => Ok(age_days(condition, value, now)? < *n),
        Operator::GreaterThanDays(n) => Ok(age_days(condition, value, now)? > *n),
        Operator::LessThanMonths(n) => {
            Ok(age_days(condition, value, now)? < n.saturating_mul(DAYS_PER_MONTH))
        }
        Operator::GreaterThanMonths(n) => {
            Ok(age_days(condition, value, now)? > n.saturating_mul(DAYS_PER_MONTH))
        }
    }
}

fn contains(
    condition: &Condition,
    value: &AttributeValue,
    needle: &str,
) -> Result<bool, EvaluationError> {
    let needle = needle.to_lowercase();
    match value {
        AttributeValue::Text(s) => Ok(s.to_lowercase().contains(&needle)),
        AttributeValue::Set(items) => Ok(items.iter().any(|i| i.to_lowercase() == needle)),
        other => Err(mismatch(condition, "text or set", other)),
    }
}

fn text<'a>(condition: &Condition, value: &'a AttributeValue) -> Result<&'a str, EvaluationError> {
    match value {
        AttributeValue::Text(s) => Ok(s),
        other => Err(mismatch(condition, "text", other)),
    }
}

fn timestamp(
    condition: &Condition,
    value: &AttributeValue,
) -> Result<DateTime<Utc>, EvaluationError> {
    match value {
        AttributeValue::Timestamp(ts) => Ok(*ts),
        other => Err(mismatch(condition, "timestamp", other)),
    }
}

/// Whole days elapsed between the attribute's timestamp and `now`.
fn age_days(
    condition: &Condition,
    value: &AttributeValue,
    now: DateTime<Utc>,
) -> Result<i64, EvaluationError> {
    Ok(now.signed_duration_since(timestamp(condition, value)?).num_days())
}

fn mismatch(condition: &Condition, expected: &'static str, actual: &AttributeValue) -> EvaluationError {
    EvaluationError::TypeMismatch {
        field: condition.field.clone(),
        operator: condition.operator.name(),
        expected,
        actual: actual.kind(),
    }
}
