//! Pure predicate evaluation over a [`PolicyContext`].
//!
//! Absent attributes never raise: every operator reports `false` for a field the context does
//! not carry. Errors are reserved for operands that exist but cannot be compared.

use std::borrow::Cow;
use std::cmp::Ordering;

use super::domain::{AttributeValue, Condition, ConditionOperator, PolicyContext};
use super::errors::ConditionError;

/// Evaluate a single condition.
pub fn evaluate(condition: &Condition, context: &PolicyContext) -> Result<bool, ConditionError> {
    let Some(actual) = resolve_field(context, &condition.field) else {
        return Ok(false);
    };
    let actual = actual.as_ref();

    match condition.operator {
        ConditionOperator::Equals => Ok(actual == expected_scalar(condition, actual)?),
        ConditionOperator::NotEquals => Ok(actual != expected_scalar(condition, actual)?),
        ConditionOperator::GreaterThan => {
            Ok(compare(condition, actual)? == Ordering::Greater)
        }
        ConditionOperator::LessThan => Ok(compare(condition, actual)? == Ordering::Less),
        ConditionOperator::GreaterOrEqual => {
            Ok(compare(condition, actual)? != Ordering::Less)
        }
        ConditionOperator::LessOrEqual => Ok(compare(condition, actual)? != Ordering::Greater),
        ConditionOperator::Between => {
            let (min, max) = condition
                .value
                .range_bounds()
                .ok_or_else(|| malformed(condition, actual, "a numeric range"))?;
            match actual {
                AttributeValue::Number(value) => Ok(min <= *value && *value <= max),
                other => Err(malformed(condition, other, "a number")),
            }
        }
        ConditionOperator::In => membership(condition, actual),
        ConditionOperator::NotIn => membership(condition, actual).map(|found| !found),
        ConditionOperator::Contains => {
            let expected = expected_scalar(condition, actual)?;
            match (actual, expected) {
                (AttributeValue::Text(haystack), AttributeValue::Text(needle)) => {
                    Ok(haystack.contains(needle.as_str()))
                }
                (AttributeValue::List(items), needle) => Ok(items.contains(needle)),
                (other, _) => Err(malformed(condition, other, "text or a list")),
            }
        }
    }
}

/// Short-circuiting AND; an empty list is an unconditional match.
pub fn evaluate_all(
    conditions: &[Condition],
    context: &PolicyContext,
) -> Result<bool, ConditionError> {
    for condition in conditions {
        if !evaluate(condition, context)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Walks a dot-path through nested map attributes. When the first segment names no attribute,
/// the context's own `amount`, `event_type`, `actor_id` and `tenant_id` are consulted.
pub(crate) fn resolve_field<'a>(
    context: &'a PolicyContext,
    path: &str,
) -> Option<Cow<'a, AttributeValue>> {
    let mut segments = path.split('.');
    let head = segments.next()?;

    let Some(root) = context.attributes.get(head) else {
        if segments.next().is_some() {
            return None;
        }
        return builtin_field(context, head).map(Cow::Owned);
    };

    let mut current = root;
    for segment in segments {
        current = match current {
            AttributeValue::Map(entries) => entries.get(segment)?,
            _ => return None,
        };
    }
    Some(Cow::Borrowed(current))
}

fn builtin_field(context: &PolicyContext, name: &str) -> Option<AttributeValue> {
    match name {
        "amount" => context.amount.map(AttributeValue::Number),
        "event_type" => Some(AttributeValue::Text(context.event_type.clone())),
        "actor_id" => Some(AttributeValue::Text(context.actor_id.clone())),
        "tenant_id" => Some(AttributeValue::Text(context.tenant_id.clone())),
        _ => None,
    }
}

fn expected_scalar<'c>(
    condition: &'c Condition,
    actual: &AttributeValue,
) -> Result<&'c AttributeValue, ConditionError> {
    condition
        .value
        .as_scalar()
        .ok_or_else(|| malformed(condition, actual, "a single comparison value"))
}

fn compare(condition: &Condition, actual: &AttributeValue) -> Result<Ordering, ConditionError> {
    match (actual, expected_scalar(condition, actual)?) {
        (AttributeValue::Number(left), AttributeValue::Number(right)) => Ok(left.cmp(right)),
        (AttributeValue::Text(left), AttributeValue::Text(right)) => {
            Ok(left.as_str().cmp(right.as_str()))
        }
        (other, _) => Err(malformed(condition, other, "two numbers or two strings")),
    }
}

fn membership(condition: &Condition, actual: &AttributeValue) -> Result<bool, ConditionError> {
    let candidates = condition
        .value
        .as_list()
        .ok_or_else(|| malformed(condition, actual, "a list of values"))?;
    if !actual.is_scalar() {
        return Err(malformed(condition, actual, "a scalar value"));
    }
    Ok(candidates.contains(actual))
}

fn malformed(
    condition: &Condition,
    actual: &AttributeValue,
    expected: &'static str,
) -> ConditionError {
    ConditionError::Malformed {
        field: condition.field.clone(),
        operator: condition.operator,
        actual: actual.kind(),
        expected,
    }
}
