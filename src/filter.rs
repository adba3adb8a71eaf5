//! Per-subscription predicate trees evaluated over decoded field maps.
//!
//! Subscribers attach an optional [`Predicate`] to their subscription; the
//! dispatcher evaluates it against each decoded sample's fields and skips
//! events that do not match. Evaluation errors skip the event for that
//! subscriber only.

use std::cmp::Ordering;

use thiserror::Error;

use crate::decode::{FieldMap, Value};

/// Errors from evaluating a predicate against a field map.
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("unknown field {0}")]
    UnknownField(String),

    #[error("field {field}: cannot compare {left} with {right}")]
    TypeMismatch {
        field: String,
        left: &'static str,
        right: &'static str,
    },
}

/// A filter predicate over decoded field values.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Le(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    /// True when the named field is present, regardless of value.
    Exists(String),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Combine with another predicate under logical AND.
    pub fn and(self, other: Predicate) -> Predicate {
        Predicate::And(Box::new(self), Box::new(other))
    }

    /// Combine with another predicate under logical OR.
    pub fn or(self, other: Predicate) -> Predicate {
        Predicate::Or(Box::new(self), Box::new(other))
    }

    /// Negate this predicate.
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Predicate {
        Predicate::Not(Box::new(self))
    }

    /// Evaluate the predicate against a decoded field map.
    pub fn evaluate(&self, fields: &FieldMap) -> Result<bool, FilterError> {
        match self {
            Predicate::Eq(f, v) => Ok(compare(f, fields, v)? == Ordering::Equal),
            Predicate::Ne(f, v) => Ok(compare(f, fields, v)? != Ordering::Equal),
            Predicate::Lt(f, v) => Ok(compare(f, fields, v)? == Ordering::Less),
            Predicate::Le(f, v) => Ok(compare(f, fields, v)? != Ordering::Greater),
            Predicate::Gt(f, v) => Ok(compare(f, fields, v)? == Ordering::Greater),
            Predicate::Ge(f, v) => Ok(compare(f, fields, v)? != Ordering::Less),
            Predicate::Exists(f) => Ok(fields.contains_key(f)),
            Predicate::And(a, b) => Ok(a.evaluate(fields)? && b.evaluate(fields)?),
            Predicate::Or(a, b) => Ok(a.evaluate(fields)? || b.evaluate(fields)?),
            Predicate::Not(p) => Ok(!p.evaluate(fields)?),
        }
    }
}

/// Integer value widened for cross-width comparison.
fn as_i128(v: &Value) -> Option<i128> {
    match v {
        Value::I8(x) => Some(i128::from(*x)),
        Value::I16(x) => Some(i128::from(*x)),
        Value::I32(x) => Some(i128::from(*x)),
        Value::I64(x) => Some(i128::from(*x)),
        Value::U8(x) => Some(i128::from(*x)),
        Value::U16(x) => Some(i128::from(*x)),
        Value::U32(x) => Some(i128::from(*x)),
        Value::U64(x) => Some(i128::from(*x)),
        Value::String(_) | Value::Array(_) => None,
    }
}

fn compare(field: &str, fields: &FieldMap, expected: &Value) -> Result<Ordering, FilterError> {
    let actual = fields
        .get(field)
        .ok_or_else(|| FilterError::UnknownField(field.to_string()))?;

    if let (Some(a), Some(b)) = (as_i128(actual), as_i128(expected)) {
        return Ok(a.cmp(&b));
    }

    if let (Value::String(a), Value::String(b)) = (actual, expected) {
        return Ok(a.as_str().cmp(b.as_str()));
    }

    Err(FilterError::TypeMismatch {
        field: field.to_string(),
        left: actual.type_name(),
        right: expected.type_name(),
    })
}
