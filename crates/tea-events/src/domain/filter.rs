//! Payload filter evaluation.
//!
//! A filter map matches when every key is present in the payload with an equal
//! scalar value. Numbers compare numerically so `1` equals `1.0`. Arrays and
//! objects are not comparable and make their clause false.

use serde_json::{Map, Value};

use super::subscription::Filters;

/// Whether `filters` is a subset of `payload`
pub fn filters_match(filters: &Filters, payload: &Map<String, Value>) -> bool {
    filters
        .iter()
        .all(|(key, expected)| match payload.get(key) {
            Some(actual) => scalar_eq(expected, actual),
            None => false,
        })
}

fn scalar_eq(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Null, Value::Null) => true,
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => match (a.as_u64(), b.as_u64()) {
                (Some(x), Some(y)) => x == y,
                _ => a.as_f64() == b.as_f64(),
            },
        },
        _ => false,
    }
}
