//! Field paths and JSON value helpers for the document store.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::{Map, Number, Value};

use parley_shared::{ChatError, Result};

use super::FieldOp;

/// Path to a (possibly nested) field.
///
/// Built from a dotted string (`"reactions.👍"`) or from explicit segments when
/// a key may itself contain dots (user ids, emoji sequences).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        Self(path.split('.').map(str::to_string).collect())
    }
}

impl From<String> for FieldPath {
    fn from(path: String) -> Self {
        FieldPath::from(path.as_str())
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

pub(crate) fn get_path<'a>(data: &'a Map<String, Value>, path: &FieldPath) -> Option<&'a Value> {
    let (first, rest) = path.segments().split_first()?;
    let mut current = data.get(first)?;
    for segment in rest {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Apply one field operation, creating intermediate objects as needed.
pub(crate) fn apply_op(data: &mut Map<String, Value>, path: &FieldPath, op: &FieldOp) -> Result<()> {
    let Some((last, parents)) = path.segments().split_last() else {
        return Err(ChatError::Protocol("empty field path".to_string()));
    };

    if matches!(op, FieldOp::Delete) {
        let mut current = data;
        for segment in parents {
            current = match current.get_mut(segment) {
                Some(Value::Object(map)) => map,
                _ => return Ok(()),
            };
        }
        current.remove(last);
        return Ok(());
    }

    let mut current = data;
    for segment in parents {
        let entry = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = match entry {
            Value::Object(map) => map,
            _ => unreachable!("entry was just made an object"),
        };
    }

    match op {
        FieldOp::Set(value) => {
            current.insert(last.clone(), value.clone());
        }
        FieldOp::Delete => unreachable!("handled above"),
        FieldOp::ArrayUnion(values) => {
            let slot = current
                .entry(last.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            if let Value::Array(items) = slot {
                for v in values {
                    if !items.contains(v) {
                        items.push(v.clone());
                    }
                }
            }
        }
        FieldOp::ArrayRemove(values) => {
            if let Some(Value::Array(items)) = current.get_mut(last) {
                items.retain(|item| !values.contains(item));
            }
        }
        FieldOp::Increment(by) => {
            let base = current.get(last).and_then(Value::as_i64).unwrap_or(0);
            current.insert(last.clone(), Value::Number(Number::from(base + by)));
        }
    }
    Ok(())
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values used for `order_by`.
///
/// Strings that both parse as RFC 3339 timestamps compare chronologically, so
/// timestamps with different sub-second precision still sort correctly.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => {
            match (
                DateTime::parse_from_rfc3339(x),
                DateTime::parse_from_rfc3339(y),
            ) {
                (Ok(x), Ok(y)) => x.with_timezone(&Utc).cmp(&y.with_timezone(&Utc)),
                _ => x.cmp(y),
            }
        }
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}
