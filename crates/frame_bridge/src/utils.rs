//! # Utility Functions
//!
//! Timestamps and the JSON helpers shared by the variable engine:
//!
//! - [`json_equal()`] - structural equality with numeric normalization
//! - [`merge_deep()`] - recursive assignment of one mapping into another
//! - [`defaults_deep()`] - recursive fill of missing keys only
//! - [`unset_path()`] - removal of a value at a dotted path

use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current Unix timestamp in seconds.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Returns the current Unix timestamp in milliseconds.
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Structural equality between two JSON values.
///
/// Mappings compare key-by-key and lists element-by-element, recursively.
/// Numbers compare by value, so `1` equals `1.0`; `serde_json`'s own
/// `PartialEq` treats those as different.
pub fn json_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return x == y;
            }
            if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                return x == y;
            }
            match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| json_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(key, a)| y.get(key).is_some_and(|b| json_equal(a, b)))
        }
        _ => a == b,
    }
}

/// Recursively assigns `source` into `target`.
///
/// Nested mappings are merged key by key; any other value in `source`
/// replaces the one in `target`.
pub fn merge_deep(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, value) in source {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_deep(existing, incoming);
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

/// Recursively fills keys of `target` that are missing, leaving existing
/// values untouched.
pub fn defaults_deep(target: &mut Map<String, Value>, defaults: Map<String, Value>) {
    for (key, value) in defaults {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                defaults_deep(existing, incoming);
            }
            (Some(_), _) => {}
            (None, value) => {
                target.insert(key, value);
            }
        }
    }
}

/// Removes the value at a dotted `path` (`"stats.hp"`, `"items.0"`).
///
/// Returns whether a value was actually removed. List segments are addressed
/// by index.
pub fn unset_path(target: &mut Map<String, Value>, path: &str) -> bool {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };

    if parents.is_empty() {
        return target.remove(*last).is_some();
    }

    let Some(mut cursor) = target.get_mut(parents[0]) else {
        return false;
    };
    for segment in &parents[1..] {
        cursor = match cursor {
            Value::Object(map) => match map.get_mut(*segment) {
                Some(next) => next,
                None => return false,
            },
            Value::Array(list) => match segment.parse::<usize>().ok().and_then(|i| list.get_mut(i)) {
                Some(next) => next,
                None => return false,
            },
            _ => return false,
        };
    }

    match cursor {
        Value::Object(map) => map.remove(*last).is_some(),
        Value::Array(list) => match last.parse::<usize>() {
            Ok(index) if index < list.len() => {
                list.remove(index);
                true
            }
            _ => false,
        },
        _ => false,
    }
}
