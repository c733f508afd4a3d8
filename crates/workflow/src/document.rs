//! Helpers for the JSON documents that flow through the engine.
//!
//! Messages, configs and properties are plain [`serde_json::Value`]s; a value
//! may be absent or have an unexpected shape, and every accessor here treats
//! that as "not found" rather than an error.

use serde_json::{Number, Value};

/// Decode a string holding a JSON object or array into that document.
///
/// Definition files sometimes carry nested documents as escaped strings
/// (`"config": "{\"limit\":10}"`). Anything else is returned unchanged.
pub fn decode_embedded(value: Value) -> Value {
    match value {
        Value::String(text) => {
            let trimmed = text.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            } else {
                Value::String(text)
            }
        }
        other => other,
    }
}

/// Compact rendering of `value`, cut to `max_chars` characters for logging.
pub fn preview(value: &Value, max_chars: usize) -> String {
    let text = value.to_string();
    if text.chars().count() <= max_chars {
        return text;
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(4)).collect();
    format!("{kept} ...")
}

/// Same as [`preview`] for an optional document; absent renders as empty.
pub fn preview_opt(value: Option<&Value>, max_chars: usize) -> String {
    value.map(|v| preview(v, max_chars)).unwrap_or_default()
}

/// Follow a dotted path (`order.items.0.sku`) into a document.
///
/// Numeric segments index into arrays. Returns `None` as soon as a segment
/// does not resolve.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Replace numbers that are neither `i64` nor `u64` with their `f64` value.
///
/// Decoders configured for arbitrary precision hand back numbers that do not
/// fit either integer type; downstream code expects plain floating point.
pub fn normalize_numbers(value: Value) -> Value {
    match value {
        Value::Number(n) if !n.is_i64() && !n.is_u64() => n
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_numbers).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize_numbers(v)))
                .collect(),
        ),
        other => other,
    }
}
