//! Payload key normalisation.
//!
//! Producers send payload keys in either `camelCase` or `snake_case`.
//! Everything inside the worker uses `snake_case` field names, so inbound
//! maps are rewritten once at the envelope boundary. Values are never
//! touched: scalars pass through as-is and lists keep their order, with
//! any maps nested inside them rewritten the same way.

use serde_json::Value;

use crate::types::JsonMap;

/// Convert a single key to `snake_case`.
///
/// Word boundaries are a lower-case letter or digit followed by an
/// upper-case letter (`overlayId` -> `overlay_id`) and the last capital of
/// an acronym followed by a lower-case letter (`HTTPServer` ->
/// `http_server`). Hyphens and spaces become underscores. Keys that are
/// already `snake_case` are returned unchanged.
pub fn to_snake_case(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let mut out = String::with_capacity(key.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c == '-' || c == ' ' {
            if !out.ends_with('_') {
                out.push('_');
            }
            continue;
        }
        if c.is_uppercase() {
            let prev = if i > 0 { Some(chars[i - 1]) } else { None };
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_uppercase() => next.is_some_and(|n| n.is_lowercase()),
                _ => false,
            };
            if boundary && !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }

    out
}

/// Recursively rewrite every object key in `value` to `snake_case`.
pub fn normalize_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(normalize_map(map)),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_keys).collect()),
        other => other,
    }
}

/// Rewrite the keys of a JSON object, recursing into nested values.
///
/// When two source keys collapse onto the same snake-case key the later
/// one in iteration order wins.
pub fn normalize_map(map: JsonMap) -> JsonMap {
    map.into_iter()
        .map(|(k, v)| (to_snake_case(&k), normalize_keys(v)))
        .collect()
}
