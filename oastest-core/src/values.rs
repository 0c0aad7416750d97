//! Dynamic JSON value helpers shared by the generator, store, and runner.

use serde_json::Value as JsonValue;

/// A JSON object map, the shape of all parameter maps and stored objects.
pub type JsonObject = serde_json::Map<String, JsonValue>;

/// Subset equality: `criteria` matches `actual` when every entry of
/// `criteria` is present (recursively) in `actual`.
///
/// Maps match when each criterion key exists in the actual map with a
/// subset-equal value. Arrays match when every criterion element finds a
/// subset-equal element in the actual array. Numbers widen to strings
/// (`7` matches `"7"`); the reverse does not hold.
pub fn interface_equals(criteria: &JsonValue, actual: &JsonValue) -> bool {
    match (criteria, actual) {
        (JsonValue::Object(want), JsonValue::Object(have)) => want
            .iter()
            .all(|(key, value)| have.get(key).is_some_and(|entry| interface_equals(value, entry))),
        (JsonValue::Array(want), JsonValue::Array(have)) => want
            .iter()
            .all(|value| have.iter().any(|entry| interface_equals(value, entry))),
        (JsonValue::Number(want), JsonValue::String(have)) => want.to_string() == *have,
        _ => criteria == actual,
    }
}

/// Union of two maps where `src` entries overwrite `dst` on conflict.
pub fn map_combine(dst: &JsonObject, src: &JsonObject) -> JsonObject {
    let mut combined = dst.clone();
    for (key, value) in src {
        combined.insert(key.clone(), value.clone());
    }
    combined
}

/// Union of two maps where existing `dst` entries win.
pub fn map_add(dst: &JsonObject, src: &JsonObject) -> JsonObject {
    let mut combined = src.clone();
    for (key, value) in dst {
        combined.insert(key.clone(), value.clone());
    }
    combined
}

/// Replaces values of keys already present in `dst` with values from
/// `src`; keys unique to `src` are not added.
pub fn map_replace(dst: &JsonObject, src: &JsonObject) -> JsonObject {
    let mut replaced = dst.clone();
    for (key, value) in src {
        if replaced.contains_key(key) {
            replaced.insert(key.clone(), value.clone());
        }
    }
    replaced
}

/// Recursive overlay used for PATCH-style updates: maps merge key by key,
/// everything else (arrays included) is replaced by the new value.
pub fn deep_merge(old: &JsonValue, new: &JsonValue) -> JsonValue {
    match (old, new) {
        (JsonValue::Object(old_map), JsonValue::Object(new_map)) => {
            let mut merged = old_map.clone();
            for (key, value) in new_map {
                let next = match merged.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            JsonValue::Object(merged)
        }
        _ => new.clone(),
    }
}

/// Depth-first search for the first occurrence of `field` anywhere in the
/// value tree.
pub fn find_field<'a>(value: &'a JsonValue, field: &str) -> Option<&'a JsonValue> {
    match value {
        JsonValue::Object(map) => {
            if let Some(found) = map.get(field) {
                return Some(found);
            }
            map.values().find_map(|entry| find_field(entry, field))
        }
        JsonValue::Array(items) => items.iter().find_map(|entry| find_field(entry, field)),
        _ => None,
    }
}

/// Invokes `visit` on every object map in the value tree, outermost first.
pub fn iterate_maps(value: &JsonValue, visit: &mut dyn FnMut(&JsonObject)) {
    match value {
        JsonValue::Object(map) => {
            visit(map);
            for entry in map.values() {
                iterate_maps(entry, visit);
            }
        }
        JsonValue::Array(items) => {
            for entry in items {
                iterate_maps(entry, visit);
            }
        }
        _ => {}
    }
}

/// Renders a scalar parameter the way it appears on the wire: strings
/// bare, everything else via JSON encoding.
pub fn value_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Stable key for set membership of arbitrary JSON values.
pub fn value_key(value: &JsonValue) -> String {
    value.to_string()
}

/// Name of the JSON type of `value`, matching OpenAPI type vocabulary.
pub fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(number) => {
            if number.is_f64() {
                "number"
            } else {
                "integer"
            }
        }
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
