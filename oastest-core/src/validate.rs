//! Validation of response bodies against schemas.
//!
//! `parses` walks the schema and the decoded body together. Besides
//! checking shape it harvests tagged subtrees into a collection keyed by
//! class (or, in property mode, `Class.property` to scalar values) so the
//! executor can reconcile server objects with the client store.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::spec::{SchemaRef, Spec};
use crate::values::json_type_name;

/// Collection of validated subtrees: class name to object list, or
/// `Class.property` to scalar list in property mode.
pub type Collection = BTreeMap<String, Vec<JsonValue>>;

impl SchemaRef {
    /// Validates `value` against this schema. With `collect_objects`,
    /// named object subtrees land in `collection[class]`; without, scalar
    /// properties of named objects land in `collection["Class.prop"]`.
    pub fn parses(
        &self,
        name: &str,
        value: &JsonValue,
        collection: &mut Collection,
        collect_objects: bool,
        spec: &Spec,
    ) -> Result<()> {
        if let Some((ref_name, referred)) = spec.referred_schema(self)? {
            return referred.parses(&ref_name, value, collection, collect_objects, spec);
        }

        // The nearest tag names the class; the reference name is the fallback.
        let class = self
            .tag()
            .map(|tag| tag.class)
            .filter(|class| !class.is_empty())
            .unwrap_or_else(|| name.to_string());

        if let Some(all_of) = self.all_of() {
            for sub_value in all_of {
                if let Some(sub) = SchemaRef::from_value(sub_value) {
                    sub.parses(&class, value, collection, collect_objects, spec)?;
                }
            }
            return Ok(());
        }

        match self.schema_type() {
            Some("object") | None if self.properties().is_some() => {
                self.parses_object(&class, value, collection, collect_objects, spec)
            }
            Some("object") => match value {
                JsonValue::Object(_) => {
                    if collect_objects && !class.is_empty() {
                        collection.entry(class).or_default().push(value.clone());
                    }
                    Ok(())
                }
                _ => Err(mismatch(&class, "object", value)),
            },
            Some("array") => {
                let JsonValue::Array(items) = value else {
                    return Err(mismatch(&class, "array", value));
                };
                let Some(item_schema) = self.items() else {
                    return Ok(());
                };
                for item in items {
                    item_schema.parses(&class, item, collection, collect_objects, spec)?;
                }
                Ok(())
            }
            Some(scalar) => {
                if validate_scalar(self, value) {
                    Ok(())
                } else {
                    Err(mismatch(&class, scalar, value))
                }
            }
            // No type, no properties: an unconstrained schema accepts anything.
            None => Ok(()),
        }
    }

    fn parses_object(
        &self,
        class: &str,
        value: &JsonValue,
        collection: &mut Collection,
        collect_objects: bool,
        spec: &Spec,
    ) -> Result<()> {
        let JsonValue::Object(map) = value else {
            return Err(mismatch(class, "object", value));
        };
        for required in self.required() {
            if !map.contains_key(required) {
                return Err(Error::SchemaMismatch(format!(
                    "{class}: required property '{required}' missing"
                )));
            }
        }
        if let Some(properties) = self.properties() {
            for (prop_name, prop_value) in properties {
                let Some(entry) = map.get(prop_name) else {
                    continue;
                };
                let Some(prop_schema) = SchemaRef::from_value(prop_value) else {
                    continue;
                };
                prop_schema.parses(prop_name, entry, collection, collect_objects, spec)?;
                if !collect_objects && !class.is_empty() && !entry.is_object() && !entry.is_array()
                {
                    collection
                        .entry(format!("{class}.{prop_name}"))
                        .or_default()
                        .push(entry.clone());
                }
            }
        }
        if collect_objects && !class.is_empty() {
            collection
                .entry(class.to_string())
                .or_default()
                .push(value.clone());
        }
        Ok(())
    }

    /// True when `value` validates against this schema.
    pub fn matches(&self, value: &JsonValue, spec: &Spec) -> bool {
        let mut collection = Collection::new();
        self.parses("", value, &mut collection, false, spec).is_ok()
    }
}

fn mismatch(name: &str, expected: &str, value: &JsonValue) -> Error {
    let context = if name.is_empty() { "value" } else { name };
    Error::SchemaMismatch(format!(
        "{context}: expected {expected}, got {} ({value})",
        json_type_name(value)
    ))
}

/// Validates a scalar value against a scalar schema: type, enum, numeric
/// bounds, string length, and pattern. Used both during response walks
/// and to sort fuzz dataset values into passing and failing pools.
pub fn validate_scalar(schema: &SchemaRef, value: &JsonValue) -> bool {
    if let Some(values) = schema.enum_values() {
        return values.contains(value);
    }
    let Some(schema_type) = schema.schema_type() else {
        return true;
    };
    match (schema_type, value) {
        ("boolean", JsonValue::Bool(_)) => true,
        ("integer", JsonValue::Number(number)) => {
            (number.is_i64() || number.is_u64()) && number_in_bounds(schema, number.as_f64())
        }
        ("number", JsonValue::Number(number)) => number_in_bounds(schema, number.as_f64()),
        ("string", JsonValue::String(text)) => string_valid(schema, text),
        ("null", JsonValue::Null) => true,
        ("array", JsonValue::Array(_)) | ("object", JsonValue::Object(_)) => true,
        _ => false,
    }
}

fn number_in_bounds(schema: &SchemaRef, value: Option<f64>) -> bool {
    let Some(value) = value else {
        return false;
    };
    if let Some(minimum) = schema.number("minimum") {
        let ok = if schema.flag("exclusiveMinimum") {
            value > minimum
        } else {
            value >= minimum
        };
        if !ok {
            return false;
        }
    }
    if let Some(maximum) = schema.number("maximum") {
        let ok = if schema.flag("exclusiveMaximum") {
            value < maximum
        } else {
            value <= maximum
        };
        if !ok {
            return false;
        }
    }
    true
}

fn string_valid(schema: &SchemaRef, text: &str) -> bool {
    let length = text.chars().count() as u64;
    if let Some(min_length) = schema.unsigned("minLength") {
        if length < min_length {
            return false;
        }
    }
    if let Some(max_length) = schema.unsigned("maxLength") {
        if length > max_length {
            return false;
        }
    }
    if let Some(pattern) = schema.pattern() {
        match regex::Regex::new(pattern) {
            Ok(pattern) => {
                if !pattern.is_match(text) {
                    return false;
                }
            }
            Err(error) => {
                log::warn!("unusable pattern '{pattern}': {error}");
            }
        }
    }
    true
}
