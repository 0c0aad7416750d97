//! Value generation from schemas.
//!
//! `generate_schema` materializes a concrete JSON value for a schema,
//! consulting prior comparisons and the object stores before inventing
//! anything, and fills the test's fuzz sample space for every scalar it
//! resolves.

use rand::Rng;
use serde_json::Value as JsonValue;

use crate::dataset::{Dataset, FuzzMode};
use crate::dsl::{Comparison, Test};
use crate::error::{Error, Result};
use crate::spec::{SchemaRef, Spec};
use crate::store::{lock, match_always, SharedStore};
use crate::tag::MeqaTag;
use crate::validate::validate_scalar;
use crate::values::{map_combine, value_key, JsonObject};
use crate::{FuzzKind, FuzzValue};

mod pattern;

pub use pattern::generate_matching;

#[cfg(test)]
#[path = "../../tests/internal/generate_unit_tests.rs"]
mod tests;

/// Recursion bound for reference and object nesting.
pub const GENERATION_DEPTH: usize = 4;

const DATA_TYPES: [&str; 4] = ["boolean", "integer", "number", "string"];

/// Everything scalar generation needs besides the test itself.
pub(crate) struct GenCtx<'a> {
    pub spec: &'a Spec,
    pub suite_store: &'a SharedStore,
    pub plan_store: &'a SharedStore,
    pub suite_body: Option<&'a JsonValue>,
    pub dataset: &'a Dataset,
    pub fuzz_mode: FuzzMode,
}

/// Materializes a value for one operation parameter.
pub(crate) fn generate_parameter(
    test: &mut Test,
    param: &JsonObject,
    ctx: &GenCtx<'_>,
) -> Result<JsonValue> {
    let tag = param
        .get("description")
        .and_then(JsonValue::as_str)
        .and_then(MeqaTag::parse);
    let name = param
        .get("name")
        .and_then(JsonValue::as_str)
        .unwrap_or_default();
    let Some(schema) = param.get("schema").and_then(SchemaRef::from_value) else {
        return Err(Error::invalid_spec(format!(
            "parameter '{name}' doesn't have a schema"
        )));
    };
    generate_schema_for_param(
        test,
        name,
        tag.as_ref(),
        &schema,
        ctx,
        GENERATION_DEPTH,
        Some(param),
    )
}

/// Materializes a value for a schema. The tag nearest the schema wins
/// over `parent_tag`.
pub(crate) fn generate_schema(
    test: &mut Test,
    name: &str,
    parent_tag: Option<&MeqaTag>,
    schema: &SchemaRef,
    ctx: &GenCtx<'_>,
    depth: usize,
) -> Result<JsonValue> {
    generate_schema_for_param(test, name, parent_tag, schema, ctx, depth, None)
}

fn generate_schema_for_param(
    test: &mut Test,
    name: &str,
    parent_tag: Option<&MeqaTag>,
    schema: &SchemaRef,
    ctx: &GenCtx<'_>,
    depth: usize,
    param: Option<&JsonObject>,
) -> Result<JsonValue> {
    let tag = schema.tag().or_else(|| parent_tag.cloned());

    if let Some((ref_name, referred)) = ctx.spec.referred_schema(schema)? {
        // A named field reuses an existing object before creating one.
        if !name.is_empty() {
            let found = find_in_stores(ctx, &ref_name, 1);
            if let Some(existing) = found.into_iter().next() {
                return Ok(existing);
            }
        }
        if depth == 0 {
            return Ok(JsonValue::Object(JsonObject::new()));
        }
        let ref_tag = MeqaTag::new(ref_name);
        return generate_schema_for_param(
            test,
            name,
            Some(&ref_tag),
            &referred,
            ctx,
            depth - 1,
            param,
        );
    }

    if let Some(values) = schema.enum_values() {
        if !values.is_empty() {
            return generate_enum(values);
        }
    }

    if let Some(all_of) = schema.all_of() {
        return generate_all_of(test, name, tag.as_ref(), schema, all_of, ctx, depth);
    }

    match schema.schema_type() {
        None | Some("object") => generate_object(test, name, tag.as_ref(), schema, ctx, depth),
        Some("array") => generate_array(test, name, tag.as_ref(), schema, ctx, depth),
        Some(_) => generate_by_type(test, schema, name, tag.as_ref(), param, ctx),
    }
}

fn find_in_stores(ctx: &GenCtx<'_>, class: &str, limit: isize) -> Vec<JsonValue> {
    let found = lock(ctx.suite_store).find(class, None, None, match_always, limit);
    if !found.is_empty() {
        return found;
    }
    lock(ctx.plan_store).find(class, None, None, match_always, limit)
}

fn generate_all_of(
    test: &mut Test,
    name: &str,
    tag: Option<&MeqaTag>,
    schema: &SchemaRef,
    all_of: &[JsonValue],
    ctx: &GenCtx<'_>,
    depth: usize,
) -> Result<JsonValue> {
    let mut combined = JsonObject::new();
    let mut discriminator: Option<String> = None;
    for sub_value in all_of {
        let Some(sub) = SchemaRef::from_value(sub_value) else {
            continue;
        };
        let generated = generate_schema(test, name, None, &sub, ctx, depth)?;
        let JsonValue::Object(map) = generated else {
            return Err(Error::invalid_spec(
                "can't combine allOf schema that's not an object",
            ));
        };
        combined = map_combine(&combined, &map);
        if let Some(property) = sub.discriminator_property() {
            discriminator = Some(property.to_string());
        } else if let Some((_, referred)) = ctx.spec.referred_schema(&sub)? {
            // The discriminator usually sits on the common base object.
            if let Some(property) = referred.discriminator_property() {
                discriminator = Some(property.to_string());
            }
        }
    }
    if let (Some(property), Some(tag)) = (&discriminator, tag) {
        if !tag.class.is_empty() {
            combined.insert(property.clone(), JsonValue::String(tag.class.clone()));
        }
    }
    if let Some(tag) = tag {
        let store = lock(ctx.suite_store);
        test.add_object_comparison(tag, combined.clone(), schema.clone(), &store, ctx.spec);
    }
    Ok(JsonValue::Object(combined))
}

fn generate_object(
    test: &mut Test,
    _name: &str,
    parent_tag: Option<&MeqaTag>,
    schema: &SchemaRef,
    ctx: &GenCtx<'_>,
    depth: usize,
) -> Result<JsonValue> {
    let mut object = JsonObject::new();
    if let Some(properties) = schema.properties().cloned() {
        for (key, prop_value) in &properties {
            // Suite-level body parameters pin or skip individual fields.
            if let Some(JsonValue::Object(suite_body)) = ctx.suite_body {
                if let Some(pinned) = suite_body.get(key) {
                    if !pinned.is_null() {
                        object.insert(key.clone(), pinned.clone());
                    }
                    continue;
                }
            }
            let Some(prop_schema) = SchemaRef::from_value(prop_value) else {
                continue;
            };
            let next_depth = depth.saturating_sub(1);
            let generated =
                generate_schema(test, &format!("{key}_"), None, &prop_schema, ctx, next_depth)?;
            object.insert(key.clone(), generated);
        }
    }

    let tag = schema.tag().or_else(|| parent_tag.cloned());
    if let Some(tag) = tag {
        let store = lock(ctx.suite_store);
        test.add_object_comparison(&tag, object.clone(), schema.clone(), &store, ctx.spec);
    }
    Ok(JsonValue::Object(object))
}

fn generate_array(
    test: &mut Test,
    name: &str,
    parent_tag: Option<&MeqaTag>,
    schema: &SchemaRef,
    ctx: &GenCtx<'_>,
    depth: usize,
) -> Result<JsonValue> {
    let Some(item_schema) = schema.items() else {
        return Err(Error::invalid_spec("array schema must declare items"));
    };
    let min_items = schema.unsigned("minItems").unwrap_or(1).max(1) as usize;
    let max_items = schema.unsigned("maxItems").unwrap_or(10).max(1) as usize;
    let max_items = max_items.max(min_items);
    let count = rand::thread_rng().gen_range(min_items..=max_items);

    let tag = schema.tag().or_else(|| parent_tag.cloned());
    let unique = schema.flag("uniqueItems");
    let mut seen = std::collections::BTreeSet::new();
    let mut items = Vec::new();
    for _ in 0..count {
        let entry = generate_schema(test, name, tag.as_ref(), &item_schema, ctx, depth)?;
        if entry.is_null() {
            continue;
        }
        if unique && !seen.insert(value_key(&entry)) {
            continue;
        }
        items.push(entry);
    }
    Ok(JsonValue::Array(items))
}

fn generate_by_type(
    test: &mut Test,
    schema: &SchemaRef,
    prefix: &str,
    tag: Option<&MeqaTag>,
    param: Option<&JsonObject>,
    ctx: &GenCtx<'_>,
) -> Result<JsonValue> {
    // Tag-driven reuse: a scalar bound to Class.Property prefers the value
    // of an object this test already touches, then one from the stores.
    if let Some(tag) = tag {
        if let (Some(property), false) = (tag.property(), tag.class.is_empty()) {
            if let Some(reused) = reuse_tagged_value(test, tag, property, ctx) {
                return Ok(reused);
            }
        }
    }

    let Some(schema_type) = schema.schema_type() else {
        return Err(Error::invalid_spec("parameter doesn't have a type"));
    };
    let result = generate_value(schema_type, schema, prefix)?;
    let field = prefix.replace('_', "");
    test.add_basic_comparison(tag, param, &result, ctx.spec);
    record_samples(test, schema, schema_type, &field, prefix, ctx);
    Ok(result)
}

fn reuse_tagged_value(
    test: &mut Test,
    tag: &MeqaTag,
    property: &str,
    ctx: &GenCtx<'_>,
) -> Option<JsonValue> {
    if let Some(comps) = test.runtime.comparisons.get_mut(&tag.class) {
        for comp in comps.iter_mut() {
            let Some(old) = &comp.old else {
                continue;
            };
            let Some(value) = old.get(property).cloned() else {
                continue;
            };
            comp.old_used
                .get_or_insert_with(JsonObject::new)
                .insert(property.to_string(), value.clone());
            return Some(value);
        }
    }

    let found = find_in_stores(ctx, &tag.class, 5);
    if found.is_empty() {
        return None;
    }
    let pick = found[rand::thread_rng().gen_range(0..found.len())].clone();
    let JsonValue::Object(object) = pick else {
        return None;
    };
    let value = object.get(property).cloned().unwrap_or(JsonValue::Null);
    let mut old_used = JsonObject::new();
    old_used.insert(property.to_string(), value.clone());
    let schema = lock(ctx.suite_store)
        .schema(&tag.class)
        .cloned()
        .unwrap_or_default();
    test.runtime
        .comparisons
        .entry(tag.class.clone())
        .or_default()
        .push(Comparison {
            old: Some(object),
            old_used: Some(old_used),
            new: None,
            schema,
        });
    Some(value)
}

/// Appends positive, datatype, and negative fuzz choices for the field
/// being resolved, according to the run's fuzz mode.
fn record_samples(
    test: &mut Test,
    schema: &SchemaRef,
    schema_type: &str,
    field: &str,
    prefix: &str,
    ctx: &GenCtx<'_>,
) {
    if field.is_empty() || ctx.fuzz_mode == FuzzMode::None {
        return;
    }
    let samples = test.runtime.sample_space.entry(field.to_string()).or_default();
    if ctx.fuzz_mode.positive() {
        for value in ctx.dataset.positive.get(schema_type).into_iter().flatten() {
            if validate_scalar(schema, value) {
                samples.push(FuzzValue {
                    value: value.clone(),
                    kind: FuzzKind::Positive,
                });
            }
        }
    }
    if ctx.fuzz_mode.datatype() && schema_type != "string" {
        let mut cleared = schema.as_map().clone();
        cleared.remove("format");
        let cleared = SchemaRef::new(cleared);
        for value_type in DATA_TYPES {
            if value_type == schema_type {
                continue;
            }
            if let Ok(value) = generate_value(value_type, &cleared, prefix) {
                samples.push(FuzzValue {
                    value,
                    kind: FuzzKind::Datatype,
                });
            }
        }
    }
    if ctx.fuzz_mode.negative() {
        for value in ctx.dataset.negative.get(schema_type).into_iter().flatten() {
            if !validate_scalar(schema, value) {
                samples.push(FuzzValue {
                    value: value.clone(),
                    kind: FuzzKind::Negative,
                });
            }
        }
    }
}

fn generate_value(value_type: &str, schema: &SchemaRef, prefix: &str) -> Result<JsonValue> {
    match value_type {
        "boolean" => Ok(JsonValue::Bool(rand::thread_rng().gen_bool(0.5))),
        "integer" => generate_int(schema).map(JsonValue::from),
        "number" => generate_float(schema).map(JsonValue::from),
        "string" => generate_string(schema, prefix).map(JsonValue::String),
        "file" => Err(Error::CannotFuzzFile(prefix.trim_end_matches('_').to_string())),
        other => Err(Error::invalid_spec(format!("unrecognized type: {other}"))),
    }
}

fn generate_float(schema: &SchemaRef) -> Result<f64> {
    let minimum = schema.number("minimum").map(|min| {
        if schema.flag("exclusiveMinimum") {
            min + 0.01
        } else {
            min
        }
    });
    let maximum = schema.number("maximum").map(|max| {
        if schema.flag("exclusiveMaximum") {
            max - 0.01
        } else {
            max
        }
    });
    let (low, high) = match (minimum, maximum) {
        (None, None) => (-1.0, 1.0),
        (Some(low), None) => (low, low + low.abs().max(10.0)),
        (None, Some(high)) => (high - high.abs().max(10.0), high),
        (Some(low), Some(high)) if low >= high => {
            return Err(Error::invalid_spec(format!(
                "specified min value {low} is bigger than max {high}"
            )));
        }
        (Some(low), Some(high)) => (low, high),
    };

    let mut rng = rand::thread_rng();
    let mut drawn = rng.gen_range(low..high);
    // Prefer values with a fractional part so numbers don't pass as
    // integers downstream.
    for _ in 0..100 {
        if drawn.fract() != 0.0 {
            break;
        }
        drawn = rng.gen_range(low..high);
    }
    Ok(drawn)
}

fn generate_int(schema: &SchemaRef) -> Result<i64> {
    let bounded = if schema.number("minimum").is_none() && schema.number("maximum").is_none() {
        let mut with_max = schema.as_map().clone();
        with_max.insert("maximum".to_string(), JsonValue::from(1_000_000.0));
        SchemaRef::new(with_max)
    } else {
        schema.clone()
    };
    let drawn = generate_float(&bounded)?;
    let mut value = drawn.trunc() as i64;
    if let Some(minimum) = schema.number("minimum") {
        if value <= minimum as i64 {
            value += 1;
        }
    }
    Ok(value)
}

fn format_pattern(format: &str) -> Option<String> {
    match format {
        "email" => Some("^[a-z0-9]+@[a-z_]+?\\.[a-z]{2,3}$".to_string()),
        _ => None,
    }
}

/// Generates a string honoring format and pattern. With neither, the
/// field name plus a numeric suffix keeps values recognizable in logs.
pub(crate) fn generate_string(schema: &SchemaRef, prefix: &str) -> Result<String> {
    let format = schema.format().unwrap_or_default();
    let mut rng = rand::thread_rng();
    match format {
        "date-time" => {
            let offset = chrono::Duration::seconds(rng.gen_range(0..30 * 24 * 3600));
            let stamp = chrono::Utc::now() + offset;
            return Ok(stamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
        }
        "date" => {
            let offset = chrono::Duration::seconds(rng.gen_range(0..30 * 24 * 3600));
            let stamp = chrono::Utc::now() + offset;
            return Ok(stamp.date_naive().to_string());
        }
        "uuid" => return Ok(uuid::Uuid::new_v4().to_string()),
        _ => {}
    }

    let pattern = schema
        .pattern()
        .map(str::to_string)
        .or_else(|| format_pattern(format))
        .unwrap_or_else(|| format!("{}[0-9]{{6,}}", regex::escape(prefix)));
    let generated = generate_matching(&pattern)?;

    match format {
        "" | "password" | "email" => Ok(generated),
        "byte" => {
            use base64::Engine as _;
            Ok(base64::engine::general_purpose::STANDARD.encode(generated.as_bytes()))
        }
        "binary" => Ok(hex::encode(generated.as_bytes())),
        "uri" | "url" => Ok(format!("https://www.example.com/search?q={generated}")),
        other => Err(Error::invalid_spec(format!("invalid format string: {other}"))),
    }
}

fn generate_enum(values: &[JsonValue]) -> Result<JsonValue> {
    if values.is_empty() {
        return Err(Error::invalid_spec("enum must include at least one value"));
    }
    Ok(values[rand::thread_rng().gen_range(0..values.len())].clone())
}

/// Resolved property schemas of a schema, following refs and merging
/// allOf branches.
pub(crate) fn schema_properties(spec: &Spec, schema: &SchemaRef) -> JsonObject {
    let mut out = JsonObject::new();
    collect_properties(spec, schema, &mut out, 0);
    out
}

fn collect_properties(spec: &Spec, schema: &SchemaRef, out: &mut JsonObject, depth: usize) {
    if depth > GENERATION_DEPTH {
        return;
    }
    if let Ok(Some((_, referred))) = spec.referred_schema(schema) {
        collect_properties(spec, &referred, out, depth + 1);
        return;
    }
    if let Some(properties) = schema.properties() {
        for (key, value) in properties {
            out.insert(key.clone(), value.clone());
        }
    }
    if let Some(all_of) = schema.all_of() {
        for sub_value in all_of {
            if let Some(sub) = SchemaRef::from_value(sub_value) {
                collect_properties(spec, &sub, out, depth + 1);
            }
        }
    }
}

/// Regenerates body fields declared as unique keys so repeated fuzz
/// variants don't collide on uniqueness constraints.
pub(crate) fn regenerate_unique_keys(
    spec: &Spec,
    operation: &JsonObject,
    unique_keys: &std::collections::BTreeSet<String>,
    body: &mut JsonObject,
) {
    let Some(body_schema) = Spec::request_body_schema(operation) else {
        return;
    };
    let properties = schema_properties(spec, &body_schema);
    for key in unique_keys {
        let Some(prop_schema) = properties.get(key).and_then(SchemaRef::from_value) else {
            continue;
        };
        if let Ok(fresh) = generate_string(&prop_schema, &format!("{key}_")) {
            body.insert(key.clone(), JsonValue::String(fresh));
        }
    }
}
