use std::sync::{Arc, Mutex};

use serde_json::{json, Value as JsonValue};

use super::*;
use crate::dataset::Dataset;
use crate::dsl::Test;
use crate::spec::{SchemaRef, Spec};
use crate::store::{DataStore, SharedStore};

fn pet_spec() -> Spec {
    Spec::from_value(json!({
        "openapi": "3.0.0",
        "components": {
            "schemas": {
                "Pet": {
                    "type": "object",
                    "properties": {
                        "id": { "type": "integer" },
                        "name": { "type": "string" }
                    }
                },
                "Base": {
                    "type": "object",
                    "discriminator": { "propertyName": "kind" },
                    "properties": { "kind": { "type": "string" } }
                },
                "Dog": {
                    "description": "<meqa Dog>",
                    "allOf": [
                        { "$ref": "#/components/schemas/Base" },
                        {
                            "type": "object",
                            "properties": { "bark": { "type": "boolean" } }
                        }
                    ]
                }
            }
        },
        "paths": {}
    }))
    .expect("spec")
}

fn schema(value: JsonValue) -> SchemaRef {
    SchemaRef::from_value(&value).expect("schema object")
}

struct Fixture {
    spec: Spec,
    suite_store: SharedStore,
    plan_store: SharedStore,
    dataset: Dataset,
}

impl Fixture {
    fn new() -> Fixture {
        let spec = pet_spec();
        let suite_store = Arc::new(Mutex::new(DataStore::new(&spec)));
        let plan_store = Arc::new(Mutex::new(DataStore::new(&spec)));
        Fixture {
            spec,
            suite_store,
            plan_store,
            dataset: Dataset::default(),
        }
    }

    fn ctx(&self) -> GenCtx<'_> {
        GenCtx {
            spec: &self.spec,
            suite_store: &self.suite_store,
            plan_store: &self.plan_store,
            suite_body: None,
            dataset: &self.dataset,
            fuzz_mode: FuzzMode::None,
        }
    }
}

#[test]
fn enum_fields_always_take_a_listed_value() {
    let fixture = Fixture::new();
    let mut test = Test::default();
    let schema = schema(json!({ "type": "string", "enum": ["a", "b", "c"] }));
    for _ in 0..20 {
        let value = generate_schema(&mut test, "field_", None, &schema, &fixture.ctx(), 3)
            .expect("generated");
        let text = value.as_str().expect("string enum value");
        assert!(["a", "b", "c"].contains(&text));
    }
}

#[test]
fn integer_bounds_are_honored() {
    let fixture = Fixture::new();
    let mut test = Test::default();
    let schema = schema(json!({ "type": "integer", "minimum": 5, "maximum": 9 }));
    for _ in 0..50 {
        let value = generate_schema(&mut test, "count_", None, &schema, &fixture.ctx(), 3)
            .expect("generated");
        let number = value.as_i64().expect("integer");
        assert!((5..=9).contains(&number), "out of range: {number}");
    }
}

#[test]
fn number_generation_avoids_integers() {
    let fixture = Fixture::new();
    let mut test = Test::default();
    let schema = schema(json!({ "type": "number", "minimum": 0, "maximum": 100 }));
    let value =
        generate_schema(&mut test, "price_", None, &schema, &fixture.ctx(), 3).expect("generated");
    let number = value.as_f64().expect("number");
    assert!((0.0..100.0).contains(&number));
}

#[test]
fn string_pattern_is_respected() {
    let fixture = Fixture::new();
    let mut test = Test::default();
    let schema = schema(json!({ "type": "string", "pattern": "^[a-f]{4}-[0-9]{2}$" }));
    let value =
        generate_schema(&mut test, "code_", None, &schema, &fixture.ctx(), 3).expect("generated");
    let text = value.as_str().expect("string");
    let pattern = regex::Regex::new("^[a-f]{4}-[0-9]{2}$").expect("pattern");
    assert!(pattern.is_match(text), "'{text}' does not match");
}

#[test]
fn string_formats_produce_valid_literals() {
    let fixture = Fixture::new();
    let mut test = Test::default();

    let uuid_schema = schema(json!({ "type": "string", "format": "uuid" }));
    let value = generate_schema(&mut test, "uid_", None, &uuid_schema, &fixture.ctx(), 3)
        .expect("generated");
    uuid::Uuid::parse_str(value.as_str().expect("string")).expect("valid uuid");

    let date_schema = schema(json!({ "type": "string", "format": "date-time" }));
    let value = generate_schema(&mut test, "when_", None, &date_schema, &fixture.ctx(), 3)
        .expect("generated");
    chrono::DateTime::parse_from_rfc3339(value.as_str().expect("string")).expect("valid rfc3339");
}

#[test]
fn default_strings_start_with_the_field_name() {
    let fixture = Fixture::new();
    let mut test = Test::default();
    let schema = schema(json!({ "type": "string" }));
    let value =
        generate_schema(&mut test, "name_", None, &schema, &fixture.ctx(), 3).expect("generated");
    assert!(value.as_str().expect("string").starts_with("name_"));
}

#[test]
fn arrays_honor_bounds_and_unique_items() {
    let fixture = Fixture::new();
    let mut test = Test::default();
    let schema = schema(json!({
        "type": "array",
        "items": { "type": "integer", "minimum": 0, "maximum": 3 },
        "minItems": 1,
        "maxItems": 4,
        "uniqueItems": true
    }));
    for _ in 0..20 {
        let value = generate_schema(&mut test, "ids_", None, &schema, &fixture.ctx(), 3)
            .expect("generated");
        let items = value.as_array().expect("array");
        assert!(items.len() <= 4);
        let mut seen = std::collections::BTreeSet::new();
        for item in items {
            assert!(seen.insert(item.to_string()), "duplicate in {items:?}");
        }
    }
}

#[test]
fn object_generation_fills_every_property() {
    let fixture = Fixture::new();
    let mut test = Test::default();
    let pet = fixture.spec.find_schema_by_name("Pet").expect("Pet");
    let value =
        generate_schema(&mut test, "", None, &pet, &fixture.ctx(), 3).expect("generated");
    let object = value.as_object().expect("object");
    assert!(object.get("id").is_some_and(JsonValue::is_i64));
    assert!(object.get("name").is_some_and(JsonValue::is_string));
}

#[test]
fn all_of_merges_and_sets_the_discriminator() {
    let fixture = Fixture::new();
    let mut test = Test::default();
    let dog = fixture.spec.find_schema_by_name("Dog").expect("Dog");
    let value =
        generate_schema(&mut test, "", None, &dog, &fixture.ctx(), 3).expect("generated");
    let object = value.as_object().expect("object");
    assert!(object.contains_key("bark"));
    assert_eq!(object.get("kind"), Some(&json!("Dog")));
}

#[test]
fn named_field_references_prefer_stored_objects() {
    let fixture = Fixture::new();
    let stored = json!({ "id": 7, "name": "stored" });
    lock(&fixture.suite_store)
        .insert("Pet", stored.clone(), None)
        .expect("insert");
    let mut test = Test::default();
    let schema = schema(json!({ "$ref": "#/components/schemas/Pet" }));
    let value = generate_schema(&mut test, "pet_", None, &schema, &fixture.ctx(), 3)
        .expect("generated");
    assert_eq!(value, stored);
}

#[test]
fn tagged_scalars_reuse_store_values_and_record_old_used() {
    let fixture = Fixture::new();
    lock(&fixture.suite_store)
        .insert("Pet", json!({ "id": 42, "name": "known" }), None)
        .expect("insert");
    let mut test = Test::default();
    let schema = schema(json!({
        "type": "integer",
        "description": "<meqa Pet.id.get>"
    }));
    let param = json!({ "name": "id", "in": "path", "schema": { "type": "integer" } });
    let value = generate_by_type(
        &mut test,
        &schema,
        "id_",
        schema.tag().as_ref(),
        param.as_object(),
        &fixture.ctx(),
    )
    .expect("generated");
    assert_eq!(value, json!(42));
    let comps = test.runtime.comparisons.get("Pet").expect("comparison");
    assert_eq!(
        comps[0].old_used.as_ref().and_then(|used| used.get("id")),
        Some(&json!(42))
    );
}

#[test]
fn fuzz_samples_are_split_by_validity() {
    let mut fixture = Fixture::new();
    fixture.dataset.positive.insert(
        "integer".to_string(),
        vec![json!(6), json!(100)],
    );
    fixture.dataset.negative.insert(
        "integer".to_string(),
        vec![json!(-5), json!(7)],
    );
    let mut ctx = fixture.ctx();
    ctx.fuzz_mode = FuzzMode::All;
    let mut test = Test::default();
    let schema = schema(json!({ "type": "integer", "minimum": 5, "maximum": 10 }));
    generate_schema(&mut test, "count_", None, &schema, &ctx, 3).expect("generated");

    let samples = test.runtime.sample_space.get("count").expect("samples");
    let positives: Vec<&FuzzValue> = samples
        .iter()
        .filter(|sample| sample.kind == FuzzKind::Positive)
        .collect();
    assert_eq!(positives.len(), 1);
    assert_eq!(positives[0].value, json!(6));
    let negatives: Vec<&FuzzValue> = samples
        .iter()
        .filter(|sample| sample.kind == FuzzKind::Negative)
        .collect();
    assert_eq!(negatives.len(), 1);
    assert_eq!(negatives[0].value, json!(-5));
    // One datatype sample per other primitive type.
    let datatypes = samples
        .iter()
        .filter(|sample| sample.kind == FuzzKind::Datatype)
        .count();
    assert_eq!(datatypes, 3);
}

#[test]
fn file_parameters_cannot_be_generated() {
    let error = generate_value("file", &SchemaRef::default(), "upload_").expect_err("error");
    assert!(matches!(error, crate::Error::CannotFuzzFile(_)));
}

#[test]
fn pattern_synthesis_matches_its_own_pattern() {
    for pattern in ["[a-z]{3}\\d{2}", "(cat|dog)-[0-9]+", "^x[A-F]{2}$"] {
        let generated = generate_matching(pattern).expect("generated");
        let checker = regex::Regex::new(pattern).expect("valid pattern");
        assert!(
            checker.is_match(&generated),
            "'{generated}' does not match {pattern}"
        );
    }
}
