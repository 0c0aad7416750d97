use oastest_core::store::{match_always, Assoc};
use oastest_core::{interface_equals, DataStore, Spec};
use serde_json::json;

fn spec() -> Spec {
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
                "Order": {
                    "type": "object",
                    "properties": {
                        "id": { "type": "integer" },
                        "petId": { "type": "integer" },
                        "status": { "type": "string" }
                    }
                }
            }
        },
        "paths": {}
    }))
    .expect("spec")
}

fn store() -> DataStore {
    DataStore::new(&spec())
}

#[test]
fn insert_and_find_round_trip() {
    let mut store = store();
    store
        .insert("Pet", json!({ "id": 1, "name": "rex" }), None)
        .expect("insert");
    store
        .insert("Pet", json!({ "id": 2, "name": "ada" }), None)
        .expect("insert");

    let all = store.find("Pet", None, None, match_always, -1);
    assert_eq!(all.len(), 2);

    let found = store.find("Pet", Some(&json!({ "id": 2 })), None, interface_equals, -1);
    assert_eq!(found, vec![json!({ "id": 2, "name": "ada" })]);
}

#[test]
fn unknown_class_is_rejected() {
    let mut store = store();
    let error = store
        .insert("Ghost", json!({}), None)
        .expect_err("unknown class");
    assert!(error.to_string().contains("unknown class"));
}

#[test]
fn find_honors_the_limit() {
    let mut store = store();
    for id in 0..5 {
        store
            .insert("Pet", json!({ "id": id }), None)
            .expect("insert");
    }
    assert_eq!(store.find("Pet", None, None, match_always, 2).len(), 2);
    assert_eq!(store.find("Pet", None, None, match_always, -1).len(), 5);
    assert_eq!(store.find("Pet", None, None, match_always, 0).len(), 0);
}

#[test]
fn update_replaces_or_patches() {
    let mut store = store();
    store
        .insert("Pet", json!({ "id": 1, "name": "rex" }), None)
        .expect("insert");

    let updated = store.update(
        "Pet",
        Some(&json!({ "id": 1 })),
        None,
        interface_equals,
        &json!({ "name": "max" }),
        1,
        true,
    );
    assert_eq!(updated, 1);
    let found = store.find("Pet", Some(&json!({ "id": 1 })), None, interface_equals, -1);
    assert_eq!(found, vec![json!({ "id": 1, "name": "max" })]);

    let replaced = store.update(
        "Pet",
        Some(&json!({ "id": 1 })),
        None,
        interface_equals,
        &json!({ "name": "solo" }),
        1,
        false,
    );
    assert_eq!(replaced, 1);
    let found = store.find("Pet", None, None, match_always, -1);
    assert_eq!(found, vec![json!({ "name": "solo" })]);
}

#[test]
fn delete_removes_at_most_limit() {
    let mut store = store();
    for id in 0..3 {
        store
            .insert("Pet", json!({ "id": id, "name": "x" }), None)
            .expect("insert");
    }
    let deleted = store.delete(
        "Pet",
        Some(&json!({ "name": "x" })),
        None,
        interface_equals,
        1,
    );
    assert_eq!(deleted, 1);
    assert_eq!(store.count("Pet"), 2);

    let deleted = store.delete("Pet", None, None, match_always, -1);
    assert_eq!(deleted, 2);
    assert_eq!(store.count("Pet"), 0);
}

#[test]
fn clone_schema_starts_empty_but_typed() {
    let mut store = store();
    store
        .insert("Pet", json!({ "id": 1 }), None)
        .expect("insert");
    let mut clone = store.clone_schema();
    assert_eq!(clone.count("Pet"), 0);
    clone
        .insert("Pet", json!({ "id": 9 }), None)
        .expect("clone accepts known classes");
    assert_eq!(store.count("Pet"), 1);
}

#[test]
fn associations_gate_matches() {
    let mut store = store();
    store
        .insert("Pet", json!({ "id": 1, "name": "rex" }), None)
        .expect("insert");
    store
        .insert("Order", json!({ "id": 10, "petId": 1 }), None)
        .expect("insert");

    let mut assoc = Assoc::new();
    assoc.insert("Pet".to_string(), json!({ "id": 1 }));
    let found = store.find("Order", None, Some(&assoc), match_always, -1);
    assert_eq!(found.len(), 1);

    let mut assoc = Assoc::new();
    assoc.insert("Pet".to_string(), json!({ "id": 99 }));
    let found = store.find("Order", None, Some(&assoc), match_always, -1);
    assert!(found.is_empty());
}

#[test]
fn find_matching_schema_prefers_first_name() {
    let spec = spec();
    let store = DataStore::new(&spec);
    // Both Order and Pet validate {"id": 1}; lexicographic order wins.
    let (class, _) = store
        .find_matching_schema(&json!({ "id": 1 }), &spec)
        .expect("match");
    assert_eq!(class, "Order");

    let (class, _) = store
        .find_matching_schema(&json!({ "id": 1, "name": "rex" }), &spec)
        .expect("match");
    assert_eq!(class, "Order");
}
