use std::sync::Arc;

use serde_json::json;

use super::*;
use crate::dsl::Response;
use crate::plan::Context;
use crate::spec::Spec;
use crate::values::JsonObject;

fn pet_spec() -> Arc<Spec> {
    Arc::new(
        Spec::from_value(json!({
            "openapi": "3.0.0",
            "servers": [{ "url": "http://localhost:0" }],
            "components": {
                "schemas": {
                    "Pet": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "integer" },
                            "name": { "type": "string" }
                        }
                    }
                }
            },
            "paths": {}
        }))
        .expect("spec"),
    )
}

fn ctx() -> Context {
    Context::new(pet_spec(), "http://localhost:0").expect("context")
}

fn suite_store(ctx: &Context) -> SharedStore {
    Arc::new(std::sync::Mutex::new(lock(&ctx.store).clone_schema()))
}

fn pet_operation() -> JsonObject {
    json!({
        "responses": {
            "200": {
                "content": {
                    "application/json": {
                        "schema": { "$ref": "#/components/schemas/Pet" }
                    }
                }
            }
        }
    })
    .as_object()
    .cloned()
    .expect("operation object")
}

fn pet_list_operation() -> JsonObject {
    json!({
        "responses": {
            "200": {
                "content": {
                    "application/json": {
                        "schema": {
                            "type": "array",
                            "items": { "$ref": "#/components/schemas/Pet" }
                        }
                    }
                }
            }
        }
    })
    .as_object()
    .cloned()
    .expect("operation object")
}

fn base_test(method: &str, path: &str, status: u16, body: serde_json::Value) -> Test {
    let mut test = Test {
        name: "unit".to_string(),
        path: path.to_string(),
        method: method.to_string(),
        ..Test::default()
    };
    test.runtime.op = Some(pet_operation());
    test.runtime.resp = Some(Response {
        status,
        body: Some(body.clone()),
        text: body.to_string(),
    });
    test
}

#[test]
fn success_overwrites_expect_with_ground_truth() {
    let ctx = ctx();
    let store = suite_store(&ctx);
    let mut test = base_test("get", "/pets", 200, json!([{ "id": 1, "name": "a" }]));
    test.runtime.op = Some(pet_list_operation());
    process_result(&mut test, &ctx, &store).expect("success");
    assert_eq!(test.expect_status(), Some(&json!(200)));
    assert_eq!(
        test.expect_body(),
        Some(&json!([{ "id": 1, "name": "a" }]))
    );
    // Non-strict runs absorb returned objects into the store.
    assert_eq!(lock(&store).count("Pet"), 1);
}

#[test]
fn failing_status_is_an_expect_error() {
    let ctx = ctx();
    let store = suite_store(&ctx);
    let mut test = base_test("get", "/pets", 500, json!({}));
    let error = process_result(&mut test, &ctx, &store).expect_err("failure");
    assert!(matches!(error, crate::Error::Expect(_)));
    assert!(test.runtime.response_error.is_some());
}

#[test]
fn explicit_fail_expectation_inverts_success() {
    let ctx = ctx();
    let store = suite_store(&ctx);
    let mut test = base_test("get", "/pets", 500, json!({}));
    let mut expect = JsonObject::new();
    expect.insert("status".to_string(), json!("fail"));
    test.expect = Some(expect);
    process_result(&mut test, &ctx, &store).expect("inverted success");
}

#[test]
fn explicit_status_code_expectation_must_match() {
    let ctx = ctx();
    let store = suite_store(&ctx);
    let mut test = base_test("post", "/pets", 400, json!({}));
    let mut expect = JsonObject::new();
    expect.insert("status".to_string(), json!(400));
    test.expect = Some(expect);
    process_result(&mut test, &ctx, &store).expect("matching code");
    // An explicit code skips reconciliation: nothing lands in the store.
    assert_eq!(lock(&store).count("Pet"), 0);
}

#[test]
fn expect_body_mismatch_fails() {
    let ctx = ctx();
    let store = suite_store(&ctx);
    let mut test = base_test("get", "/pets", 200, json!({ "id": 2, "name": "b" }));
    let mut expect = JsonObject::new();
    expect.insert("body".to_string(), json!({ "id": 3 }));
    test.expect = Some(expect);
    let error = process_result(&mut test, &ctx, &store).expect_err("mismatch");
    assert!(matches!(error, crate::Error::Expect(_)));
}

#[test]
fn schema_mismatch_is_recorded_but_not_fatal() {
    let ctx = ctx();
    let store = suite_store(&ctx);
    // Pet.id must be an integer.
    let mut test = base_test("get", "/pets", 200, json!({ "id": "seven" }));
    process_result(&mut test, &ctx, &store).expect("non-fatal");
    assert!(test.runtime.schema_error.is_some());
}

#[test]
fn strict_post_fails_when_response_omits_posted_fields() {
    let ctx = ctx();
    let store = suite_store(&ctx);
    let mut test = base_test("post", "/pets", 200, json!({ "id": 1 }));
    test.strict = true;
    let posted = json!({ "id": 1, "name": "posted" })
        .as_object()
        .cloned()
        .expect("posted object");
    test.runtime.comparisons.insert(
        "Pet".to_string(),
        vec![Comparison::with_new(posted, SchemaRef::default())],
    );
    let error = process_result(&mut test, &ctx, &store).expect_err("strict failure");
    match error {
        crate::Error::Http(message) => {
            assert!(message.contains("client object not found in results returned"));
        }
        other => panic!("expected Http error, got {other:?}"),
    }
}

#[test]
fn post_replaces_client_guess_with_server_object() {
    let ctx = ctx();
    let store = suite_store(&ctx);
    let mut test = base_test("post", "/pets", 200, json!({ "id": 9, "name": "server" }));
    let posted = json!({ "name": "client" })
        .as_object()
        .cloned()
        .expect("posted object");
    test.runtime.comparisons.insert(
        "Pet".to_string(),
        vec![Comparison::with_new(posted, SchemaRef::default())],
    );
    process_result(&mut test, &ctx, &store).expect("success");
    let stored = lock(&store).find("Pet", None, None, interface_equals, -1);
    assert_eq!(stored, vec![json!({ "id": 9, "name": "server" })]);
}

#[test]
fn single_resource_get_requires_client_knowledge() {
    let ctx = ctx();
    let store = suite_store(&ctx);
    lock(&store)
        .insert("Pet", json!({ "id": 1, "name": "known" }), None)
        .expect("insert");

    // The stored pet comes back: fine.
    let mut test = base_test("get", "/pets/{id}", 200, json!({ "id": 1, "name": "known" }));
    process_result(&mut test, &ctx, &store).expect("known object");

    // An object the client never saw: response not in client store.
    let mut test = base_test("get", "/pets/{id}", 200, json!({ "id": 8, "name": "ghost" }));
    let error = process_result(&mut test, &ctx, &store).expect_err("unknown object");
    match error {
        crate::Error::Http(message) => {
            assert!(message.contains("remote object not found in client"));
        }
        other => panic!("expected Http error, got {other:?}"),
    }
}

#[test]
fn listing_get_requires_every_client_object_in_response() {
    let ctx = ctx();
    let store = suite_store(&ctx);
    lock(&store)
        .insert("Pet", json!({ "id": 1 }), None)
        .expect("insert");
    lock(&store)
        .insert("Pet", json!({ "id": 2 }), None)
        .expect("insert");

    let mut test = base_test("get", "/pets", 200, json!([{ "id": 1 }, { "id": 2 }]));
    test.runtime.op = Some(pet_list_operation());
    process_result(&mut test, &ctx, &store).expect("client subset of response");

    let mut test = base_test("get", "/pets", 200, json!([{ "id": 1 }]));
    test.runtime.op = Some(pet_list_operation());
    let error = process_result(&mut test, &ctx, &store).expect_err("missing client object");
    match error {
        crate::Error::Http(message) => {
            assert!(message.contains("client object not found in results returned"));
        }
        other => panic!("expected Http error, got {other:?}"),
    }
}

#[test]
fn delete_dispatch_removes_the_object() {
    let ctx = ctx();
    let store = suite_store(&ctx);
    lock(&store)
        .insert("Pet", json!({ "id": 5, "name": "gone" }), None)
        .expect("insert");
    let mut test = base_test("delete", "/pets/{id}", 204, json!(null));
    test.runtime.resp = Some(Response {
        status: 204,
        body: None,
        text: String::new(),
    });
    let old_used = json!({ "id": 5 }).as_object().cloned().expect("old used");
    test.runtime.comparisons.insert(
        "Pet".to_string(),
        vec![Comparison {
            old: Some(old_used.clone()),
            old_used: Some(old_used),
            new: None,
            schema: SchemaRef::default(),
        }],
    );
    process_result(&mut test, &ctx, &store).expect("delete");
    assert_eq!(lock(&store).count("Pet"), 0);
}
