use std::collections::BTreeSet;

use oastest_core::dag::{build_dag, dag_name, TYPE_OP};
use oastest_core::plangen::op_test_name;
use oastest_core::{
    generate_object_plan, generate_path_plan, generate_simple_plan, Spec, TestPlan,
};
use serde_json::json;

fn petstore() -> Spec {
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
                }
            }
        },
        "paths": {
            "/pets": {
                "post": {
                    "requestBody": {
                        "content": {
                            "application/json": {
                                "schema": { "$ref": "#/components/schemas/Pet" }
                            }
                        }
                    },
                    "responses": {
                        "201": {
                            "content": {
                                "application/json": {
                                    "schema": { "$ref": "#/components/schemas/Pet" }
                                }
                            }
                        }
                    }
                },
                "get": {
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
                }
            },
            "/pets/{id}": {
                "parameters": [
                    { "name": "id", "in": "path", "schema": { "type": "integer" } }
                ],
                "get": {
                    "responses": {
                        "200": {
                            "content": {
                                "application/json": {
                                    "schema": { "$ref": "#/components/schemas/Pet" }
                                }
                            }
                        }
                    }
                },
                "put": {
                    "requestBody": {
                        "content": {
                            "application/json": {
                                "schema": { "$ref": "#/components/schemas/Pet" }
                            }
                        }
                    },
                    "responses": { "200": { "description": "updated" } }
                },
                "delete": {
                    "responses": { "204": { "description": "deleted" } }
                }
            }
        }
    }))
    .expect("spec")
}

#[test]
fn test_names_read_like_operations() {
    assert_eq!(op_test_name("post", "/pets"), "postPets");
    assert_eq!(op_test_name("get", "/pets/{id}"), "getPetsId");
    assert_eq!(op_test_name("get", "/store/order/{orderId}"), "getStoreOrderOrderId");
}

#[test]
fn simple_plan_is_ordered_by_priority() {
    let spec = petstore();
    let dag = build_dag(&spec).expect("dag");
    let plan = generate_simple_plan(&spec, &dag).expect("plan");
    assert_eq!(plan.suites.len(), 5);
    for suite in &plan.suites {
        assert_eq!(suite.tests.len(), 1);
        assert_eq!(
            suite.tests[0].expect_status(),
            Some(&json!("success"))
        );
    }

    let priorities: Vec<u32> = plan
        .suites
        .iter()
        .map(|suite| {
            let test = &suite.tests[0];
            dag.node(&dag_name(TYPE_OP, &test.path, &test.method))
                .expect("node")
                .priority
        })
        .collect();
    let mut sorted = priorities.clone();
    sorted.sort_unstable();
    assert_eq!(priorities, sorted, "suites out of priority order");

    // The creator comes first.
    assert_eq!(plan.suites[0].tests[0].method, "post");
    assert_eq!(plan.suites[0].tests[0].path, "/pets");
}

#[test]
fn object_plan_groups_operations_by_class() {
    let spec = petstore();
    let dag = build_dag(&spec).expect("dag");
    let plan = generate_object_plan(&spec, &dag).expect("plan");

    let pet_suite = plan.suite("Pet").expect("Pet suite");
    // Every operation producing or consuming Pet lands in its suite,
    // create first.
    assert!(pet_suite.tests.len() >= 4);
    assert_eq!(pet_suite.tests[0].method, "post");
    let methods: BTreeSet<&str> = pet_suite
        .tests
        .iter()
        .map(|test| test.method.as_str())
        .collect();
    assert!(methods.contains("post"));
    assert!(methods.contains("put"));
}

#[test]
fn path_plan_emits_one_suite_per_path_in_method_order() {
    let spec = petstore();
    let dag = build_dag(&spec).expect("dag");
    let plan = generate_path_plan(&spec, &dag, None, None).expect("plan");
    assert_eq!(plan.suites.len(), 2);

    let item_suite = plan.suite("/pets/{id}").expect("suite");
    let methods: Vec<&str> = item_suite
        .tests
        .iter()
        .map(|test| test.method.as_str())
        .collect();
    assert_eq!(methods, vec!["get", "put", "delete"]);
}

#[test]
fn path_plan_filters_ignore_wins_over_whitelist() {
    let spec = petstore();
    let dag = build_dag(&spec).expect("dag");

    let whitelist: BTreeSet<String> = ["/pets".to_string()].into_iter().collect();
    let plan = generate_path_plan(&spec, &dag, Some(&whitelist), None).expect("plan");
    assert_eq!(plan.suites.len(), 1);
    assert_eq!(plan.suites[0].name, "/pets");

    let ignored: BTreeSet<String> = ["/pets".to_string()].into_iter().collect();
    let plan = generate_path_plan(&spec, &dag, Some(&whitelist), Some(&ignored)).expect("plan");
    assert!(plan.suites.is_empty());

    // An empty whitelist accepts every path.
    let empty = BTreeSet::new();
    let plan = generate_path_plan(&spec, &dag, Some(&empty), None).expect("plan");
    assert_eq!(plan.suites.len(), 2);
}

#[test]
fn generated_plans_survive_a_file_round_trip() {
    let spec = petstore();
    let dag = build_dag(&spec).expect("dag");
    let plan = generate_simple_plan(&spec, &dag).expect("plan");

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("simple.yml");
    plan.dump_to_file(&path).expect("dump");
    let reloaded = TestPlan::from_file(&path).expect("reload");

    let names: Vec<&String> = plan.suites.iter().map(|suite| &suite.name).collect();
    let reloaded_names: Vec<&String> = reloaded.suites.iter().map(|suite| &suite.name).collect();
    assert_eq!(names, reloaded_names);
    for (before, after) in plan.suites.iter().zip(reloaded.suites.iter()) {
        assert_eq!(before.tests.len(), after.tests.len());
        for (test_before, test_after) in before.tests.iter().zip(after.tests.iter()) {
            assert_eq!(test_before.name, test_after.name);
            assert_eq!(test_before.path, test_after.path);
            assert_eq!(test_before.method, test_after.method);
            assert_eq!(test_before.expect, test_after.expect);
        }
    }
}
