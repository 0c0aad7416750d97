use oastest_core::dag::{build_dag, dag_name, Dag, NodeData, TYPE_DEF, TYPE_OP};
use oastest_core::Spec;
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

fn transitive_children(dag: &Dag, start: usize) -> std::collections::BTreeSet<usize> {
    let mut seen = std::collections::BTreeSet::new();
    let mut stack: Vec<usize> = dag.nodes()[start].children().iter().copied().collect();
    while let Some(index) = stack.pop() {
        if seen.insert(index) {
            stack.extend(dag.nodes()[index].children().iter().copied());
        }
    }
    seen
}

#[test]
fn every_node_gets_a_weight() {
    let dag = build_dag(&petstore()).expect("dag");
    for node in dag.nodes() {
        assert!(node.weight.is_some(), "{} has no weight", node.name);
    }
}

#[test]
fn graph_is_acyclic() {
    let dag = build_dag(&petstore()).expect("dag");
    for index in 0..dag.nodes().len() {
        assert!(
            !transitive_children(&dag, index).contains(&index),
            "{} reaches itself",
            dag.nodes()[index].name
        );
    }
}

#[test]
fn weights_grow_along_edges() {
    let dag = build_dag(&petstore()).expect("dag");
    for node in dag.nodes() {
        let weight = node.weight.expect("weight");
        for child in node.children() {
            let child_weight = dag.nodes()[*child].weight.expect("weight");
            assert!(
                weight < child_weight,
                "{} !< {}",
                node.name,
                dag.nodes()[*child].name
            );
        }
    }
}

#[test]
fn post_produces_the_definition() {
    let dag = build_dag(&petstore()).expect("dag");
    let post = dag
        .node(&dag_name(TYPE_OP, "/pets", "post"))
        .expect("post node");
    let def_index = dag
        .index(&dag_name(TYPE_DEF, "Pet", ""))
        .expect("Pet node");
    assert!(post.children().contains(&def_index));
}

#[test]
fn consuming_put_sits_below_the_definition() {
    let dag = build_dag(&petstore()).expect("dag");
    let put = dag
        .node(&dag_name(TYPE_OP, "/pets/{id}", "put"))
        .expect("put node");
    let def_index = dag
        .index(&dag_name(TYPE_DEF, "Pet", ""))
        .expect("Pet node");
    assert!(put.parents().contains(&def_index));
    let def_weight = dag.nodes()[def_index].weight.expect("weight");
    assert!(put.weight.expect("weight") > def_weight);
}

#[test]
fn priorities_order_create_before_read() {
    let dag = build_dag(&petstore()).expect("dag");
    let priority = |method: &str, path: &str| {
        dag.node(&dag_name(TYPE_OP, path, method))
            .expect("node")
            .priority
    };
    let post = priority("post", "/pets");
    let list = priority("get", "/pets");
    let read = priority("get", "/pets/{id}");
    let put = priority("put", "/pets/{id}");
    assert!(post < list, "post {post} !< list {list}");
    assert!(list < read, "list {list} !< read {read}");
    assert!(read < put, "read {read} !< put {put}");
}

#[test]
fn cyclic_references_are_broken_not_fatal() {
    let spec = Spec::from_value(json!({
        "openapi": "3.0.0",
        "components": {
            "schemas": {
                "A": {
                    "type": "object",
                    "properties": { "b": { "$ref": "#/components/schemas/B" } }
                },
                "B": {
                    "type": "object",
                    "properties": { "a": { "$ref": "#/components/schemas/A" } }
                }
            }
        },
        "paths": {}
    }))
    .expect("spec");
    let dag = build_dag(&spec).expect("dag survives the cycle");
    assert_eq!(dag.dropped_edges().len(), 1);
    for node in dag.nodes() {
        assert!(node.weight.is_some(), "{} has no weight", node.name);
    }
}

#[test]
fn duplicate_definitions_are_rejected() {
    let mut dag = Dag::new();
    let schema = oastest_core::SchemaRef::default();
    dag.new_node(
        dag_name(TYPE_DEF, "Pet", ""),
        NodeData::Definition {
            name: "Pet".to_string(),
            schema: schema.clone(),
        },
    )
    .expect("first insert");
    let error = dag
        .new_node(
            dag_name(TYPE_DEF, "Pet", ""),
            NodeData::Definition {
                name: "Pet".to_string(),
                schema,
            },
        )
        .expect_err("duplicate");
    assert!(error.to_string().contains("duplicate"));
}
