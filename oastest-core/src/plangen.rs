//! Plan generation strategies: one suite per operation (`simple`), per
//! produced/consumed class (`object`), or per API path (`path`).

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value as JsonValue;

use crate::dag::{Dag, DagNode, NodeData};
use crate::dsl::{Test, EXPECT_STATUS, STATUS_SUCCESS};
use crate::error::Result;
use crate::plan::{TestPlan, TestSuite};
use crate::spec::{method_weight, Spec, METHODS};
use crate::tag::MeqaTag;
use crate::values::JsonObject;

/// `("post", "/pet/{id}")` becomes `postPetId`, the name used for the
/// test and for history back-references.
pub fn op_test_name(method: &str, path: &str) -> String {
    let mut name = method.to_lowercase();
    for segment in path.split('/') {
        let cleaned: String = segment
            .chars()
            .filter(|ch| ch.is_ascii_alphanumeric())
            .collect();
        let mut chars = cleaned.chars();
        if let Some(first) = chars.next() {
            name.push(first.to_ascii_uppercase());
            name.push_str(chars.as_str());
        }
    }
    name
}

fn plan_test(path: &str, method: &str) -> Test {
    let mut expect = JsonObject::new();
    expect.insert(
        EXPECT_STATUS.to_string(),
        JsonValue::String(STATUS_SUCCESS.to_string()),
    );
    Test {
        name: op_test_name(method, path),
        path: path.to_string(),
        method: method.to_string(),
        expect: Some(expect),
        ..Test::default()
    }
}

fn operation_nodes(dag: &Dag) -> Vec<&DagNode> {
    let mut nodes: Vec<&DagNode> = dag
        .nodes()
        .iter()
        .filter(|node| node.is_operation())
        .collect();
    nodes.sort_by(|a, b| (a.priority, &a.name).cmp(&(b.priority, &b.name)));
    nodes
}

/// One suite per operation, ordered by priority so producers run before
/// consumers.
pub fn generate_simple_plan(_spec: &Spec, dag: &Dag) -> Result<TestPlan> {
    let mut plan = TestPlan::new();
    for node in operation_nodes(dag) {
        let NodeData::Operation { path, method } = &node.data else {
            continue;
        };
        let test = plan_test(path, method);
        plan.add(TestSuite {
            name: test.name.clone(),
            tests: vec![test],
            comment: String::new(),
        })?;
    }
    Ok(plan)
}

/// The class an operation belongs to: its tag, then the first definition
/// it produces, then the first one it consumes.
fn operation_class(spec: &Spec, dag: &Dag, node: &DagNode) -> Option<String> {
    let NodeData::Operation { path, method } = &node.data else {
        return None;
    };
    if let Some(tag) = spec
        .operation(path, method)
        .and_then(|op| op.get("description"))
        .and_then(JsonValue::as_str)
        .and_then(MeqaTag::parse)
    {
        if !tag.class.is_empty() {
            return Some(tag.class);
        }
    }
    let definition_name = |index: &usize| match &dag.nodes()[*index].data {
        NodeData::Definition { name, .. } => Some(name.clone()),
        NodeData::Operation { .. } => None,
    };
    node.children()
        .iter()
        .find_map(definition_name)
        .or_else(|| node.parents().iter().find_map(definition_name))
}

/// Per-class suites; within a suite operations are ordered by priority so
/// create precedes read, update, and delete for that class.
pub fn generate_object_plan(spec: &Spec, dag: &Dag) -> Result<TestPlan> {
    let mut grouped: BTreeMap<String, Vec<Test>> = BTreeMap::new();
    for node in operation_nodes(dag) {
        let NodeData::Operation { path, method } = &node.data else {
            continue;
        };
        let test = plan_test(path, method);
        let class = operation_class(spec, dag, node).unwrap_or_else(|| test.name.clone());
        grouped.entry(class).or_default().push(test);
    }
    let mut plan = TestPlan::new();
    for (class, tests) in grouped {
        plan.add(TestSuite {
            name: class,
            tests,
            comment: String::new(),
        })?;
    }
    Ok(plan)
}

/// One suite per path, operations ordered by method rank. The ignore list
/// wins over the whitelist; an empty whitelist accepts every path.
pub fn generate_path_plan(
    spec: &Spec,
    _dag: &Dag,
    whitelist: Option<&BTreeSet<String>>,
    ignored: Option<&BTreeSet<String>>,
) -> Result<TestPlan> {
    let mut plan = TestPlan::new();
    for (path, _item) in spec.paths() {
        if ignored.is_some_and(|list| list.contains(&path)) {
            continue;
        }
        if whitelist.is_some_and(|list| !list.is_empty() && !list.contains(&path)) {
            continue;
        }
        let mut tests: Vec<Test> = METHODS
            .iter()
            .copied()
            .filter(|method| spec.operation(&path, method).is_some())
            .map(|method| plan_test(&path, method))
            .collect();
        if tests.is_empty() {
            continue;
        }
        tests.sort_by_key(|test| method_weight(&test.method));
        plan.add(TestSuite {
            name: path.clone(),
            tests,
            comment: String::new(),
        })?;
    }
    Ok(plan)
}
