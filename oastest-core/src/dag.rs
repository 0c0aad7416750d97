//! Dependency graph over schemas and operations.
//!
//! Every named schema becomes a `d?Name?` node, every operation an
//! `o?Path?method` node. An edge goes from producer to consumer: when X
//! consumes Y, Y is a parent of X and must be exercised first. A
//! topological pass assigns each node a weight (longest path from the
//! leaves) and a second pass derives per-operation priorities that order
//! the generated plans: create before read, read before update, update
//! before delete.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::spec::{method_weight, SchemaRef, Spec, METHODS};
use crate::tag::MeqaTag;

/// Node kind code for schema definitions.
pub const TYPE_DEF: &str = "d";
/// Node kind code for operations.
pub const TYPE_OP: &str = "o";

const FIELD_SEPARATOR: char = '?';

/// Canonical node name: `{kind}?{name}?{method}`.
pub fn dag_name(kind: &str, name: &str, method: &str) -> String {
    format!("{kind}{FIELD_SEPARATOR}{name}{FIELD_SEPARATOR}{method}")
}

/// Payload carried by a graph node.
#[derive(Clone, Debug)]
pub enum NodeData {
    Definition { name: String, schema: SchemaRef },
    Operation { path: String, method: String },
}

#[derive(Clone, Debug)]
pub struct DagNode {
    pub name: String,
    pub data: NodeData,
    /// Longest path from the leaves; leaves sit at 0. Assigned by `sort`.
    pub weight: Option<u32>,
    /// Execution rank for operations; 0 for definitions.
    pub priority: u32,
    parents: BTreeSet<usize>,
    children: BTreeSet<usize>,
}

impl DagNode {
    pub fn parents(&self) -> &BTreeSet<usize> {
        &self.parents
    }

    pub fn children(&self) -> &BTreeSet<usize> {
        &self.children
    }

    pub fn is_operation(&self) -> bool {
        matches!(self.data, NodeData::Operation { .. })
    }
}

#[derive(Debug, Default)]
pub struct Dag {
    nodes: Vec<DagNode>,
    name_map: HashMap<String, usize>,
    /// Edges in insertion order; cycle breaking drops the latest closing one.
    edges: Vec<(usize, usize)>,
    dropped: Vec<(String, String)>,
}

impl Dag {
    pub fn new() -> Dag {
        Dag::default()
    }

    pub fn new_node(&mut self, name: String, data: NodeData) -> Result<usize> {
        if self.name_map.contains_key(&name) {
            return Err(Error::invalid_spec(format!("duplicate node name: {name}")));
        }
        let index = self.nodes.len();
        self.nodes.push(DagNode {
            name: name.clone(),
            data,
            weight: None,
            priority: 0,
            parents: BTreeSet::new(),
            children: BTreeSet::new(),
        });
        self.name_map.insert(name, index);
        Ok(index)
    }

    pub fn nodes(&self) -> &[DagNode] {
        &self.nodes
    }

    pub fn index(&self, name: &str) -> Option<usize> {
        self.name_map.get(name).copied()
    }

    pub fn node(&self, name: &str) -> Option<&DagNode> {
        self.index(name).map(|index| &self.nodes[index])
    }

    /// Edges dropped while breaking cycles, preserved for debugging.
    pub fn dropped_edges(&self) -> &[(String, String)] {
        &self.dropped
    }

    fn add_edge(&mut self, parent: usize, child: usize) {
        if parent == child {
            return;
        }
        if self.edges.contains(&(parent, child)) {
            return;
        }
        self.edges.push((parent, child));
        self.nodes[parent].children.insert(child);
        self.nodes[child].parents.insert(parent);
    }

    /// Connects a node to the definition nodes of the given classes. With
    /// `as_children` the classes depend on this node (it produces them);
    /// otherwise this node depends on the classes (it consumes them).
    pub fn add_dependencies(&mut self, node: usize, classes: &BTreeSet<String>, as_children: bool) {
        for class in classes {
            let Some(def) = self.index(&dag_name(TYPE_DEF, class, "")) else {
                log::warn!("dependency on unknown definition '{class}' skipped");
                continue;
            };
            if as_children {
                self.add_edge(node, def);
            } else {
                self.add_edge(def, node);
            }
        }
    }

    /// Assigns weights via a topological sweep. A node's weight is one
    /// more than the largest parent weight; leaves get 0. When no node is
    /// ready the latest-added edge inside the stuck set is dropped and the
    /// sweep continues.
    pub fn sort(&mut self) {
        let mut remaining: BTreeSet<usize> = (0..self.nodes.len()).collect();
        while !remaining.is_empty() {
            let ready: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|index| {
                    self.nodes[*index]
                        .parents
                        .iter()
                        .all(|parent| !remaining.contains(parent))
                })
                .collect();
            if ready.is_empty() {
                if !self.break_cycle(&remaining) {
                    // Should be unreachable; bail rather than spin.
                    log::warn!("unable to break cycle among {} nodes", remaining.len());
                    break;
                }
                continue;
            }
            for index in ready {
                let weight = self.nodes[index]
                    .parents
                    .iter()
                    .filter_map(|parent| self.nodes[*parent].weight)
                    .max()
                    .map(|max| max + 1)
                    .unwrap_or(0);
                self.nodes[index].weight = Some(weight);
                remaining.remove(&index);
            }
        }
    }

    fn break_cycle(&mut self, stuck: &BTreeSet<usize>) -> bool {
        let position = self
            .edges
            .iter()
            .rposition(|(parent, child)| stuck.contains(parent) && stuck.contains(child));
        let Some(position) = position else {
            return false;
        };
        let (parent, child) = self.edges.remove(position);
        self.nodes[parent].children.remove(&child);
        self.nodes[child].parents.remove(&parent);
        let record = (
            self.nodes[parent].name.clone(),
            self.nodes[child].name.clone(),
        );
        log::warn!(
            "cycle detected; dropping edge {} -> {}",
            record.0,
            record.1
        );
        self.dropped.push(record);
        true
    }

    /// Verifies that every node received a weight and that weights grow
    /// along edges. Anomalies are logged; a missing weight is an error.
    pub fn check_weight(&self) -> Result<()> {
        for node in &self.nodes {
            if node.weight.is_none() {
                return Err(Error::invalid_spec(format!(
                    "node {} was never assigned a weight",
                    node.name
                )));
            }
        }
        for (parent, child) in &self.edges {
            let parent_weight = self.nodes[*parent].weight.unwrap_or(0);
            let child_weight = self.nodes[*child].weight.unwrap_or(0);
            if parent_weight >= child_weight {
                log::warn!(
                    "weight anomaly: {} ({parent_weight}) !< {} ({child_weight})",
                    self.nodes[*parent].name,
                    self.nodes[*child].name
                );
            }
        }
        Ok(())
    }
}

/// What an operation consumes and produces. Untagged references fall
/// into the bucket the caller designates for the section being walked.
#[derive(Debug, Default)]
struct Dependencies {
    produces: BTreeSet<String>,
    consumes: BTreeSet<String>,
    is_post: bool,
}

#[derive(Clone, Copy)]
enum Bucket {
    Produces,
    Consumes,
}

impl Dependencies {
    fn insert(&mut self, bucket: Bucket, class: String) {
        match bucket {
            Bucket::Produces => self.produces.insert(class),
            Bucket::Consumes => self.consumes.insert(class),
        };
    }

    /// Records a tagged class. A tag with an explicit operation always
    /// decides the bucket; otherwise the class lands in the current
    /// default. Returns the class collected, if any.
    fn collect_from_tag(&mut self, tag: Option<&MeqaTag>, default: Bucket) -> Option<String> {
        let tag = tag?;
        if tag.class.is_empty() {
            return None;
        }
        let bucket = match tag.operation() {
            Some("post") => Bucket::Produces,
            Some(_) => Bucket::Consumes,
            None => default,
        };
        self.insert(bucket, tag.class.clone());
        Some(tag.class.clone())
    }

    fn collect_schema(&mut self, spec: &Spec, schema: &SchemaRef, default: Bucket) -> Result<()> {
        spec.iterate(schema, &mut |name, sub| {
            let collected = self.collect_from_tag(sub.tag().as_ref(), default);
            if collected.is_none() {
                if let Some(name) = name {
                    self.insert(default, name.to_string());
                }
            }
        })
    }
}

/// Builds the graph from a document: definition nodes and their mutual
/// references first, then operation nodes classified into producers and
/// consumers, then the weight sweep and the priority pass.
pub fn build_dag(spec: &Spec) -> Result<Dag> {
    let mut dag = Dag::new();

    let schemas = spec.schemas();
    for (name, schema) in &schemas {
        dag.new_node(
            dag_name(TYPE_DEF, name, ""),
            NodeData::Definition {
                name: name.clone(),
                schema: schema.clone(),
            },
        )?;
    }

    // The inner references of a schema are its parents.
    for (name, schema) in &schemas {
        let node = dag
            .index(&dag_name(TYPE_DEF, name, ""))
            .ok_or_else(|| Error::invalid_spec(format!("missing definition node {name}")))?;
        let mut referenced = BTreeSet::new();
        spec.iterate(schema, &mut |ref_name, _| {
            if let Some(ref_name) = ref_name {
                if ref_name != name {
                    referenced.insert(ref_name.to_string());
                }
            }
        })?;
        dag.add_dependencies(node, &referenced, false);
    }

    for (path, _item) in spec.paths() {
        for method in METHODS {
            if spec.operation(&path, method).is_none() {
                continue;
            }
            add_operation(&mut dag, spec, &path, method)?;
        }
    }

    dag.sort();

    for (path, _item) in spec.paths() {
        for method in METHODS {
            if spec.operation(&path, method).is_none() {
                continue;
            }
            set_priority(&mut dag, spec, &path, method);
        }
    }

    dag.check_weight()?;
    Ok(dag)
}

fn add_operation(dag: &mut Dag, spec: &Spec, path: &str, method: &str) -> Result<()> {
    let operation = spec
        .operation(path, method)
        .cloned()
        .ok_or_else(|| Error::not_found(format!("{method} {path}")))?;
    let node = dag.new_node(
        dag_name(TYPE_OP, path, method),
        NodeData::Operation {
            path: path.to_string(),
            method: method.to_string(),
        },
    )?;

    let op_tag = operation
        .get("description")
        .and_then(JsonValue::as_str)
        .and_then(MeqaTag::parse);

    let mut dep = Dependencies::default();
    dep.is_post = match op_tag.as_ref().and_then(MeqaTag::operation) {
        Some(op) => op == "post",
        None => method == "post",
    };
    if dep.is_post {
        if let Some(tag) = &op_tag {
            if !tag.class.is_empty() {
                dep.produces.insert(tag.class.clone());
            }
        }
    }

    collect_param_dependencies(&mut dep, spec, path, method, &operation)?;
    collect_response_dependencies(&mut dep, spec, &operation)?;

    // Creating an object consumes its inputs but not itself; reading an
    // object never counts as producing its inputs.
    if dep.is_post {
        for class in dep.produces.clone() {
            dep.consumes.remove(&class);
        }
    } else {
        for class in dep.consumes.clone() {
            dep.produces.remove(&class);
        }
    }

    let produces = dep.produces.clone();
    let consumes = dep.consumes.clone();
    dag.add_dependencies(node, &produces, true);
    dag.add_dependencies(node, &consumes, false);
    Ok(())
}

fn collect_param_dependencies(
    dep: &mut Dependencies,
    spec: &Spec,
    path: &str,
    method: &str,
    operation: &crate::values::JsonObject,
) -> Result<()> {
    for param in spec.operation_parameters(path, method) {
        let schema = param
            .get("schema")
            .and_then(SchemaRef::from_value)
            .unwrap_or_default();
        let bucket = param_bucket(dep, &param);
        let param_tag = param
            .get("description")
            .and_then(JsonValue::as_str)
            .and_then(MeqaTag::parse);
        collect_one_parameter(dep, spec, param_tag.as_ref(), &schema, bucket)?;
    }

    // The request body follows the same rules as a body parameter.
    if let Some(schema) = Spec::request_body_schema(operation) {
        let bucket = if dep.is_post {
            Bucket::Produces
        } else {
            Bucket::Consumes
        };
        collect_one_parameter(dep, spec, None, &schema, bucket)?;
    }
    Ok(())
}

fn param_bucket(dep: &Dependencies, param: &crate::values::JsonObject) -> Bucket {
    let location = param.get("in").and_then(JsonValue::as_str).unwrap_or("");
    if dep.is_post && (location == "body" || location == "formData") {
        Bucket::Produces
    } else {
        Bucket::Consumes
    }
}

fn collect_one_parameter(
    dep: &mut Dependencies,
    spec: &Spec,
    param_tag: Option<&MeqaTag>,
    schema: &SchemaRef,
    bucket: Bucket,
) -> Result<()> {
    let mut inputs_needed = Vec::new();
    let mut collected = dep.collect_from_tag(param_tag, bucket);
    if !schema.is_empty() {
        if collected.is_none() {
            collected = dep.collect_from_tag(schema.tag().as_ref(), bucket);
        }
        if let Some(class) = collected {
            // A named object inlined in the request keeps contributing its
            // own inputs; anything else is consumed through its class.
            if schema.schema_type() != Some("object") {
                inputs_needed.push(class);
            } else {
                dep.collect_schema(spec, schema, Bucket::Consumes)?;
            }
        } else {
            let (root_tag, root_schema) = spec.schema_root_type(schema, None);
            if let (Some(tag), Some(_)) = (root_tag, root_schema) {
                if !tag.class.is_empty() {
                    dep.insert(bucket, tag.class.clone());
                    inputs_needed.push(tag.class);
                }
            } else {
                dep.collect_schema(spec, schema, Bucket::Consumes)?;
            }
        }
    }

    // Posting an object consumes whatever that object refers to.
    for class in inputs_needed {
        if let Some(schema) = spec.find_schema_by_name(&class) {
            dep.collect_schema(spec, &schema, Bucket::Consumes)?;
        }
    }
    Ok(())
}

fn collect_response_dependencies(
    dep: &mut Dependencies,
    spec: &Spec,
    operation: &crate::values::JsonObject,
) -> Result<()> {
    for (code, response) in Spec::responses(operation) {
        let response_tag = response
            .get("description")
            .and_then(JsonValue::as_str)
            .and_then(MeqaTag::parse);
        if dep
            .collect_from_tag(response_tag.as_ref(), Bucket::Produces)
            .is_some()
        {
            continue;
        }
        let status: u16 = code.parse().unwrap_or(0);
        if !(200..300).contains(&status) {
            continue;
        }
        if let Some(schema) = Spec::response_schema(&response) {
            dep.collect_schema(spec, &schema, Bucket::Produces)?;
        }
    }
    Ok(())
}

fn set_priority(dag: &mut Dag, spec: &Spec, path: &str, method: &str) {
    let Some(node) = dag.index(&dag_name(TYPE_OP, path, method)) else {
        return;
    };

    // The consumed definitions are exactly the operation node's parents.
    let base = dag.nodes[node]
        .parents
        .iter()
        .filter_map(|parent| dag.nodes[*parent].weight)
        .max()
        .unwrap_or(0);

    let path_params = spec
        .operation_parameters(path, method)
        .iter()
        .filter(|param| param.get("in").and_then(JsonValue::as_str) == Some("path"))
        .count() as u32;

    let effective_method = spec
        .operation(path, method)
        .and_then(|op| op.get("description"))
        .and_then(JsonValue::as_str)
        .and_then(MeqaTag::parse)
        .as_ref()
        .and_then(MeqaTag::operation)
        .map(str::to_string)
        .unwrap_or_else(|| method.to_string());

    dag.nodes[node].priority = base * 100 + path_params * 10 + method_weight(&effective_method);
}
