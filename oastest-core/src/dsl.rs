//! The test DSL: plan-file test entries and their runtime bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::spec::SchemaRef;
use crate::store::DataStore;
use crate::tag::MeqaTag;
use crate::values::{map_add, map_combine, JsonObject};
use crate::FuzzValue;

/// Suite name reserved for plan/suite-level defaults.
pub const MEQA_INIT: &str = "meqa_init";

pub const EXPECT_STATUS: &str = "status";
pub const EXPECT_BODY: &str = "body";
/// Expect-status literal for "any 2xx".
pub const STATUS_SUCCESS: &str = "success";
/// Expect-status literal for "anything but 2xx".
pub const STATUS_FAIL: &str = "fail";

/// Parameter maps shared by tests, suites, and plans.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestParams {
    #[serde(default, skip_serializing_if = "JsonObject::is_empty")]
    pub query_params: JsonObject,
    #[serde(default, skip_serializing_if = "JsonObject::is_empty")]
    pub form_params: JsonObject,
    #[serde(default, skip_serializing_if = "JsonObject::is_empty")]
    pub path_params: JsonObject,
    #[serde(default, skip_serializing_if = "JsonObject::is_empty")]
    pub header_params: JsonObject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_params: Option<JsonValue>,
}

impl TestParams {
    /// Copies `src` over `self`; `src` wins on conflicts.
    pub fn combine(&mut self, src: &TestParams) {
        self.query_params = map_combine(&self.query_params, &src.query_params);
        self.form_params = map_combine(&self.form_params, &src.form_params);
        self.path_params = map_combine(&self.path_params, &src.path_params);
        self.header_params = map_combine(&self.header_params, &src.header_params);
        let own = self.body_params.take();
        self.body_params = match (own, &src.body_params) {
            (Some(JsonValue::Object(dst)), Some(JsonValue::Object(new))) => {
                Some(JsonValue::Object(map_combine(&dst, new)))
            }
            (_, Some(body)) => Some(body.clone()),
            (own, None) => own,
        };
    }

    /// Adds missing entries from `src`; existing `self` entries win.
    pub fn add(&mut self, src: &TestParams) {
        self.query_params = map_add(&self.query_params, &src.query_params);
        self.form_params = map_add(&self.form_params, &src.form_params);
        self.path_params = map_add(&self.path_params, &src.path_params);
        self.header_params = map_add(&self.header_params, &src.header_params);
        let own = self.body_params.take();
        self.body_params = match (own, &src.body_params) {
            (Some(JsonValue::Object(dst)), Some(JsonValue::Object(new))) => {
                Some(JsonValue::Object(map_add(&dst, new)))
            }
            (None, Some(body)) => Some(body.clone()),
            (own, _) => own,
        };
    }
}

/// Bookkeeping for one class instance touched by a test.
///
/// POST: `new` is the object being created. PUT/PATCH: `old` holds the
/// lookup keys, `new` the replacement. GET/DELETE: only `old`. `old_used`
/// is the subset of `old` actually fed into the request, which makes it
/// the only reliable lookup key afterwards.
#[derive(Clone, Debug, Default)]
pub struct Comparison {
    pub old: Option<JsonObject>,
    pub old_used: Option<JsonObject>,
    pub new: Option<JsonObject>,
    pub schema: SchemaRef,
}

impl Comparison {
    pub fn with_new(new: JsonObject, schema: SchemaRef) -> Comparison {
        Comparison {
            old: None,
            old_used: None,
            new: Some(new),
            schema,
        }
    }

    fn map_for_op(&mut self, op: &str) -> &mut JsonObject {
        if op == "get" {
            if self.old_used.is_none() {
                self.old_used = Some(JsonObject::new());
            }
            self.old.get_or_insert_with(JsonObject::new)
        } else {
            self.new.get_or_insert_with(JsonObject::new)
        }
    }

    /// Records `key = value` under the map the operation addresses. When
    /// the key already exists the test is touching an array of entities
    /// and a fresh comparison is returned for the caller to chain.
    pub fn set_for_op(&mut self, op: &str, key: &str, value: JsonValue) -> Option<Comparison> {
        let map = self.map_for_op(op);
        if map.contains_key(key) {
            let mut next = Comparison {
                old: None,
                old_used: None,
                new: None,
                schema: self.schema.clone(),
            };
            next.map_for_op(op).insert(key.to_string(), value.clone());
            if op == "get" {
                if let Some(old_used) = next.old_used.as_mut() {
                    old_used.insert(key.to_string(), value);
                }
            }
            return Some(next);
        }
        map.insert(key.to_string(), value.clone());
        if op == "get" {
            if let Some(old_used) = self.old_used.as_mut() {
                old_used.insert(key.to_string(), value);
            }
        }
        None
    }
}

/// Snapshot of the HTTP exchange a test performed.
#[derive(Clone, Debug, Default)]
pub struct Response {
    pub status: u16,
    pub body: Option<JsonValue>,
    pub text: String,
}

/// Mutable state accumulated while a test resolves and executes. Never
/// serialized into plan or result files.
#[derive(Clone, Debug, Default)]
pub struct TestRuntime {
    pub comparisons: std::collections::BTreeMap<String, Vec<Comparison>>,
    pub sample_space: std::collections::BTreeMap<String, Vec<FuzzValue>>,
    pub tag: Option<MeqaTag>,
    pub op: Option<JsonObject>,
    pub params: Vec<JsonObject>,
    pub resp: Option<Response>,
    pub started: Option<DateTime<Utc>>,
    pub stopped: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub response_error: Option<String>,
    pub schema_error: Option<String>,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// One test entry in a plan file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Test {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, rename = "ref", skip_serializing_if = "String::is_empty")]
    pub suite_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<JsonObject>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub strict: bool,
    #[serde(flatten)]
    pub params: TestParams,
    #[serde(skip)]
    pub runtime: TestRuntime,
}

impl Test {
    /// Normalizes a freshly parsed test entry.
    pub fn init(&mut self) {
        self.method = self.method.to_lowercase();
    }

    /// Copies the declared shape with a clean runtime, the form used for
    /// each execution so the template stays pristine.
    pub fn schema_duplicate(&self) -> Test {
        Test {
            name: self.name.clone(),
            path: self.path.clone(),
            method: self.method.clone(),
            suite_ref: self.suite_ref.clone(),
            expect: self.expect.clone(),
            strict: self.strict,
            params: self.params.clone(),
            runtime: TestRuntime::default(),
        }
    }

    /// Copies the test including resolved runtime values, the form fuzz
    /// variants start from.
    pub fn duplicate(&self) -> Test {
        let mut copy = self.schema_duplicate();
        copy.runtime.op = self.runtime.op.clone();
        copy.runtime.params = self.runtime.params.clone();
        copy.runtime.tag = self.runtime.tag.clone();
        copy.runtime.comparisons = self.runtime.comparisons.clone();
        copy
    }

    /// Inherits strictness, expectations, and parameters from the test
    /// that referenced this suite.
    pub fn copy_parent(&mut self, parent: &Test) {
        self.strict = parent.strict;
        self.expect = parent.expect.clone();
        self.params.add(&parent.params);
        if let Some(parent_body) = parent.params.body_params.clone() {
            match self.params.body_params.take() {
                Some(JsonValue::Object(own)) => {
                    if let JsonValue::Object(from_parent) = &parent_body {
                        self.params.body_params =
                            Some(JsonValue::Object(map_combine(&own, from_parent)));
                    } else {
                        self.params.body_params = Some(JsonValue::Object(own));
                    }
                }
                Some(own) => {
                    // Replace only when the types line up.
                    if std::mem::discriminant(&own) == std::mem::discriminant(&parent_body) {
                        self.params.body_params = Some(parent_body);
                    } else {
                        self.params.body_params = Some(own);
                    }
                }
                None => self.params.body_params = Some(parent_body),
            }
        }
    }

    pub fn body_params(&self) -> Option<&JsonValue> {
        self.params.body_params.as_ref()
    }

    pub fn expect_status(&self) -> Option<&JsonValue> {
        self.expect.as_ref()?.get(EXPECT_STATUS)
    }

    pub fn expect_body(&self) -> Option<&JsonValue> {
        self.expect.as_ref()?.get(EXPECT_BODY)
    }

    /// Overwrites the expectation with the observed status and body so the
    /// result file is a replayable plan reflecting ground truth.
    pub fn set_expect_actual(&mut self) {
        let Some(resp) = &self.runtime.resp else {
            return;
        };
        let mut expect = JsonObject::new();
        expect.insert(
            EXPECT_STATUS.to_string(),
            JsonValue::Number(resp.status.into()),
        );
        if let Some(body) = &resp.body {
            expect.insert(EXPECT_BODY.to_string(), body.clone());
        }
        self.expect = Some(expect);
    }

    /// Looks up a dotted back-reference target inside this test:
    /// `{{name.section.field…}}` with section one of the parameter maps or
    /// `outputs` (the observed body). A single trailing field may be found
    /// anywhere in the section by deep search.
    pub fn get_param(&self, path: &[&str]) -> Option<JsonValue> {
        if path.len() < 2 {
            return None;
        }
        let section: Option<JsonValue> = match path[0] {
            "pathParams" => Some(JsonValue::Object(self.params.path_params.clone())),
            "queryParams" => Some(JsonValue::Object(self.params.query_params.clone())),
            "headerParams" => Some(JsonValue::Object(self.params.header_params.clone())),
            "formParams" => Some(JsonValue::Object(self.params.form_params.clone())),
            "bodyParams" => self.params.body_params.clone(),
            "outputs" => self.expect_body().cloned(),
            _ => None,
        };
        let section = section?;

        let mut current = &section;
        let mut walked = true;
        for field in &path[1..] {
            match current.as_object().and_then(|map| map.get(*field)) {
                Some(next) => current = next,
                None => {
                    walked = false;
                    break;
                }
            }
        }
        if walked {
            return Some(current.clone());
        }
        if path.len() == 2 {
            return crate::values::find_field(&section, path[1]).cloned();
        }
        None
    }

    /// Records a scalar parameter into the comparison for its tagged
    /// class, keyed by the tagged property.
    pub fn add_basic_comparison(
        &mut self,
        tag: Option<&MeqaTag>,
        param: Option<&JsonObject>,
        data: &JsonValue,
        spec: &crate::spec::Spec,
    ) {
        let Some(param) = param else {
            return;
        };
        let Some(tag) = tag else {
            return;
        };
        let (Some(property), false) = (tag.property(), tag.class.is_empty()) else {
            return;
        };

        let op = match tag.operation() {
            Some(op) => op.to_string(),
            None => {
                let location = param.get("in").and_then(JsonValue::as_str).unwrap_or("");
                if location == "formData" || location == "body" {
                    "put".to_string()
                } else {
                    "get".to_string()
                }
            }
        };

        let entries = self
            .runtime
            .comparisons
            .entry(tag.class.clone())
            .or_default();
        if let Some(last) = entries.last_mut() {
            if let Some(next) = last.set_for_op(&op, property, data.clone()) {
                entries.push(next);
            }
            return;
        }
        let mut comp = Comparison {
            old: None,
            old_used: None,
            new: None,
            schema: spec.find_schema_by_name(&tag.class).unwrap_or_default(),
        };
        comp.set_for_op(&op, property, data.clone());
        entries.push(comp);
    }

    /// Records a generated or returned object against its class. The tag
    /// nearest the object wins; an untagged object is classified by
    /// reverse schema lookup.
    pub fn add_object_comparison(
        &mut self,
        tag: &MeqaTag,
        object: JsonObject,
        schema: SchemaRef,
        store: &DataStore,
        spec: &crate::spec::Spec,
    ) {
        let mut class = tag.class.clone();
        let method = tag
            .operation()
            .map(str::to_string)
            .or_else(|| {
                self.runtime
                    .tag
                    .as_ref()
                    .and_then(MeqaTag::operation)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| self.method.clone());

        if class.is_empty() {
            let Some((found, _)) =
                store.find_matching_schema(&JsonValue::Object(object.clone()), spec)
            else {
                log::warn!("no known schema matches object {:?}", object);
                return;
            };
            class = found;
        }

        if method == "post" || method == "put" || method == "patch" {
            let entries = self.runtime.comparisons.entry(class).or_default();
            if let Some(last) = entries.last_mut() {
                if last.new.is_none() {
                    last.new = Some(object);
                    return;
                }
                // An array of updates may carry the lookup key inside each
                // new object; chain another comparison.
            }
            entries.push(Comparison::with_new(object, schema));
        } else {
            log::warn!("unexpected: generated object of class {class} for {method}");
        }
    }
}
