//! Typed view over an OpenAPI 3 document.
//!
//! The document is kept as dynamic JSON and accessed through thin
//! wrappers; schemas are never forced into a static object model. Only
//! the `#/components/schemas/*` layout is honored for `$ref` resolution.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::tag::MeqaTag;
use crate::values::JsonObject;

/// HTTP methods recognized in path items, in document-walk order.
pub const METHODS: [&str; 7] = ["get", "put", "post", "delete", "head", "patch", "options"];

/// The response content type the runner understands.
pub const JSON_CONTENT: &str = "application/json";

/// Method rank used for priority and path-suite ordering: create before
/// read, read before update, update before delete.
pub fn method_weight(method: &str) -> u32 {
    match method {
        "post" => 1,
        "get" | "head" | "options" => 2,
        "put" | "patch" => 3,
        "delete" => 4,
        _ => 2,
    }
}

/// A schema node: a JSON-schema-shaped object that may be (or contain) a
/// `$ref`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SchemaRef(JsonObject);

impl SchemaRef {
    pub fn new(schema: JsonObject) -> Self {
        SchemaRef(schema)
    }

    pub fn from_value(value: &JsonValue) -> Option<SchemaRef> {
        value.as_object().cloned().map(SchemaRef)
    }

    pub fn as_map(&self) -> &JsonObject {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    pub fn ref_path(&self) -> Option<&str> {
        self.0.get("$ref").and_then(JsonValue::as_str)
    }

    pub fn schema_type(&self) -> Option<&str> {
        self.0.get("type").and_then(JsonValue::as_str)
    }

    pub fn format(&self) -> Option<&str> {
        self.0.get("format").and_then(JsonValue::as_str)
    }

    pub fn pattern(&self) -> Option<&str> {
        self.0.get("pattern").and_then(JsonValue::as_str)
    }

    pub fn description(&self) -> Option<&str> {
        self.0.get("description").and_then(JsonValue::as_str)
    }

    /// The tag embedded in this schema's description, if any.
    pub fn tag(&self) -> Option<MeqaTag> {
        MeqaTag::parse(self.description().unwrap_or_default())
    }

    pub fn enum_values(&self) -> Option<&Vec<JsonValue>> {
        self.0.get("enum").and_then(JsonValue::as_array)
    }

    pub fn properties(&self) -> Option<&JsonObject> {
        self.0.get("properties").and_then(JsonValue::as_object)
    }

    pub fn required(&self) -> Vec<&str> {
        self.0
            .get("required")
            .and_then(JsonValue::as_array)
            .map(|entries| entries.iter().filter_map(JsonValue::as_str).collect())
            .unwrap_or_default()
    }

    pub fn items(&self) -> Option<SchemaRef> {
        self.0.get("items").and_then(SchemaRef::from_value)
    }

    pub fn all_of(&self) -> Option<&Vec<JsonValue>> {
        self.0.get("allOf").and_then(JsonValue::as_array)
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(JsonValue::as_f64)
    }

    pub fn unsigned(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(JsonValue::as_u64)
    }

    pub fn flag(&self, key: &str) -> bool {
        self.0.get(key).and_then(JsonValue::as_bool).unwrap_or(false)
    }

    pub fn discriminator_property(&self) -> Option<&str> {
        self.0
            .get("discriminator")
            .and_then(JsonValue::as_object)?
            .get("propertyName")
            .and_then(JsonValue::as_str)
    }
}

/// The loaded OpenAPI document.
#[derive(Clone, Debug)]
pub struct Spec {
    doc: JsonObject,
}

impl Spec {
    /// Loads a document from a `.json` or `.yaml`/`.yml` file. YAML is
    /// converted to JSON values so one code path handles both.
    pub fn from_file(path: &Path) -> Result<Spec> {
        let text = fs::read_to_string(path)?;
        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
        let doc: JsonValue = if extension.eq_ignore_ascii_case("json") {
            serde_json::from_str(&text)?
        } else {
            serde_yaml::from_str(&text)?
        };
        Spec::from_value(doc)
    }

    pub fn from_value(doc: JsonValue) -> Result<Spec> {
        match doc {
            JsonValue::Object(map) => Ok(Spec { doc: map }),
            _ => Err(Error::invalid_spec("document root must be an object")),
        }
    }

    /// First entry of the `servers` array, the default base URL.
    pub fn base_url(&self) -> Option<&str> {
        self.doc
            .get("servers")?
            .as_array()?
            .first()?
            .get("url")?
            .as_str()
    }

    fn components_schemas(&self) -> Option<&JsonObject> {
        self.doc
            .get("components")?
            .as_object()?
            .get("schemas")?
            .as_object()
    }

    /// All named schemas in lexicographic order.
    pub fn schemas(&self) -> BTreeMap<String, SchemaRef> {
        self.components_schemas()
            .map(|schemas| {
                schemas
                    .iter()
                    .filter_map(|(name, value)| {
                        SchemaRef::from_value(value).map(|schema| (name.clone(), schema))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn find_schema_by_name(&self, name: &str) -> Option<SchemaRef> {
        self.components_schemas()
            .and_then(|schemas| schemas.get(name))
            .and_then(SchemaRef::from_value)
    }

    /// Resolves a `$ref`, returning the referred name and schema, or
    /// `None` when the schema is not a reference. Any `$ref` outside
    /// `#/components/schemas/*` is an invalid spec.
    pub fn referred_schema(&self, schema: &SchemaRef) -> Result<Option<(String, SchemaRef)>> {
        let Some(ref_path) = schema.ref_path() else {
            return Ok(None);
        };
        let tokens: Vec<&str> = ref_path.split('/').collect();
        if tokens.len() != 4 || tokens[0] != "#" || tokens[1] != "components" || tokens[2] != "schemas"
        {
            return Err(Error::invalid_spec(format!("invalid reference: {ref_path}")));
        }
        let referred = self.find_schema_by_name(tokens[3]).ok_or_else(|| {
            Error::invalid_spec(format!("reference object not found: {ref_path}"))
        })?;
        Ok(Some((tokens[3].to_string(), referred)))
    }

    /// Unwraps refs and arrays down to the innermost object schema.
    ///
    /// Returns the accumulated tag (the nearest one wins, with the ref
    /// name as a fallback) and the object schema. Scalar-only and enum
    /// schemas yield `(None, None)`.
    pub fn schema_root_type(
        &self,
        schema: &SchemaRef,
        parent: Option<&MeqaTag>,
    ) -> (Option<MeqaTag>, Option<SchemaRef>) {
        let tag = schema.tag().or_else(|| parent.cloned());
        match self.referred_schema(schema) {
            Ok(Some((name, referred))) => {
                let tag = tag.or_else(|| Some(MeqaTag::new(name)));
                return self.schema_root_type(&referred, tag.as_ref());
            }
            Ok(None) => {}
            Err(error) => {
                log::warn!("{error}");
                return (None, None);
            }
        }
        if schema.enum_values().is_some_and(|values| !values.is_empty()) {
            return (None, None);
        }
        match schema.schema_type() {
            Some("array") => match schema.items() {
                Some(items) => self.schema_root_type(&items, tag.as_ref()),
                None => (None, None),
            },
            Some("object") => (tag, Some(schema.clone())),
            _ => (None, None),
        }
    }

    /// Walks properties, items, and allOf, invoking the visitor for every
    /// named reference (with its name) and every inline sub-schema
    /// (without). References are reported but not descended into, which
    /// keeps cyclic schemas terminating.
    pub fn iterate(
        &self,
        schema: &SchemaRef,
        visit: &mut dyn FnMut(Option<&str>, &SchemaRef),
    ) -> Result<()> {
        self.iterate_inner(schema, visit, true)
    }

    fn iterate_inner(
        &self,
        schema: &SchemaRef,
        visit: &mut dyn FnMut(Option<&str>, &SchemaRef),
        root: bool,
    ) -> Result<()> {
        if let Some((name, referred)) = self.referred_schema(schema)? {
            visit(Some(&name), &referred);
            return Ok(());
        }
        if !root {
            visit(None, schema);
        }
        if let Some(properties) = schema.properties() {
            for value in properties.values() {
                if let Some(sub) = SchemaRef::from_value(value) {
                    self.iterate_inner(&sub, visit, false)?;
                }
            }
        }
        if let Some(items) = schema.items() {
            self.iterate_inner(&items, visit, false)?;
        }
        if let Some(all_of) = schema.all_of() {
            for value in all_of {
                if let Some(sub) = SchemaRef::from_value(value) {
                    self.iterate_inner(&sub, visit, false)?;
                }
            }
        }
        Ok(())
    }

    /// All path items in lexicographic order.
    pub fn paths(&self) -> Vec<(String, JsonObject)> {
        let mut paths: Vec<(String, JsonObject)> = self
            .doc
            .get("paths")
            .and_then(JsonValue::as_object)
            .map(|paths| {
                paths
                    .iter()
                    .filter_map(|(name, value)| {
                        value.as_object().map(|item| (name.clone(), item.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        paths.sort_by(|a, b| a.0.cmp(&b.0));
        paths
    }

    pub fn path_item(&self, path: &str) -> Option<&JsonObject> {
        self.doc
            .get("paths")?
            .as_object()?
            .get(path)?
            .as_object()
    }

    pub fn operation(&self, path: &str, method: &str) -> Option<&JsonObject> {
        self.path_item(path)?.get(method)?.as_object()
    }

    /// Operation parameters merged with path-item parameters, deduplicated
    /// by name with the operation's own entries winning.
    pub fn operation_parameters(&self, path: &str, method: &str) -> Vec<JsonObject> {
        let mut merged = Vec::new();
        let mut seen = Vec::new();
        let mut push_params = |item: Option<&JsonObject>| {
            let Some(entries) = item
                .and_then(|obj| obj.get("parameters"))
                .and_then(JsonValue::as_array)
            else {
                return;
            };
            for entry in entries {
                let Some(param) = entry.as_object() else {
                    continue;
                };
                let name = param
                    .get("name")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string();
                if seen.contains(&name) {
                    continue;
                }
                seen.push(name);
                merged.push(param.clone());
            }
        };
        push_params(self.operation(path, method));
        push_params(self.path_item(path));
        merged
    }

    /// The JSON request body schema of an operation, if declared.
    pub fn request_body_schema(operation: &JsonObject) -> Option<SchemaRef> {
        operation
            .get("requestBody")?
            .as_object()?
            .get("content")?
            .as_object()?
            .get(JSON_CONTENT)?
            .as_object()?
            .get("schema")
            .and_then(SchemaRef::from_value)
    }

    /// The response object matched to a status code, falling back to the
    /// `default` response.
    pub fn response_spec(operation: &JsonObject, status: u16) -> Option<&JsonObject> {
        let responses = operation.get("responses")?.as_object()?;
        responses
            .get(&status.to_string())
            .or_else(|| responses.get("default"))
            .and_then(JsonValue::as_object)
    }

    /// The JSON schema attached to a response object.
    pub fn response_schema(response: &JsonObject) -> Option<SchemaRef> {
        response
            .get("content")?
            .as_object()?
            .get(JSON_CONTENT)?
            .as_object()?
            .get("schema")
            .and_then(SchemaRef::from_value)
    }

    /// All `(status, response)` pairs declared for an operation.
    pub fn responses(operation: &JsonObject) -> Vec<(String, JsonObject)> {
        operation
            .get("responses")
            .and_then(JsonValue::as_object)
            .map(|responses| {
                responses
                    .iter()
                    .filter_map(|(code, value)| {
                        value.as_object().map(|resp| (code.clone(), resp.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Reads a whitelist/ignore file: one API path per line, exact match,
/// blank lines skipped.
pub fn read_path_list(path: &Path) -> Result<std::collections::BTreeSet<String>> {
    let text = fs::read_to_string(path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}
