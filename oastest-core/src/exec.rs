//! Single-test execution: parameter resolution, the HTTP exchange with
//! retry, response validation, and reconciliation of the client store
//! with what the server actually did.

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use reqwest::Method;
use serde_json::Value as JsonValue;

use crate::dsl::{Comparison, Response, Test, STATUS_FAIL, STATUS_SUCCESS};
use crate::error::{Error, Result};
use crate::generate::{generate_parameter, generate_schema, GenCtx, GENERATION_DEPTH};
use crate::plan::{Context, SuiteCtx};
use crate::spec::{SchemaRef, Spec};
use crate::store::{lock, SharedStore};
use crate::tag::MeqaTag;
use crate::validate::Collection;
use crate::values::{
    interface_equals, iterate_maps, map_add, map_replace, value_to_string, JsonObject,
};
use crate::Payload;

#[cfg(test)]
#[path = "../tests/internal/exec_unit_tests.rs"]
mod tests;

/// Attempt ceiling for 429 responses and transport errors.
pub const MAX_RETRIES: u32 = 10;

const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// Resolves the test's parameters and hands it to the fuzz driver.
/// Returns the recorded failure payloads, the number of fuzz variants
/// attempted, and the baseline outcome.
pub(crate) async fn run_test(
    test: &mut Test,
    ctx: &Arc<Context>,
    suite: &SuiteCtx,
    templates: &Arc<Vec<Test>>,
) -> (Vec<Payload>, usize, Result<()>) {
    log::info!("running test case: {}", test.name);
    if let Err(error) = resolve_parameters(test, ctx, suite) {
        log::warn!("{}: {error}", test.name);
        return (Vec::new(), 0, Err(error));
    }
    crate::fuzz::fuzz_test(test, ctx, suite, templates).await
}

/// Fills the test's parameter maps from provided values, suite defaults,
/// and the value generator, recording comparisons along the way.
pub(crate) fn resolve_parameters(test: &mut Test, ctx: &Context, suite: &SuiteCtx) -> Result<()> {
    let operation = ctx
        .spec
        .operation(&test.path, &test.method)
        .cloned()
        .ok_or_else(|| {
            Error::not_found(format!(
                "operation {} {} not found in spec",
                test.method, test.path
            ))
        })?;
    test.runtime.tag = operation
        .get("description")
        .and_then(JsonValue::as_str)
        .and_then(MeqaTag::parse);
    test.runtime.params = ctx.spec.operation_parameters(&test.path, &test.method);
    test.runtime.op = Some(operation.clone());

    let gen = GenCtx {
        spec: &ctx.spec,
        suite_store: &suite.store,
        plan_store: &ctx.store,
        suite_body: suite.params.body_params.as_ref(),
        dataset: &ctx.dataset,
        fuzz_mode: ctx.fuzz_mode,
    };

    if let Some(body_schema) = Spec::request_body_schema(&operation) {
        resolve_body(test, &body_schema, ctx, suite, &gen)?;
    }

    let params = test.runtime.params.clone();
    for param in &params {
        let location = param
            .get("in")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        let name = param
            .get("name")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        let tag = param
            .get("description")
            .and_then(JsonValue::as_str)
            .and_then(MeqaTag::parse);

        // Provided values win: test-level first, then suite defaults. An
        // explicit null asks for the parameter to be skipped entirely.
        let provided = {
            let global = suite_params_map(suite, &location).get(&name).cloned();
            let local = params_map(test, &location);
            if !local.contains_key(&name) {
                if let Some(global) = global {
                    local.insert(name.clone(), global);
                }
            }
            local.get(&name).cloned()
        };
        match provided {
            Some(JsonValue::Null) => {
                params_map(test, &location).remove(&name);
            }
            Some(value) => {
                test.add_basic_comparison(tag.as_ref(), Some(param), &value, &ctx.spec);
            }
            None => {
                let generated = generate_parameter(test, param, &gen)?;
                params_map(test, &location).insert(name.clone(), generated);
            }
        }
    }
    Ok(())
}

fn resolve_body(
    test: &mut Test,
    body_schema: &SchemaRef,
    ctx: &Context,
    suite: &SuiteCtx,
    gen: &GenCtx<'_>,
) -> Result<()> {
    let provided = test.params.body_params.clone();
    match provided {
        // A provided non-map body is used as-is; arrays of objects still
        // feed the comparison bookkeeping.
        Some(body) if !body.is_object() => {
            let (root_tag, root_schema) =
                ctx.spec.schema_root_type(body_schema, body_schema.tag().as_ref());
            if let (Some(root_tag), Some(root_schema)) = (root_tag, root_schema) {
                if let JsonValue::Array(items) = &body {
                    for item in items {
                        if let JsonValue::Object(map) = item {
                            let store = lock(&suite.store);
                            test.add_object_comparison(
                                &root_tag,
                                map.clone(),
                                root_schema.clone(),
                                &store,
                                &ctx.spec,
                            );
                        }
                    }
                }
            }
            Ok(())
        }
        provided_body => {
            let generated = generate_schema(test, "", None, body_schema, gen, GENERATION_DEPTH)?;
            match generated {
                JsonValue::Object(generated_map) => {
                    // Static body params override generated fields:
                    // test-level entries win over suite-level ones.
                    let mut overrides = provided_body
                        .as_ref()
                        .and_then(JsonValue::as_object)
                        .cloned()
                        .unwrap_or_default();
                    if let Some(JsonValue::Object(suite_body)) = &suite.params.body_params {
                        overrides = map_add(&overrides, suite_body);
                    }
                    test.params.body_params =
                        Some(JsonValue::Object(map_replace(&generated_map, &overrides)));
                }
                other => test.params.body_params = Some(other),
            }
            Ok(())
        }
    }
}

fn params_map<'a>(test: &'a mut Test, location: &str) -> &'a mut JsonObject {
    match location {
        "path" => &mut test.params.path_params,
        "query" => &mut test.params.query_params,
        "header" => &mut test.params.header_params,
        _ => &mut test.params.form_params,
    }
}

fn suite_params_map<'a>(suite: &'a SuiteCtx, location: &str) -> &'a JsonObject {
    match location {
        "path" => &suite.params.path_params,
        "query" => &suite.params.query_params,
        "header" => &suite.params.header_params,
        _ => &suite.params.form_params,
    }
}

/// Executes the HTTP call and processes the response. The exchange is
/// retried on 429 and transport errors with randomized backoff.
pub(crate) async fn do_request(
    test: &mut Test,
    ctx: &Context,
    suite_store: &SharedStore,
) -> Result<()> {
    match send_with_retry(test, ctx).await {
        Ok(response) => {
            test.runtime.resp = Some(response);
        }
        Err(error) => {
            test.runtime.error = Some(error.to_string());
            return Err(error);
        }
    }
    process_result(test, ctx, suite_store)
}

async fn send_with_retry(test: &mut Test, ctx: &Context) -> Result<Response> {
    let method = Method::from_bytes(test.method.to_uppercase().as_bytes()).map_err(|_| {
        Error::invalid_spec(format!(
            "unknown method in test {}: {}",
            test.name, test.method
        ))
    })?;
    let url = request_url(test, ctx);
    log::info!("calling {} {}", test.method, url);

    for attempt in 1..=MAX_RETRIES {
        let request = build_request(test, ctx, &method, &url);
        test.runtime.started = Some(Utc::now());
        let outcome = request.send().await;
        test.runtime.stopped = Some(Utc::now());
        match outcome {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let text = resp.text().await.unwrap_or_default();
                if status != STATUS_TOO_MANY_REQUESTS || attempt == MAX_RETRIES {
                    let body = serde_json::from_str(&text).ok();
                    log::debug!("status {status}: {text}");
                    return Ok(Response { status, body, text });
                }
            }
            Err(error) => {
                if attempt == MAX_RETRIES {
                    return Err(Error::Http(error.to_string()));
                }
                log::warn!("attempt {attempt} failed: {error}");
            }
        }
        let backoff = 1000 + rand::thread_rng().gen_range(0..3000 * attempt as u64);
        tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
    }
    Err(Error::http(format!("request to {url} kept failing")))
}

fn request_url(test: &Test, ctx: &Context) -> String {
    let mut path = test.path.clone();
    for (key, value) in &test.params.path_params {
        path = path.replace(&format!("{{{key}}}"), &value_to_string(value));
    }
    format!("{}{}", ctx.base_url.trim_end_matches('/'), path)
}

fn build_request(
    test: &Test,
    ctx: &Context,
    method: &Method,
    url: &str,
) -> reqwest::RequestBuilder {
    let mut request = ctx.client.request(method.clone(), url);
    if !ctx.auth.api_token.is_empty() {
        request = request.bearer_auth(&ctx.auth.api_token);
    } else if !ctx.auth.username.is_empty() {
        request = request.basic_auth(&ctx.auth.username, Some(&ctx.auth.password));
    }
    if !test.params.query_params.is_empty() {
        let pairs: Vec<(String, String)> = test
            .params
            .query_params
            .iter()
            .map(|(key, value)| (key.clone(), value_to_string(value)))
            .collect();
        request = request.query(&pairs);
    }
    for (key, value) in &test.params.header_params {
        request = request.header(key.as_str(), value_to_string(value));
    }
    if !test.params.form_params.is_empty() {
        let form: std::collections::BTreeMap<String, String> = test
            .params
            .form_params
            .iter()
            .map(|(key, value)| (key.clone(), value_to_string(value)))
            .collect();
        request = request.form(&form);
    }
    if let Some(body) = &test.params.body_params {
        request = request.json(body);
    }
    request
}

/// Validates the response and reconciles the client store with it. Only
/// `SchemaMismatch` is swallowed (recorded on the test); everything else
/// is the test's fatal error.
pub(crate) fn process_result(
    test: &mut Test,
    ctx: &Context,
    suite_store: &SharedStore,
) -> Result<()> {
    let Some(resp) = test.runtime.resp.clone() else {
        return Err(Error::http(
            test.runtime
                .error
                .clone()
                .unwrap_or_else(|| "no response recorded".to_string()),
        ));
    };
    let status = resp.status;
    let operation = test.runtime.op.clone().unwrap_or_default();
    let resp_spec = Spec::response_spec(&operation, status)
        .cloned()
        .unwrap_or_default();
    let resp_schema = Spec::response_schema(&resp_spec);
    let result_obj = resp.body.clone();

    // Success is the status class, unless the matched response description
    // is tagged as an expected failure.
    let mut success = (200..300).contains(&status);
    let resp_tag = resp_spec
        .get("description")
        .and_then(JsonValue::as_str)
        .and_then(MeqaTag::parse);
    if resp_tag.is_some_and(|tag| tag.flags.fail) {
        success = false;
    }

    let mut test_success = success;
    let mut expected_status = JsonValue::String(STATUS_SUCCESS.to_string());
    if let Some(expect) = test.expect_status() {
        expected_status = expect.clone();
        if expected_status.as_str() == Some(STATUS_FAIL) {
            test_success = !success;
        } else if let Some(code) = expected_status.as_i64() {
            test_success = code == status as i64;
        }
    }

    if !test_success {
        log::info!(
            "expecting status {expected_status}, got {status}: fail ({} {})",
            test.method,
            test.path
        );
        test.runtime.response_error = Some(format!("status {status}: {}", resp.text));
        test.set_expect_actual();
        return Err(Error::Expect(format!("test failed, response code {status}")));
    }
    log::info!(
        "expecting status {expected_status}, got {status}: success ({} {})",
        test.method,
        test.path
    );

    if let Some(expect_body) = test.expect_body().cloned() {
        let actual = result_obj.clone().unwrap_or(JsonValue::Null);
        if !interface_equals(&expect_body, &actual) {
            test.set_expect_actual();
            return Err(Error::Expect(format!(
                "test failed, expecting body:\n{expect_body}\ngot body:\n{}",
                resp.text
            )));
        }
        log::info!("body matches the test's expect value");
    }

    // Validate against the declared schema, harvesting tagged subtrees.
    let mut collection = Collection::new();
    if let (Some(result), Some(schema)) = (&result_obj, &resp_schema) {
        if let Err(error) = schema.parses("", result, &mut collection, true, &ctx.spec) {
            log::warn!("server response doesn't match spec: {error}");
            test.runtime.schema_error = Some(error.to_string());
            test.set_expect_actual();
            return Ok(());
        }
    }

    // With no typed response, fall back to the operation-level tag.
    if let Some(result) = &result_obj {
        if collection.is_empty() {
            if let Some(op_tag) = test.runtime.tag.clone() {
                if !op_tag.class.is_empty() {
                    if let Some(class_schema) = ctx.spec.find_schema_by_name(&op_tag.class) {
                        if class_schema.matches(result, &ctx.spec) {
                            collection
                                .entry(op_tag.class.clone())
                                .or_default()
                                .push(result.clone());
                        } else {
                            iterate_maps(result, &mut |map| {
                                let value = JsonValue::Object(map.clone());
                                if class_schema.matches(&value, &ctx.spec) {
                                    collection
                                        .entry(op_tag.class.clone())
                                        .or_default()
                                        .push(value);
                                }
                            });
                        }
                    }
                }
            }
        }
    }

    if let Some(schema) = &resp_schema {
        if resp.text.is_empty() {
            if schema.schema_type() != Some("array") {
                log::warn!("spec expects a non-empty response, but the body is empty");
            }
        } else if result_obj.is_none() && schema.schema_type() != Some("string") {
            log::warn!("response body is not JSON but the spec declares a schema");
        }
    }

    // An explicit status expectation (fuzz variants expecting 400, replays
    // of failures) does not feed the store.
    if expected_status.as_str() != Some(STATUS_SUCCESS) {
        test.set_expect_actual();
        return Ok(());
    }

    let method = test
        .runtime
        .tag
        .as_ref()
        .and_then(MeqaTag::operation)
        .map(str::to_string)
        .unwrap_or_else(|| test.method.clone());

    if method == "post" || method == "put" {
        if let Err(error) =
            reconcile_posted_objects(test, ctx, suite_store, &resp_schema, &result_obj, &mut collection)
        {
            test.set_expect_actual();
            return Err(error);
        }
    }

    if method == "get" {
        // A path ending in `{…}` addresses one resource: the response must
        // be known to the client. A listing must contain everything the
        // client knows.
        let single_resource = test.path.ends_with('}');
        for (class, result_array) in &collection {
            let outcome = if single_resource {
                response_in_store(test, class, result_array, suite_store)
            } else {
                store_in_response(test, class, result_array, suite_store)
            };
            if let Err(error) = outcome {
                let error_text = error.to_string();
                test.runtime.response_error.get_or_insert(error_text);
                test.set_expect_actual();
                return Err(error);
            }
        }
    } else {
        let comparisons = test.runtime.comparisons.clone();
        for (class, comps) in &comparisons {
            for comp in comps {
                if let Err(error) = dispatch_comparison(ctx, suite_store, class, &method, comp) {
                    test.set_expect_actual();
                    return Err(error);
                }
            }
        }
    }

    if !test.strict {
        for (class, entries) in &collection {
            for entry in entries {
                let _ = lock(suite_store).insert(class, entry.clone(), None);
                let _ = lock(&ctx.store).insert(class, entry.clone(), None);
            }
        }
    }

    test.set_expect_actual();
    Ok(())
}

/// POST/PUT reconciliation: the server's view of a created or updated
/// object replaces the client's guess, and server-assigned scalar fields
/// are copied into single posted objects. In strict mode a posted object
/// with no subset match in the response fails the test.
fn reconcile_posted_objects(
    test: &mut Test,
    ctx: &Context,
    suite_store: &SharedStore,
    resp_schema: &Option<SchemaRef>,
    result_obj: &Option<JsonValue>,
    collection: &mut Collection,
) -> Result<()> {
    let mut property_collection = Collection::new();
    if let (Some(result), Some(schema)) = (result_obj, resp_schema) {
        let _ = schema.parses("", result, &mut property_collection, false, &ctx.spec);
    }

    let classes: Vec<String> = test.runtime.comparisons.keys().cloned().collect();
    for class in classes {
        let comp_list = test
            .runtime
            .comparisons
            .get(&class)
            .cloned()
            .unwrap_or_default();
        if comp_list.is_empty() || comp_list[0].new.is_none() {
            continue;
        }
        let class_list = collection.get(&class).cloned().unwrap_or_default();
        if !class_list.is_empty() {
            if test.strict {
                for comp in &comp_list {
                    let Some(new) = &comp.new else {
                        continue;
                    };
                    let posted = JsonValue::Object(new.clone());
                    let found = class_list
                        .iter()
                        .any(|entry| interface_equals(&posted, entry));
                    if !found {
                        test.runtime.response_error = Some(format!(
                            "expected:\n{posted}\nfound:\n{}",
                            class_list
                                .first()
                                .cloned()
                                .unwrap_or(JsonValue::Null)
                        ));
                        return Err(Error::http(format!(
                            "client object not found in results returned\n{posted}"
                        )));
                    }
                }
            }
            // Replace what we posted with what the server returned.
            let replaced: Vec<Comparison> = class_list
                .iter()
                .filter_map(|entry| {
                    entry
                        .as_object()
                        .map(|map| Comparison::with_new(map.clone(), SchemaRef::default()))
                })
                .collect();
            collection.remove(&class);
            test.runtime.comparisons.insert(class.clone(), replaced);
        } else if comp_list.len() == 1 {
            // Copy server-assigned fields (generated ids and the like)
            // into the single posted object.
            for (key, values) in &property_collection {
                let Some((key_class, property)) = key.split_once('.') else {
                    continue;
                };
                if key_class != class || values.len() != 1 {
                    continue;
                }
                if let Some(comps) = test.runtime.comparisons.get_mut(&class) {
                    if let Some(new) = comps[0].new.as_mut() {
                        new.insert(property.to_string(), values[0].clone());
                    }
                }
            }
        }
    }

    // Everything else the server returned becomes a comparison too, so
    // metadata objects reach the store.
    for (class, entries) in collection.iter() {
        let class_tag = MeqaTag::new(class.clone());
        let class_schema = ctx.spec.find_schema_by_name(class).unwrap_or_default();
        for entry in entries {
            if let JsonValue::Object(map) = entry {
                let store = lock(suite_store);
                test.add_object_comparison(
                    &class_tag,
                    map.clone(),
                    class_schema.clone(),
                    &store,
                    &ctx.spec,
                );
            }
        }
    }
    Ok(())
}

/// Objects the client expects to exist for `class`, constrained by the
/// lookup keys this test actually used.
fn client_objects(test: &Test, class: &str, suite_store: &SharedStore) -> Vec<JsonValue> {
    let store = lock(suite_store);
    match test.runtime.comparisons.get(class) {
        Some(comps) if !comps.is_empty() => {
            let mut out = Vec::new();
            for comp in comps {
                let criteria = comp.old_used.clone().map(JsonValue::Object);
                out.extend(store.find(class, criteria.as_ref(), None, interface_equals, -1));
            }
            out
        }
        _ => store.find(class, None, None, interface_equals, -1),
    }
}

/// Single-resource GET: every returned object must be known client-side.
fn response_in_store(
    test: &mut Test,
    class: &str,
    result_array: &[JsonValue],
    suite_store: &SharedStore,
) -> Result<()> {
    let client = client_objects(test, class, suite_store);
    let mut misses = 0;
    let mut missing = String::new();
    for entry in result_array {
        if !entry.is_object() {
            // Arrays of scalars are covered by schema validation.
            continue;
        }
        let found = client
            .iter()
            .any(|client_entry| interface_equals(client_entry, entry));
        if !found {
            missing = entry.to_string();
            misses += 1;
        }
    }
    // A GET without a prior create legitimately sees unknown objects.
    if misses > 0 && !client.is_empty() {
        test.runtime.response_error = Some(format!(
            "{misses} remote objects missing in client\nmissing: {missing}\nclient holds {} objects",
            client.len()
        ));
        return Err(Error::http("remote object not found in client"));
    }
    Ok(())
}

/// Listing GET: everything the client knows must appear in the response.
fn store_in_response(
    test: &mut Test,
    class: &str,
    result_array: &[JsonValue],
    suite_store: &SharedStore,
) -> Result<()> {
    let client = client_objects(test, class, suite_store);
    let mut misses = 0;
    let mut missing = String::new();
    for client_entry in &client {
        let found = result_array
            .iter()
            .any(|entry| entry.is_object() && interface_equals(client_entry, entry));
        if !found {
            missing = client_entry.to_string();
            misses += 1;
        }
    }
    if misses > 0 {
        test.runtime.response_error = Some(format!(
            "{misses} local objects missing from a list of {} on remote\nmissing: {missing}",
            result_array.len()
        ));
        return Err(Error::http("client object not found in results returned"));
    }
    Ok(())
}

/// Applies one comparison to the suite and plan stores according to the
/// effective method.
fn dispatch_comparison(
    ctx: &Context,
    suite_store: &SharedStore,
    class: &str,
    method: &str,
    comp: &Comparison,
) -> Result<()> {
    let criteria = comp.old_used.clone().map(JsonValue::Object);
    match method {
        "delete" => {
            lock(suite_store).delete(class, criteria.as_ref(), None, interface_equals, 1);
            lock(&ctx.store).delete(class, criteria.as_ref(), None, interface_equals, 1);
            log::debug!("deleted {class} entry from client store");
        }
        "post" => {
            if let Some(new) = &comp.new {
                let object = JsonValue::Object(new.clone());
                let _ = lock(&ctx.store).insert(class, object.clone(), None);
                lock(suite_store).insert(class, object, None)?;
                log::debug!("added {class} entry to client store");
            }
        }
        "put" | "patch" => {
            if let Some(new) = &comp.new {
                let object = JsonValue::Object(new.clone());
                let patch = method == "patch";
                lock(&ctx.store).update(
                    class,
                    criteria.as_ref(),
                    None,
                    interface_equals,
                    &object,
                    1,
                    patch,
                );
                let count = lock(suite_store).update(
                    class,
                    criteria.as_ref(),
                    None,
                    interface_equals,
                    &object,
                    1,
                    patch,
                );
                if count != 1 {
                    log::warn!("failed to find a {class} entry to update");
                }
            }
        }
        _ => {}
    }
    Ok(())
}
