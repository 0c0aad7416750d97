//! The fuzz driver: one baseline request, then per-field variants.
//!
//! A variant duplicates the baseline test, regenerates unique keys, and
//! overwrites one body field with a fuzz choice. Datatype and negative
//! choices are expected to produce 400; anything else is recorded as a
//! failure payload. Variants run concurrently except for PUT, which must
//! stay ordered against the same resource.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use crate::dsl::{Test, EXPECT_STATUS};
use crate::error::Result;
use crate::exec::do_request;
use crate::generate::regenerate_unique_keys;
use crate::plan::{Context, SuiteCtx};
use crate::store::SharedStore;
use crate::values::{map_combine, map_replace, value_key, JsonObject};
use crate::{FuzzKind, FuzzValue, Payload};

/// Expected status for datatype and negative fuzz variants.
const STATUS_BAD_REQUEST: u16 = 400;

/// Executes the baseline request and, if it passed, every planned fuzz
/// variant. Returns recorded payloads (sorted for stable diffing), the
/// variant count, and the baseline outcome.
pub(crate) async fn fuzz_test(
    test: &mut Test,
    ctx: &Arc<Context>,
    suite: &SuiteCtx,
    templates: &Arc<Vec<Test>>,
) -> (Vec<Payload>, usize, Result<()>) {
    let samples = collect_samples(test, ctx);
    let total: usize = samples.values().map(Vec::len).sum();
    let in_parallel = test.method != "put";
    if total > 0 {
        log::info!(
            "fuzzing {} {} with {total} variants (parallel: {in_parallel})",
            test.method,
            test.path
        );
    }

    let base_copy = test.duplicate();
    let baseline = do_request(test, ctx, &suite.store).await;

    let mut payloads = Vec::new();
    if baseline.is_ok() && total > 0 {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handles = Vec::new();
        for (field, choices) in samples {
            for choice in choices {
                let Some(JsonValue::Object(body)) = base_copy.params.body_params.clone() else {
                    continue;
                };
                let variant = base_copy.duplicate();
                let mut changes = body;
                if let Some(operation) = &variant.runtime.op {
                    regenerate_unique_keys(&ctx.spec, operation, &ctx.unique_keys, &mut changes);
                }
                changes.insert(field.clone(), choice.value.clone());

                let task_ctx = ctx.clone();
                let task_store = suite.store.clone();
                let task_templates = templates.clone();
                let task_tx = tx.clone();
                let task_field = field.clone();
                if in_parallel {
                    handles.push(tokio::spawn(async move {
                        fuzz_request(
                            variant,
                            changes,
                            task_field,
                            choice,
                            task_ctx,
                            task_store,
                            task_templates,
                            task_tx,
                        )
                        .await;
                    }));
                } else {
                    fuzz_request(
                        variant,
                        changes,
                        task_field,
                        choice,
                        task_ctx,
                        task_store,
                        task_templates,
                        task_tx,
                    )
                    .await;
                }
            }
        }
        drop(tx);
        for handle in handles {
            let _ = handle.await;
        }
        while let Some(payload) = rx.recv().await {
            payloads.push(payload);
        }
    }

    payloads.sort_by(|a, b| {
        (&a.field, a.fuzz_type, value_key(&a.value)).cmp(&(
            &b.field,
            b.fuzz_type,
            value_key(&b.value),
        ))
    });
    (payloads, total, baseline)
}

/// The sample space for this test: recorded failures when replaying in
/// repro mode, freshly generated choices minus known failures otherwise.
fn collect_samples(test: &Test, ctx: &Context) -> BTreeMap<String, Vec<FuzzValue>> {
    let mut samples = BTreeMap::new();
    if test.params.body_params.is_none() {
        return samples;
    }
    let history = ctx
        .old_failures
        .get(&test.path)
        .and_then(|methods| methods.get(&test.method));
    if ctx.repro {
        if let Some(history) = history {
            for (field, choices) in history {
                let replay: Vec<FuzzValue> = choices
                    .values()
                    .map(|(value, kind)| FuzzValue {
                        value: value.clone(),
                        kind: *kind,
                    })
                    .collect();
                if !replay.is_empty() {
                    samples.insert(field.clone(), replay);
                }
            }
        }
        return samples;
    }
    for (field, choices) in &test.runtime.sample_space {
        let known = history.and_then(|fields| fields.get(field));
        let fresh: Vec<FuzzValue> = choices
            .iter()
            .filter(|choice| {
                !known.is_some_and(|values| values.contains_key(&value_key(&choice.value)))
            })
            .cloned()
            .collect();
        if !fresh.is_empty() {
            samples.insert(field.clone(), fresh);
        }
    }
    samples
}

#[allow(clippy::too_many_arguments)]
async fn fuzz_request(
    mut test: Test,
    changes: JsonObject,
    field: String,
    choice: FuzzValue,
    ctx: Arc<Context>,
    suite_store: SharedStore,
    templates: Arc<Vec<Test>>,
    tx: mpsc::UnboundedSender<Payload>,
) {
    for comps in test.runtime.comparisons.values_mut() {
        for comp in comps {
            if let Some(new) = &comp.new {
                comp.new = Some(map_replace(new, &changes));
            }
        }
    }
    match &test.params.body_params {
        Some(JsonValue::Object(body)) => {
            test.params.body_params = Some(JsonValue::Object(map_combine(body, &changes)));
        }
        _ => test.params.body_params = Some(JsonValue::Object(changes.clone())),
    }

    let mut expected = crate::dsl::STATUS_SUCCESS.to_string();
    if matches!(choice.kind, FuzzKind::Datatype | FuzzKind::Negative) {
        let mut expect = JsonObject::new();
        expect.insert(
            EXPECT_STATUS.to_string(),
            JsonValue::Number(STATUS_BAD_REQUEST.into()),
        );
        test.expect = Some(expect);
        expected = STATUS_BAD_REQUEST.to_string();
    }

    let outcome = do_request(&mut test, &ctx, &suite_store).await;
    if outcome.is_err() {
        let (actual, message) = match &test.runtime.resp {
            Some(resp) => (resp.status.to_string(), resp.text.clone()),
            None => (
                String::new(),
                test.runtime.error.clone().unwrap_or_default(),
            ),
        };
        let payload = Payload {
            endpoint: test.path.clone(),
            method: test.method.clone(),
            field: field.clone(),
            value: changes.get(&field).cloned().unwrap_or(JsonValue::Null),
            fuzz_type: choice.kind,
            expected,
            actual,
            message,
            meta: None,
        };
        log::warn!(
            "fuzz failure on {} {} field '{}': expected {}, got {}",
            payload.method,
            payload.endpoint,
            payload.field,
            payload.expected,
            payload.actual
        );
        let _ = tx.send(payload);
    }

    // A variant that slipped past validation and created a resource gets
    // cleaned up through the suite's own DELETE test.
    let created = test.method == "post"
        && test
            .runtime
            .resp
            .as_ref()
            .is_some_and(|resp| (200..300).contains(&resp.status));
    if created {
        delete_resource(&test, &ctx, &suite_store, &templates).await;
    }
}

async fn delete_resource(
    test: &Test,
    ctx: &Arc<Context>,
    suite_store: &SharedStore,
    templates: &[Test],
) {
    let Some(id) = test
        .runtime
        .resp
        .as_ref()
        .and_then(|resp| resp.body.as_ref())
        .and_then(|body| body.get("id"))
        .cloned()
    else {
        return;
    };
    // The last DELETE in the suite is the one tearing down this resource.
    let Some(template) = templates.iter().filter(|entry| entry.method == "delete").last() else {
        return;
    };
    let mut delete_test = template.schema_duplicate();
    delete_test.params.body_params = None;
    delete_test
        .params
        .path_params
        .insert("id".to_string(), id);
    delete_test.runtime.op = Some(JsonObject::new());
    if test.runtime.response_error.is_none() && test.runtime.schema_error.is_none() {
        delete_test.runtime.comparisons = test.runtime.comparisons.clone();
        for comps in delete_test.runtime.comparisons.values_mut() {
            for comp in comps {
                comp.old_used = comp.new.clone();
            }
        }
    }
    if let Err(error) = do_request(&mut delete_test, ctx, suite_store).await {
        log::warn!("cleanup delete failed: {error}");
    }
}
