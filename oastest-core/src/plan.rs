//! Test plans: parsing and writing the `---`-separated YAML plan files,
//! running suites in order, and the execution history that powers
//! `{{test.section.field}}` back-references.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::future::Future;
use std::io::Write as _;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::dataset::{Dataset, FuzzMode};
use crate::dsl::{Test, TestParams, MEQA_INIT};
use crate::error::{Error, Result};
use crate::spec::Spec;
use crate::store::{lock, DataStore, SharedStore};
use crate::values::{value_key, JsonObject};
use crate::{FuzzKind, Payload, ResultCounts};

/// Failure log file name inside the data directory.
pub const FAILURE_LOG_FILE: &str = ".mqfails.jsonl";
/// Free-form metadata attached to every new failure record.
pub const META_FILE: &str = "meta.yml";

/// Credentials applied to every request of a run. Bearer wins over basic.
#[derive(Clone, Debug, Default)]
pub struct Auth {
    pub username: String,
    pub password: String,
    pub api_token: String,
}

/// Known fuzz failures: endpoint -> method -> field -> value key ->
/// (value, kind). Drives repro replays and keeps re-runs from repeating
/// known failures.
pub type FailureIndex =
    BTreeMap<String, BTreeMap<String, BTreeMap<String, BTreeMap<String, (JsonValue, FuzzKind)>>>>;

/// Everything one plan run shares: the spec, the HTTP client, the
/// plan-level store, datasets, and history.
pub struct Context {
    pub spec: Arc<Spec>,
    pub base_url: String,
    pub auth: Auth,
    pub client: reqwest::Client,
    pub store: SharedStore,
    pub dataset: Dataset,
    pub unique_keys: BTreeSet<String>,
    pub fuzz_mode: FuzzMode,
    pub repro: bool,
    pub old_failures: FailureIndex,
    pub history: History,
}

impl Context {
    pub fn new(spec: Arc<Spec>, base_url: impl Into<String>) -> Result<Context> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|error| Error::http(error.to_string()))?;
        let store = Arc::new(Mutex::new(DataStore::new(&spec)));
        Ok(Context {
            spec,
            base_url: base_url.into(),
            auth: Auth::default(),
            client,
            store,
            dataset: Dataset::default(),
            unique_keys: BTreeSet::new(),
            fuzz_mode: FuzzMode::None,
            repro: false,
            old_failures: FailureIndex::new(),
            history: History::default(),
        })
    }

    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_dataset(mut self, dataset: Dataset) -> Self {
        self.dataset = dataset;
        self
    }

    pub fn with_unique_keys(mut self, unique_keys: BTreeSet<String>) -> Self {
        self.unique_keys = unique_keys;
        self
    }

    pub fn with_fuzz_mode(mut self, fuzz_mode: FuzzMode) -> Self {
        self.fuzz_mode = fuzz_mode;
        self
    }

    pub fn with_repro(mut self, repro: bool) -> Self {
        self.repro = repro;
        self
    }

    pub fn with_old_failures(mut self, old_failures: FailureIndex) -> Self {
        self.old_failures = old_failures;
        self
    }
}

/// Per-suite execution state: the isolated store clone and the defaults
/// that `meqa_init` entries may adjust mid-suite.
pub struct SuiteCtx {
    pub name: String,
    pub store: SharedStore,
    pub params: TestParams,
    pub strict: bool,
}

/// Append-only record of executed tests, most recent name wins.
#[derive(Debug, Default)]
pub struct History {
    tests: Mutex<Vec<Test>>,
}

impl History {
    pub fn append(&self, test: Test) {
        self.guard().push(test);
    }

    /// Replaces the most recent entry with the same name, so outputs
    /// recorded after execution become visible to later back-references.
    pub fn update(&self, test: Test) {
        let mut tests = self.guard();
        if let Some(entry) = tests.iter_mut().rev().find(|entry| entry.name == test.name) {
            *entry = test;
        } else {
            tests.push(test);
        }
    }

    /// The most recent test with the given name.
    pub fn get(&self, name: &str) -> Option<Test> {
        self.guard()
            .iter()
            .rev()
            .find(|test| test.name == name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, Vec<Test>> {
        self.tests.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An ordered group of tests sharing defaults and a store clone.
#[derive(Clone, Debug, Default)]
pub struct TestSuite {
    pub name: String,
    pub tests: Vec<Test>,
    pub comment: String,
}

/// Aggregated outcome of a plan run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub counts: ResultCounts,
    pub results: Vec<Test>,
    pub new_failures: Vec<Payload>,
}

/// The ordered suites of a plan file plus plan-level defaults.
#[derive(Debug, Default)]
pub struct TestPlan {
    pub suites: Vec<TestSuite>,
    pub params: TestParams,
    pub strict: bool,
    pub comment: String,
}

impl TestPlan {
    pub fn new() -> TestPlan {
        TestPlan::default()
    }

    pub fn add(&mut self, suite: TestSuite) -> Result<()> {
        if self.suite(&suite.name).is_some() {
            return Err(Error::invalid_spec(format!(
                "duplicate name {} found in test plan",
                suite.name
            )));
        }
        self.suites.push(suite);
        Ok(())
    }

    pub fn suite(&self, name: &str) -> Option<&TestSuite> {
        self.suites.iter().find(|suite| suite.name == name)
    }

    /// Ingests one YAML document: a map from suite name to test list.
    /// The `meqa_init` suite sets plan-level defaults instead.
    pub fn add_from_value(&mut self, doc: &JsonValue) -> Result<()> {
        let Some(map) = doc.as_object() else {
            return Err(Error::invalid_spec("plan document must be a map"));
        };
        for (name, tests_value) in map {
            let mut tests: Vec<Test> = serde_json::from_value(tests_value.clone())?;
            for test in &mut tests {
                test.init();
            }
            if name == MEQA_INIT {
                for test in &tests {
                    self.params.combine(&test.params);
                    self.strict = test.strict;
                }
                continue;
            }
            self.add(TestSuite {
                name: name.clone(),
                tests,
                comment: String::new(),
            })?;
        }
        Ok(())
    }

    /// Reads a plan file: a sequence of `---`-separated YAML documents,
    /// one suite each, order preserved.
    pub fn from_file(path: &Path) -> Result<TestPlan> {
        let text = fs::read_to_string(path)?;
        let mut plan = TestPlan::new();
        for document in serde_yaml::Deserializer::from_str(&text) {
            let value = JsonValue::deserialize(document)?;
            if value.is_null() {
                continue;
            }
            plan.add_from_value(&value)?;
        }
        Ok(plan)
    }

    /// Serializes the plan: a leading `meqa_init` document with plan-wide
    /// defaults, then one document per suite.
    pub fn to_yaml(&self) -> Result<String> {
        let mut out = String::new();
        write_comment(&mut out, &self.comment);
        out.push_str("---\n");
        let mut init = Test {
            name: MEQA_INIT.to_string(),
            strict: self.strict,
            ..Test::default()
        };
        init.params = self.params.clone();
        let init_doc: BTreeMap<&str, Vec<&Test>> =
            BTreeMap::from([(MEQA_INIT, vec![&init])]);
        out.push_str(&serde_yaml::to_string(&init_doc)?);
        for suite in &self.suites {
            out.push('\n');
            write_comment(&mut out, &suite.comment);
            out.push_str("---\n");
            let doc: BTreeMap<&str, &Vec<Test>> = BTreeMap::from([(suite.name.as_str(), &suite.tests)]);
            out.push_str(&serde_yaml::to_string(&doc)?);
        }
        Ok(out)
    }

    pub fn dump_to_file(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    /// Runs every suite in file order, aggregating counts, results, and
    /// new fuzz failures.
    pub async fn run_all(&self, ctx: &Arc<Context>) -> RunReport {
        let mut report = RunReport::default();
        for suite in &self.suites {
            if let Err(error) = self.run_suite(&suite.name, None, ctx, &mut report).await {
                log::warn!("suite {} failed: {error}", suite.name);
            }
        }
        report
    }

    /// Runs one named suite. A test with `ref` recursively runs the named
    /// suite with the current test as parent.
    pub fn run_suite<'a>(
        &'a self,
        name: &'a str,
        parent: Option<&'a Test>,
        ctx: &'a Arc<Context>,
        report: &'a mut RunReport,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + 'a>> {
        Box::pin(self.run_suite_inner(name, parent, ctx, report))
    }

    async fn run_suite_inner(
        &self,
        name: &str,
        parent: Option<&Test>,
        ctx: &Arc<Context>,
        report: &mut RunReport,
    ) -> Result<()> {
        let suite = self
            .suite(name)
            .filter(|suite| !suite.tests.is_empty())
            .ok_or_else(|| Error::not_found(format!("test suite not found: {name}")))?;

        let mut suite_ctx = SuiteCtx {
            name: name.to_string(),
            store: Arc::new(Mutex::new(lock(&ctx.store).clone_schema())),
            params: self.params.clone(),
            strict: self.strict,
        };
        report.counts.total += suite.tests.len();
        let templates = Arc::new(suite.tests.clone());
        let mut first_error: Option<Error> = None;

        for (index, template) in suite.tests.iter().enumerate() {
            if !template.suite_ref.is_empty() {
                let mut parent_test = template.clone();
                parent_test.strict = suite_ctx.strict;
                self.run_suite(&template.suite_ref, Some(&parent_test), ctx, report)
                    .await?;
                continue;
            }
            if template.name == MEQA_INIT {
                suite_ctx.params.combine(&template.params);
                suite_ctx.strict = template.strict;
                continue;
            }

            let mut test = template.schema_duplicate();
            test.strict = suite_ctx.strict;
            if let Some(parent) = parent {
                test.copy_parent(parent);
            }
            resolve_history_refs(&mut test, &ctx.history);
            if let Some(parent) = parent {
                // The referenced suite's tests report under the caller.
                test.name = parent.name.clone();
            }
            ctx.history.append(test.clone());

            let (payloads, fuzz_total, outcome) =
                crate::exec::run_test(&mut test, ctx, &suite_ctx, &templates).await;
            report.counts.fuzz_total += fuzz_total;
            report.new_failures.extend(payloads);
            if test.runtime.schema_error.is_some() {
                report.counts.schema_mismatch += 1;
            }
            match outcome {
                Ok(()) => report.counts.passed += 1,
                Err(error) => {
                    report.counts.failed += 1;
                    test.runtime.error = Some(error.to_string());
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
            ctx.history.update(test.clone());

            let status = test
                .runtime
                .resp
                .as_ref()
                .map(|resp| resp.status)
                .unwrap_or(0);
            let root_create_failed =
                test.method == "post" && test.params.path_params.is_empty() && status >= 300;
            report.results.push(test);
            if root_create_failed {
                // The root object never existed; the dependents are
                // pointless.
                let skipped = suite.tests.len() - index - 1;
                log::warn!("skipping {skipped} tests in suite {name}");
                report.counts.skipped += skipped;
                break;
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Writes every executed test into a single suite named by the
    /// current RFC3339 timestamp; with expectations overwritten by the
    /// executor the file doubles as a replayable plan.
    pub fn write_result_file(path: &Path, results: &[Test]) -> Result<()> {
        let mut plan = TestPlan::new();
        plan.add(TestSuite {
            name: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            tests: results.to_vec(),
            comment: String::new(),
        })?;
        plan.dump_to_file(path)
    }
}

fn write_comment(out: &mut String, comment: &str) {
    if comment.is_empty() {
        return;
    }
    for line in comment.lines() {
        out.push_str("# ");
        out.push_str(line);
        out.push('\n');
    }
}

/// Resolves `{{testName.section.field}}` in a string against history.
/// The whole value is replaced by the referenced one.
pub fn resolve_string_with_history(text: &str, history: &History) -> Option<JsonValue> {
    let begin = text.find("{{")?;
    let end = text.find("}}")?;
    if end <= begin {
        return None;
    }
    let inner = text[begin + 2..end].trim();
    let parts: Vec<&str> = inner.split('.').collect();
    if parts.len() < 3 {
        log::warn!(
            "invalid parameter {{{{{inner}}}}}, the format is {{{{testName.paramSection.paramName}}}}"
        );
        return None;
    }
    let test = history.get(parts[0])?;
    test.get_param(&parts[1..])
}

fn resolve_map_with_history(map: &mut JsonObject, history: &History) {
    for value in map.values_mut() {
        if let JsonValue::String(text) = value {
            if let Some(resolved) = resolve_string_with_history(text, history) {
                *value = resolved;
            }
        }
    }
}

fn resolve_array_with_history(items: &mut [JsonValue], history: &History) {
    for item in items {
        match item {
            JsonValue::Object(map) => resolve_map_with_history(map, history),
            JsonValue::String(text) => {
                if let Some(resolved) = resolve_string_with_history(text, history) {
                    *item = resolved;
                }
            }
            _ => {}
        }
    }
}

/// Resolves history back-references in every parameter map of a test.
pub fn resolve_history_refs(test: &mut Test, history: &History) {
    resolve_map_with_history(&mut test.params.path_params, history);
    resolve_map_with_history(&mut test.params.query_params, history);
    resolve_map_with_history(&mut test.params.header_params, history);
    resolve_map_with_history(&mut test.params.form_params, history);
    match &mut test.params.body_params {
        Some(JsonValue::Object(map)) => resolve_map_with_history(map, history),
        Some(JsonValue::Array(items)) => resolve_array_with_history(items, history),
        Some(JsonValue::String(text)) => {
            if let Some(resolved) = resolve_string_with_history(text, history) {
                test.params.body_params = Some(resolved);
            }
        }
        _ => {}
    }
}

/// Reads the failure log into the index used for repro and skip-known.
pub fn read_failure_index(data_dir: &Path) -> Result<FailureIndex> {
    let path = data_dir.join(FAILURE_LOG_FILE);
    if !path.exists() {
        return Ok(FailureIndex::new());
    }
    let text = fs::read_to_string(&path)?;
    let mut index = FailureIndex::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let payload: Payload = serde_json::from_str(line)?;
        index
            .entry(payload.endpoint)
            .or_default()
            .entry(payload.method)
            .or_default()
            .entry(payload.field)
            .or_default()
            .insert(value_key(&payload.value), (payload.value, payload.fuzz_type));
    }
    Ok(index)
}

/// Appends new failures to the log (truncating it first in repro mode),
/// attaching the free-form metadata file to every record.
pub fn write_failures(data_dir: &Path, failures: &[Payload], repro: bool) -> Result<()> {
    let meta = read_metadata(data_dir);
    let path = data_dir.join(FAILURE_LOG_FILE);
    let mut options = fs::OpenOptions::new();
    options.create(true).write(true);
    if repro {
        options.truncate(true);
    } else {
        options.append(true);
    }
    let mut file = options.open(path)?;
    for payload in failures {
        let mut record = payload.clone();
        record.meta = meta.clone();
        writeln!(file, "{}", serde_json::to_string(&record)?)?;
    }
    Ok(())
}

/// Free-form YAML metadata attached to failure records; absence is fine.
pub fn read_metadata(data_dir: &Path) -> Option<JsonValue> {
    let path = data_dir.join(META_FILE);
    let text = fs::read_to_string(path).ok()?;
    match serde_yaml::from_str(&text) {
        Ok(meta) => Some(meta),
        Err(error) => {
            log::warn!("unreadable {META_FILE}: {error}");
            None
        }
    }
}
