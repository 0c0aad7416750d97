//! OpenAPI-driven test planning, execution, and fuzzing.
//!
//! The crate consumes an OpenAPI 3 document and derives a
//! dependency-respecting plan of HTTP test suites, then runs a plan
//! against a live server: parameters are generated from schemas and
//! prior responses, per-field fuzz variants probe validation, responses
//! are checked against both the spec and an in-memory mirror of created
//! objects, and failures are recorded for later reproduction.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub mod dag;
pub mod dataset;
mod dsl;
mod error;
mod exec;
mod fuzz;
mod generate;
pub mod plan;
pub mod plangen;
pub mod spec;
pub mod store;
pub mod tag;
mod validate;
pub mod values;

pub use dag::{build_dag, Dag};
pub use dataset::{read_unique_keys, Dataset, FuzzMode};
pub use dsl::{Comparison, Response, Test, TestParams, TestRuntime, MEQA_INIT};
pub use error::{Error, Result};
pub use exec::MAX_RETRIES;
pub use plan::{
    read_failure_index, write_failures, Auth, Context, FailureIndex, History, RunReport, SuiteCtx,
    TestPlan, TestSuite,
};
pub use plangen::{generate_object_plan, generate_path_plan, generate_simple_plan};
pub use spec::{read_path_list, SchemaRef, Spec};
pub use store::DataStore;
pub use tag::MeqaTag;
pub use validate::{validate_scalar, Collection};
pub use values::{interface_equals, JsonObject};

/// Whether a fuzz value is expected to succeed or to be rejected.
#[derive(
    Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum FuzzKind {
    /// Valid per schema; the request should still succeed.
    Positive,
    /// A value of the wrong primitive type; the server should 400.
    Datatype,
    /// Invalid per schema; the server should 400.
    Negative,
}

impl std::fmt::Display for FuzzKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FuzzKind::Positive => "positive",
            FuzzKind::Datatype => "datatype",
            FuzzKind::Negative => "negative",
        };
        f.write_str(label)
    }
}

/// One candidate value for a fuzzable field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FuzzValue {
    pub value: JsonValue,
    pub kind: FuzzKind,
}

/// One recorded fuzz failure, serialized as a line of the failure log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Payload {
    pub endpoint: String,
    pub method: String,
    pub field: String,
    pub value: JsonValue,
    #[serde(rename = "fuzzType")]
    pub fuzz_type: FuzzKind,
    pub expected: String,
    pub actual: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<JsonValue>,
}

/// Aggregated result counters of a plan run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResultCounts {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub schema_mismatch: usize,
    pub total: usize,
    /// Fuzz variants attempted beyond the baseline requests.
    pub fuzz_total: usize,
}
