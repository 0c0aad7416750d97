use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by planning and execution.
///
/// `SchemaMismatch` is special: the executor records it on the test and
/// keeps going, so it never propagates as the fatal error of a run.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// The OpenAPI document is malformed or a reference cannot be resolved.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),
    /// A path, operation, or suite lookup failed.
    #[error("not found: {0}")]
    NotFound(String),
    /// Transport failure or a response-based test failure.
    #[error("http: {0}")]
    Http(String),
    /// The response status or body diverged from the test's expectation.
    #[error("expectation failed: {0}")]
    Expect(String),
    /// The response body does not validate against the declared schema.
    #[error("response does not match schema: {0}")]
    SchemaMismatch(String),
    /// `file`-typed parameters cannot be generated automatically.
    #[error("cannot generate file parameter '{0}'; supply it in the plan")]
    CannotFuzzFile(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    pub fn invalid_spec(message: impl Into<String>) -> Self {
        Error::InvalidSpec(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound(message.into())
    }

    pub fn http(message: impl Into<String>) -> Self {
        Error::Http(message.into())
    }

    /// True for the non-fatal kind that is recorded rather than returned.
    pub fn is_schema_mismatch(&self) -> bool {
        matches!(self, Error::SchemaMismatch(_))
    }
}
