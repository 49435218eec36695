use thiserror::Error;

use crate::workflow::ValidationIssue;

/// Errors from repository operations (used by trait definitions in stepflow-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// The engine-wide error taxonomy surfaced to callers of the run control and
/// approval APIs.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Definition failed to compile, or input did not match the declared schema.
    #[error("validation failed: {}", format_issues(.0))]
    Validation(Vec<ValidationIssue>),

    /// An expression could not be parsed or evaluated.
    #[error("evaluation error: {0}")]
    Evaluation(String),

    /// An operation handler failed after exhausting its retries.
    #[error("operation '{task}' failed: {message}")]
    Operation { task: String, message: String },

    /// Illegal state transition (decided approval, finished run, stale step).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Actor is not allowed to perform the action.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl EngineError {
    /// Shorthand for a single-issue validation error.
    pub fn validation(code: &str, path: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Validation(vec![ValidationIssue::new(code, path, message)])
    }
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
