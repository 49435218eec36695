//! Business logic services (use cases).
//!
//! Services orchestrate repository calls and engine rules behind the run
//! control, definition and approval APIs. They depend on traits (ports) --
//! never on concrete infrastructure implementations.

pub mod approval;
pub mod definition;
pub mod run;

use stepflow_types::error::{EngineError, RepositoryError};

/// Map a repository error for an entity lookup into the engine taxonomy.
pub(crate) fn not_found_or(entity: impl FnOnce() -> String, e: RepositoryError) -> EngineError {
    match e {
        RepositoryError::NotFound => EngineError::NotFound(entity()),
        RepositoryError::Conflict(reason) => EngineError::Conflict(reason),
        other => EngineError::Repository(other),
    }
}
