//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow definitions, runs and step
//! records. The infrastructure layer (stepflow-infra) implements this trait
//! with SQLite persistence.

use chrono::{DateTime, Utc};
use stepflow_types::approval::Approval;
use stepflow_types::error::RepositoryError;
use stepflow_types::run::{RunFilter, RunStatus, StepRecord, WorkItem, WorkflowRun};
use stepflow_types::workflow::{WorkflowDefinition, WorkflowSummary};
use uuid::Uuid;

/// Everything persisted after one top-level step, written atomically.
#[derive(Debug, Clone)]
pub struct StepCommit {
    pub run_id: Uuid,
    /// The run's `step_seq` observed when the step was dequeued. The commit is
    /// rejected with `Conflict` if the stored value differs.
    pub expected_seq: i64,
    pub status: RunStatus,
    pub current_state_id: Option<String>,
    pub context: serde_json::Value,
    pub error: Option<String>,
    /// Records for the step and any composite children.
    pub records: Vec<StepRecord>,
    /// Approval created by a `human.approval` step. Ignored if it already exists.
    pub approval: Option<Approval>,
    /// Follow-up work item, enqueued in the same transaction.
    pub next: Option<WorkItem>,
}

/// Guarded status change used by run control (cancel, pause, resume) and by
/// the scheduler when it starts a pending run.
#[derive(Debug, Clone)]
pub struct RunTransition {
    pub run_id: Uuid,
    /// Current statuses from which the change is legal.
    pub from: Vec<RunStatus>,
    pub to: RunStatus,
    pub error: Option<String>,
    /// Work item enqueued in the same transaction (resume).
    pub enqueue: Option<WorkItem>,
}

/// Repository trait for workflow persistence.
///
/// Covers three entity families:
/// - **Definitions:** versioned, immutable workflow definitions.
/// - **Runs:** creation, atomic per-step commits, guarded status changes.
/// - **Step records:** append-only history, written only through `commit_step`.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Store a new version of `def` and return the assigned version number
    /// (one more than the latest stored version, starting at 1).
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<i64, RepositoryError>> + Send;

    /// Get a definition by id; the latest version when `version` is `None`.
    fn get_definition(
        &self,
        id: &str,
        version: Option<i64>,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// Latest version of every definition, ordered by id.
    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowSummary>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Insert a new run together with its first work item.
    fn create_run(
        &self,
        run: &WorkflowRun,
        first: &WorkItem,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// List runs matching `filter`, newest first.
    fn list_runs(
        &self,
        filter: &RunFilter,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Atomically persist a step result (see [`StepCommit`]).
    ///
    /// Returns `Conflict` when the run's `step_seq` no longer matches or the
    /// run is no longer executable.
    fn commit_step(
        &self,
        commit: &StepCommit,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Apply a guarded status change and return the updated run.
    ///
    /// Returns `NotFound` for unknown runs and `Conflict` when the current
    /// status is not in `transition.from`.
    fn transition_run(
        &self,
        transition: &RunTransition,
    ) -> impl std::future::Future<Output = Result<WorkflowRun, RepositoryError>> + Send;

    /// Runs in `pending`/`running` with no queued work item (startup recovery).
    fn list_orphaned_runs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Mark a run failed regardless of its step sequence, unless it is already
    /// terminal. Used when a work item cannot be processed at all.
    fn fail_run(
        &self,
        run_id: &Uuid,
        error: &str,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step records
    // -----------------------------------------------------------------------

    /// All step records of a run, ordered by sequence then insertion order.
    fn list_step_records(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepRecord>, RepositoryError>> + Send;
}
