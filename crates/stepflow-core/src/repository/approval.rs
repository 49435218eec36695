//! Approval repository trait definition.
//!
//! Approvals are created inside `WorkflowRepository::commit_step` (so the
//! approval row and the `waiting_approval` status land together) and decided
//! here, again in a single transaction with the run update.

use chrono::{DateTime, Utc};
use stepflow_types::approval::{Approval, ApprovalFilter, ApprovalStatus, DeliveryRecord};
use stepflow_types::error::RepositoryError;
use stepflow_types::run::{RunStatus, StepRecord, WorkItem};
use uuid::Uuid;

/// Run update applied together with an approval decision.
#[derive(Debug, Clone)]
pub struct RunResume {
    pub run_id: Uuid,
    /// The run's `step_seq` while it was waiting. The update only applies if
    /// the run is still `waiting_approval` at this sequence.
    pub expected_seq: i64,
    pub status: RunStatus,
    pub current_state_id: Option<String>,
    pub context: serde_json::Value,
    pub record: StepRecord,
    pub next: Option<WorkItem>,
}

/// One decision, to be written atomically.
#[derive(Debug, Clone)]
pub struct ApprovalResolution {
    pub approval_id: String,
    pub status: ApprovalStatus,
    pub decided_by: String,
    pub decided_at: DateTime<Utc>,
    pub comment: Option<String>,
    pub resume: Option<RunResume>,
}

pub trait ApprovalRepository: Send + Sync {
    fn get_approval(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Approval>, RepositoryError>> + Send;

    /// List approvals, oldest first.
    fn list_approvals(
        &self,
        filter: &ApprovalFilter,
    ) -> impl std::future::Future<Output = Result<Vec<Approval>, RepositoryError>> + Send;

    /// Write a decision.
    ///
    /// The approval update is guarded by `status = 'pending'`; a decided
    /// approval yields `Conflict` and nothing is written. The optional run
    /// update is guarded separately: if the run moved on (e.g. was cancelled)
    /// the decision is still stored. Returns the updated approval and whether
    /// the run was resumed.
    fn decide_approval(
        &self,
        resolution: &ApprovalResolution,
    ) -> impl std::future::Future<Output = Result<(Approval, bool), RepositoryError>> + Send;

    /// Pending approvals whose `timeout_at` is at or before `now`.
    fn list_expired_approvals(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<Approval>, RepositoryError>> + Send;

    /// Append one entry to the webhook delivery log.
    fn record_delivery(
        &self,
        record: &DeliveryRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn list_deliveries(
        &self,
        approval_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<DeliveryRecord>, RepositoryError>> + Send;
}
