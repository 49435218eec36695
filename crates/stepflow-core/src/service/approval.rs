//! Approval service: decisions, the expiry sweep and read access.
//!
//! A decision is written together with the run update in one repository
//! call. The decision is recorded under `_approvals.<state id>` in the run
//! context (and at the state's `result_path`, when declared), then the run
//! continues with the approval state's transition. Expiry follows the same
//! path with status `expired` and the system actor.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use stepflow_types::approval::{
    approval_id, Approval, ApprovalFilter, ApprovalStatus, Decision, DeliveryRecord,
    APPROVALS_CONTEXT_KEY, SYSTEM_ACTOR,
};
use stepflow_types::config::ApprovalConfig;
use stepflow_types::error::EngineError;
use stepflow_types::run::{RunStatus, StepRecord, StepStatus, WorkItem};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::approval::{ApprovalRepository, ApprovalResolution, RunResume};
use crate::repository::workflow::WorkflowRepository;
use crate::service::not_found_or;
use crate::workflow::cache::GraphCache;
use crate::workflow::context::set_path;

pub struct ApprovalService<W: WorkflowRepository, A: ApprovalRepository> {
    repo: W,
    approvals: A,
    graphs: Arc<GraphCache>,
    config: ApprovalConfig,
}

impl<W, A> ApprovalService<W, A>
where
    W: WorkflowRepository + 'static,
    A: ApprovalRepository + 'static,
{
    pub fn new(repo: W, approvals: A, graphs: Arc<GraphCache>, config: ApprovalConfig) -> Self {
        Self {
            repo,
            approvals,
            graphs,
            config,
        }
    }

    pub async fn get(&self, id: &str) -> Result<Approval, EngineError> {
        self.approvals
            .get_approval(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("approval '{id}'")))
    }

    pub async fn list(&self, filter: &ApprovalFilter) -> Result<Vec<Approval>, EngineError> {
        let mut approvals = self.approvals.list_approvals(filter).await?;
        if let Some(limit) = filter.limit {
            approvals.truncate(limit as usize);
        }
        Ok(approvals)
    }

    /// Webhook delivery log of one approval, oldest first.
    pub async fn deliveries(&self, id: &str) -> Result<Vec<DeliveryRecord>, EngineError> {
        self.get(id).await?;
        Ok(self.approvals.list_deliveries(id).await?)
    }

    /// Approve or reject a pending approval.
    ///
    /// Returns `Conflict` when the approval was already decided (or expired)
    /// and `Forbidden` when `actor` is not on the allow-list.
    pub async fn decide(
        &self,
        id: &str,
        decision: Decision,
        actor: &str,
        comment: Option<String>,
    ) -> Result<Approval, EngineError> {
        let actor = actor.trim();
        if actor.is_empty() {
            return Err(EngineError::validation("MISSING_ACTOR", "/actor", "actor is required"));
        }

        let approval = self.get(id).await?;
        if approval.is_decided() {
            return Err(EngineError::Conflict(format!(
                "approval '{id}' is already {}",
                approval.status.as_str()
            )));
        }
        if !approval.allows(actor) {
            return Err(EngineError::Forbidden(format!(
                "'{actor}' is not an approver of '{id}'"
            )));
        }

        self.resolve(&approval, decision.status(), actor, comment, Utc::now())
            .await
    }

    /// Expire every pending approval whose timeout has passed. Returns the
    /// number of approvals expired.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let mut expired = 0;
        for approval in self.approvals.list_expired_approvals(now).await? {
            match self
                .resolve(
                    &approval,
                    ApprovalStatus::Expired,
                    SYSTEM_ACTOR,
                    Some("approval timed out".to_string()),
                    now,
                )
                .await
            {
                Ok(_) => expired += 1,
                // Decided by a human between listing and expiry.
                Err(EngineError::Conflict(_)) => {}
                Err(e) => {
                    tracing::error!(approval_id = approval.id.as_str(), error = %e, "failed to expire approval");
                }
            }
        }
        Ok(expired)
    }

    /// Run `expire_due` every `sweep_interval_secs` until `shutdown` fires.
    pub fn start_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let every = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match service.expire_due(Utc::now()).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(expired = n, "expired overdue approvals"),
                    Err(e) => tracing::error!(error = %e, "approval sweep failed"),
                }
            }
            tracing::debug!("approval sweeper stopped");
        })
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    async fn resolve(
        &self,
        approval: &Approval,
        status: ApprovalStatus,
        actor: &str,
        comment: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Approval, EngineError> {
        let resume = self
            .build_resume(approval, status, actor, comment.as_deref(), at)
            .await?;
        let resolution = ApprovalResolution {
            approval_id: approval.id.clone(),
            status,
            decided_by: actor.to_string(),
            decided_at: at,
            comment,
            resume,
        };

        let (updated, resumed) = self
            .approvals
            .decide_approval(&resolution)
            .await
            .map_err(|e| not_found_or(|| format!("approval '{}'", approval.id), e))?;

        tracing::info!(
            approval_id = updated.id.as_str(),
            run_id = %updated.run_id,
            status = status.as_str(),
            actor,
            resumed,
            "approval decided"
        );
        Ok(updated)
    }

    /// Build the run update for a decision, or `None` when the run is no
    /// longer waiting on this approval.
    async fn build_resume(
        &self,
        approval: &Approval,
        status: ApprovalStatus,
        actor: &str,
        comment: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<RunResume>, EngineError> {
        let Some(run) = self.repo.get_run(&approval.run_id).await? else {
            return Ok(None);
        };
        // The parked step committed at `step_seq - 1`; an approval from an
        // earlier visit of the same state must not resume the run.
        if run.status != RunStatus::WaitingApproval
            || run.current_state_id.as_deref() != Some(approval.state_id.as_str())
            || approval.id != approval_id(&run.id, &approval.state_id, run.step_seq - 1)
        {
            tracing::debug!(
                approval_id = approval.id.as_str(),
                run_id = %run.id,
                status = %run.status,
                "run no longer waiting, decision stored without resuming"
            );
            return Ok(None);
        }

        let graph = match self
            .graphs
            .load(&self.repo, &run.workflow_id, run.workflow_version)
            .await
        {
            Ok(graph) => graph,
            Err(EngineError::Repository(e)) => return Err(EngineError::Repository(e)),
            Err(e) => {
                tracing::warn!(run_id = %run.id, error = %e, "cannot load graph to resume run");
                return Ok(None);
            }
        };
        let Some(state) = graph.state(&approval.state_id) else {
            return Ok(None);
        };
        let def = &state.definition;

        let decision = decision_value(status, actor, comment, at);
        let mut context = run.context.clone();
        set_path(
            &mut context,
            &format!("{APPROVALS_CONTEXT_KEY}.{}", approval.state_id),
            decision.clone(),
        );
        if let Some(path) = &def.result_path {
            set_path(&mut context, path, decision.clone());
        }

        let (next_status, current_state_id, next) = match (&def.transition, def.end) {
            (Some(target), false) => (
                RunStatus::Running,
                Some(target.clone()),
                Some(WorkItem::new(run.id, target.as_str(), run.step_seq + 1)),
            ),
            _ => (RunStatus::Completed, Some(approval.state_id.clone()), None),
        };

        let waited = (at - approval.created_at).num_milliseconds().max(0) as u64;
        let record = StepRecord {
            id: Uuid::now_v7(),
            run_id: run.id,
            seq: run.step_seq,
            scope: None,
            state_id: approval.state_id.clone(),
            status: StepStatus::Completed,
            attempt: 1,
            started_at: approval.created_at,
            duration_ms: waited,
            output: Some(decision),
            error: None,
        };

        Ok(Some(RunResume {
            run_id: run.id,
            expected_seq: run.step_seq,
            status: next_status,
            current_state_id,
            context,
            record,
            next,
        }))
    }
}

/// The `_approvals.<state>` value: `{approved, approver, comment, decidedAt, status}`.
fn decision_value(
    status: ApprovalStatus,
    actor: &str,
    comment: Option<&str>,
    at: DateTime<Utc>,
) -> Value {
    json!({
        "approved": status == ApprovalStatus::Approved,
        "approver": actor,
        "comment": comment,
        "decidedAt": at.to_rfc3339(),
        "status": status.as_str(),
    })
}
