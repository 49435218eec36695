//! In-memory implementation of the repository ports, for engine tests.
//!
//! Mirrors the transactional guarantees of the SQLite implementation: every
//! method takes the single lock once, so each call is atomic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use stepflow_types::approval::{Approval, ApprovalFilter, ApprovalStatus, DeliveryRecord};
use stepflow_types::error::RepositoryError;
use stepflow_types::run::{RunFilter, RunStatus, StepRecord, WorkItem, WorkflowRun};
use stepflow_types::workflow::{WorkflowDefinition, WorkflowSummary};
use uuid::Uuid;

use super::approval::{ApprovalRepository, ApprovalResolution};
use super::queue::WorkQueue;
use super::workflow::{RunTransition, StepCommit, WorkflowRepository};

struct QueuedItem {
    item: WorkItem,
    available_at: DateTime<Utc>,
    lease_until: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    definitions: HashMap<String, Vec<(WorkflowDefinition, DateTime<Utc>)>>,
    runs: HashMap<Uuid, WorkflowRun>,
    records: Vec<StepRecord>,
    queue: Vec<QueuedItem>,
    approvals: HashMap<String, Approval>,
    deliveries: Vec<DeliveryRecord>,
}

/// Shared in-memory store implementing every port.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, RepositoryError> {
        self.inner.lock().map_err(|_| RepositoryError::Connection)
    }

    /// Snapshot of queued work items (test inspection).
    pub fn queued(&self) -> Vec<WorkItem> {
        self.inner
            .lock()
            .map(|inner| inner.queue.iter().map(|q| q.item.clone()).collect())
            .unwrap_or_default()
    }

    /// Force a stored approval's timeout (test helper).
    pub fn set_approval_timeout(&self, id: &str, at: DateTime<Utc>) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(approval) = inner.approvals.get_mut(id) {
                approval.timeout_at = at;
            }
        }
    }
}

fn push_item(inner: &mut Inner, item: &WorkItem, now: DateTime<Utc>) {
    inner.queue.push(QueuedItem {
        item: item.clone(),
        available_at: now,
        lease_until: None,
    });
}

impl WorkflowRepository for MemoryStore {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<i64, RepositoryError> {
        let mut inner = self.lock()?;
        let versions = inner.definitions.entry(def.id.clone()).or_default();
        let version = versions.last().map(|(d, _)| d.version).unwrap_or(0) + 1;
        let mut stored = def.clone();
        stored.version = version;
        versions.push((stored, Utc::now()));
        Ok(version)
    }

    async fn get_definition(
        &self,
        id: &str,
        version: Option<i64>,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let inner = self.lock()?;
        let Some(versions) = inner.definitions.get(id) else {
            return Ok(None);
        };
        let found = match version {
            Some(v) => versions.iter().find(|(d, _)| d.version == v),
            None => versions.last(),
        };
        Ok(found.map(|(d, _)| d.clone()))
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowSummary>, RepositoryError> {
        let inner = self.lock()?;
        let mut out: Vec<WorkflowSummary> = inner
            .definitions
            .values()
            .filter_map(|versions| versions.last())
            .map(|(d, created_at)| WorkflowSummary {
                id: d.id.clone(),
                version: d.version,
                name: d.name.clone(),
                states: d.states.len(),
                created_at: *created_at,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn create_run(&self, run: &WorkflowRun, first: &WorkItem) -> Result<(), RepositoryError> {
        let mut inner = self.lock()?;
        if inner.runs.contains_key(&run.id) {
            return Err(RepositoryError::Conflict(format!("run {} already exists", run.id)));
        }
        inner.runs.insert(run.id, run.clone());
        push_item(&mut inner, first, Utc::now());
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.lock()?.runs.get(run_id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let inner = self.lock()?;
        let mut runs: Vec<WorkflowRun> = inner
            .runs
            .values()
            .filter(|r| filter.workflow_id.as_ref().is_none_or(|w| &r.workflow_id == w))
            .filter(|r| filter.status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(runs
            .into_iter()
            .skip(filter.offset.unwrap_or(0) as usize)
            .take(filter.effective_limit() as usize)
            .collect())
    }

    async fn commit_step(&self, commit: &StepCommit) -> Result<(), RepositoryError> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let run = inner
            .runs
            .get_mut(&commit.run_id)
            .ok_or(RepositoryError::NotFound)?;
        if run.step_seq != commit.expected_seq || !run.status.is_executable() {
            return Err(RepositoryError::Conflict(format!(
                "run {} is at seq {} ({}), expected seq {}",
                run.id, run.step_seq, run.status, commit.expected_seq
            )));
        }

        run.status = commit.status;
        run.current_state_id = commit.current_state_id.clone();
        run.context = commit.context.clone();
        run.error = commit.error.clone();
        run.step_seq += 1;
        run.updated_at = now;
        run.started_at.get_or_insert(now);
        if commit.status.is_terminal() {
            run.completed_at = Some(now);
        }

        inner.records.extend(commit.records.iter().cloned());
        if let Some(approval) = &commit.approval {
            inner
                .approvals
                .entry(approval.id.clone())
                .or_insert_with(|| approval.clone());
        }
        if let Some(next) = &commit.next {
            push_item(&mut inner, next, now);
        }
        Ok(())
    }

    async fn transition_run(&self, transition: &RunTransition) -> Result<WorkflowRun, RepositoryError> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let run = inner
            .runs
            .get_mut(&transition.run_id)
            .ok_or(RepositoryError::NotFound)?;
        if !transition.from.contains(&run.status) {
            return Err(RepositoryError::Conflict(format!(
                "run {} is {}, cannot become {}",
                run.id, run.status, transition.to
            )));
        }
        run.status = transition.to;
        run.updated_at = now;
        if transition.error.is_some() {
            run.error = transition.error.clone();
        }
        if transition.to == RunStatus::Running {
            run.started_at.get_or_insert(now);
        }
        if transition.to.is_terminal() {
            run.completed_at = Some(now);
        }
        let updated = run.clone();
        if let Some(item) = &transition.enqueue {
            push_item(&mut inner, item, now);
        }
        Ok(updated)
    }

    async fn list_orphaned_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let inner = self.lock()?;
        Ok(inner
            .runs
            .values()
            .filter(|r| r.status.is_executable())
            .filter(|r| !inner.queue.iter().any(|q| q.item.run_id == r.id))
            .cloned()
            .collect())
    }

    async fn fail_run(&self, run_id: &Uuid, error: &str, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        let mut inner = self.lock()?;
        if let Some(run) = inner.runs.get_mut(run_id) {
            if !run.status.is_terminal() {
                run.status = RunStatus::Failed;
                run.error = Some(error.to_string());
                run.updated_at = at;
                run.completed_at = Some(at);
            }
        }
        Ok(())
    }

    async fn list_step_records(&self, run_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        let inner = self.lock()?;
        Ok(inner
            .records
            .iter()
            .filter(|r| &r.run_id == run_id)
            .cloned()
            .collect())
    }
}

impl ApprovalRepository for MemoryStore {
    async fn get_approval(&self, id: &str) -> Result<Option<Approval>, RepositoryError> {
        Ok(self.lock()?.approvals.get(id).cloned())
    }

    async fn list_approvals(&self, filter: &ApprovalFilter) -> Result<Vec<Approval>, RepositoryError> {
        let inner = self.lock()?;
        let mut out: Vec<Approval> = inner
            .approvals
            .values()
            .filter(|a| filter.status.is_none_or(|s| a.status == s))
            .filter(|a| filter.run_id.is_none_or(|r| a.run_id == r))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn decide_approval(
        &self,
        resolution: &ApprovalResolution,
    ) -> Result<(Approval, bool), RepositoryError> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let approval = inner
            .approvals
            .get_mut(&resolution.approval_id)
            .ok_or(RepositoryError::NotFound)?;
        if approval.status != ApprovalStatus::Pending {
            return Err(RepositoryError::Conflict(format!(
                "approval {} is already {}",
                approval.id,
                approval.status.as_str()
            )));
        }
        approval.status = resolution.status;
        approval.decided_by = Some(resolution.decided_by.clone());
        approval.decided_at = Some(resolution.decided_at);
        approval.comment = resolution.comment.clone();
        let updated = approval.clone();

        let mut resumed = false;
        if let Some(resume) = &resolution.resume {
            if let Some(run) = inner.runs.get_mut(&resume.run_id) {
                if run.status == RunStatus::WaitingApproval && run.step_seq == resume.expected_seq {
                    run.status = resume.status;
                    run.current_state_id = resume.current_state_id.clone();
                    run.context = resume.context.clone();
                    run.step_seq += 1;
                    run.updated_at = now;
                    if resume.status.is_terminal() {
                        run.completed_at = Some(now);
                    }
                    resumed = true;
                }
            }
            if resumed {
                inner.records.push(resume.record.clone());
                if let Some(next) = &resume.next {
                    push_item(&mut inner, next, now);
                }
            }
        }
        Ok((updated, resumed))
    }

    async fn list_expired_approvals(&self, now: DateTime<Utc>) -> Result<Vec<Approval>, RepositoryError> {
        let inner = self.lock()?;
        Ok(inner
            .approvals
            .values()
            .filter(|a| a.status == ApprovalStatus::Pending && a.timeout_at <= now)
            .cloned()
            .collect())
    }

    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<(), RepositoryError> {
        self.lock()?.deliveries.push(record.clone());
        Ok(())
    }

    async fn list_deliveries(&self, approval_id: &str) -> Result<Vec<DeliveryRecord>, RepositoryError> {
        let inner = self.lock()?;
        Ok(inner
            .deliveries
            .iter()
            .filter(|d| d.approval_id == approval_id)
            .cloned()
            .collect())
    }
}

impl WorkQueue for MemoryStore {
    async fn enqueue(&self, item: &WorkItem) -> Result<(), RepositoryError> {
        let mut inner = self.lock()?;
        push_item(&mut inner, item, Utc::now());
        Ok(())
    }

    async fn dequeue(&self, lease: Duration) -> Result<Option<WorkItem>, RepositoryError> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(365));
        let Some(queued) = inner.queue.iter_mut().find(|q| {
            q.available_at <= now && q.lease_until.is_none_or(|until| until <= now)
        }) else {
            return Ok(None);
        };
        queued.lease_until = Some(now + lease);
        queued.item.deliveries += 1;
        Ok(Some(queued.item.clone()))
    }

    async fn extend_lease(&self, item_id: &Uuid, lease: Duration) -> Result<(), RepositoryError> {
        let mut inner = self.lock()?;
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(365));
        if let Some(queued) = inner.queue.iter_mut().find(|q| &q.item.id == item_id) {
            if queued.lease_until.is_some() {
                queued.lease_until = Some(Utc::now() + lease);
            }
        }
        Ok(())
    }

    async fn ack(&self, item_id: &Uuid) -> Result<(), RepositoryError> {
        self.lock()?.queue.retain(|q| &q.item.id != item_id);
        Ok(())
    }

    async fn nack(&self, item_id: &Uuid, delay: Duration) -> Result<(), RepositoryError> {
        let mut inner = self.lock()?;
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        if let Some(queued) = inner.queue.iter_mut().find(|q| &q.item.id == item_id) {
            queued.lease_until = None;
            queued.available_at = Utc::now() + delay;
        }
        Ok(())
    }

    async fn depth(&self) -> Result<u64, RepositoryError> {
        Ok(self.lock()?.queue.len() as u64)
    }
}
