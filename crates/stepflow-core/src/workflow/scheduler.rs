//! Run scheduler: the consumer loop that drives runs step by step.
//!
//! Each work item is processed as load -> execute -> atomic persist -> ack.
//! Workers keep no per-run state between items; the run row in the store is
//! the single source of truth, and its `step_seq` makes redelivered items
//! harmless.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use stepflow_types::approval::ApprovalRequested;
use stepflow_types::config::SchedulerConfig;
use stepflow_types::error::{EngineError, RepositoryError};
use stepflow_types::run::{RunStatus, WorkItem, WorkflowRun};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::cache::GraphCache;
use super::executor::{Frame, NextStep, StepExecutor, StepOutcome};
use super::notifier::{dispatch, BoxApprovalNotifier};
use crate::repository::queue::WorkQueue;
use crate::repository::workflow::{RunTransition, StepCommit, WorkflowRepository};

/// Delay before a released work item becomes visible again.
const RELEASE_DELAY: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// In-flight runs
// ---------------------------------------------------------------------------

/// Cancellation handles of the steps currently executing, by run id.
#[derive(Default)]
pub struct InFlightRuns {
    tokens: DashMap<Uuid, CancellationToken>,
}

impl InFlightRuns {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, run_id: Uuid, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        self.tokens.insert(run_id, token.clone());
        token
    }

    fn finish(&self, run_id: &Uuid) {
        self.tokens.remove(run_id);
    }

    /// Signal the executing step of `run_id`, if any. Returns whether one was found.
    pub fn cancel(&self, run_id: &Uuid) -> bool {
        match self.tokens.get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What processing one work item did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// The step was executed and persisted; the run is now in this status.
    Committed(RunStatus),
    /// Duplicate or stale item, acknowledged without effect.
    Stale,
    /// Run missing or not executable (cancelled, paused, finished).
    Skipped,
    /// Released back to the queue for a later attempt.
    Released,
}

// ---------------------------------------------------------------------------
// RunScheduler
// ---------------------------------------------------------------------------

pub struct RunScheduler<W: WorkflowRepository, Q: WorkQueue> {
    repo: W,
    queue: Q,
    executor: Arc<StepExecutor>,
    graphs: Arc<GraphCache>,
    in_flight: Arc<InFlightRuns>,
    notifier: Option<(Arc<BoxApprovalNotifier>, String)>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
}

impl<W, Q> RunScheduler<W, Q>
where
    W: WorkflowRepository + 'static,
    Q: WorkQueue + 'static,
{
    pub fn new(
        repo: W,
        queue: Q,
        executor: Arc<StepExecutor>,
        graphs: Arc<GraphCache>,
        in_flight: Arc<InFlightRuns>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repo,
            queue,
            executor,
            graphs,
            in_flight,
            notifier: None,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Notify `notifier` whenever a step creates an approval. Links in the
    /// payload point at `public_base_url`.
    pub fn with_notifier(
        mut self,
        notifier: Arc<BoxApprovalNotifier>,
        public_base_url: impl Into<String>,
    ) -> Self {
        self.notifier = Some((notifier, public_base_url.into()));
        self
    }

    /// Stop workers (and abort in-flight steps) when `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    // -----------------------------------------------------------------------
    // Worker loop
    // -----------------------------------------------------------------------

    /// Spawn `config.workers` consumer tasks.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let workers = self.config.workers.max(1);
        tracing::info!(workers, "starting scheduler workers");
        (0..workers)
            .map(|worker| {
                let scheduler = Arc::clone(self);
                tokio::spawn(async move { scheduler.worker_loop(worker).await })
            })
            .collect()
    }

    fn lease(&self) -> Duration {
        Duration::from_secs(self.config.lease_secs.max(1))
    }

    async fn worker_loop(&self, worker: usize) {
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let lease = self.lease();

        while !self.shutdown.is_cancelled() {
            let idle = match self.queue.dequeue(lease).await {
                Ok(Some(item)) => {
                    self.handle(item).await;
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    tracing::error!(worker, error = %e, "failed to dequeue work item");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }
        tracing::debug!(worker, "scheduler worker stopped");
    }

    /// Dequeue and process a single item. `None` when the queue is empty.
    pub async fn run_next(&self) -> Result<Option<ItemOutcome>, EngineError> {
        match self.queue.dequeue(self.lease()).await? {
            Some(item) => Ok(Some(self.handle(item).await)),
            None => Ok(None),
        }
    }

    /// Process items until the queue has nothing visible. Returns the number
    /// of items handled.
    pub async fn drain(&self) -> Result<usize, EngineError> {
        let mut handled = 0;
        while let Some(outcome) = self.run_next().await? {
            handled += 1;
            if outcome == ItemOutcome::Released {
                break;
            }
        }
        Ok(handled)
    }

    // -----------------------------------------------------------------------
    // Startup recovery
    // -----------------------------------------------------------------------

    /// Re-enqueue executable runs that lost their work item, skipping runs
    /// idle for longer than `max_recovery_age_secs`.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let max_age = chrono::Duration::seconds(self.config.max_recovery_age_secs as i64);
        let cutoff = Utc::now() - max_age;
        let mut recovered = 0;

        for run in self.repo.list_orphaned_runs().await? {
            if run.updated_at < cutoff {
                tracing::warn!(
                    run_id = %run.id,
                    updated_at = %run.updated_at,
                    "orphaned run is too old to recover automatically"
                );
                continue;
            }
            let Some(state_id) = run.current_state_id.clone() else {
                continue;
            };
            self.queue
                .enqueue(&WorkItem::new(run.id, state_id.as_str(), run.step_seq))
                .await?;
            tracing::info!(run_id = %run.id, state_id = state_id.as_str(), "recovered orphaned run");
            recovered += 1;
        }
        Ok(recovered)
    }

    // -----------------------------------------------------------------------
    // Processing
    // -----------------------------------------------------------------------

    async fn handle(&self, item: WorkItem) -> ItemOutcome {
        let outcome = match self.process(&item).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    run_id = %item.run_id,
                    state_id = item.state_id.as_str(),
                    deliveries = item.deliveries,
                    error = %e,
                    "failed to process work item"
                );
                ItemOutcome::Released
            }
        };

        let settled = match outcome {
            ItemOutcome::Released => self.queue.nack(&item.id, RELEASE_DELAY).await,
            _ => self.queue.ack(&item.id).await,
        };
        if let Err(e) = settled {
            tracing::error!(run_id = %item.run_id, error = %e, "failed to settle work item");
        }
        outcome
    }

    async fn process(&self, item: &WorkItem) -> Result<ItemOutcome, EngineError> {
        let Some(run) = self.repo.get_run(&item.run_id).await? else {
            tracing::warn!(run_id = %item.run_id, "work item references unknown run");
            return Ok(ItemOutcome::Skipped);
        };

        // Cancellation, pause and completion all take effect here.
        if !run.status.is_executable() {
            tracing::debug!(
                run_id = %run.id,
                status = %run.status,
                "run is not executable, dropping work item"
            );
            return Ok(ItemOutcome::Skipped);
        }
        if run.step_seq != item.seq || run.current_state_id.as_deref() != Some(item.state_id.as_str()) {
            tracing::warn!(
                run_id = %run.id,
                state_id = item.state_id.as_str(),
                item_seq = item.seq,
                run_seq = run.step_seq,
                "dropping duplicate work item"
            );
            return Ok(ItemOutcome::Stale);
        }

        let graph = match self
            .graphs
            .load(&self.repo, &run.workflow_id, run.workflow_version)
            .await
        {
            Ok(graph) => graph,
            Err(EngineError::Repository(e)) => return Err(e.into()),
            Err(e) => return self.fail(&run, &e.to_string()).await,
        };
        let Some(state) = graph.state(&item.state_id) else {
            let message = format!("state '{}' does not exist", item.state_id);
            return self.fail(&run, &message).await;
        };

        let run = if run.status == RunStatus::Pending {
            let claim = RunTransition {
                run_id: run.id,
                from: vec![RunStatus::Pending],
                to: RunStatus::Running,
                error: None,
                enqueue: None,
            };
            match self.repo.transition_run(&claim).await {
                Ok(started) => {
                    tracing::info!(run_id = %started.id, "run started");
                    started
                }
                Err(RepositoryError::Conflict(reason)) => {
                    tracing::debug!(run_id = %run.id, reason = reason.as_str(), "run changed before start");
                    return Ok(ItemOutcome::Skipped);
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            run
        };

        let cancel = self.in_flight.register(run.id, &self.shutdown);
        let frame = Frame {
            run_id: run.id,
            seq: run.step_seq,
            scope: None,
            cancel: cancel.clone(),
        };
        let outcome = self
            .renewing_lease(item, self.executor.execute_state(&frame, state, run.context.clone()))
            .await;
        self.in_flight.finish(&run.id);

        if cancel.is_cancelled() {
            if self.shutdown.is_cancelled() {
                // Redo the step after restart.
                return Ok(ItemOutcome::Released);
            }
            tracing::info!(run_id = %run.id, state_id = item.state_id.as_str(), "step aborted by cancellation");
            return Ok(ItemOutcome::Skipped);
        }

        let commit = build_commit(&run, &item.state_id, outcome);
        let status = commit.status;
        let approval = commit.approval.clone();

        match self.repo.commit_step(&commit).await {
            Ok(()) => {}
            Err(RepositoryError::Conflict(reason)) => {
                tracing::warn!(run_id = %run.id, reason = reason.as_str(), "step result discarded");
                return Ok(ItemOutcome::Stale);
            }
            Err(e) => return Err(e.into()),
        }

        match status {
            RunStatus::Completed => tracing::info!(run_id = %run.id, "run completed"),
            RunStatus::Failed => tracing::info!(
                run_id = %run.id,
                state_id = item.state_id.as_str(),
                error = commit.error.as_deref().unwrap_or(""),
                "run failed"
            ),
            RunStatus::WaitingApproval => tracing::info!(
                run_id = %run.id,
                state_id = item.state_id.as_str(),
                "run waiting for approval"
            ),
            _ => tracing::debug!(
                run_id = %run.id,
                state_id = item.state_id.as_str(),
                next = commit.current_state_id.as_deref().unwrap_or(""),
                "step persisted"
            ),
        }

        if let (Some(approval), Some((notifier, base_url))) = (approval, &self.notifier) {
            dispatch(Arc::clone(notifier), ApprovalRequested::new(&approval, base_url));
        }
        Ok(ItemOutcome::Committed(status))
    }

    /// Drive `step` to completion, renewing the item's lease every half
    /// lease so it is not redelivered to another worker meanwhile.
    async fn renewing_lease<F>(&self, item: &WorkItem, step: F) -> StepOutcome
    where
        F: std::future::Future<Output = StepOutcome>,
    {
        let lease = self.lease();
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + lease / 2, lease / 2);
        renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(step);
        loop {
            tokio::select! {
                outcome = &mut step => return outcome,
                _ = renew.tick() => {
                    if let Err(e) = self.queue.extend_lease(&item.id, lease).await {
                        tracing::warn!(run_id = %item.run_id, error = %e, "failed to renew work item lease");
                    }
                }
            }
        }
    }

    async fn fail(&self, run: &WorkflowRun, message: &str) -> Result<ItemOutcome, EngineError> {
        tracing::error!(run_id = %run.id, error = message, "run cannot continue");
        self.repo.fail_run(&run.id, message, Utc::now()).await?;
        Ok(ItemOutcome::Committed(RunStatus::Failed))
    }
}

/// Translate a step outcome into the atomic write that follows it.
fn build_commit(run: &WorkflowRun, state_id: &str, outcome: StepOutcome) -> StepCommit {
    let here = Some(state_id.to_string());
    let (status, current_state_id, context, error, next) = match outcome.next {
        NextStep::Transition(target) => (
            RunStatus::Running,
            Some(target.clone()),
            outcome.context,
            None,
            Some(WorkItem::new(run.id, target, run.step_seq + 1)),
        ),
        NextStep::End => (RunStatus::Completed, here, outcome.context, None, None),
        NextStep::WaitForApproval(_) => {
            (RunStatus::WaitingApproval, here, outcome.context, None, None)
        }
        // A failed step leaves the last good context in place.
        NextStep::Fail(message) => (RunStatus::Failed, here, run.context.clone(), Some(message), None),
    };

    StepCommit {
        run_id: run.id,
        expected_seq: run.step_seq,
        status,
        current_state_id,
        context,
        error,
        records: outcome.records,
        approval: outcome.approval,
        next,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::{json, Value};
    use stepflow_types::run::StepStatus;

    use super::*;
    use crate::repository::memory::MemoryStore;
    use crate::testing::{definition, Harness};
    use crate::workflow::operation::{OperationFailure, OperationHandler, OperationRequest};

    struct Counting(Arc<AtomicU32>);

    impl OperationHandler for Counting {
        async fn invoke(&self, _request: &OperationRequest) -> Result<Value, OperationFailure> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "ok": true }))
        }
    }

    /// Records the run status seen from inside the step.
    struct StatusCheck {
        store: MemoryStore,
        seen: Arc<std::sync::Mutex<Vec<RunStatus>>>,
    }

    impl OperationHandler for StatusCheck {
        async fn invoke(&self, request: &OperationRequest) -> Result<Value, OperationFailure> {
            let run = self.store.get_run(&request.run_id).await.unwrap().unwrap();
            self.seen.lock().unwrap().push(run.status);
            Ok(json!({}))
        }
    }

    struct Slow(Arc<AtomicU32>, Duration);

    impl OperationHandler for Slow {
        async fn invoke(&self, _request: &OperationRequest) -> Result<Value, OperationFailure> {
            self.0.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.1).await;
            Ok(json!({ "slow": true }))
        }
    }

    fn sequential() -> serde_json::Value {
        json!({
            "id": "seq",
            "states": [
                { "id": "seed", "type": "inject", "data": { "x": 1 }, "transition": "bump" },
                { "id": "bump", "type": "transform", "expression": "x + 1", "output": "x", "transition": "done" },
                { "id": "done", "type": "inject", "data": {}, "end": true }
            ]
        })
    }

    #[tokio::test]
    async fn test_sequential_run_completes() {
        let h = Harness::new();
        h.publish(definition(json!({
            "id": "two",
            "states": [
                { "id": "seed", "type": "inject", "data": { "x": 1 }, "transition": "bump" },
                { "id": "bump", "type": "transform", "expression": "x + 1", "output": "x", "end": true }
            ]
        })))
        .await;

        let run = h.start("two", json!({})).await;
        assert_eq!(h.scheduler.drain().await.unwrap(), 2);

        let detail = h.runs.get_run(&run.id).await.unwrap();
        assert_eq!(detail.run.status, RunStatus::Completed);
        assert_eq!(detail.run.context, json!({ "x": 2 }));
        assert_eq!(detail.steps.len(), 2);
        assert!(detail.steps.iter().all(|s| s.status == StepStatus::Completed));
        assert!(detail.run.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_redelivered_item_is_noop() {
        let h = Harness::new();
        h.publish(definition(sequential())).await;
        let run = h.start("seq", json!({})).await;
        h.scheduler.drain().await.unwrap();

        // Same item again after the run advanced past it.
        h.store
            .enqueue(&WorkItem::new(run.id, "bump", 1))
            .await
            .unwrap();
        assert_eq!(h.scheduler.run_next().await.unwrap(), Some(ItemOutcome::Skipped));

        let detail = h.runs.get_run(&run.id).await.unwrap();
        assert_eq!(detail.steps.len(), 3);
        assert_eq!(detail.run.context, json!({ "x": 2 }));
        assert_eq!(h.store.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stale_item_on_running_run_is_dropped() {
        let h = Harness::new();
        h.publish(definition(sequential())).await;
        let run = h.start("seq", json!({})).await;

        assert_eq!(
            h.scheduler.run_next().await.unwrap(),
            Some(ItemOutcome::Committed(RunStatus::Running))
        );
        // Duplicate of the step that was just executed.
        h.store.enqueue(&WorkItem::new(run.id, "seed", 0)).await.unwrap();

        let mut outcomes = Vec::new();
        while let Some(outcome) = h.scheduler.run_next().await.unwrap() {
            outcomes.push(outcome);
        }
        assert!(outcomes.contains(&ItemOutcome::Stale));

        let detail = h.runs.get_run(&run.id).await.unwrap();
        assert_eq!(detail.run.status, RunStatus::Completed);
        assert_eq!(detail.steps.iter().filter(|s| s.state_id == "seed").count(), 1);
    }

    #[tokio::test]
    async fn test_failed_step_fails_run_and_keeps_context() {
        let h = Harness::new();
        h.publish(definition(json!({
            "id": "bad",
            "states": [
                { "id": "seed", "type": "inject", "data": { "x": 1 }, "transition": "call" },
                { "id": "call", "type": "operation", "task": "missing.task", "end": true }
            ]
        })))
        .await;
        let run = h.start("bad", json!({})).await;
        h.scheduler.drain().await.unwrap();

        let detail = h.runs.get_run(&run.id).await.unwrap();
        assert_eq!(detail.run.status, RunStatus::Failed);
        assert_eq!(detail.run.context, json!({ "x": 1 }));
        assert!(detail.run.error.unwrap().contains("missing.task"));
        assert_eq!(detail.run.current_state_id.as_deref(), Some("call"));
    }

    #[tokio::test]
    async fn test_cancel_checked_at_dequeue() {
        let calls = Arc::new(AtomicU32::new(0));
        let h = Harness::new();
        h.registry.register("count", Counting(Arc::clone(&calls)));
        h.publish(definition(json!({
            "id": "c",
            "states": [{ "id": "call", "type": "operation", "task": "count", "end": true }]
        })))
        .await;
        let run = h.start("c", json!({})).await;

        h.runs.cancel_run(&run.id, Some("operator".to_string())).await.unwrap();
        assert_eq!(h.scheduler.run_next().await.unwrap(), Some(ItemOutcome::Skipped));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let detail = h.runs.get_run(&run.id).await.unwrap();
        assert_eq!(detail.run.status, RunStatus::Cancelled);
        assert!(detail.steps.is_empty());
    }

    #[tokio::test]
    async fn test_pending_run_marked_running_before_first_step() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let h = Harness::new();
        h.registry.register(
            "observe",
            StatusCheck {
                store: h.store.clone(),
                seen: Arc::clone(&seen),
            },
        );
        h.publish(definition(json!({
            "id": "obs",
            "states": [{ "id": "call", "type": "operation", "task": "observe", "end": true }]
        })))
        .await;
        let run = h.start("obs", json!({})).await;
        let before = h.runs.get_run(&run.id).await.unwrap().run;
        assert_eq!(before.status, RunStatus::Pending);
        assert!(before.started_at.is_none());

        assert_eq!(
            h.scheduler.run_next().await.unwrap(),
            Some(ItemOutcome::Committed(RunStatus::Completed))
        );
        assert_eq!(*seen.lock().unwrap(), vec![RunStatus::Running]);
        assert!(h.runs.get_run(&run.id).await.unwrap().run.started_at.is_some());
    }

    #[tokio::test]
    async fn test_long_step_renews_its_lease() {
        let calls = Arc::new(AtomicU32::new(0));
        let h = Harness::new();
        h.registry.register("slow", Slow(Arc::clone(&calls), Duration::from_millis(2500)));
        h.publish(definition(json!({
            "id": "slow",
            "states": [{ "id": "call", "type": "operation", "task": "slow", "timeout_secs": 10, "end": true }]
        })))
        .await;
        h.start("slow", json!({})).await;
        let scheduler = h.scheduler_with_config(SchedulerConfig {
            lease_secs: 1,
            ..SchedulerConfig::default()
        });

        // A second consumer polls once the first one-second lease would have run out.
        let (outcome, taken) = tokio::join!(scheduler.run_next(), async {
            tokio::time::sleep(Duration::from_millis(1600)).await;
            h.store.dequeue(Duration::from_secs(60)).await.unwrap()
        });
        assert_eq!(
            outcome.unwrap(),
            Some(ItemOutcome::Committed(RunStatus::Completed))
        );
        assert!(taken.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_loop_runs_until_condition() {
        let h = Harness::new();
        h.publish(definition(json!({
            "id": "loop",
            "states": [
                { "id": "init", "type": "inject", "data": { "n": 0 }, "transition": "inc" },
                { "id": "inc", "type": "transform", "expression": "n + 1", "output": "n", "transition": "check" },
                {
                    "id": "check", "type": "switch",
                    "conditions": [{ "if": "n < 3", "next": "inc" }],
                    "default": "stop"
                },
                { "id": "stop", "type": "inject", "data": { "done": true }, "end": true }
            ]
        })))
        .await;
        let run = h.start("loop", json!({})).await;
        h.scheduler.drain().await.unwrap();

        let detail = h.runs.get_run(&run.id).await.unwrap();
        assert_eq!(detail.run.context, json!({ "n": 3, "done": true }));
        assert_eq!(detail.run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_recover_requeues_orphaned_runs() {
        let h = Harness::new();
        h.publish(definition(sequential())).await;
        let run = h.start("seq", json!({})).await;

        // Lose the work item.
        let item = h.store.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();
        h.store.ack(&item.id).await.unwrap();
        assert_eq!(h.scheduler.recover().await.unwrap(), 1);
        h.scheduler.drain().await.unwrap();

        let detail = h.runs.get_run(&run.id).await.unwrap();
        assert_eq!(detail.run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_paused_run_resumes_from_current_state() {
        let h = Harness::new();
        h.publish(definition(sequential())).await;
        let run = h.start("seq", json!({})).await;
        h.scheduler.run_next().await.unwrap();

        h.runs.pause_run(&run.id).await.unwrap();
        assert_eq!(h.scheduler.run_next().await.unwrap(), Some(ItemOutcome::Skipped));
        assert_eq!(h.store.depth().await.unwrap(), 0);

        h.runs.resume_run(&run.id).await.unwrap();
        h.scheduler.drain().await.unwrap();
        let detail = h.runs.get_run(&run.id).await.unwrap();
        assert_eq!(detail.run.status, RunStatus::Completed);
        assert_eq!(detail.run.context, json!({ "x": 2 }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_workers_drive_runs_and_stop_on_shutdown() {
        let h = Harness::new();
        h.publish(definition(sequential())).await;
        let runs = [
            h.start("seq", json!({})).await,
            h.start("seq", json!({})).await,
            h.start("seq", json!({})).await,
        ];

        let shutdown = CancellationToken::new();
        let scheduler = Arc::new(h.scheduler_with_shutdown(shutdown.clone()));
        let handles = scheduler.spawn_workers();

        for run in &runs {
            let mut status = RunStatus::Pending;
            for _ in 0..200 {
                status = h.runs.get_run(&run.id).await.unwrap().run.status;
                if status.is_terminal() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(status, RunStatus::Completed);
        }

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_commit_conflict_when_run_cancelled_mid_step() {
        let h = Harness::new();
        h.publish(definition(sequential())).await;
        let run = h.start("seq", json!({})).await;

        let stored = h.store.get_run(&run.id).await.unwrap().unwrap();
        h.store
            .transition_run(&RunTransition {
                run_id: run.id,
                from: vec![RunStatus::Pending],
                to: RunStatus::Cancelled,
                error: None,
                enqueue: None,
            })
            .await
            .unwrap();

        let commit = StepCommit {
            run_id: run.id,
            expected_seq: stored.step_seq,
            status: RunStatus::Running,
            current_state_id: Some("bump".to_string()),
            context: json!({ "x": 1 }),
            error: None,
            records: vec![],
            approval: None,
            next: None,
        };
        let err = h.store.commit_step(&commit).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }
}
