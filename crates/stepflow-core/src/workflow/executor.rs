//! Step executors: one strategy per state kind.
//!
//! `StepExecutor::execute_state` consumes a context snapshot and returns the
//! new context, the step output, the next-state decision and the step records
//! to persist. It never touches storage; the scheduler persists the outcome
//! atomically.
//!
//! `parallel` and `foreach` recurse into their sub-graphs through
//! `run_scope`, the same machinery used for a single state, parameterised by
//! the sub-graph's scope name. Branches run on forked copies of the context
//! inside a `JoinSet`; foreach iterations are bounded by a `Semaphore`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use stepflow_types::approval::{approval_id, Approval, ApprovalStatus};
use stepflow_types::run::{StepRecord, StepStatus};
use stepflow_types::workflow::{FailurePolicy, RetryConfig, StateDefinition, StateKind};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::{self, check_context_size, limit_output};
use super::expression::{ExpressionError, ExpressionEvaluator};
use super::graph::{CompiledState, Scope};
use super::operation::{OperationFailure, OperationRegistry, OperationRequest};
use super::retry::RetryHandler;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Upper bound on state executions inside one sub-graph instance. Sub-graphs
/// may loop, but run within a single work item and cannot suspend.
pub const MAX_SUBGRAPH_STEPS: usize = 10_000;

/// Reserved foreach bindings.
const INDEX_KEY: &str = "_index";
const TOTAL_KEY: &str = "_total";

// ---------------------------------------------------------------------------
// Errors and decisions
// ---------------------------------------------------------------------------

/// Why a state failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Evaluation(#[from] ExpressionErrorMessage),

    #[error("operation '{task}' failed: {message}")]
    Operation { task: String, message: String },

    #[error("operation '{task}' timed out after {secs}s")]
    Timeout { task: String, secs: u64 },

    #[error("invalid state: {0}")]
    Invalid(String),

    #[error("{0}")]
    Composite(String),

    #[error("{0}")]
    ContextTooLarge(String),

    #[error("cancelled")]
    Cancelled,
}

/// Cloneable rendering of an [`ExpressionError`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("evaluation error: {0}")]
pub struct ExpressionErrorMessage(pub String);

impl From<ExpressionError> for StepError {
    fn from(e: ExpressionError) -> Self {
        StepError::Evaluation(ExpressionErrorMessage(e.to_string()))
    }
}

/// What happens after a state.
#[derive(Debug, Clone, PartialEq)]
pub enum NextStep {
    Transition(String),
    End,
    /// Suspend until the approval with this id is decided.
    WaitForApproval(String),
    Fail(String),
}

/// Result of executing one state.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub context: Value,
    pub output: Option<Value>,
    pub next: NextStep,
    /// The state's own record last, preceded by retry attempts and composite
    /// children.
    pub records: Vec<StepRecord>,
    pub approval: Option<Approval>,
}

/// Identity of the step being executed.
#[derive(Debug, Clone)]
pub struct Frame {
    pub run_id: Uuid,
    pub seq: i64,
    /// `None` at the top level, else the sub-graph instance (`fan/a`, `each[2]`).
    pub scope: Option<String>,
    pub cancel: CancellationToken,
}

impl Frame {
    fn child(&self, scope: String, cancel: CancellationToken) -> Self {
        Self {
            run_id: self.run_id,
            seq: self.seq,
            scope: Some(scope),
            cancel,
        }
    }
}

/// Successful state body before the own record is attached.
struct Applied {
    context: Value,
    output: Option<Value>,
    next: NextStep,
    approval: Option<Approval>,
    attempt: u32,
}

struct Failed {
    error: StepError,
    attempt: u32,
}

impl From<StepError> for Failed {
    fn from(error: StepError) -> Self {
        Self { error, attempt: 1 }
    }
}

impl From<ExpressionError> for Failed {
    fn from(e: ExpressionError) -> Self {
        StepError::from(e).into()
    }
}

/// Outcome of running a whole sub-graph instance.
pub struct ScopeRun {
    pub result: Result<Value, ScopeFailure>,
    pub records: Vec<StepRecord>,
}

#[derive(Debug, Clone)]
pub struct ScopeFailure {
    pub message: String,
    /// Stopped because a sibling failed or the run was cancelled.
    pub cancelled: bool,
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub default_operation_timeout: Duration,
    pub default_approval_timeout: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            default_operation_timeout: Duration::from_secs(300),
            default_approval_timeout: Duration::from_secs(3600),
        }
    }
}

pub struct StepExecutor {
    evaluator: Arc<ExpressionEvaluator>,
    operations: Arc<OperationRegistry>,
    settings: ExecutorSettings,
}

impl StepExecutor {
    pub fn new(
        evaluator: Arc<ExpressionEvaluator>,
        operations: Arc<OperationRegistry>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            evaluator,
            operations,
            settings,
        }
    }

    pub fn evaluator(&self) -> &ExpressionEvaluator {
        &self.evaluator
    }

    /// Execute one state against `context`.
    pub async fn execute_state(
        self: &Arc<Self>,
        frame: &Frame,
        state: &CompiledState,
        context: Value,
    ) -> StepOutcome {
        let def = &state.definition;
        let started_at = Utc::now();
        let timer = Instant::now();
        let mut records = Vec::new();

        let result = match &def.kind {
            StateKind::Operation {
                task,
                input,
                timeout_secs,
                retry,
            } => {
                if def.is_human_approval() {
                    self.request_approval(frame, def, input, context)
                } else {
                    self.run_operation(
                        frame,
                        def,
                        task,
                        input,
                        *timeout_secs,
                        retry.as_ref(),
                        context,
                        &mut records,
                    )
                    .await
                }
            }
            StateKind::Inject { data } => self.inject(def, data, context),
            StateKind::Switch {
                data_path,
                conditions,
                default,
            } => self.switch(data_path.as_deref(), conditions, default.as_deref(), context),
            StateKind::Transform { expression, output } => {
                self.transform(def, expression, output.as_deref(), context)
            }
            StateKind::Parallel { failure_policy, .. } => {
                self.parallel(frame, state, *failure_policy, context, &mut records)
                    .await
            }
            StateKind::Foreach {
                items_path,
                item_name,
                max_concurrency,
                failure_policy,
                ..
            } => {
                self.foreach(
                    frame,
                    state,
                    items_path,
                    item_name,
                    *max_concurrency,
                    *failure_policy,
                    context,
                    &mut records,
                )
                .await
            }
        };

        let result = result.and_then(|applied| {
            check_context_size(&applied.context)
                .map_err(|e| Failed::from(StepError::ContextTooLarge(e)))?;
            Ok(applied)
        });

        let duration_ms = timer.elapsed().as_millis() as u64;
        match result {
            Ok(applied) => {
                let status = if applied.approval.is_some() {
                    StepStatus::WaitingApproval
                } else {
                    StepStatus::Completed
                };
                records.push(step_record(
                    frame,
                    &def.id,
                    status,
                    applied.attempt,
                    started_at,
                    duration_ms,
                    applied.output.clone(),
                    None,
                ));
                StepOutcome {
                    context: applied.context,
                    output: applied.output,
                    next: applied.next,
                    records,
                    approval: applied.approval,
                }
            }
            Err(failed) => {
                let message = failed.error.to_string();
                tracing::debug!(
                    run_id = %frame.run_id,
                    state_id = def.id.as_str(),
                    scope = frame.scope.as_deref().unwrap_or(""),
                    error = message.as_str(),
                    "state failed"
                );
                records.push(step_record(
                    frame,
                    &def.id,
                    StepStatus::Failed,
                    failed.attempt,
                    started_at,
                    duration_ms,
                    None,
                    Some(message.clone()),
                ));
                StepOutcome {
                    context: Value::Null,
                    output: None,
                    next: NextStep::Fail(message),
                    records,
                    approval: None,
                }
            }
        }
    }

    /// Run a sub-graph instance from its start state to a terminal state.
    ///
    /// Boxed so that `parallel`/`foreach` can recurse.
    pub fn run_scope(
        self: Arc<Self>,
        frame: Frame,
        scope: Arc<Scope>,
        context: Value,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ScopeRun> + Send + 'static>> {
        Box::pin(async move {
            let mut records = Vec::new();
            let mut context = context;
            let mut current = scope.start.clone();

            for _ in 0..MAX_SUBGRAPH_STEPS {
                if frame.cancel.is_cancelled() {
                    return ScopeRun {
                        result: Err(ScopeFailure {
                            message: "cancelled".to_string(),
                            cancelled: true,
                        }),
                        records,
                    };
                }

                let Some(state) = scope.state(&current) else {
                    return ScopeRun {
                        result: Err(ScopeFailure {
                            message: format!("unknown state '{current}' in scope '{}'", scope.name),
                            cancelled: false,
                        }),
                        records,
                    };
                };

                let outcome = self.execute_state(&frame, state, context.clone()).await;
                records.extend(outcome.records);

                match outcome.next {
                    NextStep::Transition(next) => {
                        context = outcome.context;
                        current = next;
                    }
                    NextStep::End => {
                        return ScopeRun {
                            result: Ok(outcome.context),
                            records,
                        };
                    }
                    NextStep::WaitForApproval(_) => {
                        return ScopeRun {
                            result: Err(ScopeFailure {
                                message: "approvals cannot suspend a sub-graph".to_string(),
                                cancelled: false,
                            }),
                            records,
                        };
                    }
                    NextStep::Fail(message) => {
                        return ScopeRun {
                            result: Err(ScopeFailure {
                                cancelled: frame.cancel.is_cancelled(),
                                message,
                            }),
                            records,
                        };
                    }
                }
            }

            ScopeRun {
                result: Err(ScopeFailure {
                    message: format!(
                        "scope '{}' exceeded {MAX_SUBGRAPH_STEPS} steps",
                        scope.name
                    ),
                    cancelled: false,
                }),
                records,
            }
        })
    }

    // -----------------------------------------------------------------------
    // operation
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn run_operation(
        &self,
        frame: &Frame,
        def: &StateDefinition,
        task: &str,
        input: &Map<String, Value>,
        timeout_secs: Option<u64>,
        retry: Option<&RetryConfig>,
        mut context: Value,
        records: &mut Vec<StepRecord>,
    ) -> Result<Applied, Failed> {
        let resolved = context::resolve_map(input, &context, &self.evaluator)?;
        let handler = self.operations.resolve(task);
        let timeout = timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.settings.default_operation_timeout);

        let mut attempt = 1u32;
        loop {
            let started_at = Utc::now();
            let timer = Instant::now();
            let request = OperationRequest {
                run_id: frame.run_id,
                state_id: def.id.clone(),
                task: task.to_string(),
                input: Value::Object(resolved.clone()),
                attempt,
                cancel: frame.cancel.clone(),
            };

            let result = tokio::select! {
                _ = frame.cancel.cancelled() => {
                    return Err(Failed { error: StepError::Cancelled, attempt });
                }
                r = tokio::time::timeout(timeout, handler.invoke(&request)) => r,
            };

            let (error, retryable) = match result {
                Ok(Ok(output)) => {
                    let output = limit_output(&def.id, output);
                    let path = def.result_path.as_deref().unwrap_or(&def.id);
                    context::set_path(&mut context, path, output.clone());
                    return Ok(Applied {
                        context,
                        output: Some(output),
                        next: follow(def),
                        approval: None,
                        attempt,
                    });
                }
                Ok(Err(failure)) => {
                    let retryable = failure.is_retryable();
                    let error = match failure {
                        OperationFailure::UnknownTask(_) => StepError::Invalid(failure.to_string()),
                        other => StepError::Operation {
                            task: task.to_string(),
                            message: other.to_string(),
                        },
                    };
                    (error, retryable)
                }
                Err(_elapsed) => (
                    StepError::Timeout {
                        task: task.to_string(),
                        secs: timeout.as_secs(),
                    },
                    true,
                ),
            };

            if !(retryable && RetryHandler::should_retry(retry, attempt)) {
                return Err(Failed { error, attempt });
            }

            let message = error.to_string();
            tracing::warn!(
                run_id = %frame.run_id,
                state_id = def.id.as_str(),
                task,
                attempt,
                error = message.as_str(),
                "operation failed, retrying"
            );
            records.push(step_record(
                frame,
                &def.id,
                StepStatus::Failed,
                attempt,
                started_at,
                timer.elapsed().as_millis() as u64,
                None,
                Some(message),
            ));

            let delay = retry.map(|r| RetryHandler::backoff(r, attempt)).unwrap_or_default();
            tokio::select! {
                _ = frame.cancel.cancelled() => {
                    return Err(Failed { error: StepError::Cancelled, attempt });
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// `operation` with task `human.approval`: build the approval and suspend.
    fn request_approval(
        &self,
        frame: &Frame,
        def: &StateDefinition,
        input: &Map<String, Value>,
        context: Value,
    ) -> Result<Applied, Failed> {
        if frame.scope.is_some() {
            return Err(StepError::Invalid(
                "human.approval cannot run inside a sub-graph".to_string(),
            )
            .into());
        }
        let resolved = context::resolve_map(input, &context, &self.evaluator)?;

        let message = match resolved.get("message") {
            Some(Value::String(m)) if !m.trim().is_empty() => m.clone(),
            _ => {
                return Err(StepError::Invalid(
                    "human.approval requires a non-empty 'message'".to_string(),
                )
                .into());
            }
        };
        let approvers: Vec<String> = match resolved.get("approvers") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(single)) => vec![single.clone()],
            _ => Vec::new(),
        };
        let timeout = resolved
            .get("timeout_seconds")
            .or_else(|| resolved.get("timeoutSeconds"))
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(self.settings.default_approval_timeout);
        let summary_path = resolved
            .get("summary_path")
            .or_else(|| resolved.get("summaryPath"))
            .and_then(Value::as_str)
            .filter(|p| !p.trim().is_empty())
            .map(str::to_string);

        let now = Utc::now();
        let id = approval_id(&frame.run_id, &def.id, frame.seq);
        let timeout_at = now
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::hours(1));
        let approval = Approval {
            id: id.clone(),
            run_id: frame.run_id,
            state_id: def.id.clone(),
            message: message.clone(),
            summary_path,
            approvers,
            status: ApprovalStatus::Pending,
            timeout_at,
            decided_by: None,
            decided_at: None,
            comment: None,
            created_at: now,
        };

        Ok(Applied {
            context,
            output: Some(json!({
                "approval_id": id,
                "message": message,
                "status": "pending",
            })),
            next: NextStep::WaitForApproval(id),
            approval: Some(approval),
            attempt: 1,
        })
    }

    // -----------------------------------------------------------------------
    // inject / switch / transform
    // -----------------------------------------------------------------------

    fn inject(
        &self,
        def: &StateDefinition,
        data: &Map<String, Value>,
        mut context: Value,
    ) -> Result<Applied, Failed> {
        let resolved = context::resolve_map(data, &context, &self.evaluator)?;
        context::merge_at(&mut context, def.result_path.as_deref(), resolved.clone());
        Ok(Applied {
            context,
            output: Some(Value::Object(resolved)),
            next: follow(def),
            approval: None,
            attempt: 1,
        })
    }

    fn switch(
        &self,
        data_path: Option<&str>,
        conditions: &[stepflow_types::workflow::SwitchCondition],
        default: Option<&str>,
        context: Value,
    ) -> Result<Applied, Failed> {
        let scoped;
        let view = match data_path {
            Some(path) if !path.trim().is_empty() => {
                let data = self.evaluator.evaluate(path, &context)?;
                let mut bound = context.clone();
                if let Value::Object(map) = &mut bound {
                    map.insert("data".to_string(), data);
                }
                scoped = bound;
                &scoped
            }
            _ => &context,
        };

        let mut target = None;
        for (index, cond) in conditions.iter().enumerate() {
            if self.evaluator.evaluate_bool(&cond.condition, view)? {
                target = Some((Some(index), cond.next.clone()));
                break;
            }
        }
        let (matched, next) = match target {
            Some(t) => t,
            None => match default {
                Some(d) => (None, d.to_string()),
                None => {
                    return Err(StepError::Invalid("switch has no default".to_string()).into());
                }
            },
        };

        Ok(Applied {
            output: Some(json!({ "matched": matched, "next": next })),
            context,
            next: NextStep::Transition(next),
            approval: None,
            attempt: 1,
        })
    }

    fn transform(
        &self,
        def: &StateDefinition,
        expression: &str,
        output: Option<&str>,
        mut context: Value,
    ) -> Result<Applied, Failed> {
        let value = self.evaluator.evaluate(expression, &context)?;
        let value = limit_output(&def.id, value);
        context::set_path(&mut context, output.unwrap_or(&def.id), value.clone());
        Ok(Applied {
            context,
            output: Some(value),
            next: follow(def),
            approval: None,
            attempt: 1,
        })
    }

    // -----------------------------------------------------------------------
    // parallel
    // -----------------------------------------------------------------------

    async fn parallel(
        self: &Arc<Self>,
        frame: &Frame,
        state: &CompiledState,
        policy: FailurePolicy,
        mut context: Value,
        records: &mut Vec<StepRecord>,
    ) -> Result<Applied, Failed> {
        let def = &state.definition;
        let seed = context.clone();
        let cancel = frame.cancel.child_token();
        let mut join_set = JoinSet::new();

        for (index, branch) in state.branches.iter().enumerate() {
            let executor = Arc::clone(self);
            let child = frame.child(branch.scope.name.clone(), cancel.clone());
            let scope = Arc::clone(&branch.scope);
            let fork = seed.clone();
            join_set.spawn(async move { (index, executor.run_scope(child, scope, fork).await) });
        }

        let mut outputs: Vec<Option<Value>> = vec![None; state.branches.len()];
        let mut failure: Option<String> = None;

        // Barrier: every branch must report before the state advances.
        while let Some(joined) = join_set.join_next().await {
            let (index, run) = match joined {
                Ok(r) => r,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    failure.get_or_insert_with(|| format!("branch task panicked: {e}"));
                    cancel.cancel();
                    join_set.abort_all();
                    continue;
                }
            };
            records.extend(run.records);
            let name = &state.branches[index].name;
            match run.result {
                Ok(result) => outputs[index] = Some(context::delta(&seed, &result, &[])),
                Err(err) if err.cancelled && failure.is_some() => {}
                Err(err) => match policy {
                    FailurePolicy::FailFast => {
                        if failure.is_none() {
                            failure = Some(format!("branch '{name}' failed: {}", err.message));
                            cancel.cancel();
                            join_set.abort_all();
                        }
                    }
                    FailurePolicy::CollectPartial => {
                        outputs[index] = Some(json!({ "error": err.message }));
                    }
                },
            }
        }

        if frame.cancel.is_cancelled() {
            return Err(StepError::Cancelled.into());
        }
        if let Some(message) = failure {
            return Err(StepError::Composite(message).into());
        }

        let mut merged = Map::new();
        for (branch, output) in state.branches.iter().zip(outputs) {
            merged.insert(branch.name.clone(), output.unwrap_or(Value::Null));
        }
        let output = limit_output(&def.id, Value::Object(merged));
        context::set_path(
            &mut context,
            def.result_path.as_deref().unwrap_or(&def.id),
            output.clone(),
        );

        Ok(Applied {
            context,
            output: Some(output),
            next: follow(def),
            approval: None,
            attempt: 1,
        })
    }

    // -----------------------------------------------------------------------
    // foreach
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn foreach(
        self: &Arc<Self>,
        frame: &Frame,
        state: &CompiledState,
        items_path: &str,
        item_name: &str,
        max_concurrency: i64,
        policy: FailurePolicy,
        mut context: Value,
        records: &mut Vec<StepRecord>,
    ) -> Result<Applied, Failed> {
        let def = &state.definition;
        let items = self.evaluator.evaluate_array(items_path, &context)?;
        let total = items.len();
        let Some(iterator) = state.iterator.clone() else {
            return Err(StepError::Invalid("foreach without iterator".to_string()).into());
        };

        let mut results: Vec<Option<Value>> = vec![None; total];
        let mut failures: Vec<(usize, String)> = Vec::new();

        if total > 0 {
            let workers = max_concurrency.max(1) as usize;
            let semaphore = Arc::new(Semaphore::new(workers));
            let cancel = frame.cancel.child_token();
            let mut join_set = JoinSet::new();

            for (index, item) in items.into_iter().enumerate() {
                let executor = Arc::clone(self);
                let semaphore = Arc::clone(&semaphore);
                let scope = Arc::clone(&iterator);
                let child = frame.child(format!("{}[{index}]", iterator.name), cancel.clone());
                let mut seed = context.clone();
                if let Value::Object(map) = &mut seed {
                    map.insert(item_name.to_string(), item);
                    map.insert(INDEX_KEY.to_string(), json!(index));
                    map.insert(TOTAL_KEY.to_string(), json!(total));
                }
                let skip = [item_name.to_string(), INDEX_KEY.to_string(), TOTAL_KEY.to_string()];
                let cancel = cancel.clone();

                join_set.spawn(async move {
                    // Closed semaphore means a sibling failed under fail-fast.
                    let Ok(_permit) = Arc::clone(&semaphore).acquire_owned().await else {
                        return (index, None);
                    };
                    if cancel.is_cancelled() {
                        return (index, None);
                    }
                    let run = executor.run_scope(child, scope, seed.clone()).await;
                    // Stop the pool while this task still holds its permit, so
                    // no queued iteration starts after the first failure.
                    if policy == FailurePolicy::FailFast
                        && matches!(&run.result, Err(err) if !err.cancelled)
                    {
                        semaphore.close();
                        cancel.cancel();
                    }
                    let skip: Vec<&str> = skip.iter().map(String::as_str).collect();
                    let result = run.result.map(|after| context::delta(&seed, &after, &skip));
                    (index, Some((result, run.records)))
                });
            }

            while let Some(joined) = join_set.join_next().await {
                let (index, run) = match joined {
                    Ok(r) => r,
                    Err(e) => {
                        failures.push((usize::MAX, format!("iteration task panicked: {e}")));
                        semaphore.close();
                        cancel.cancel();
                        continue;
                    }
                };
                let Some((result, iteration_records)) = run else {
                    continue;
                };
                records.extend(iteration_records);
                match result {
                    Ok(delta) => results[index] = Some(delta),
                    Err(err) if err.cancelled => {}
                    Err(err) => match policy {
                        FailurePolicy::FailFast => {
                            failures.push((index, err.message));
                            semaphore.close();
                            cancel.cancel();
                        }
                        FailurePolicy::CollectPartial => {
                            results[index] = Some(json!({ "error": err.message }));
                        }
                    },
                }
            }
        }

        if frame.cancel.is_cancelled() {
            return Err(StepError::Cancelled.into());
        }
        if !failures.is_empty() {
            failures.sort_by_key(|(index, _)| *index);
            let message = format!(
                "{} iteration(s) failed: {}",
                failures.len(),
                failures[0].1
            );
            return Err(StepError::Composite(message).into());
        }

        let results: Vec<Value> = results.into_iter().map(|r| r.unwrap_or(Value::Null)).collect();
        let output = limit_output(
            &def.id,
            json!({ "results": results, "count": total }),
        );
        context::set_path(
            &mut context,
            def.result_path.as_deref().unwrap_or(&def.id),
            output.clone(),
        );

        Ok(Applied {
            context,
            output: Some(output),
            next: follow(def),
            approval: None,
            attempt: 1,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Next step of a non-switch state.
fn follow(def: &StateDefinition) -> NextStep {
    match (&def.transition, def.end) {
        (Some(next), false) => NextStep::Transition(next.clone()),
        _ => NextStep::End,
    }
}

#[allow(clippy::too_many_arguments)]
fn step_record(
    frame: &Frame,
    state_id: &str,
    status: StepStatus,
    attempt: u32,
    started_at: DateTime<Utc>,
    duration_ms: u64,
    output: Option<Value>,
    error: Option<String>,
) -> StepRecord {
    StepRecord {
        id: Uuid::now_v7(),
        run_id: frame.run_id,
        seq: frame.seq,
        scope: frame.scope.clone(),
        state_id: state_id.to_string(),
        status,
        attempt,
        started_at,
        duration_ms,
        output,
        error,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use super::*;
    use crate::workflow::graph::{compile, CompiledGraph};
    use crate::workflow::operation::OperationHandler;
    use stepflow_types::workflow::WorkflowDefinition;

    // -----------------------------------------------------------------------
    // Fixtures
    // -----------------------------------------------------------------------

    struct Flaky {
        failures_left: AtomicU32,
        calls: Arc<AtomicU32>,
    }

    impl OperationHandler for Flaky {
        async fn invoke(&self, request: &OperationRequest) -> Result<Value, OperationFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(OperationFailure::Failed("upstream 503".to_string()));
            }
            Ok(json!({ "echo": request.input.clone(), "attempt": request.attempt }))
        }
    }

    struct Slow;

    impl OperationHandler for Slow {
        async fn invoke(&self, request: &OperationRequest) -> Result<Value, OperationFailure> {
            let ms = request.input.get("ms").and_then(Value::as_u64).unwrap_or(10);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "slept": ms }))
        }
    }

    /// Tracks the peak number of concurrent invocations.
    struct Gauge {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl OperationHandler for Gauge {
        async fn invoke(&self, _request: &OperationRequest) -> Result<Value, OperationFailure> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(json!(true))
        }
    }

    struct Boom;

    impl OperationHandler for Boom {
        async fn invoke(&self, _request: &OperationRequest) -> Result<Value, OperationFailure> {
            Err(OperationFailure::Failed("boom".to_string()))
        }
    }

    fn executor(registry: OperationRegistry) -> Arc<StepExecutor> {
        Arc::new(StepExecutor::new(
            Arc::new(ExpressionEvaluator::new()),
            Arc::new(registry),
            ExecutorSettings::default(),
        ))
    }

    fn graph(value: Value) -> CompiledGraph {
        let def: WorkflowDefinition = serde_json::from_value(value).unwrap();
        compile(&def).unwrap()
    }

    fn frame() -> Frame {
        Frame {
            run_id: Uuid::now_v7(),
            seq: 0,
            scope: None,
            cancel: CancellationToken::new(),
        }
    }

    async fn run_state(exec: &Arc<StepExecutor>, g: &CompiledGraph, id: &str, ctx: Value) -> StepOutcome {
        exec.execute_state(&frame(), g.state(id).unwrap(), ctx).await
    }

    // -----------------------------------------------------------------------
    // inject / switch / transform
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_inject_merges_resolved_values() {
        let g = graph(json!({
            "id": "w",
            "states": [
                { "id": "seed", "type": "inject", "data": { "x": 1, "label": "${ name|upper }" }, "transition": "meta" },
                { "id": "meta", "type": "inject", "data": { "n": "${ x }" }, "result_path": "info", "end": true }
            ]
        }));
        let exec = executor(OperationRegistry::new());

        let out = run_state(&exec, &g, "seed", json!({ "name": "ada" })).await;
        assert_eq!(out.next, NextStep::Transition("meta".to_string()));
        assert_eq!(out.context, json!({ "name": "ada", "x": 1, "label": "ADA" }));

        let out = run_state(&exec, &g, "meta", out.context).await;
        assert_eq!(out.next, NextStep::End);
        assert_eq!(out.context["info"], json!({ "n": 1 }));
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_switch_first_true_condition_wins() {
        let g = graph(json!({
            "id": "w",
            "states": [
                {
                    "id": "route",
                    "type": "switch",
                    "conditions": [
                        { "if": "x > 10", "next": "big" },
                        { "if": "x > 0", "next": "small" },
                        { "if": "x > 1", "next": "big" }
                    ],
                    "default": "zero"
                },
                { "id": "big", "type": "inject", "data": {}, "end": true },
                { "id": "small", "type": "inject", "data": {}, "end": true },
                { "id": "zero", "type": "inject", "data": {}, "end": true }
            ]
        }));
        let exec = executor(OperationRegistry::new());

        let out = run_state(&exec, &g, "route", json!({ "x": 5 })).await;
        assert_eq!(out.next, NextStep::Transition("small".to_string()));
        assert_eq!(out.context, json!({ "x": 5 }));

        let out = run_state(&exec, &g, "route", json!({ "x": 0 })).await;
        assert_eq!(out.next, NextStep::Transition("zero".to_string()));
    }

    #[tokio::test]
    async fn test_switch_binds_data_path() {
        let g = graph(json!({
            "id": "w",
            "states": [
                {
                    "id": "route",
                    "type": "switch",
                    "data_path": "order",
                    "conditions": [{ "if": "data.amount > 1000", "next": "review" }],
                    "default": "ship"
                },
                { "id": "review", "type": "inject", "data": {}, "end": true },
                { "id": "ship", "type": "inject", "data": {}, "end": true }
            ]
        }));
        let exec = executor(OperationRegistry::new());
        let out = run_state(&exec, &g, "route", json!({ "order": { "amount": 5000 } })).await;
        assert_eq!(out.next, NextStep::Transition("review".to_string()));
        assert!(out.context.get("data").is_none());
    }

    #[tokio::test]
    async fn test_transform_writes_output_path() {
        let g = graph(json!({
            "id": "w",
            "states": [
                { "id": "gross", "type": "transform", "expression": "order.amount * 2", "output": "order.gross", "end": true }
            ]
        }));
        let exec = executor(OperationRegistry::new());
        let out = run_state(&exec, &g, "gross", json!({ "order": { "amount": 21 } })).await;
        assert_eq!(out.context, json!({ "order": { "amount": 21, "gross": 42 } }));
        assert_eq!(out.output, Some(json!(42)));
    }

    #[tokio::test]
    async fn test_evaluation_error_fails_step() {
        let g = graph(json!({
            "id": "w",
            "states": [{ "id": "bad", "type": "transform", "expression": "x ==", "end": true }]
        }));
        let exec = executor(OperationRegistry::new());
        let out = run_state(&exec, &g, "bad", json!({ "x": 1 })).await;
        assert!(matches!(out.next, NextStep::Fail(ref m) if m.contains("evaluation error")));
        assert_eq!(out.records[0].status, StepStatus::Failed);
    }

    // -----------------------------------------------------------------------
    // operation
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_operation_retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = OperationRegistry::new();
        registry.register(
            "agent.run",
            Flaky {
                failures_left: AtomicU32::new(2),
                calls: Arc::clone(&calls),
            },
        );
        let g = graph(json!({
            "id": "w",
            "states": [{
                "id": "call",
                "type": "operation",
                "task": "agent.run",
                "input": { "prompt": "hi ${ who }" },
                "retry": { "max_attempts": 3, "initial_backoff_ms": 10 },
                "result_path": "answer",
                "end": true
            }]
        }));
        let exec = executor(registry);
        let out = run_state(&exec, &g, "call", json!({ "who": "bob" })).await;

        assert_eq!(out.next, NextStep::End);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(out.context["answer"]["echo"], json!({ "prompt": "hi bob" }));
        assert_eq!(out.context["answer"]["attempt"], json!(3));
        let statuses: Vec<(StepStatus, u32)> = out.records.iter().map(|r| (r.status, r.attempt)).collect();
        assert_eq!(
            statuses,
            vec![
                (StepStatus::Failed, 1),
                (StepStatus::Failed, 2),
                (StepStatus::Completed, 3)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_exhausts_retries() {
        let registry = OperationRegistry::new();
        registry.register("x", Boom);
        let g = graph(json!({
            "id": "w",
            "states": [{
                "id": "call", "type": "operation", "task": "x",
                "retry": { "max_attempts": 2, "initial_backoff_ms": 5 },
                "end": true
            }]
        }));
        let out = run_state(&executor(registry), &g, "call", json!({})).await;
        assert!(matches!(out.next, NextStep::Fail(ref m) if m.contains("operation 'x' failed: boom")));
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.records[1].attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_timeout_is_retryable() {
        let registry = OperationRegistry::new();
        registry.register("slow", Slow);
        let g = graph(json!({
            "id": "w",
            "states": [{
                "id": "call", "type": "operation", "task": "slow",
                "input": { "ms": 5000 },
                "timeout_secs": 1,
                "retry": { "max_attempts": 2, "initial_backoff_ms": 1 },
                "end": true
            }]
        }));
        let out = run_state(&executor(registry), &g, "call", json!({})).await;
        assert!(matches!(out.next, NextStep::Fail(ref m) if m.contains("timed out")));
        assert_eq!(out.records.len(), 2);
    }

    #[tokio::test]
    async fn test_unregistered_task_fails_without_retry() {
        let g = graph(json!({
            "id": "w",
            "states": [{
                "id": "call", "type": "operation", "task": "nobody.home",
                "retry": { "max_attempts": 5 },
                "end": true
            }]
        }));
        let out = run_state(&executor(OperationRegistry::new()), &g, "call", json!({})).await;
        assert!(matches!(out.next, NextStep::Fail(ref m) if m.contains("nobody.home")));
        assert_eq!(out.records.len(), 1);
    }

    #[tokio::test]
    async fn test_human_approval_suspends() {
        let g = graph(json!({
            "id": "w",
            "states": [{
                "id": "review", "type": "operation", "task": "human.approval",
                "input": { "message": "Ship ${ order }?", "approvers": ["alice"], "timeoutSeconds": 60 },
                "end": true
            }]
        }));
        let f = frame();
        let exec = executor(OperationRegistry::new());
        let out = exec
            .execute_state(&f, g.state("review").unwrap(), json!({ "order": "A1" }))
            .await;

        let approval = out.approval.unwrap();
        assert_eq!(approval.id, approval_id(&f.run_id, "review", f.seq));
        assert_eq!(approval.message, "Ship A1?");
        assert_eq!(approval.summary_path, None);
        assert_eq!(approval.approvers, vec!["alice".to_string()]);
        assert_eq!(approval.status, ApprovalStatus::Pending);
        assert_eq!(out.next, NextStep::WaitForApproval(approval.id.clone()));
        assert_eq!(out.records[0].status, StepStatus::WaitingApproval);
        assert_eq!(out.output.unwrap()["status"], json!("pending"));
    }

    #[tokio::test]
    async fn test_human_approval_keeps_summary_path_and_visit_seq() {
        let g = graph(json!({
            "id": "w",
            "states": [{
                "id": "review", "type": "operation", "task": "human.approval",
                "input": { "message": "Ship it?", "summary_path": "build.report" },
                "end": true
            }]
        }));
        let mut f = frame();
        f.seq = 4;
        let exec = executor(OperationRegistry::new());
        let out = exec
            .execute_state(&f, g.state("review").unwrap(), json!({}))
            .await;

        let approval = out.approval.unwrap();
        assert_eq!(approval.id, approval_id(&f.run_id, "review", 4));
        assert_eq!(approval.summary_path.as_deref(), Some("build.report"));
    }

    // -----------------------------------------------------------------------
    // parallel
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_parallel_merges_by_branch_name() {
        let g = graph(json!({
            "id": "w",
            "states": [{
                "id": "fan",
                "type": "parallel",
                "branches": [
                    { "name": "a", "states": [
                        { "id": "x", "type": "inject", "data": { "a": 1 }, "transition": "y" },
                        { "id": "y", "type": "transform", "expression": "a + base", "output": "sum", "end": true }
                    ] },
                    { "name": "b", "states": [
                        { "id": "x", "type": "transform", "expression": "a|fieldOr('unset')", "output": "saw_a", "end": true }
                    ] }
                ],
                "end": true
            }]
        }));
        let exec = executor(OperationRegistry::new());
        let out = run_state(&exec, &g, "fan", json!({ "base": 10 })).await;

        assert_eq!(out.next, NextStep::End);
        assert_eq!(out.context["fan"]["a"], json!({ "a": 1, "sum": 11 }));
        // Forked contexts: branch b never sees branch a's writes.
        assert_eq!(out.context["fan"]["b"], json!({ "saw_a": "unset" }));
        assert_eq!(out.context["base"], json!(10));

        let scopes: Vec<Option<&str>> = out.records.iter().map(|r| r.scope.as_deref()).collect();
        assert!(scopes.contains(&Some("fan/a")));
        assert!(scopes.contains(&Some("fan/b")));
        assert_eq!(out.records.last().unwrap().scope, None);
    }

    #[tokio::test]
    async fn test_parallel_fail_fast_fails_once() {
        let registry = OperationRegistry::new();
        registry.register("boom", Boom);
        registry.register("slow", Slow);
        let g = graph(json!({
            "id": "w",
            "states": [{
                "id": "fan",
                "type": "parallel",
                "branches": [
                    { "name": "ok", "states": [{ "id": "s", "type": "operation", "task": "slow", "input": { "ms": 50 }, "end": true }] },
                    { "name": "bad", "states": [{ "id": "b", "type": "operation", "task": "boom", "end": true }] }
                ],
                "end": true
            }]
        }));
        let out = run_state(&executor(registry), &g, "fan", json!({})).await;
        match &out.next {
            NextStep::Fail(message) => assert_eq!(message, "branch 'bad' failed: operation 'boom' failed: boom"),
            other => panic!("expected failure, got {other:?}"),
        }
        let parent_failures = out
            .records
            .iter()
            .filter(|r| r.scope.is_none() && r.status == StepStatus::Failed)
            .count();
        assert_eq!(parent_failures, 1);
    }

    #[tokio::test]
    async fn test_parallel_collect_partial() {
        let registry = OperationRegistry::new();
        registry.register("boom", Boom);
        let g = graph(json!({
            "id": "w",
            "states": [{
                "id": "fan",
                "type": "parallel",
                "failure_policy": "collect_partial",
                "branches": [
                    { "name": "ok", "states": [{ "id": "s", "type": "inject", "data": { "v": 1 }, "end": true }] },
                    { "name": "bad", "states": [{ "id": "b", "type": "operation", "task": "boom", "end": true }] }
                ],
                "result_path": "results",
                "end": true
            }]
        }));
        let out = run_state(&executor(registry), &g, "fan", json!({})).await;
        assert_eq!(out.next, NextStep::End);
        assert_eq!(out.context["results"]["ok"], json!({ "v": 1 }));
        assert!(out.context["results"]["bad"]["error"].as_str().unwrap().contains("boom"));
    }

    // -----------------------------------------------------------------------
    // foreach
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_foreach_preserves_input_order() {
        let registry = OperationRegistry::new();
        registry.register("slow", Slow);
        let g = graph(json!({
            "id": "w",
            "states": [{
                "id": "each",
                "type": "foreach",
                "items_path": "delays",
                "item_name": "d",
                "max_concurrency": 3,
                "iterator": { "states": [
                    { "id": "wait", "type": "operation", "task": "slow", "input": { "ms": "${ d }" }, "result_path": "r", "end": true }
                ] },
                "end": true
            }]
        }));
        let out = run_state(&executor(registry), &g, "each", json!({ "delays": [300, 100, 200, 10] })).await;

        assert_eq!(out.next, NextStep::End);
        let results = out.context["each"]["results"].as_array().unwrap();
        let slept: Vec<u64> = results.iter().map(|r| r["r"]["slept"].as_u64().unwrap()).collect();
        assert_eq!(slept, vec![300, 100, 200, 10]);
        assert_eq!(out.context["each"]["count"], json!(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreach_bounds_concurrency() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let registry = OperationRegistry::new();
        registry.register(
            "gauge",
            Gauge {
                current: Arc::clone(&current),
                peak: Arc::clone(&peak),
            },
        );
        let g = graph(json!({
            "id": "w",
            "states": [{
                "id": "each",
                "type": "foreach",
                "items_path": "items",
                "max_concurrency": 2,
                "iterator": { "states": [{ "id": "g", "type": "operation", "task": "gauge", "end": true }] },
                "end": true
            }]
        }));
        let out = run_state(&executor(registry), &g, "each", json!({ "items": [1, 2, 3, 4, 5, 6] })).await;
        assert_eq!(out.next, NextStep::End);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(out.context["each"]["count"], json!(6));
    }

    #[tokio::test]
    async fn test_foreach_bindings_and_empty_items() {
        let g = graph(json!({
            "id": "w",
            "states": [{
                "id": "each",
                "type": "foreach",
                "items_path": "lines",
                "item_name": "line",
                "max_concurrency": 0,
                "iterator": { "states": [
                    { "id": "price", "type": "transform", "expression": "line.qty * line.unit", "output": "price", "end": true }
                ] },
                "end": true
            }]
        }));
        let exec = executor(OperationRegistry::new());

        let out = run_state(
            &exec,
            &g,
            "each",
            json!({ "lines": [{ "qty": 2, "unit": 3 }, { "qty": 1, "unit": 5 }] }),
        )
        .await;
        assert_eq!(
            out.context["each"],
            json!({ "results": [{ "price": 6 }, { "price": 5 }], "count": 2 })
        );
        assert!(out.context.get("line").is_none());

        let out = run_state(&exec, &g, "each", json!({ "lines": [] })).await;
        assert_eq!(out.context["each"], json!({ "results": [], "count": 0 }));
        assert_eq!(out.records.len(), 1);

        let out = run_state(&exec, &g, "each", json!({})).await;
        assert_eq!(out.context["each"]["count"], json!(0));
    }

    #[tokio::test]
    async fn test_foreach_fail_fast_message() {
        let g = graph(json!({
            "id": "w",
            "states": [{
                "id": "each",
                "type": "foreach",
                "items_path": "items",
                "iterator": { "states": [
                    { "id": "check", "type": "transform", "expression": "item ==", "end": true }
                ] },
                "end": true
            }]
        }));
        let out = run_state(&executor(OperationRegistry::new()), &g, "each", json!({ "items": [1, 2] })).await;
        match out.next {
            NextStep::Fail(message) => assert!(message.starts_with("1 iteration(s) failed: evaluation error")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_foreach_fail_fast_starts_no_further_iterations() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = OperationRegistry::new();
        registry.register(
            "flaky",
            Flaky {
                failures_left: AtomicU32::new(u32::MAX),
                calls: Arc::clone(&calls),
            },
        );
        let g = graph(json!({
            "id": "w",
            "states": [{
                "id": "each",
                "type": "foreach",
                "items_path": "items",
                "max_concurrency": 1,
                "iterator": { "states": [
                    { "id": "call", "type": "operation", "task": "flaky", "end": true }
                ] },
                "end": true
            }]
        }));
        let out = run_state(&executor(registry), &g, "each", json!({ "items": [1, 2, 3, 4] })).await;
        match out.next {
            NextStep::Fail(message) => assert!(message.starts_with("1 iteration(s) failed: ")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_foreach_items_must_be_array() {
        let g = graph(json!({
            "id": "w",
            "states": [{
                "id": "each",
                "type": "foreach",
                "items_path": "items",
                "iterator": { "states": [{ "id": "i", "type": "inject", "data": {}, "end": true }] },
                "end": true
            }]
        }));
        let out = run_state(&executor(OperationRegistry::new()), &g, "each", json!({ "items": "nope" })).await;
        assert!(matches!(out.next, NextStep::Fail(ref m) if m.contains("expected array")));
    }
}
