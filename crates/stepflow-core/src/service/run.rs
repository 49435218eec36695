//! Run control service: create, inspect, list, cancel, pause and resume runs.
//!
//! All status changes go through guarded repository transitions, so a
//! request that races the scheduler either applies cleanly or reports a
//! conflict.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stepflow_types::error::EngineError;
use stepflow_types::run::{RunFilter, RunStatus, StepRecord, WorkItem, WorkflowRun};
use stepflow_types::workflow::ValidationIssue;
use uuid::Uuid;

use crate::repository::workflow::{RunTransition, WorkflowRepository};
use crate::service::not_found_or;
use crate::workflow::cache::GraphCache;
use crate::workflow::scheduler::InFlightRuns;

/// Request body for creating a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRunRequest {
    pub workflow_id: String,
    /// Latest version when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// A run together with its step history.
#[derive(Debug, Clone, Serialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: WorkflowRun,
    pub steps: Vec<StepRecord>,
}

pub struct RunService<W: WorkflowRepository> {
    repo: W,
    graphs: Arc<GraphCache>,
    in_flight: Arc<InFlightRuns>,
}

impl<W: WorkflowRepository> RunService<W> {
    pub fn new(repo: W, graphs: Arc<GraphCache>, in_flight: Arc<InFlightRuns>) -> Self {
        Self {
            repo,
            graphs,
            in_flight,
        }
    }

    /// Create a pending run and enqueue its start state.
    pub async fn create_run(&self, request: CreateRunRequest) -> Result<WorkflowRun, EngineError> {
        let def = self
            .repo
            .get_definition(&request.workflow_id, request.version)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow '{}'", request.workflow_id)))?;
        let graph = self.graphs.load(&self.repo, &def.id, def.version).await?;

        let input = match request.input {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(Value::Object(map)) => Value::Object(map),
            Some(_) => {
                return Err(EngineError::validation(
                    "INVALID_INPUT",
                    "/input",
                    "run input must be a JSON object",
                ));
            }
        };
        if let Some(schema) = &def.input_schema {
            let issues = validate_input(schema, &input);
            if !issues.is_empty() {
                return Err(EngineError::Validation(issues));
            }
        }

        let run = WorkflowRun::new(def.id.as_str(), def.version, graph.start(), input);
        let first = WorkItem::new(run.id, graph.start(), run.step_seq);
        self.repo.create_run(&run, &first).await?;

        tracing::info!(
            run_id = %run.id,
            workflow_id = run.workflow_id.as_str(),
            version = run.workflow_version,
            "run created"
        );
        Ok(run)
    }

    pub async fn get_run(&self, run_id: &Uuid) -> Result<RunDetail, EngineError> {
        let run = self
            .repo
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))?;
        let steps = self.repo.list_step_records(run_id).await?;
        Ok(RunDetail { run, steps })
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, EngineError> {
        Ok(self.repo.list_runs(filter).await?)
    }

    /// Cancel a non-terminal run. A step already executing is signalled; its
    /// result is discarded.
    pub async fn cancel_run(&self, run_id: &Uuid, reason: Option<String>) -> Result<WorkflowRun, EngineError> {
        let run = self
            .transition(RunTransition {
                run_id: *run_id,
                from: vec![
                    RunStatus::Pending,
                    RunStatus::Running,
                    RunStatus::WaitingApproval,
                    RunStatus::Paused,
                ],
                to: RunStatus::Cancelled,
                error: Some(reason.unwrap_or_else(|| "cancelled by operator".to_string())),
                enqueue: None,
            })
            .await?;

        let signalled = self.in_flight.cancel(run_id);
        tracing::info!(run_id = %run_id, signalled, "run cancelled");
        Ok(run)
    }

    /// Pause a pending or running run at the next step boundary.
    pub async fn pause_run(&self, run_id: &Uuid) -> Result<WorkflowRun, EngineError> {
        let run = self
            .transition(RunTransition {
                run_id: *run_id,
                from: vec![RunStatus::Pending, RunStatus::Running],
                to: RunStatus::Paused,
                error: None,
                enqueue: None,
            })
            .await?;
        tracing::info!(run_id = %run_id, "run paused");
        Ok(run)
    }

    /// Resume a paused run from its current state.
    pub async fn resume_run(&self, run_id: &Uuid) -> Result<WorkflowRun, EngineError> {
        let current = self.get_run(run_id).await?.run;
        if current.status != RunStatus::Paused {
            return Err(EngineError::Conflict(format!(
                "run {run_id} is {}, only paused runs can be resumed",
                current.status
            )));
        }
        let state_id = current
            .current_state_id
            .clone()
            .ok_or_else(|| EngineError::Conflict(format!("run {run_id} has no current state")))?;

        let run = self
            .transition(RunTransition {
                run_id: *run_id,
                from: vec![RunStatus::Paused],
                to: RunStatus::Running,
                error: None,
                enqueue: Some(WorkItem::new(*run_id, state_id, current.step_seq)),
            })
            .await?;
        tracing::info!(run_id = %run_id, "run resumed");
        Ok(run)
    }

    async fn transition(&self, transition: RunTransition) -> Result<WorkflowRun, EngineError> {
        let run_id = transition.run_id;
        self.repo
            .transition_run(&transition)
            .await
            .map_err(|e| not_found_or(|| format!("run {run_id}"), e))
    }
}

// ---------------------------------------------------------------------------
// Input schema
// ---------------------------------------------------------------------------

/// Check `input` against the `required` list and primitive
/// `properties.*.type` declarations of a JSON-schema-like object.
pub fn validate_input(schema: &Value, input: &Value) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if input.get(field).is_none_or(Value::is_null) {
                issues.push(ValidationIssue::new(
                    "MISSING_FIELD",
                    format!("/input/{field}"),
                    format!("required field '{field}' is missing"),
                ));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (field, spec) in properties {
            let Some(expected) = spec.get("type").and_then(Value::as_str) else {
                continue;
            };
            let Some(value) = input.get(field).filter(|v| !v.is_null()) else {
                continue;
            };
            let matches = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !matches {
                issues.push(ValidationIssue::new(
                    "TYPE_MISMATCH",
                    format!("/input/{field}"),
                    format!("field '{field}' must be of type {expected}"),
                ));
            }
        }
    }

    issues
}
