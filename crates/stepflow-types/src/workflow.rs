//! Workflow definition types.
//!
//! `WorkflowDefinition` is the author-facing declaration of a state graph. It is
//! deserialized from JSON or YAML, compiled and validated by
//! `stepflow_core::workflow::graph::compile`, and stored immutably per version.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Task identifier routed to the approval subsystem instead of an operation handler.
pub const HUMAN_APPROVAL_TASK: &str = "human.approval";

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A versioned workflow declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable identifier shared by every version of this workflow.
    pub id: String,
    /// Monotonic version number, assigned by the store on publish.
    #[serde(default)]
    pub version: i64,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Entry state id. Defaults to the first declared state.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "start_state_id")]
    pub start: Option<String>,
    /// Ordered top-level states.
    #[serde(default)]
    pub states: Vec<StateDefinition>,
    /// Optional JSON-schema subset checked against run input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    /// Optional output schema (informational).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowDefinition {
    /// The entry state id: explicit `start`, else the first state.
    pub fn start_state_id(&self) -> Option<&str> {
        self.start
            .as_deref()
            .or_else(|| self.states.first().map(|s| s.id.as_str()))
    }
}

/// Summary row for definition listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub version: i64,
    pub name: String,
    pub states: usize,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// One node of the state graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDefinition {
    /// Unique within its scope (top level, or one parallel branch / foreach iterator).
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Kind-specific configuration, tagged by `type`.
    #[serde(flatten)]
    pub kind: StateKind,
    /// Next state id for non-switch states.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,
    /// Terminal marker. A state cannot be terminal and declare a transition.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub end: bool,
    /// Dotted context path receiving the state's output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
}

impl StateDefinition {
    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }

    /// True for `operation` states whose task is `human.approval`.
    pub fn is_human_approval(&self) -> bool {
        matches!(&self.kind, StateKind::Operation { task, .. } if task == HUMAN_APPROVAL_TASK)
    }
}

/// State kind, internally tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateKind {
    /// Delegates to a registered operation handler (or the approval subsystem).
    Operation {
        task: String,
        #[serde(default)]
        input: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry: Option<RetryConfig>,
    },
    /// Merges literal or computed values into the context.
    Inject {
        #[serde(default)]
        data: Map<String, Value>,
    },
    /// Ordered conditions; first true wins, otherwise `default`.
    Switch {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data_path: Option<String>,
        #[serde(default)]
        conditions: Vec<SwitchCondition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    /// Evaluates one expression and stores the result at `output`.
    Transform {
        expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    /// Named branches executed concurrently over forked contexts.
    Parallel {
        #[serde(default)]
        branches: Vec<ParallelBranch>,
        #[serde(default)]
        failure_policy: FailurePolicy,
    },
    /// Runs the iterator sub-graph once per item with bounded concurrency.
    Foreach {
        items_path: String,
        #[serde(default = "default_item_name")]
        item_name: String,
        #[serde(default = "default_max_concurrency")]
        max_concurrency: i64,
        iterator: SubGraph,
        #[serde(default)]
        failure_policy: FailurePolicy,
    },
}

impl StateKind {
    pub fn name(&self) -> &'static str {
        match self {
            StateKind::Operation { .. } => "operation",
            StateKind::Inject { .. } => "inject",
            StateKind::Switch { .. } => "switch",
            StateKind::Transform { .. } => "transform",
            StateKind::Parallel { .. } => "parallel",
            StateKind::Foreach { .. } => "foreach",
        }
    }
}

fn default_item_name() -> String {
    "item".to_string()
}

fn default_max_concurrency() -> i64 {
    1
}

/// One `(condition, target)` pair of a switch state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchCondition {
    #[serde(rename = "if", alias = "condition")]
    pub condition: String,
    #[serde(alias = "target")]
    pub next: String,
}

/// A named branch of a parallel state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelBranch {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default)]
    pub states: Vec<StateDefinition>,
}

/// An embedded sub-graph (foreach iterator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubGraph {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default)]
    pub states: Vec<StateDefinition>,
}

/// How a composite state reacts to a failing branch or iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// First child failure fails the composite state.
    #[default]
    FailFast,
    /// Failed children contribute an `{error}` entry and the composite succeeds.
    CollectPartial,
}

// ---------------------------------------------------------------------------
// Retry Configuration
// ---------------------------------------------------------------------------

/// Retry policy for operation states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation issues
// ---------------------------------------------------------------------------

/// A single compile-time problem, located by a JSON-pointer-like path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Machine-readable code (e.g. `UNKNOWN_TRANSITION_TARGET`).
    pub code: String,
    /// Location, e.g. `/states/2/branches/0/states/1/transition`.
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(code: &str, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.path, self.message, self.code)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
