//! State graph compiler.
//!
//! `compile` turns an author-facing `WorkflowDefinition` into a `CompiledGraph`:
//! one `Scope` for the top level plus one per parallel branch and foreach
//! iterator. State ids are unique per scope, every transition target must
//! resolve inside the scope that declares it, and every problem is reported
//! with its location so authors can fix several at once.
//!
//! Cycles are allowed; a workflow may loop back to an earlier state on purpose.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use stepflow_types::workflow::{
    StateDefinition, StateKind, ValidationIssue, WorkflowDefinition, HUMAN_APPROVAL_TASK,
};

// ---------------------------------------------------------------------------
// Compiled representation
// ---------------------------------------------------------------------------

/// A validated workflow definition, ready for execution.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    pub workflow_id: String,
    pub version: i64,
    pub root: Arc<Scope>,
}

impl CompiledGraph {
    /// Look up a top-level state.
    pub fn state(&self, id: &str) -> Option<&Arc<CompiledState>> {
        self.root.state(id)
    }

    pub fn start(&self) -> &str {
        &self.root.start
    }
}

/// One independently validated set of states (top level, branch or iterator).
#[derive(Debug)]
pub struct Scope {
    /// Empty for the top level, else e.g. `fanout/a` or `each`.
    pub name: String,
    pub start: String,
    states: HashMap<String, Arc<CompiledState>>,
}

impl Scope {
    pub fn state(&self, id: &str) -> Option<&Arc<CompiledState>> {
        self.states.get(id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[derive(Debug)]
pub struct CompiledState {
    pub definition: StateDefinition,
    /// Parallel branches, in declaration order.
    pub branches: Vec<CompiledBranch>,
    /// Foreach iterator scope.
    pub iterator: Option<Arc<Scope>>,
}

impl CompiledState {
    pub fn id(&self) -> &str {
        &self.definition.id
    }
}

#[derive(Debug)]
pub struct CompiledBranch {
    pub name: String,
    pub scope: Arc<Scope>,
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// Validate and compile a definition.
///
/// Pure function: no I/O, no expression evaluation.
pub fn compile(def: &WorkflowDefinition) -> Result<CompiledGraph, Vec<ValidationIssue>> {
    let mut issues = Vec::new();

    if def.id.trim().is_empty() {
        issues.push(ValidationIssue::new(
            "MISSING_WORKFLOW_ID",
            "/id",
            "workflow id must not be empty",
        ));
    }

    let root = compile_scope(
        String::new(),
        def.start.as_deref(),
        &def.states,
        "",
        &[],
        &mut issues,
    );

    if issues.is_empty() {
        Ok(CompiledGraph {
            workflow_id: def.id.clone(),
            version: def.version,
            root: Arc::new(root),
        })
    } else {
        Err(issues)
    }
}

/// Compile one scope. `prefix` is the JSON-pointer of the scope's owner
/// (empty for the top level); `ancestors` holds the state ids of every
/// enclosing scope, used to diagnose cross-scope jumps.
fn compile_scope(
    name: String,
    start: Option<&str>,
    states: &[StateDefinition],
    prefix: &str,
    ancestors: &[HashSet<String>],
    issues: &mut Vec<ValidationIssue>,
) -> Scope {
    let states_path = format!("{prefix}/states");
    let nested = !ancestors.is_empty();

    if states.is_empty() {
        issues.push(ValidationIssue::new(
            "MISSING_STATES",
            states_path.clone(),
            "at least one state is required",
        ));
    }

    // Unique ids within this scope.
    let mut ids: HashSet<String> = HashSet::new();
    for (i, state) in states.iter().enumerate() {
        let path = format!("{states_path}/{i}/id");
        if state.id.trim().is_empty() {
            issues.push(ValidationIssue::new("MISSING_STATE_ID", path, "state id must not be empty"));
        } else if !ids.insert(state.id.clone()) {
            issues.push(ValidationIssue::new(
                "DUPLICATE_STATE_ID",
                path,
                format!("duplicate state id '{}'", state.id),
            ));
        }
    }

    let start = match start {
        Some(s) => {
            if !ids.contains(s) {
                let path = if prefix.is_empty() {
                    "/start".to_string()
                } else {
                    format!("{prefix}/start")
                };
                issues.push(ValidationIssue::new(
                    "INVALID_START",
                    path,
                    format!("start state '{s}' does not exist"),
                ));
            }
            s.to_string()
        }
        None => states.first().map(|s| s.id.clone()).unwrap_or_default(),
    };

    let mut child_ancestors: Vec<HashSet<String>> = ancestors.to_vec();
    child_ancestors.push(ids.clone());

    let mut compiled = HashMap::new();
    for (i, state) in states.iter().enumerate() {
        let state_path = format!("{states_path}/{i}");
        let resolver = TargetResolver {
            ids: &ids,
            ancestors,
        };

        check_transitions(state, &state_path, &resolver, issues);

        let mut branches = Vec::new();
        let mut iterator = None;

        match &state.kind {
            StateKind::Operation { task, .. } => {
                if task.trim().is_empty() {
                    issues.push(ValidationIssue::new(
                        "MISSING_TASK",
                        format!("{state_path}/task"),
                        format!("operation '{}' has no task", state.id),
                    ));
                } else if task == HUMAN_APPROVAL_TASK && nested {
                    issues.push(ValidationIssue::new(
                        "APPROVAL_IN_SUBGRAPH",
                        format!("{state_path}/task"),
                        format!(
                            "'{}' uses {HUMAN_APPROVAL_TASK} inside a parallel branch or foreach iterator",
                            state.id
                        ),
                    ));
                }
            }
            StateKind::Transform { expression, .. } => {
                if expression.trim().is_empty() {
                    issues.push(ValidationIssue::new(
                        "EMPTY_EXPRESSION",
                        format!("{state_path}/expression"),
                        format!("transform '{}' has an empty expression", state.id),
                    ));
                }
            }
            StateKind::Parallel { branches: defs, .. } => {
                if defs.is_empty() {
                    issues.push(ValidationIssue::new(
                        "MISSING_BRANCHES",
                        format!("{state_path}/branches"),
                        format!("parallel '{}' declares no branches", state.id),
                    ));
                }
                let mut names = HashSet::new();
                for (j, branch) in defs.iter().enumerate() {
                    let branch_path = format!("{state_path}/branches/{j}");
                    if branch.name.trim().is_empty() || !names.insert(branch.name.as_str()) {
                        issues.push(ValidationIssue::new(
                            "DUPLICATE_BRANCH_NAME",
                            format!("{branch_path}/name"),
                            format!("branch name '{}' is empty or not unique", branch.name),
                        ));
                    }
                    let scope = compile_scope(
                        scope_name(&name, &format!("{}/{}", state.id, branch.name)),
                        branch.start.as_deref(),
                        &branch.states,
                        &branch_path,
                        &child_ancestors,
                        issues,
                    );
                    branches.push(CompiledBranch {
                        name: branch.name.clone(),
                        scope: Arc::new(scope),
                    });
                }
            }
            StateKind::Foreach {
                items_path,
                iterator: sub,
                ..
            } => {
                if items_path.trim().is_empty() {
                    issues.push(ValidationIssue::new(
                        "MISSING_ITEMS_PATH",
                        format!("{state_path}/items_path"),
                        format!("foreach '{}' has no items_path", state.id),
                    ));
                }
                let scope = compile_scope(
                    scope_name(&name, &state.id),
                    sub.start.as_deref(),
                    &sub.states,
                    &format!("{state_path}/iterator"),
                    &child_ancestors,
                    issues,
                );
                iterator = Some(Arc::new(scope));
            }
            StateKind::Inject { .. } | StateKind::Switch { .. } => {}
        }

        compiled.insert(
            state.id.clone(),
            Arc::new(CompiledState {
                definition: state.clone(),
                branches,
                iterator,
            }),
        );
    }

    Scope {
        name,
        start,
        states: compiled,
    }
}

fn scope_name(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{parent}/{child}")
    }
}

struct TargetResolver<'a> {
    ids: &'a HashSet<String>,
    ancestors: &'a [HashSet<String>],
}

impl TargetResolver<'_> {
    fn check(&self, target: &str, path: String, owner: &str, issues: &mut Vec<ValidationIssue>) {
        if self.ids.contains(target) {
            return;
        }
        if self.ancestors.iter().any(|scope| scope.contains(target)) {
            issues.push(ValidationIssue::new(
                "CROSS_SCOPE_TRANSITION",
                path,
                format!("'{owner}' jumps to '{target}' outside its own scope"),
            ));
        } else {
            issues.push(ValidationIssue::new(
                "UNKNOWN_TRANSITION_TARGET",
                path,
                format!("'{owner}' references unknown state '{target}'"),
            ));
        }
    }
}

fn check_transitions(
    state: &StateDefinition,
    state_path: &str,
    resolver: &TargetResolver<'_>,
    issues: &mut Vec<ValidationIssue>,
) {
    if let StateKind::Switch {
        conditions,
        default,
        ..
    } = &state.kind
    {
        if state.transition.is_some() || state.end {
            issues.push(ValidationIssue::new(
                "SWITCH_WITH_TRANSITION",
                format!("{state_path}/transition"),
                format!("switch '{}' must route through conditions and default only", state.id),
            ));
        }
        for (k, cond) in conditions.iter().enumerate() {
            if cond.condition.trim().is_empty() {
                issues.push(ValidationIssue::new(
                    "EMPTY_CONDITION",
                    format!("{state_path}/conditions/{k}/if"),
                    format!("switch '{}' has an empty condition", state.id),
                ));
            }
            resolver.check(
                &cond.next,
                format!("{state_path}/conditions/{k}/next"),
                &state.id,
                issues,
            );
        }
        match default {
            Some(target) => {
                resolver.check(target, format!("{state_path}/default"), &state.id, issues)
            }
            None => issues.push(ValidationIssue::new(
                "MISSING_DEFAULT",
                format!("{state_path}/default"),
                format!("switch '{}' has no default target", state.id),
            )),
        }
        return;
    }

    match (&state.transition, state.end) {
        (Some(_), true) => issues.push(ValidationIssue::new(
            "TERMINAL_WITH_TRANSITION",
            format!("{state_path}/transition"),
            format!("'{}' is terminal and also declares a transition", state.id),
        )),
        (Some(target), false) => {
            resolver.check(target, format!("{state_path}/transition"), &state.id, issues)
        }
        (None, false) => issues.push(ValidationIssue::new(
            "MISSING_TRANSITION",
            format!("{state_path}/transition"),
            format!("'{}' needs a transition or end: true", state.id),
        )),
        (None, true) => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
