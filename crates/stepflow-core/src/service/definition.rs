//! Workflow definition service.
//!
//! Publishing compiles the definition first; only definitions that compile
//! cleanly are stored. Stored versions are immutable.

use std::sync::Arc;

use stepflow_types::error::EngineError;
use stepflow_types::workflow::{ValidationIssue, WorkflowDefinition, WorkflowSummary};

use crate::repository::workflow::WorkflowRepository;
use crate::service::not_found_or;
use crate::workflow::cache::GraphCache;
use crate::workflow::graph::compile;

/// Parse a definition from JSON or YAML text.
///
/// Text starting with `{` is read as JSON, everything else as YAML.
pub fn parse_definition(text: &str) -> Result<WorkflowDefinition, EngineError> {
    let parsed = if text.trim_start().starts_with('{') {
        serde_json::from_str(text).map_err(|e| e.to_string())
    } else {
        serde_yaml_ng::from_str(text).map_err(|e| e.to_string())
    };
    parsed.map_err(|e| EngineError::validation("PARSE_ERROR", "/", e))
}

pub struct DefinitionService<W: WorkflowRepository> {
    repo: W,
    graphs: Arc<GraphCache>,
}

impl<W: WorkflowRepository> DefinitionService<W> {
    pub fn new(repo: W, graphs: Arc<GraphCache>) -> Self {
        Self { repo, graphs }
    }

    /// Compile without storing. An empty list means the definition is valid.
    pub fn validate(&self, def: &WorkflowDefinition) -> Vec<ValidationIssue> {
        compile(def).err().unwrap_or_default()
    }

    /// Compile and store a new version. Returns the stored definition.
    pub async fn publish(&self, def: WorkflowDefinition) -> Result<WorkflowDefinition, EngineError> {
        compile(&def).map_err(EngineError::Validation)?;

        let version = self.repo.save_definition(&def).await?;
        let mut stored = def;
        stored.version = version;

        // Warm the cache for the first run.
        self.graphs.load(&self.repo, &stored.id, version).await?;

        tracing::info!(
            workflow_id = stored.id.as_str(),
            version,
            states = stored.states.len(),
            "published workflow"
        );
        Ok(stored)
    }

    pub async fn get(&self, id: &str, version: Option<i64>) -> Result<WorkflowDefinition, EngineError> {
        let describe = || match version {
            Some(v) => format!("workflow '{id}' version {v}"),
            None => format!("workflow '{id}'"),
        };
        self.repo
            .get_definition(id, version)
            .await
            .map_err(|e| not_found_or(describe, e))?
            .ok_or_else(|| EngineError::NotFound(describe()))
    }

    pub async fn list(&self) -> Result<Vec<WorkflowSummary>, EngineError> {
        Ok(self.repo.list_definitions().await?)
    }
}
