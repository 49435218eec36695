//! Compiled-graph cache keyed by `(workflow id, version)`.
//!
//! Definitions are immutable once published, so a compiled version never
//! goes stale.

use std::sync::Arc;

use dashmap::DashMap;
use stepflow_types::error::EngineError;

use super::graph::{compile, CompiledGraph};
use crate::repository::workflow::WorkflowRepository;

#[derive(Default)]
pub struct GraphCache {
    graphs: DashMap<(String, i64), Arc<CompiledGraph>>,
}

impl GraphCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the compiled graph for a stored version, compiling on first use.
    pub async fn load<W: WorkflowRepository>(
        &self,
        repo: &W,
        workflow_id: &str,
        version: i64,
    ) -> Result<Arc<CompiledGraph>, EngineError> {
        let key = (workflow_id.to_string(), version);
        if let Some(graph) = self.graphs.get(&key) {
            return Ok(Arc::clone(graph.value()));
        }

        let def = repo
            .get_definition(workflow_id, Some(version))
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("workflow '{workflow_id}' version {version}"))
            })?;
        let graph = Arc::new(compile(&def).map_err(EngineError::Validation)?);
        self.graphs.insert(key, Arc::clone(&graph));
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }
}
