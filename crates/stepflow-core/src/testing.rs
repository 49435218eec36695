//! Test fixtures: an engine wired to the in-memory store.

use std::sync::Arc;

use serde_json::Value;
use stepflow_types::config::{ApprovalConfig, SchedulerConfig};
use stepflow_types::run::WorkflowRun;
use stepflow_types::workflow::WorkflowDefinition;
use tokio_util::sync::CancellationToken;

use crate::repository::memory::MemoryStore;
use crate::service::approval::ApprovalService;
use crate::service::definition::DefinitionService;
use crate::service::run::{CreateRunRequest, RunService};
use crate::workflow::cache::GraphCache;
use crate::workflow::executor::{ExecutorSettings, StepExecutor};
use crate::workflow::expression::ExpressionEvaluator;
use crate::workflow::operation::OperationRegistry;
use crate::workflow::scheduler::{InFlightRuns, RunScheduler};

pub(crate) fn definition(value: Value) -> WorkflowDefinition {
    serde_json::from_value(value).expect("valid definition json")
}

pub(crate) struct Harness {
    pub store: MemoryStore,
    pub registry: Arc<OperationRegistry>,
    pub executor: Arc<StepExecutor>,
    pub graphs: Arc<GraphCache>,
    pub in_flight: Arc<InFlightRuns>,
    pub scheduler: RunScheduler<MemoryStore, MemoryStore>,
    pub definitions: DefinitionService<MemoryStore>,
    pub runs: RunService<MemoryStore>,
    pub approvals: Arc<ApprovalService<MemoryStore, MemoryStore>>,
}

impl Harness {
    pub fn new() -> Self {
        let store = MemoryStore::new();
        let registry = Arc::new(OperationRegistry::new());
        let executor = Arc::new(StepExecutor::new(
            Arc::new(ExpressionEvaluator::new()),
            Arc::clone(&registry),
            ExecutorSettings::default(),
        ));
        let graphs = Arc::new(GraphCache::new());
        let in_flight = Arc::new(InFlightRuns::new());

        let scheduler = RunScheduler::new(
            store.clone(),
            store.clone(),
            Arc::clone(&executor),
            Arc::clone(&graphs),
            Arc::clone(&in_flight),
            SchedulerConfig::default(),
        );
        let approvals = Arc::new(ApprovalService::new(
            store.clone(),
            store.clone(),
            Arc::clone(&graphs),
            ApprovalConfig {
                sweep_interval_secs: 1,
                ..ApprovalConfig::default()
            },
        ));

        Self {
            definitions: DefinitionService::new(store.clone(), Arc::clone(&graphs)),
            runs: RunService::new(store.clone(), Arc::clone(&graphs), Arc::clone(&in_flight)),
            store,
            registry,
            executor,
            graphs,
            in_flight,
            scheduler,
            approvals,
        }
    }

    /// A second scheduler over the same store, stopped by `shutdown`.
    pub fn scheduler_with_shutdown(
        &self,
        shutdown: CancellationToken,
    ) -> RunScheduler<MemoryStore, MemoryStore> {
        self.scheduler_with_config(SchedulerConfig {
            workers: 2,
            poll_interval_ms: 5,
            ..SchedulerConfig::default()
        })
        .with_shutdown(shutdown)
    }

    /// A second scheduler over the same store with its own settings.
    pub fn scheduler_with_config(&self, config: SchedulerConfig) -> RunScheduler<MemoryStore, MemoryStore> {
        RunScheduler::new(
            self.store.clone(),
            self.store.clone(),
            Arc::clone(&self.executor),
            Arc::clone(&self.graphs),
            Arc::clone(&self.in_flight),
            config,
        )
    }

    pub async fn publish(&self, def: WorkflowDefinition) -> i64 {
        self.definitions.publish(def).await.expect("publish").version
    }

    pub async fn start(&self, workflow_id: &str, input: Value) -> WorkflowRun {
        self.runs
            .create_run(CreateRunRequest {
                workflow_id: workflow_id.to_string(),
                version: None,
                input: Some(input),
            })
            .await
            .expect("create run")
    }
}
