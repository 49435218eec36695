//! Application state wiring all services together.
//!
//! AppState holds the concrete service instances used by both CLI and REST API.
//! Services are generic over the repository and queue traits, but AppState
//! pins them to the SQLite implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use stepflow_core::service::approval::ApprovalService;
use stepflow_core::service::definition::DefinitionService;
use stepflow_core::service::run::RunService;
use stepflow_core::workflow::cache::GraphCache;
use stepflow_core::workflow::executor::{ExecutorSettings, StepExecutor};
use stepflow_core::workflow::expression::ExpressionEvaluator;
use stepflow_core::workflow::notifier::BoxApprovalNotifier;
use stepflow_core::workflow::operation::OperationRegistry;
use stepflow_core::workflow::scheduler::{InFlightRuns, RunScheduler};
use stepflow_infra::config::load_engine_config;
use stepflow_infra::notifier::WebhookNotifier;
use stepflow_infra::sqlite::approval::SqliteApprovalRepository;
use stepflow_infra::sqlite::pool::{database_url, DatabasePool};
use stepflow_infra::sqlite::queue::SqliteWorkQueue;
use stepflow_infra::sqlite::workflow::SqliteWorkflowRepository;
use stepflow_infra::workflow::http::{HttpOperation, HTTP_TASK};
use stepflow_types::config::EngineConfig;
use tokio_util::sync::CancellationToken;

/// Concrete type aliases for the service generics pinned to infra implementations.
pub type ConcreteDefinitionService = DefinitionService<SqliteWorkflowRepository>;

pub type ConcreteRunService = RunService<SqliteWorkflowRepository>;

pub type ConcreteApprovalService =
    ApprovalService<SqliteWorkflowRepository, SqliteApprovalRepository>;

pub type ConcreteScheduler = RunScheduler<SqliteWorkflowRepository, SqliteWorkQueue>;

/// Environment variable holding the REST API key. Auth is off when unset.
pub const API_KEY_ENV: &str = "STEPFLOW_API_KEY";

/// Shared application state holding all services.
///
/// Used by both CLI commands and REST API handlers.
#[derive(Clone)]
pub struct AppState {
    pub definitions: Arc<ConcreteDefinitionService>,
    pub runs: Arc<ConcreteRunService>,
    pub approvals: Arc<ConcreteApprovalService>,
    pub scheduler: Arc<ConcreteScheduler>,
    pub operations: Arc<OperationRegistry>,
    pub config: Arc<EngineConfig>,
    pub data_dir: PathBuf,
    pub db_pool: DatabasePool,
    /// Expected API key. `None` disables authentication.
    pub api_key: Option<Arc<str>>,
    /// Cancelled on shutdown; stops workers, the sweeper and in-flight steps.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Initialize the application state: connect to DB, load config, wire services.
    pub async fn init(data_dir: PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;
        let db_pool = DatabasePool::new(&database_url(&data_dir)).await?;
        let api_key = std::env::var(API_KEY_ENV)
            .ok()
            .filter(|key| !key.trim().is_empty());

        let state = Self::build(db_pool, config, &data_dir, api_key)?;

        tracing::info!(
            data_dir = %data_dir.display(),
            auth = state.api_key.is_some(),
            notifier = state.config.notifier.enabled,
            "application state initialized"
        );

        Ok(state)
    }

    /// Wire services over an already-open pool.
    pub fn build(
        db_pool: DatabasePool,
        config: EngineConfig,
        data_dir: &Path,
        api_key: Option<String>,
    ) -> anyhow::Result<Self> {
        let workflows = SqliteWorkflowRepository::new(db_pool.clone());
        let approvals = SqliteApprovalRepository::new(db_pool.clone());
        let queue = SqliteWorkQueue::new(db_pool.clone());

        let graphs = Arc::new(GraphCache::new());
        let in_flight = Arc::new(InFlightRuns::new());
        let shutdown = CancellationToken::new();

        let operations = Arc::new(OperationRegistry::new());
        operations.register(HTTP_TASK, HttpOperation::new()?);

        let evaluator = Arc::new(ExpressionEvaluator::with_limits(config.expressions));
        let executor = Arc::new(StepExecutor::new(
            evaluator,
            Arc::clone(&operations),
            ExecutorSettings {
                default_operation_timeout: Duration::from_secs(
                    config.scheduler.default_operation_timeout_secs,
                ),
                default_approval_timeout: Duration::from_secs(config.approvals.default_timeout_secs),
            },
        ));

        let mut scheduler = RunScheduler::new(
            workflows.clone(),
            queue,
            executor,
            Arc::clone(&graphs),
            Arc::clone(&in_flight),
            config.scheduler.clone(),
        )
        .with_shutdown(shutdown.clone());

        if config.notifier.enabled {
            let notifier = WebhookNotifier::new(config.notifier.clone(), approvals.clone())?;
            scheduler = scheduler.with_notifier(
                Arc::new(BoxApprovalNotifier::new(notifier)),
                config.approvals.public_base_url.clone(),
            );
        }

        let definitions = DefinitionService::new(workflows.clone(), Arc::clone(&graphs));
        let runs = RunService::new(workflows.clone(), Arc::clone(&graphs), in_flight);
        let approval_service = ApprovalService::new(
            workflows,
            approvals,
            graphs,
            config.approvals.clone(),
        );

        Ok(Self {
            definitions: Arc::new(definitions),
            runs: Arc::new(runs),
            approvals: Arc::new(approval_service),
            scheduler: Arc::new(scheduler),
            operations,
            config: Arc::new(config),
            data_dir: data_dir.to_path_buf(),
            db_pool,
            api_key: api_key.map(Arc::from),
            shutdown,
        })
    }
}
