//! Application state for the Storeflow engine server.
//!
//! Wires the engine components over a pair of stores and hands them to the
//! Axum handlers.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::engine::{
    ActionExecutor, ApprovalService, ContextBuilder, EventRouter, HttpClient, LogNotifier,
    MemoryCache, Notifier, RecordService, ReqwestClient, ResourceLoader, ResumeWorker,
    UnconfiguredRecordService, UnconfiguredResourceLoader, WorkflowExecutor, WorkflowResumer,
};
use crate::store::{ApprovalStore, ExecutionStore, MemoryStore, WorkflowStore};

/// External collaborators of the engine.
#[derive(Clone)]
pub struct Collaborators {
    pub resources: Arc<dyn ResourceLoader>,
    pub notifier: Arc<dyn Notifier>,
    pub http: Arc<dyn HttpClient>,
    pub records: Arc<dyn RecordService>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            resources: Arc::new(UnconfiguredResourceLoader),
            notifier: Arc::new(LogNotifier),
            http: Arc::new(ReqwestClient::new()),
            records: Arc::new(UnconfiguredRecordService),
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool, when the Postgres backend is selected
    pub db: Option<DbPool>,

    /// Application configuration
    pub config: Arc<AppConfig>,

    pub executions: Arc<dyn ExecutionStore>,
    pub approval_store: Arc<dyn ApprovalStore>,
    pub workflows: Arc<dyn WorkflowStore>,

    pub executor: WorkflowExecutor,
    pub resumer: WorkflowResumer,
    pub router: EventRouter,
    pub approvals: ApprovalService,

    /// Server start time for uptime calculation
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        db: Option<DbPool>,
        executions: Arc<dyn ExecutionStore>,
        approval_store: Arc<dyn ApprovalStore>,
        workflows: Arc<dyn WorkflowStore>,
        collaborators: Collaborators,
    ) -> Self {
        let engine_config = config.engine_config();

        let context_builder = ContextBuilder::new(
            collaborators.resources,
            Arc::new(MemoryCache::new(engine_config.cache_ttl)),
        );
        let actions = ActionExecutor::new(
            collaborators.notifier,
            collaborators.http,
            collaborators.records,
            engine_config.http_timeout,
        );
        let executor = WorkflowExecutor::new(
            executions.clone(),
            approval_store.clone(),
            context_builder,
            actions,
            engine_config.clone(),
        );
        let resumer = WorkflowResumer::new(
            executions.clone(),
            workflows.clone(),
            executor.clone(),
            engine_config.clone(),
        );
        let router = EventRouter::new(
            workflows.clone(),
            executor.clone(),
            resumer.clone(),
            engine_config.resume_batch_size,
        );
        let approvals =
            ApprovalService::new(approval_store.clone(), executions.clone(), resumer.clone());

        Self {
            db,
            config: Arc::new(config),
            executions,
            approval_store,
            workflows,
            executor,
            resumer,
            router,
            approvals,
            start_time: std::time::Instant::now(),
        }
    }

    /// State over a fresh in-memory store.
    pub fn in_memory(
        config: AppConfig,
        workflows: Arc<dyn WorkflowStore>,
        collaborators: Collaborators,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::new(config, None, store.clone(), store, workflows, collaborators)
    }

    /// Background worker over the same stores and resumer.
    pub fn resume_worker(&self) -> ResumeWorker {
        ResumeWorker::new(
            self.executions.clone(),
            self.resumer.clone(),
            self.config.engine_config(),
        )
    }

    /// Get the server uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
