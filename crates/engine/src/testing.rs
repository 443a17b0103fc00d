//! Shared fixtures for unit tests: a fully wired engine over memory stores.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::db::models::{
    Event, ExecutionPatch, ExecutionStatus, StepExecution, WorkflowExecution,
};
use crate::engine::actions::tests::{RecordingNotifier, ScriptedHttp};
use crate::engine::actions::{ActionExecutor, UnconfiguredRecordService};
use crate::engine::approvals::ApprovalService;
use crate::engine::context::{ContextBuilder, MemoryCache, ResourceLoader, StaticResourceLoader};
use crate::engine::executor::{ExecutionSummary, WorkflowExecutor};
use crate::engine::resumer::WorkflowResumer;
use crate::engine::router::EventRouter;
use crate::engine::worker::ResumeWorker;
use crate::store::{ExecutionStore, MemoryStore, MemoryWorkflowStore, WorkflowStore};
use crate::workflow::{validate_workflow, Workflow};

/// Parse and validate a workflow fixture.
pub(crate) fn fixture(value: Value) -> Workflow {
    let workflow: Workflow = serde_json::from_value(value).unwrap();
    validate_workflow(&workflow).unwrap();
    workflow
}

pub(crate) struct Harness {
    pub store: Arc<MemoryStore>,
    pub workflows: Arc<MemoryWorkflowStore>,
    pub executor: WorkflowExecutor,
    pub resumer: WorkflowResumer,
    pub router: EventRouter,
    pub approvals: ApprovalService,
    pub notifier: Arc<RecordingNotifier>,
    pub http: Arc<ScriptedHttp>,
    pub config: EngineConfig,
}

impl Harness {
    pub fn new(workflows: Vec<Workflow>) -> Self {
        Self::with_config(workflows, EngineConfig::default())
    }

    pub fn with_config(workflows: Vec<Workflow>, config: EngineConfig) -> Self {
        Self::with_loader(workflows, config, Arc::new(StaticResourceLoader::new()))
    }

    pub fn with_loader(
        workflows: Vec<Workflow>,
        config: EngineConfig,
        loader: Arc<dyn ResourceLoader>,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let workflows = Arc::new(MemoryWorkflowStore::new(workflows).unwrap());
        let notifier = Arc::new(RecordingNotifier::default());
        let http = Arc::new(ScriptedHttp::default());

        let context_builder =
            ContextBuilder::new(loader, Arc::new(MemoryCache::new(config.cache_ttl)));
        let actions = ActionExecutor::new(
            notifier.clone(),
            http.clone(),
            Arc::new(UnconfiguredRecordService),
            config.http_timeout,
        );
        let executor = WorkflowExecutor::new(
            store.clone(),
            store.clone(),
            context_builder,
            actions,
            config.clone(),
        );
        let resumer = WorkflowResumer::new(
            store.clone(),
            workflows.clone(),
            executor.clone(),
            config.clone(),
        );
        let router = EventRouter::new(
            workflows.clone(),
            executor.clone(),
            resumer.clone(),
            config.resume_batch_size,
        );
        let approvals = ApprovalService::new(store.clone(), store.clone(), resumer.clone());

        Self {
            store,
            workflows,
            executor,
            resumer,
            router,
            approvals,
            notifier,
            http,
            config,
        }
    }

    pub fn worker(&self) -> ResumeWorker {
        ResumeWorker::new(self.store.clone(), self.resumer.clone(), self.config.clone())
    }

    async fn workflow(&self, workflow_id: &str) -> Arc<Workflow> {
        self.workflows.get(workflow_id).await.unwrap().unwrap()
    }

    /// Create and run an execution to the end of its first segment.
    pub async fn run(&self, workflow_id: &str, payload: Value) -> ExecutionSummary {
        let workflow = self.workflow(workflow_id).await;
        let event_type = workflow.trigger.event_pattern().unwrap_or("manual").to_string();
        let event = Event::new(event_type, payload);
        let exec = self.executor.create_execution(&workflow, &event).await.unwrap();
        self.executor.run(exec.id, workflow, event).await.unwrap()
    }

    /// A stored execution moved to `running` without executing any step.
    pub async fn store_running_execution(&self, workflow_id: &str) -> WorkflowExecution {
        let workflow = self.workflow(workflow_id).await;
        let event = Event::new("manual", Value::Null);
        let exec = self.executor.create_execution(&workflow, &event).await.unwrap();
        self.store
            .transition(
                exec.id,
                &[ExecutionStatus::Pending],
                ExecutionStatus::Running,
                ExecutionPatch::default(),
            )
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn execution(&self, id: Uuid) -> WorkflowExecution {
        self.store.get_execution(id).await.unwrap().unwrap()
    }

    pub async fn steps(&self, id: Uuid) -> Vec<StepExecution> {
        self.store.list_step_executions(id).await.unwrap()
    }

    /// Poll until a background execution stops running.
    pub async fn wait_for_terminal(&self, id: Uuid) -> WorkflowExecution {
        for _ in 0..200 {
            let exec = self.execution(id).await;
            if exec.status.is_terminal() || exec.status == ExecutionStatus::Paused {
                return exec;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution {id} did not settle");
    }
}
