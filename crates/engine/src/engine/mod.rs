//! Workflow execution engine.
//!
//! - **Router**: matches events to workflow triggers and starts executions
//! - **Context**: builds the execution context from the event and enrichment
//! - **Evaluator**: evaluates condition trees against the context
//! - **Executor**: walks the step graph, runs actions, parallel joins, retries
//! - **Resumer**: pause/resume state machine
//! - **Worker**: background resumption of decided pauses
//! - **Approvals**: records human decisions on approval gates

pub mod actions;
pub mod approvals;
pub mod context;
pub mod evaluator;
pub mod executor;
pub mod interpolate;
pub mod path;
pub mod resumer;
pub mod router;
pub mod worker;

pub use actions::{
    ActionExecutor, HttpClient, LogNotifier, Notifier, RecordService, ReqwestClient,
    UnconfiguredRecordService,
};
pub use approvals::{ApprovalService, DecisionOutcome};
pub use context::{
    ContextBuilder, ContextCache, MemoryCache, ResourceLoader, StaticResourceLoader,
    UnconfiguredResourceLoader,
};
pub use evaluator::ConditionEvaluator;
pub use executor::{ExecutionSummary, ResumePoint, WorkflowExecutor};
pub use resumer::{ResumeOutcome, WorkflowResumer};
pub use router::{matches_event, EventRouter, RouteReport};
pub use worker::{CycleReport, ResumeWorker};
