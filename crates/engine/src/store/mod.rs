//! Persistence boundary of the engine.
//!
//! The engine is the only writer of execution state. Every status change
//! goes through [`ExecutionStore::transition`], a conditional update keyed
//! on the expected current statuses, so concurrent resume triggers race on
//! the store and exactly one wins.

pub mod memory;
pub mod postgres;
pub mod workflows;

use async_trait::async_trait;
use uuid::Uuid;

use crate::db::models::{
    ApprovalDecision, ApprovalRequest, ExecutionPatch, ExecutionStatus, PauseReason,
    StepExecution, WorkflowExecution,
};
use crate::error::{AppError, AppResult};

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use workflows::{MemoryWorkflowStore, WorkflowStore};

/// Execution and step execution persistence.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_execution(&self, exec: &WorkflowExecution) -> AppResult<()>;

    async fn get_execution(&self, id: Uuid) -> AppResult<Option<WorkflowExecution>>;

    /// Move an execution to `to` if its current status is one of `from`,
    /// applying `patch` in the same write.
    ///
    /// Returns `Ok(None)` when the guard did not match (missing record or
    /// a concurrent writer got there first).
    async fn transition(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        patch: ExecutionPatch,
    ) -> AppResult<Option<WorkflowExecution>>;

    /// Persist the context of a live execution.
    async fn save_context(&self, id: Uuid, context: &serde_json::Value) -> AppResult<bool>;

    /// Paused executions, oldest pause first.
    async fn get_paused_executions(&self, limit: i64) -> AppResult<Vec<WorkflowExecution>>;

    async fn get_paused_by_reason(
        &self,
        reason: PauseReason,
        limit: i64,
    ) -> AppResult<Vec<WorkflowExecution>>;

    /// Merge a resume payload into a paused execution. `false` if not paused.
    async fn set_resume_data(&self, id: Uuid, data: &serde_json::Value) -> AppResult<bool>;

    /// Replace the continuation step of a paused execution. `false` if not paused.
    async fn set_pause_continuation(&self, id: Uuid, next_step_id: Option<&str>)
        -> AppResult<bool>;

    async fn create_step_execution(&self, step: &StepExecution) -> AppResult<()>;

    async fn update_step_execution(&self, step: &StepExecution) -> AppResult<()>;

    async fn list_step_executions(&self, execution_id: Uuid) -> AppResult<Vec<StepExecution>>;
}

/// Approval request persistence.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn create_approval(&self, request: &ApprovalRequest) -> AppResult<()>;

    async fn get_approval(&self, id: Uuid) -> AppResult<Option<ApprovalRequest>>;

    async fn get_approvals_by_execution(&self, execution_id: Uuid)
        -> AppResult<Vec<ApprovalRequest>>;

    /// Decide a pending request. `None` if it is no longer pending.
    async fn record_decision(
        &self,
        id: Uuid,
        decision: &ApprovalDecision,
    ) -> AppResult<Option<ApprovalRequest>>;
}

/// Fetch an execution or fail with `NotFound`.
pub async fn require_execution(
    store: &dyn ExecutionStore,
    id: Uuid,
) -> AppResult<WorkflowExecution> {
    store
        .get_execution(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Execution {} not found", id)))
}

/// Reject guards the state machine never allows.
pub(crate) fn check_transition(
    from: &[ExecutionStatus],
    to: ExecutionStatus,
    patch: &ExecutionPatch,
) -> AppResult<()> {
    if let Some(bad) = from.iter().find(|f| !f.can_transition_to(to)) {
        return Err(AppError::InvalidTransition {
            from: bad.to_string(),
            to: to.to_string(),
        });
    }
    if to == ExecutionStatus::Paused && patch.pause.is_none() {
        return Err(AppError::Internal(
            "transition to paused requires pause information".to_string(),
        ));
    }
    Ok(())
}
