//! PostgreSQL store.
//!
//! Composes the query functions in `db::queries`. Transient failures
//! (connection loss, pool exhaustion, serialization conflicts) are retried
//! here with exponential backoff; the engine above never sees them unless
//! every attempt fails.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::db::models::{
    ApprovalDecision, ApprovalRequest, ExecutionPatch, ExecutionStatus, PauseReason,
    StepExecution, WorkflowExecution,
};
use crate::db::queries::{approval, execution, step};
use crate::db::DbPool;
use crate::error::{AppError, AppResult};
use crate::store::{check_transition, ApprovalStore, ExecutionStore};

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
    max_attempts: u32,
    base_delay: Duration,
}

impl PgStore {
    /// Store over `pool`, retrying transient errors per `config`.
    pub fn new(pool: DbPool, config: &DatabaseConfig) -> Self {
        let (max_attempts, base_delay) = config.store_retry();
        Self {
            pool,
            max_attempts,
            base_delay,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut f: F) -> AppResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = AppResult<T>> + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Err(AppError::Database(ref e)) if attempt < self.max_attempts && is_transient(e) => {
                    let delay = self.base_delay * 2u32.pow(attempt - 1);
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient database error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Errors worth retrying: the statement may succeed on a fresh attempt.
fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            // serialization_failure, deadlock_detected, admin_shutdown, cannot_connect_now
            Some("40001") | Some("40P01") | Some("57P01") | Some("57P03")
        ),
        _ => false,
    }
}

#[async_trait]
impl ExecutionStore for PgStore {
    async fn create_execution(&self, exec: &WorkflowExecution) -> AppResult<()> {
        self.with_retry("create_execution", || execution::insert_execution(&self.pool, exec))
            .await
    }

    async fn get_execution(&self, id: Uuid) -> AppResult<Option<WorkflowExecution>> {
        self.with_retry("get_execution", || execution::get_execution(&self.pool, id))
            .await
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        patch: ExecutionPatch,
    ) -> AppResult<Option<WorkflowExecution>> {
        check_transition(from, to, &patch)?;
        let patch = &patch;
        self.with_retry("transition", || {
            execution::transition_execution(&self.pool, id, from, to, patch)
        })
        .await
    }

    async fn save_context(&self, id: Uuid, context: &serde_json::Value) -> AppResult<bool> {
        self.with_retry("save_context", || execution::update_context(&self.pool, id, context))
            .await
    }

    async fn get_paused_executions(&self, limit: i64) -> AppResult<Vec<WorkflowExecution>> {
        self.with_retry("get_paused_executions", || {
            execution::get_paused_executions(&self.pool, None, limit)
        })
        .await
    }

    async fn get_paused_by_reason(
        &self,
        reason: PauseReason,
        limit: i64,
    ) -> AppResult<Vec<WorkflowExecution>> {
        self.with_retry("get_paused_by_reason", || {
            execution::get_paused_executions(&self.pool, Some(reason), limit)
        })
        .await
    }

    async fn set_resume_data(&self, id: Uuid, data: &serde_json::Value) -> AppResult<bool> {
        self.with_retry("set_resume_data", || execution::merge_resume_data(&self.pool, id, data))
            .await
    }

    async fn set_pause_continuation(
        &self,
        id: Uuid,
        next_step_id: Option<&str>,
    ) -> AppResult<bool> {
        self.with_retry("set_pause_continuation", || {
            execution::update_next_step(&self.pool, id, next_step_id)
        })
        .await
    }

    async fn create_step_execution(&self, record: &StepExecution) -> AppResult<()> {
        self.with_retry("create_step_execution", || step::insert_step(&self.pool, record))
            .await
    }

    async fn update_step_execution(&self, record: &StepExecution) -> AppResult<()> {
        let updated = self
            .with_retry("update_step_execution", || step::update_step(&self.pool, record))
            .await?;
        if !updated {
            return Err(AppError::NotFound(format!(
                "Step execution {} not found",
                record.id
            )));
        }
        Ok(())
    }

    async fn list_step_executions(&self, execution_id: Uuid) -> AppResult<Vec<StepExecution>> {
        self.with_retry("list_step_executions", || step::list_steps(&self.pool, execution_id))
            .await
    }
}

#[async_trait]
impl ApprovalStore for PgStore {
    async fn create_approval(&self, request: &ApprovalRequest) -> AppResult<()> {
        self.with_retry("create_approval", || approval::insert_approval(&self.pool, request))
            .await
    }

    async fn get_approval(&self, id: Uuid) -> AppResult<Option<ApprovalRequest>> {
        self.with_retry("get_approval", || approval::get_approval(&self.pool, id))
            .await
    }

    async fn get_approvals_by_execution(
        &self,
        execution_id: Uuid,
    ) -> AppResult<Vec<ApprovalRequest>> {
        self.with_retry("get_approvals_by_execution", || {
            approval::get_approvals_by_execution(&self.pool, execution_id)
        })
        .await
    }

    async fn record_decision(
        &self,
        id: Uuid,
        decision: &ApprovalDecision,
    ) -> AppResult<Option<ApprovalRequest>> {
        self.with_retry("record_decision", || {
            approval::decide_approval(&self.pool, id, decision)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(!is_transient(&sqlx::Error::RowNotFound));
        assert!(!is_transient(&sqlx::Error::ColumnNotFound("x".to_string())));
    }
}
