//! Workflow execution queries.

use uuid::Uuid;

use crate::db::models::{ExecutionPatch, ExecutionRow, ExecutionStatus, PauseReason, WorkflowExecution};
use crate::db::DbPool;
use crate::error::AppResult;

const EXECUTION_COLUMNS: &str = r#"
    id, workflow_id, workflow_version, event_id, trigger_payload, context, status,
    result, error, created_at, started_at, completed_at, updated_at,
    paused_at, paused_reason, paused_step_id, next_step_id,
    resume_data, resume_count, last_resumed_at
"#;

/// Insert a new execution record.
pub async fn insert_execution(pool: &DbPool, exec: &WorkflowExecution) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO storeflow.workflow_execution (
            id, workflow_id, workflow_version, event_id, trigger_payload, context, status,
            result, error, created_at, started_at, completed_at, updated_at,
            paused_at, paused_reason, paused_step_id, next_step_id,
            resume_data, resume_count, last_resumed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                $14, $15, $16, $17, $18, $19, $20)
        "#,
    )
    .bind(exec.id)
    .bind(&exec.workflow_id)
    .bind(exec.workflow_version)
    .bind(exec.event_id)
    .bind(&exec.trigger_payload)
    .bind(&exec.context)
    .bind(exec.status.as_str())
    .bind(&exec.result)
    .bind(&exec.error)
    .bind(exec.created_at)
    .bind(exec.started_at)
    .bind(exec.completed_at)
    .bind(exec.updated_at)
    .bind(exec.paused_at)
    .bind(exec.paused_reason.map(|r| r.as_str()))
    .bind(&exec.paused_step_id)
    .bind(&exec.next_step_id)
    .bind(&exec.resume_data)
    .bind(exec.resume_count)
    .bind(exec.last_resumed_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get an execution by id.
pub async fn get_execution(pool: &DbPool, id: Uuid) -> AppResult<Option<WorkflowExecution>> {
    let query = format!(
        "SELECT {} FROM storeflow.workflow_execution WHERE id = $1",
        EXECUTION_COLUMNS
    );
    let row = sqlx::query_as::<_, ExecutionRow>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.map(WorkflowExecution::try_from).transpose()
}

/// Conditional status update.
///
/// Applies only while the current status is one of `from`; returns the
/// updated record, or `None` when the guard did not match.
pub async fn transition_execution(
    pool: &DbPool,
    id: Uuid,
    from: &[ExecutionStatus],
    to: ExecutionStatus,
    patch: &ExecutionPatch,
) -> AppResult<Option<WorkflowExecution>> {
    let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
    let pause = patch.pause.as_ref().filter(|_| to == ExecutionStatus::Paused);

    let query = format!(
        r#"
        UPDATE storeflow.workflow_execution SET
            status = $2,
            updated_at = now(),
            started_at = CASE WHEN $2 = 'running' AND started_at IS NULL THEN now() ELSE started_at END,
            completed_at = CASE WHEN $4 THEN now() ELSE completed_at END,
            result = COALESCE($5, result),
            error = COALESCE($6, error),
            context = CASE
                WHEN $11::jsonb IS NOT NULL THEN jsonb_set(
                    COALESCE($7::jsonb, context),
                    '{{resume}}',
                    COALESCE(resume_data, '{{}}'::jsonb) || $11::jsonb,
                    true)
                ELSE COALESCE($7::jsonb, context)
            END,
            paused_at = CASE WHEN $2 = 'paused' THEN now() ELSE NULL END,
            paused_reason = CASE WHEN $2 = 'paused' THEN $8 ELSE NULL END,
            paused_step_id = CASE WHEN $2 = 'paused' THEN $9 ELSE NULL END,
            next_step_id = CASE WHEN $2 = 'paused' THEN $10 ELSE NULL END,
            resume_data = CASE
                WHEN $2 = 'paused' THEN NULL
                WHEN $11::jsonb IS NOT NULL THEN COALESCE(resume_data, '{{}}'::jsonb) || $11::jsonb
                ELSE resume_data
            END,
            resume_count = resume_count + CASE WHEN $12 THEN 1 ELSE 0 END,
            last_resumed_at = CASE WHEN $12 THEN now() ELSE last_resumed_at END
        WHERE id = $1 AND status = ANY($3)
        RETURNING {}
        "#,
        EXECUTION_COLUMNS
    );

    let row = sqlx::query_as::<_, ExecutionRow>(&query)
        .bind(id)
        .bind(to.as_str())
        .bind(&from)
        .bind(to.is_terminal())
        .bind(&patch.result)
        .bind(&patch.error)
        .bind(&patch.context)
        .bind(pause.map(|p| p.reason.as_str()))
        .bind(pause.and_then(|p| p.paused_step_id.clone()))
        .bind(pause.and_then(|p| p.next_step_id.clone()))
        .bind(&patch.merge_resume_data)
        .bind(patch.mark_resumed)
        .fetch_optional(pool)
        .await?;

    row.map(WorkflowExecution::try_from).transpose()
}

/// Persist the context of a non-terminal execution.
pub async fn update_context(
    pool: &DbPool,
    id: Uuid,
    context: &serde_json::Value,
) -> AppResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE storeflow.workflow_execution
        SET context = $2, updated_at = now()
        WHERE id = $1 AND status IN ('pending', 'running', 'resuming')
        "#,
    )
    .bind(id)
    .bind(context)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Merge resume data into a paused execution.
pub async fn merge_resume_data(
    pool: &DbPool,
    id: Uuid,
    data: &serde_json::Value,
) -> AppResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE storeflow.workflow_execution
        SET resume_data = COALESCE(resume_data, '{}'::jsonb) || $2::jsonb,
            updated_at = now()
        WHERE id = $1 AND status = 'paused'
        "#,
    )
    .bind(id)
    .bind(data)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Replace the continuation step of a paused execution.
pub async fn update_next_step(pool: &DbPool, id: Uuid, next_step_id: Option<&str>) -> AppResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE storeflow.workflow_execution
        SET next_step_id = $2, updated_at = now()
        WHERE id = $1 AND status = 'paused'
        "#,
    )
    .bind(id)
    .bind(next_step_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Paused executions, oldest pause first.
pub async fn get_paused_executions(
    pool: &DbPool,
    reason: Option<PauseReason>,
    limit: i64,
) -> AppResult<Vec<WorkflowExecution>> {
    let query = format!(
        r#"
        SELECT {} FROM storeflow.workflow_execution
        WHERE status = 'paused' AND ($1::text IS NULL OR paused_reason = $1)
        ORDER BY paused_at ASC
        LIMIT $2
        "#,
        EXECUTION_COLUMNS
    );
    let rows = sqlx::query_as::<_, ExecutionRow>(&query)
        .bind(reason.map(|r| r.as_str()))
        .bind(limit)
        .fetch_all(pool)
        .await?;

    rows.into_iter().map(WorkflowExecution::try_from).collect()
}
