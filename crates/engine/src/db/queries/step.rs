//! Step execution queries.

use uuid::Uuid;

use crate::db::models::{StepExecution, StepRow};
use crate::db::DbPool;
use crate::error::AppResult;

/// Insert a step execution record.
pub async fn insert_step(pool: &DbPool, step: &StepExecution) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO storeflow.step_execution (
            id, execution_id, step_id, step_type, parent_step_id, status, attempt,
            input, output, error, started_at, completed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(step.id)
    .bind(step.execution_id)
    .bind(&step.step_id)
    .bind(step.step_type.to_string())
    .bind(&step.parent_step_id)
    .bind(step.status.as_str())
    .bind(step.attempt)
    .bind(&step.input)
    .bind(&step.output)
    .bind(&step.error)
    .bind(step.started_at)
    .bind(step.completed_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Record retry attempts and the final outcome of a step.
pub async fn update_step(pool: &DbPool, step: &StepExecution) -> AppResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE storeflow.step_execution
        SET status = $2, attempt = $3, output = $4, error = $5, completed_at = $6
        WHERE id = $1
        "#,
    )
    .bind(step.id)
    .bind(step.status.as_str())
    .bind(step.attempt)
    .bind(&step.output)
    .bind(&step.error)
    .bind(step.completed_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// All step records of an execution in start order.
pub async fn list_steps(pool: &DbPool, execution_id: Uuid) -> AppResult<Vec<StepExecution>> {
    let rows = sqlx::query_as::<_, StepRow>(
        r#"
        SELECT id, execution_id, step_id, step_type, parent_step_id, status, attempt,
               input, output, error, started_at, completed_at
        FROM storeflow.step_execution
        WHERE execution_id = $1
        ORDER BY started_at ASC
        "#,
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(StepExecution::try_from).collect()
}
