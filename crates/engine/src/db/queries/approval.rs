//! Approval request queries.

use uuid::Uuid;

use crate::db::models::{ApprovalDecision, ApprovalRequest, ApprovalRow};
use crate::db::DbPool;
use crate::error::AppResult;

const APPROVAL_COLUMNS: &str = r#"
    id, execution_id, step_id, entity_type, entity_id, approver_role, reason,
    status, expires_at, created_at, decided_by, decided_at, comment
"#;

pub async fn insert_approval(pool: &DbPool, request: &ApprovalRequest) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO storeflow.approval_request (
            id, execution_id, step_id, entity_type, entity_id, approver_role, reason,
            status, expires_at, created_at, decided_by, decided_at, comment
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(request.id)
    .bind(request.execution_id)
    .bind(&request.step_id)
    .bind(&request.entity_type)
    .bind(&request.entity_id)
    .bind(&request.approver_role)
    .bind(&request.reason)
    .bind(request.status.as_str())
    .bind(request.expires_at)
    .bind(request.created_at)
    .bind(&request.decided_by)
    .bind(request.decided_at)
    .bind(&request.comment)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_approval(pool: &DbPool, id: Uuid) -> AppResult<Option<ApprovalRequest>> {
    let query = format!(
        "SELECT {} FROM storeflow.approval_request WHERE id = $1",
        APPROVAL_COLUMNS
    );
    let row = sqlx::query_as::<_, ApprovalRow>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.map(ApprovalRequest::try_from).transpose()
}

pub async fn get_approvals_by_execution(
    pool: &DbPool,
    execution_id: Uuid,
) -> AppResult<Vec<ApprovalRequest>> {
    let query = format!(
        "SELECT {} FROM storeflow.approval_request WHERE execution_id = $1 ORDER BY created_at ASC",
        APPROVAL_COLUMNS
    );
    let rows = sqlx::query_as::<_, ApprovalRow>(&query)
        .bind(execution_id)
        .fetch_all(pool)
        .await?;

    rows.into_iter().map(ApprovalRequest::try_from).collect()
}

/// Record a decision on a pending request. Returns `None` if it was already decided.
pub async fn decide_approval(
    pool: &DbPool,
    id: Uuid,
    decision: &ApprovalDecision,
) -> AppResult<Option<ApprovalRequest>> {
    let query = format!(
        r#"
        UPDATE storeflow.approval_request
        SET status = $2, decided_by = $3, comment = $4, decided_at = now()
        WHERE id = $1 AND status = 'pending'
        RETURNING {}
        "#,
        APPROVAL_COLUMNS
    );
    let row = sqlx::query_as::<_, ApprovalRow>(&query)
        .bind(id)
        .bind(decision.status().as_str())
        .bind(&decision.decided_by)
        .bind(&decision.comment)
        .fetch_optional(pool)
        .await?;

    row.map(ApprovalRequest::try_from).transpose()
}
