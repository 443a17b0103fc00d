//! Approval handlers.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::db::models::{ApprovalDecision, ApprovalRequest};
use crate::engine::DecisionOutcome;
use crate::error::AppResult;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct DecisionQuery {
    /// Resume the execution in this request instead of leaving it to the worker.
    #[serde(default = "default_resume")]
    pub resume: bool,
}

fn default_resume() -> bool {
    true
}

/// GET /api/approvals/{approval_id}
pub async fn get(
    State(state): State<AppState>,
    Path(approval_id): Path<Uuid>,
) -> AppResult<Json<ApprovalRequest>> {
    Ok(Json(state.approvals.get(approval_id).await?))
}

/// Record a decision on an approval request.
///
/// POST /api/approvals/{approval_id}/decision
pub async fn decide(
    State(state): State<AppState>,
    Path(approval_id): Path<Uuid>,
    Query(query): Query<DecisionQuery>,
    Json(decision): Json<ApprovalDecision>,
) -> AppResult<Json<DecisionOutcome>> {
    let outcome = state
        .approvals
        .decide(approval_id, decision, query.resume)
        .await?;
    Ok(Json(outcome))
}
