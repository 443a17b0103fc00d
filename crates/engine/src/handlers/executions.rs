//! Execution management handlers: inspection, pause, resume and cancel.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::models::{PauseReason, StepExecution, WorkflowExecution};
use crate::engine::{ExecutionSummary, ResumeOutcome};
use crate::error::AppResult;
use crate::state::AppState;
use crate::store::require_execution;

#[derive(Debug, Clone, Deserialize)]
pub struct PausedQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// Execution with its step records.
#[derive(Debug, Serialize)]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub execution: WorkflowExecution,
    pub steps: Vec<StepExecution>,
}

/// Get execution details.
///
/// GET /api/executions/{execution_id}
pub async fn get(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> AppResult<Json<ExecutionDetail>> {
    let execution = require_execution(state.executions.as_ref(), execution_id).await?;
    let steps = state.executions.list_step_executions(execution_id).await?;
    Ok(Json(ExecutionDetail { execution, steps }))
}

/// Paused executions, oldest first.
///
/// GET /api/executions/paused?limit=
pub async fn list_paused(
    State(state): State<AppState>,
    Query(query): Query<PausedQuery>,
) -> AppResult<Json<Vec<WorkflowExecution>>> {
    let limit = query.limit.clamp(1, 500);
    Ok(Json(state.resumer.get_paused_executions(limit).await?))
}

#[derive(Debug, Clone, Deserialize)]
pub struct PauseRequest {
    #[serde(default = "default_pause_reason")]
    pub reason: PauseReason,
    #[serde(default)]
    pub paused_step_id: Option<String>,
    #[serde(default)]
    pub next_step_id: Option<String>,
}

fn default_pause_reason() -> PauseReason {
    PauseReason::Manual
}

/// Pause a running execution.
///
/// POST /api/executions/{execution_id}/pause
pub async fn pause(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
    Json(request): Json<PauseRequest>,
) -> AppResult<Json<ExecutionSummary>> {
    let summary = state
        .resumer
        .pause(
            execution_id,
            request.reason,
            request.paused_step_id,
            request.next_step_id,
        )
        .await?;
    Ok(Json(summary))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResumeRequest {
    #[serde(default)]
    pub resume_data: serde_json::Value,
}

/// Resume a paused execution.
///
/// POST /api/executions/{execution_id}/resume
pub async fn resume(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
    Json(request): Json<ResumeRequest>,
) -> AppResult<Json<ResumeOutcome>> {
    let data = match request.resume_data {
        serde_json::Value::Null => serde_json::json!({}),
        other => other,
    };
    Ok(Json(state.resumer.resume(execution_id, data).await?))
}

/// Cancel an execution.
///
/// POST /api/executions/{execution_id}/cancel
pub async fn cancel(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> AppResult<Json<ExecutionSummary>> {
    Ok(Json(state.resumer.cancel(execution_id).await?))
}
