//! Event intake and manual trigger handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::models::Event;
use crate::engine::ExecutionSummary;
use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteQuery {
    /// Run matched workflows to their first pause or end before replying.
    #[serde(default)]
    pub wait: bool,
}

/// Reply to an accepted event.
#[derive(Debug, Serialize)]
pub struct EventAccepted {
    pub event_id: Uuid,
    pub matched: usize,
    /// Present with `?wait=true`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executions: Option<Vec<DispatchedExecution>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed: Option<Vec<Uuid>>,
}

#[derive(Debug, Serialize)]
pub struct DispatchedExecution {
    pub workflow_id: String,
    pub execution_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<ExecutionSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Route an inbound event.
///
/// POST /api/events
pub async fn route_event(
    State(state): State<AppState>,
    Query(query): Query<RouteQuery>,
    Json(event): Json<Event>,
) -> AppResult<(StatusCode, Json<EventAccepted>)> {
    if event.event_type.trim().is_empty() {
        return Err(AppError::BadRequest("event type is required".to_string()));
    }
    let event_id = event.id;

    if !query.wait {
        let matched = state.router.route_event(event).await?;
        return Ok((
            StatusCode::ACCEPTED,
            Json(EventAccepted {
                event_id,
                matched,
                executions: None,
                resumed: None,
            }),
        ));
    }

    let report = state.router.route_event_and_wait(event).await?;
    let executions: Vec<_> = report
        .dispatched
        .into_iter()
        .map(|d| {
            let (summary, error) = match d.outcome {
                Ok(summary) => (Some(summary), None),
                Err(e) => (None, Some(e.to_string())),
            };
            DispatchedExecution {
                workflow_id: d.workflow_id,
                execution_id: d.execution_id,
                summary,
                error,
            }
        })
        .collect();

    Ok((
        StatusCode::OK,
        Json(EventAccepted {
            event_id,
            matched: executions.len(),
            executions: Some(executions),
            resumed: Some(report.resumed),
        }),
    ))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerRequest {
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub workflow_id: String,
    pub execution_id: Uuid,
}

/// Start a workflow without an event.
///
/// POST /api/workflows/{workflow_id}/trigger
pub async fn trigger_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Json(request): Json<TriggerRequest>,
) -> AppResult<(StatusCode, Json<TriggerResponse>)> {
    let execution_id = state
        .router
        .trigger_workflow_manually(&workflow_id, request.payload)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            workflow_id,
            execution_id,
        }),
    ))
}
