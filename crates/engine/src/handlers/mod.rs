//! HTTP handlers for the Storeflow operational API.
//!
//! Route handlers are organized by domain; [`router`] assembles them.

pub mod approvals;
pub mod events;
pub mod executions;
pub mod health;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub use health::{api_health, health_check};

/// Build the application router with all routes.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let health_routes = Router::new()
        .route("/health", get(health_check))
        .route("/api/health", get(api_health));

    let event_routes = Router::new()
        .route("/api/events", post(events::route_event))
        .route(
            "/api/workflows/{workflow_id}/trigger",
            post(events::trigger_workflow),
        );

    let execution_routes = Router::new()
        .route("/api/executions/paused", get(executions::list_paused))
        .route("/api/executions/{execution_id}", get(executions::get))
        .route(
            "/api/executions/{execution_id}/pause",
            post(executions::pause),
        )
        .route(
            "/api/executions/{execution_id}/resume",
            post(executions::resume),
        )
        .route(
            "/api/executions/{execution_id}/cancel",
            post(executions::cancel),
        );

    let approval_routes = Router::new()
        .route("/api/approvals/{approval_id}", get(approvals::get))
        .route(
            "/api/approvals/{approval_id}/decision",
            post(approvals::decide),
        );

    Router::new()
        .merge(health_routes)
        .merge(event_routes)
        .merge(execution_routes)
        .merge(approval_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
