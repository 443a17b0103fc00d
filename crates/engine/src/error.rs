//! Error types for the Storeflow engine.
//!
//! A single `AppError` covers the whole engine: workflow validation,
//! condition evaluation, action dispatch, persistence and the pause/resume
//! state machine. It implements `IntoResponse` so the operational API can
//! return it directly from Axum handlers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::workflow::types::RetryOn;

/// Application-level errors for the engine.
#[derive(Error, Debug)]
pub enum AppError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Not found error
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Validation error (malformed workflow, condition or request)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Conflict error (e.g., concurrent state change)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Bad request error
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Parse error (YAML, JSON, etc.)
    #[error("Parse error: {0}")]
    Parse(String),

    /// External service error
    #[error("External service error: {0}")]
    ExternalService(String),

    /// A dot-path did not resolve against the execution context.
    #[error("Missing field: {0}")]
    MissingField(String),

    /// Comparison between incompatible operand types.
    #[error("Type mismatch in '{op}': {detail}")]
    TypeMismatch { op: String, detail: String },

    /// Other condition evaluation failure.
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// A `${...}` token could not be resolved.
    #[error("Interpolation error: {0}")]
    Interpolation(String),

    /// Sub-action failure.
    #[error("Action error: {0}")]
    Action(String),

    /// HTTP sub-action returned a non-success status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Transport-level HTTP failure (connect, DNS, reset).
    #[error("Network error: {0}")]
    Network(String),

    /// A single step attempt exceeded its timeout.
    #[error("Step '{step_id}' timed out after {after_ms}ms")]
    StepTimeout { step_id: String, after_ms: u64 },

    /// Execution-level deadline exceeded. Terminal, not resumable.
    #[error("Execution timed out: {0}")]
    Timeout(String),

    /// A required enrichment resource failed to load.
    #[error("Resource load failed: {0}")]
    Resource(String),

    /// Pause attempted on an execution that is not running.
    #[error("Execution {0} is not running")]
    NotRunning(Uuid),

    /// Resume attempted on an execution that is not paused.
    #[error("Execution {0} is not paused")]
    NotPaused(Uuid),

    /// Resume attempted past the maximum pause duration.
    #[error("Execution {execution_id} has been paused for {paused_secs}s (max {max_secs}s)")]
    PausedTooLong {
        execution_id: Uuid,
        paused_secs: i64,
        max_secs: i64,
    },

    /// The continuation step no longer exists in the workflow definition.
    #[error("Execution {execution_id} cannot resume at missing step '{step_id}'")]
    InvalidResumeStep { execution_id: Uuid, step_id: String },

    /// Status change rejected by the execution state machine.
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// A dispatched task panicked.
    #[error("Task panicked: {0}")]
    Panicked(String),
}

impl AppError {
    /// Stable machine-readable code for API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database_error",
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "validation_error",
            AppError::Conflict(_) => "conflict",
            AppError::BadRequest(_) => "bad_request",
            AppError::Internal(_) => "internal_error",
            AppError::Config(_) => "config_error",
            AppError::Serialization(_) => "serialization_error",
            AppError::Parse(_) => "parse_error",
            AppError::ExternalService(_) => "external_service_error",
            AppError::MissingField(_) => "missing_field",
            AppError::TypeMismatch { .. } => "type_mismatch",
            AppError::Evaluation(_) => "evaluation_error",
            AppError::Interpolation(_) => "interpolation_error",
            AppError::Action(_) => "action_error",
            AppError::Http { .. } => "http_error",
            AppError::Network(_) => "network_error",
            AppError::StepTimeout { .. } => "step_timeout",
            AppError::Timeout(_) => "timeout",
            AppError::Resource(_) => "resource_error",
            AppError::NotRunning(_) => "not_running",
            AppError::NotPaused(_) => "not_paused",
            AppError::PausedTooLong { .. } => "paused_too_long",
            AppError::InvalidResumeStep { .. } => "invalid_step_reference",
            AppError::InvalidTransition { .. } => "invalid_transition",
            AppError::Panicked(_) => "panicked",
        }
    }

    /// Retry classification of this error, if it is retryable at all.
    ///
    /// Evaluation, interpolation and validation errors are deterministic and
    /// never retried.
    pub fn retry_class(&self) -> Option<RetryOn> {
        match self {
            AppError::StepTimeout { .. } => Some(RetryOn::Timeout),
            AppError::Http { status, .. } if *status >= 500 => Some(RetryOn::ServerError),
            AppError::Network(_) => Some(RetryOn::Network),
            AppError::Action(_) | AppError::ExternalService(_) | AppError::Database(_) => {
                Some(RetryOn::Any)
            }
            _ => None,
        }
    }

    /// Whether this error should be retried under the given `retry_on` list.
    ///
    /// An empty list retries every retryable error.
    pub fn is_retryable_for(&self, retry_on: &[RetryOn]) -> bool {
        match self.retry_class() {
            None => false,
            Some(_) if retry_on.is_empty() => true,
            Some(class) => retry_on
                .iter()
                .any(|r| *r == RetryOn::Any || *r == class),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Parse(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotRunning(_)
            | AppError::NotPaused(_)
            | AppError::PausedTooLong { .. }
            | AppError::InvalidTransition { .. } => (StatusCode::CONFLICT, self.to_string()),
            AppError::InvalidResumeStep { .. } => {
                tracing::warn!(error = %self, "Resume step reference invalid");
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string())
            }
            AppError::ExternalService(msg) => {
                tracing::warn!(error = %msg, "External service error");
                (StatusCode::BAD_GATEWAY, msg.clone())
            }
            AppError::Timeout(_) | AppError::StepTimeout { .. } => {
                (StatusCode::GATEWAY_TIMEOUT, self.to_string())
            }
            AppError::MissingField(_)
            | AppError::TypeMismatch { .. }
            | AppError::Evaluation(_)
            | AppError::Interpolation(_) => (StatusCode::UNPROCESSABLE_ENTITY, self.to_string()),
            _ => {
                tracing::error!(error = %self, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
            "code": self.code(),
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError.
pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<envy::Error> for AppError {
    fn from(err: envy::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        AppError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AppError::Network(format!("request timed out: {}", err))
        } else if let Some(status) = err.status() {
            AppError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            AppError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = AppError::NotFound("Workflow not found".to_string());
        assert_eq!(err.to_string(), "Resource not found: Workflow not found");
    }

    #[test]
    fn test_resume_errors_have_distinct_codes() {
        let id = Uuid::new_v4();
        let not_paused = AppError::NotPaused(id);
        let too_long = AppError::PausedTooLong {
            execution_id: id,
            paused_secs: 10,
            max_secs: 5,
        };
        let bad_step = AppError::InvalidResumeStep {
            execution_id: id,
            step_id: "gone".to_string(),
        };
        assert_eq!(not_paused.code(), "not_paused");
        assert_eq!(too_long.code(), "paused_too_long");
        assert_eq!(bad_step.code(), "invalid_step_reference");
    }

    #[test]
    fn test_retry_classification() {
        let server = AppError::Http {
            status: 503,
            message: "unavailable".to_string(),
        };
        let client = AppError::Http {
            status: 404,
            message: "missing".to_string(),
        };
        let timeout = AppError::StepTimeout {
            step_id: "s".to_string(),
            after_ms: 10,
        };

        assert!(server.is_retryable_for(&[RetryOn::ServerError]));
        assert!(!server.is_retryable_for(&[RetryOn::Timeout]));
        assert!(!client.is_retryable_for(&[]));
        assert!(timeout.is_retryable_for(&[]));
        assert!(timeout.is_retryable_for(&[RetryOn::Any]));
        assert!(!AppError::MissingField("a.b".to_string()).is_retryable_for(&[RetryOn::Any]));
    }

    #[test]
    fn test_into_response_status() {
        let response = AppError::NotPaused(Uuid::new_v4()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = AppError::Validation("bad".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
