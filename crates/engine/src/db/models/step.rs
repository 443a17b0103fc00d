//! Step execution model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::AppError;
use crate::workflow::types::StepType;

/// Step execution status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
    /// Suspended the execution (approval gate or wait).
    Paused,
    /// Race loser or aborted by execution cancellation.
    Cancelled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Paused => "paused",
            StepStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "paused" => Ok(StepStatus::Paused),
            "cancelled" => Ok(StepStatus::Cancelled),
            other => Err(AppError::Parse(format!("unknown step status '{}'", other))),
        }
    }
}

/// One attempt history of one step within an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    pub step_type: StepType,
    /// Enclosing parallel step, for children.
    pub parent_step_id: Option<String>,
    pub status: StepStatus,
    /// Attempts made so far (1-based).
    pub attempt: i32,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    pub fn start(
        execution_id: Uuid,
        step_id: impl Into<String>,
        step_type: StepType,
        parent_step_id: Option<String>,
        input: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            step_id: step_id.into(),
            step_type,
            parent_step_id,
            status: StepStatus::Running,
            attempt: 1,
            input,
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Record the final outcome.
    pub fn finish(
        &mut self,
        status: StepStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        self.status = status;
        self.output = output;
        self.error = error;
        self.completed_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct StepRow {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    pub step_type: String,
    pub parent_step_id: Option<String>,
    pub status: String,
    pub attempt: i32,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<StepRow> for StepExecution {
    type Error = AppError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            execution_id: row.execution_id,
            step_id: row.step_id,
            step_type: row.step_type.parse().map_err(AppError::Parse)?,
            parent_step_id: row.parent_step_id,
            status: row.status.parse()?,
            attempt: row.attempt,
            input: row.input,
            output: row.output,
            error: row.error,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}
