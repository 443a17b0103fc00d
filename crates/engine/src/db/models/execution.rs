//! Workflow execution model.
//!
//! One record per workflow run. Status changes only through
//! `ExecutionStore::transition`, which keeps the pause fields consistent
//! with the status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::AppError;

/// Execution lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Blocked,
    Paused,
    Resuming,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Blocked => "blocked",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Resuming => "resuming",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Blocked
                | ExecutionStatus::Cancelled
        )
    }

    /// Whether the state machine allows `self -> to`.
    pub fn can_transition_to(&self, to: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match self {
            Pending => matches!(to, Running | Failed | Cancelled),
            Running => matches!(to, Completed | Failed | Blocked | Paused | Cancelled),
            Paused => matches!(to, Resuming | Cancelled | Failed),
            Resuming => matches!(to, Running | Failed),
            Completed | Failed | Blocked | Cancelled => false,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "blocked" => Ok(ExecutionStatus::Blocked),
            "paused" => Ok(ExecutionStatus::Paused),
            "resuming" => Ok(ExecutionStatus::Resuming),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(AppError::Parse(format!("unknown execution status '{}'", other))),
        }
    }
}

/// Why an execution is paused.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    ApprovalRequired,
    EventWait,
    Manual,
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseReason::ApprovalRequired => "approval_required",
            PauseReason::EventWait => "event_wait",
            PauseReason::Manual => "manual",
        }
    }
}

impl std::fmt::Display for PauseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PauseReason {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approval_required" => Ok(PauseReason::ApprovalRequired),
            "event_wait" => Ok(PauseReason::EventWait),
            "manual" => Ok(PauseReason::Manual),
            other => Err(AppError::Parse(format!("unknown pause reason '{}'", other))),
        }
    }
}

/// Workflow execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: String,
    pub workflow_version: i32,
    /// Triggering event, absent for manual runs.
    pub event_id: Option<Uuid>,
    pub trigger_payload: serde_json::Value,
    /// Execution context document.
    pub context: serde_json::Value,
    pub status: ExecutionStatus,
    /// Final result label (`allowed`, `blocked`, `executed`, `completed`).
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    /// Set exactly while status is `paused`.
    pub paused_at: Option<DateTime<Utc>>,
    pub paused_reason: Option<PauseReason>,
    /// Step that caused the pause. Cleared with `paused_at`.
    pub paused_step_id: Option<String>,
    /// Step execution continues at after resume.
    pub next_step_id: Option<String>,
    /// Resume payloads for the current pause (approval decisions, awaited
    /// events). Reset by every `running -> paused` transition.
    pub resume_data: Option<serde_json::Value>,
    pub resume_count: i32,
    pub last_resumed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    /// New pending execution.
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_version: i32,
        event_id: Option<Uuid>,
        trigger_payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            workflow_version,
            event_id,
            trigger_payload,
            context: serde_json::Value::Object(serde_json::Map::new()),
            status: ExecutionStatus::Pending,
            result: None,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            paused_at: None,
            paused_reason: None,
            paused_step_id: None,
            next_step_id: None,
            resume_data: None,
            resume_count: 0,
            last_resumed_at: None,
        }
    }

    /// Seconds spent paused so far, if paused.
    pub fn paused_secs(&self, now: DateTime<Utc>) -> Option<i64> {
        self.paused_at.map(|at| (now - at).num_seconds())
    }
}

/// Database row for `storeflow.workflow_execution`.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct ExecutionRow {
    pub id: Uuid,
    pub workflow_id: String,
    pub workflow_version: i32,
    pub event_id: Option<Uuid>,
    pub trigger_payload: serde_json::Value,
    pub context: serde_json::Value,
    pub status: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub paused_reason: Option<String>,
    pub paused_step_id: Option<String>,
    pub next_step_id: Option<String>,
    pub resume_data: Option<serde_json::Value>,
    pub resume_count: i32,
    pub last_resumed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ExecutionRow> for WorkflowExecution {
    type Error = AppError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            workflow_id: row.workflow_id,
            workflow_version: row.workflow_version,
            event_id: row.event_id,
            trigger_payload: row.trigger_payload,
            context: row.context,
            status: row.status.parse()?,
            result: row.result,
            error: row.error,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
            paused_at: row.paused_at,
            paused_reason: row.paused_reason.as_deref().map(str::parse).transpose()?,
            paused_step_id: row.paused_step_id,
            next_step_id: row.next_step_id,
            resume_data: row.resume_data,
            resume_count: row.resume_count,
            last_resumed_at: row.last_resumed_at,
        })
    }
}

/// Pause continuation written by a `running -> paused` transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PauseInfo {
    pub reason: PauseReason,
    pub paused_step_id: Option<String>,
    pub next_step_id: Option<String>,
}

/// Field changes applied together with a status transition.
///
/// Timestamps are derived by the store: `started_at` on the first move to
/// `running`, `completed_at` on terminal statuses, `paused_at` exactly when
/// the target is `paused`. Pausing resets `resume_data`; leaving `paused`
/// clears the pause step ids.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPatch {
    pub result: Option<String>,
    pub error: Option<String>,
    /// Replaces the stored context.
    pub context: Option<serde_json::Value>,
    /// Required when the target status is `paused`.
    pub pause: Option<PauseInfo>,
    /// Shallow-merged into `resume_data` and the context's `resume` key.
    pub merge_resume_data: Option<serde_json::Value>,
    /// Increments `resume_count` and stamps `last_resumed_at`.
    pub mark_resumed: bool,
}

impl ExecutionPatch {
    pub fn result(result: impl Into<String>) -> Self {
        Self {
            result: Some(result.into()),
            ..Default::default()
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Shallow object merge; a non-object `patch` replaces `base`.
pub fn merge_objects(base: Option<&serde_json::Value>, patch: &serde_json::Value) -> serde_json::Value {
    match (base, patch) {
        (Some(serde_json::Value::Object(base)), serde_json::Value::Object(patch)) => {
            let mut merged = base.clone();
            for (k, v) in patch {
                merged.insert(k.clone(), v.clone());
            }
            serde_json::Value::Object(merged)
        }
        _ => patch.clone(),
    }
}
