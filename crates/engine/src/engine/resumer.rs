//! Pause and resume of workflow executions.
//!
//! A pause is persisted state, never a parked task: the `running -> paused`
//! write records where execution stops and where it continues. Resume is a
//! pair of conditional writes (`paused -> resuming -> running`); of several
//! concurrent resume triggers exactly one wins the first write and the rest
//! observe the execution as already resumed.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::db::models::{
    merge_objects, ExecutionPatch, ExecutionStatus, PauseInfo, PauseReason, StepExecution,
    StepStatus, WorkflowExecution,
};
use crate::engine::executor::{ExecutionSummary, ResumePoint, WorkflowExecutor};
use crate::error::{AppError, AppResult};
use crate::store::{require_execution, ExecutionStore, WorkflowStore};
use crate::workflow::types::{StepKind, Workflow};

/// Move a running execution to `paused`.
///
/// `context` and `result` are persisted in the same write when given.
pub(crate) async fn pause_execution(
    store: &dyn ExecutionStore,
    execution_id: Uuid,
    info: PauseInfo,
    context: Option<Value>,
    result: Option<String>,
) -> AppResult<WorkflowExecution> {
    let reason = info.reason;
    let patch = ExecutionPatch {
        result,
        context,
        pause: Some(info),
        ..Default::default()
    };
    let paused = store
        .transition(
            execution_id,
            &[ExecutionStatus::Running],
            ExecutionStatus::Paused,
            patch,
        )
        .await?
        .ok_or(AppError::NotRunning(execution_id))?;

    info!(
        execution_id = %execution_id,
        reason = %reason,
        paused_step_id = paused.paused_step_id.as_deref().unwrap_or(""),
        next_step_id = paused.next_step_id.as_deref().unwrap_or(""),
        "Execution paused"
    );
    Ok(paused)
}

/// Result of a resume request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "execution", rename_all = "snake_case")]
pub enum ResumeOutcome {
    /// This call resumed the execution and ran its continuation.
    Resumed(ExecutionSummary),
    /// A concurrent trigger resumed it first; nothing was done.
    AlreadyResumed(ExecutionSummary),
}

impl ResumeOutcome {
    pub fn summary(&self) -> &ExecutionSummary {
        match self {
            ResumeOutcome::Resumed(s) | ResumeOutcome::AlreadyResumed(s) => s,
        }
    }
}

#[derive(Clone)]
pub struct WorkflowResumer {
    store: Arc<dyn ExecutionStore>,
    workflows: Arc<dyn WorkflowStore>,
    executor: WorkflowExecutor,
    config: EngineConfig,
}

impl WorkflowResumer {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        workflows: Arc<dyn WorkflowStore>,
        executor: WorkflowExecutor,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            workflows,
            executor,
            config,
        }
    }

    /// Pause a running execution from outside the executor.
    ///
    /// Without an explicit `next_step_id` the continuation is inferred from
    /// the step records: a step still in flight is run again on resume, and
    /// after a finished step execution continues at its successor.
    pub async fn pause(
        &self,
        execution_id: Uuid,
        reason: PauseReason,
        paused_step_id: Option<String>,
        next_step_id: Option<String>,
    ) -> AppResult<ExecutionSummary> {
        let exec = require_execution(self.store.as_ref(), execution_id).await?;
        if exec.status != ExecutionStatus::Running {
            return Err(AppError::NotRunning(execution_id));
        }
        let workflow = self.workflow(&exec.workflow_id).await?;

        let (paused_step_id, next_step_id) = match next_step_id {
            Some(next) => (paused_step_id, Some(next)),
            None => {
                let steps = self.store.list_step_executions(execution_id).await?;
                let (inferred_paused, inferred_next) = infer_continuation(&workflow, &steps);
                (paused_step_id.or(inferred_paused), inferred_next)
            }
        };
        if let Some(next) = next_step_id.as_deref() {
            if !workflow.has_step(next) {
                return Err(AppError::Validation(format!(
                    "Step '{}' not found in workflow '{}'",
                    next, workflow.id
                )));
            }
        }

        let info = PauseInfo {
            reason,
            paused_step_id,
            next_step_id,
        };
        let paused = pause_execution(self.store.as_ref(), execution_id, info, None, None).await?;
        Ok(ExecutionSummary::from(&paused))
    }

    /// Whether `exec` is still within the maximum pause duration.
    pub fn can_resume(&self, exec: &WorkflowExecution) -> AppResult<()> {
        let max_secs = self.config.max_pause_duration.as_secs() as i64;
        match exec.paused_secs(Utc::now()) {
            Some(paused_secs) if paused_secs > max_secs => Err(AppError::PausedTooLong {
                execution_id: exec.id,
                paused_secs,
                max_secs,
            }),
            _ => Ok(()),
        }
    }

    /// Resume a paused execution with `resume_data` and run its continuation.
    pub async fn resume(&self, execution_id: Uuid, resume_data: Value) -> AppResult<ResumeOutcome> {
        let exec = require_execution(self.store.as_ref(), execution_id).await?;
        if exec.status != ExecutionStatus::Paused {
            return already_resumed_or_not_paused(&exec);
        }
        self.can_resume(&exec)?;

        let workflow = self.workflow(&exec.workflow_id).await?;
        let merged = merge_objects(exec.resume_data.as_ref(), &resume_data);
        let point = self.continuation(&exec, &workflow, &merged).await?;

        if let ResumePoint::Step(step_id) = &point {
            if !workflow.has_step(step_id) {
                let err = AppError::InvalidResumeStep {
                    execution_id,
                    step_id: step_id.clone(),
                };
                warn!(execution_id = %execution_id, step_id = %step_id, "Resume step missing from workflow definition");
                self.store
                    .transition(
                        execution_id,
                        &[ExecutionStatus::Paused],
                        ExecutionStatus::Failed,
                        ExecutionPatch::error(err.to_string()),
                    )
                    .await?;
                return Err(err);
            }
        }

        let patch = ExecutionPatch {
            merge_resume_data: Some(resume_data),
            mark_resumed: true,
            ..Default::default()
        };
        let claimed = self
            .store
            .transition(
                execution_id,
                &[ExecutionStatus::Paused],
                ExecutionStatus::Resuming,
                patch,
            )
            .await?;
        if claimed.is_none() {
            let current = require_execution(self.store.as_ref(), execution_id).await?;
            return already_resumed_or_not_paused(&current);
        }

        let running = self
            .store
            .transition(
                execution_id,
                &[ExecutionStatus::Resuming],
                ExecutionStatus::Running,
                ExecutionPatch::default(),
            )
            .await?
            .ok_or_else(|| {
                AppError::Conflict(format!(
                    "Execution {} left resuming concurrently",
                    execution_id
                ))
            })?;

        info!(
            execution_id = %execution_id,
            workflow_id = %workflow.id,
            resume_count = running.resume_count,
            "Execution resumed"
        );
        let summary = self
            .executor
            .continue_execution(running, workflow, point)
            .await?;
        Ok(ResumeOutcome::Resumed(summary))
    }

    /// Paused executions, oldest pause first.
    pub async fn get_paused_executions(&self, limit: i64) -> AppResult<Vec<WorkflowExecution>> {
        self.store.get_paused_executions(limit).await
    }

    /// Cancel a live execution. Cancelling a cancelled execution is a no-op.
    pub async fn cancel(&self, execution_id: Uuid) -> AppResult<ExecutionSummary> {
        let cancelled = self
            .store
            .transition(
                execution_id,
                &[
                    ExecutionStatus::Pending,
                    ExecutionStatus::Running,
                    ExecutionStatus::Paused,
                ],
                ExecutionStatus::Cancelled,
                ExecutionPatch::default(),
            )
            .await?;
        if let Some(exec) = cancelled {
            info!(execution_id = %execution_id, "Execution cancelled");
            return Ok(ExecutionSummary::from(&exec));
        }

        let exec = require_execution(self.store.as_ref(), execution_id).await?;
        match exec.status {
            ExecutionStatus::Cancelled => Ok(ExecutionSummary::from(&exec)),
            ExecutionStatus::Resuming => Err(AppError::Conflict(format!(
                "Execution {} is resuming",
                execution_id
            ))),
            status => Err(AppError::InvalidTransition {
                from: status.to_string(),
                to: ExecutionStatus::Cancelled.to_string(),
            }),
        }
    }

    async fn workflow(&self, workflow_id: &str) -> AppResult<Arc<Workflow>> {
        self.workflows
            .get(workflow_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Workflow '{}' not found", workflow_id)))
    }

    /// Where a paused execution continues, given its merged resume data.
    async fn continuation(
        &self,
        exec: &WorkflowExecution,
        workflow: &Workflow,
        resume_data: &Value,
    ) -> AppResult<ResumePoint> {
        let carried = || exec.result.clone().unwrap_or_else(|| "completed".to_string());

        let point = match exec.paused_reason {
            Some(PauseReason::ApprovalRequired) => {
                match resume_data.get("approved").and_then(Value::as_bool) {
                    Some(false) => {
                        let on_reject = exec
                            .paused_step_id
                            .as_deref()
                            .and_then(|id| workflow.find_step(id))
                            .and_then(|step| match &step.kind {
                                StepKind::Action {
                                    approval: Some(approval),
                                    ..
                                } => approval.on_reject.clone(),
                                _ => None,
                            });
                        match on_reject {
                            Some(step_id) => {
                                self.store
                                    .set_pause_continuation(exec.id, Some(&step_id))
                                    .await?;
                                ResumePoint::Step(step_id)
                            }
                            None => ResumePoint::Finish {
                                status: ExecutionStatus::Blocked,
                                result: "blocked".to_string(),
                            },
                        }
                    }
                    approved => {
                        if approved.is_none() {
                            debug!(execution_id = %exec.id, "Resuming approval pause without a decision");
                        }
                        match &exec.next_step_id {
                            Some(next) => ResumePoint::Step(next.clone()),
                            None => ResumePoint::Finish {
                                status: ExecutionStatus::Completed,
                                result: "allowed".to_string(),
                            },
                        }
                    }
                }
            }
            _ => match &exec.next_step_id {
                Some(next) => ResumePoint::Step(next.clone()),
                None => ResumePoint::Finish {
                    status: ExecutionStatus::Completed,
                    result: carried(),
                },
            },
        };
        Ok(point)
    }
}

fn already_resumed_or_not_paused(exec: &WorkflowExecution) -> AppResult<ResumeOutcome> {
    let resumed_elsewhere = exec.resume_count > 0
        && !matches!(
            exec.status,
            ExecutionStatus::Pending | ExecutionStatus::Cancelled
        );
    if resumed_elsewhere {
        debug!(execution_id = %exec.id, status = %exec.status, "Execution already resumed");
        Ok(ResumeOutcome::AlreadyResumed(ExecutionSummary::from(exec)))
    } else {
        Err(AppError::NotPaused(exec.id))
    }
}

/// Continuation for a pause requested while the execution is running.
///
/// Returns `(paused_step_id, next_step_id)` from the latest top-level step
/// record.
fn infer_continuation(
    workflow: &Workflow,
    steps: &[StepExecution],
) -> (Option<String>, Option<String>) {
    let Some(latest) = steps
        .iter()
        .filter(|s| s.parent_step_id.is_none())
        .max_by_key(|s| s.started_at)
    else {
        return (None, workflow.entry_step_id().map(str::to_string));
    };

    if latest.status == StepStatus::Running {
        return (Some(latest.step_id.clone()), Some(latest.step_id.clone()));
    }

    let next = workflow
        .find_step(&latest.step_id)
        .and_then(|step| match &step.kind {
            StepKind::Condition {
                on_true, on_false, ..
            } => {
                let matched = latest
                    .output
                    .as_ref()
                    .and_then(|o| o.get("matched"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if matched {
                    on_true.clone()
                } else {
                    on_false.clone()
                }
            }
            StepKind::Action { next, .. }
            | StepKind::Parallel { next, .. }
            | StepKind::Wait { next, .. } => next.clone(),
        });
    (Some(latest.step_id.clone()), next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture, Harness};
    use serde_json::json;
    use std::time::Duration;

    fn approval_workflow(on_reject: bool) -> Workflow {
        let mut approval = json!({"role": "fraud_team", "reason": "High value order"});
        if on_reject {
            approval["on_reject"] = json!("notify_customer");
        }
        fixture(json!({
            "id": "high_value_review",
            "trigger": {"type": "event", "event": "order.created", "entry": "check_total"},
            "steps": [
                {"id": "check_total", "type": "condition",
                 "condition": {"field": "order.total", "op": "gte", "value": 10000},
                 "on_true": "hold", "on_false": "allow_order"},
                {"id": "hold", "type": "action", "action": "block",
                 "approval": approval, "next": "allow_order"},
                {"id": "allow_order", "type": "action", "action": "allow"},
                {"id": "notify_customer", "type": "action", "action": "execute",
                 "actions": [{"type": "log", "message": "rejected"}]}
            ]
        }))
    }

    #[tokio::test]
    async fn test_approved_continues_at_next_step() {
        let h = Harness::new(vec![approval_workflow(false)]);
        let summary = h.run("high_value_review", json!({"order": {"total": 15000}})).await;
        assert_eq!(summary.status, ExecutionStatus::Paused);
        assert_eq!(summary.next_step_id.as_deref(), Some("allow_order"));

        let outcome = h
            .resumer
            .resume(summary.execution_id, json!({"approved": true}))
            .await
            .unwrap();
        let done = outcome.summary();
        assert!(matches!(outcome, ResumeOutcome::Resumed(_)));
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.result.as_deref(), Some("allowed"));
        assert_eq!(done.resume_count, 1);

        let exec = h.execution(summary.execution_id).await;
        assert!(exec.paused_at.is_none());
        assert_eq!(exec.context["resume"]["approved"], json!(true));
        let hold_runs = h
            .steps(summary.execution_id)
            .await
            .iter()
            .filter(|s| s.step_id == "hold")
            .count();
        assert_eq!(hold_runs, 1);
    }

    #[tokio::test]
    async fn test_rejected_without_on_reject_is_blocked() {
        let h = Harness::new(vec![approval_workflow(false)]);
        let summary = h.run("high_value_review", json!({"order": {"total": 15000}})).await;

        let outcome = h
            .resumer
            .resume(summary.execution_id, json!({"approved": false}))
            .await
            .unwrap();
        assert_eq!(outcome.summary().status, ExecutionStatus::Blocked);
        assert_eq!(outcome.summary().result.as_deref(), Some("blocked"));
    }

    #[tokio::test]
    async fn test_rejected_routes_to_on_reject() {
        let h = Harness::new(vec![approval_workflow(true)]);
        let summary = h.run("high_value_review", json!({"order": {"total": 15000}})).await;

        let outcome = h
            .resumer
            .resume(summary.execution_id, json!({"approved": false}))
            .await
            .unwrap();
        assert_eq!(outcome.summary().status, ExecutionStatus::Completed);
        assert_eq!(outcome.summary().result.as_deref(), Some("executed"));
        let steps = h.steps(summary.execution_id).await;
        assert!(steps.iter().any(|s| s.step_id == "notify_customer"));
        assert!(!steps.iter().any(|s| s.step_id == "allow_order"));
    }

    #[tokio::test]
    async fn test_resume_not_paused() {
        let h = Harness::new(vec![approval_workflow(false)]);
        let summary = h.run("high_value_review", json!({"order": {"total": 50}})).await;
        assert_eq!(summary.status, ExecutionStatus::Completed);

        let err = h
            .resumer
            .resume(summary.execution_id, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotPaused(_)));
    }

    #[tokio::test]
    async fn test_paused_too_long_stays_paused() {
        let h = Harness::new(vec![approval_workflow(false)]);
        let summary = h.run("high_value_review", json!({"order": {"total": 15000}})).await;

        let mut exec = h.execution(summary.execution_id).await;
        exec.paused_at = Some(Utc::now() - chrono::Duration::days(8));
        h.store.put_execution(exec).await;

        let err = h
            .resumer
            .resume(summary.execution_id, json!({"approved": true}))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PausedTooLong { .. }));
        assert_eq!(
            h.execution(summary.execution_id).await.status,
            ExecutionStatus::Paused
        );
    }

    #[tokio::test]
    async fn test_missing_resume_step_fails_execution() {
        let h = Harness::new(vec![approval_workflow(false)]);
        let summary = h.run("high_value_review", json!({"order": {"total": 15000}})).await;
        h.store
            .set_pause_continuation(summary.execution_id, Some("removed_step"))
            .await
            .unwrap();

        let err = h
            .resumer
            .resume(summary.execution_id, json!({"approved": true}))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidResumeStep { .. }));
        assert_eq!(
            h.execution(summary.execution_id).await.status,
            ExecutionStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_concurrent_resume_runs_continuation_once() {
        let h = Harness::new(vec![approval_workflow(false)]);
        let summary = h.run("high_value_review", json!({"order": {"total": 15000}})).await;
        let id = summary.execution_id;

        let mut handles = Vec::new();
        for _ in 0..6 {
            let resumer = h.resumer.clone();
            handles.push(tokio::spawn(async move {
                resumer.resume(id, json!({"approved": true})).await
            }));
        }

        let mut resumed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(ResumeOutcome::Resumed(_)) => resumed += 1,
                Ok(ResumeOutcome::AlreadyResumed(_)) => {}
                Err(AppError::NotPaused(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(resumed, 1);

        let exec = h.execution(id).await;
        assert_eq!(exec.resume_count, 1);
        assert_eq!(exec.status, ExecutionStatus::Completed);
        let allow_runs = h
            .steps(id)
            .await
            .iter()
            .filter(|s| s.step_id == "allow_order")
            .count();
        assert_eq!(allow_runs, 1);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let h = Harness::new(vec![approval_workflow(false)]);
        let summary = h.run("high_value_review", json!({"order": {"total": 15000}})).await;

        let first = h.resumer.cancel(summary.execution_id).await.unwrap();
        let second = h.resumer.cancel(summary.execution_id).await.unwrap();
        assert_eq!(first.status, ExecutionStatus::Cancelled);
        assert_eq!(second.status, ExecutionStatus::Cancelled);

        let err = h
            .resumer
            .resume(summary.execution_id, json!({"approved": true}))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotPaused(_)));
    }

    #[tokio::test]
    async fn test_manual_pause_infers_in_flight_step() {
        let workflow = fixture(json!({
            "id": "slow",
            "trigger": {"type": "manual", "entry": "call"},
            "steps": [
                {"id": "call", "type": "action", "action": "execute",
                 "actions": [{"type": "webhook", "url": "https://hooks.test/slow"}],
                 "next": "done"},
                {"id": "done", "type": "action", "action": "allow"}
            ]
        }));
        let h = Harness::new(vec![workflow]);
        let exec = h.store_running_execution("slow").await;
        let record = StepExecution::start(
            exec.id,
            "call",
            crate::workflow::types::StepType::Action,
            None,
            None,
        );
        h.store.create_step_execution(&record).await.unwrap();

        let paused = h
            .resumer
            .pause(exec.id, PauseReason::Manual, None, None)
            .await
            .unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(paused.next_step_id.as_deref(), Some("call"));

        let err = h
            .resumer
            .pause(exec.id, PauseReason::Manual, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotRunning(_)));
    }

    #[test]
    fn test_can_resume_window() {
        let h = Harness::with_config(
            vec![],
            EngineConfig {
                max_pause_duration: Duration::from_secs(60),
                ..EngineConfig::default()
            },
        );
        let mut exec = WorkflowExecution::new("wf", 1, None, json!({}));
        exec.status = ExecutionStatus::Paused;
        exec.paused_at = Some(Utc::now() - chrono::Duration::seconds(30));
        assert!(h.resumer.can_resume(&exec).is_ok());

        exec.paused_at = Some(Utc::now() - chrono::Duration::seconds(120));
        assert!(matches!(
            h.resumer.can_resume(&exec),
            Err(AppError::PausedTooLong { .. })
        ));
    }
}
