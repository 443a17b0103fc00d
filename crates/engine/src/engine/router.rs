//! Event routing.
//!
//! Matches inbound events against enabled workflow triggers and starts one
//! isolated task per match. Inbound events also wake executions paused on a
//! `wait` step for that event type.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::models::{Event, PauseReason};
use crate::engine::executor::{panic_message, ExecutionSummary, WorkflowExecutor};
use crate::engine::resumer::{ResumeOutcome, WorkflowResumer};
use crate::error::{AppError, AppResult};
use crate::result_ext::{OptionResultExt, ResultExt};
use crate::store::WorkflowStore;
use crate::workflow::types::{StepKind, Workflow};

/// Event type given to manually triggered executions.
pub const MANUAL_EVENT_TYPE: &str = "manual";

/// Whether a trigger pattern matches an event type.
///
/// `*` matches everything; a trailing `.*` matches exactly one more segment.
pub fn matches_event(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => event_type
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('.'))
            .is_some_and(|rest| !rest.is_empty() && !rest.contains('.')),
        None => pattern == event_type,
    }
}

/// Outcome of one workflow dispatched for an event.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub workflow_id: String,
    pub execution_id: Uuid,
    pub outcome: AppResult<ExecutionSummary>,
}

/// Everything `route_event_and_wait` did for one event.
#[derive(Debug)]
pub struct RouteReport {
    pub event_id: Uuid,
    pub dispatched: Vec<DispatchOutcome>,
    /// Executions resumed from an event wait.
    pub resumed: Vec<Uuid>,
}

struct Dispatched {
    workflow_id: String,
    execution_id: Uuid,
    handle: JoinHandle<AppResult<ExecutionSummary>>,
}

#[derive(Clone)]
pub struct EventRouter {
    workflows: Arc<dyn WorkflowStore>,
    executor: WorkflowExecutor,
    resumer: WorkflowResumer,
    wait_batch_size: i64,
}

impl EventRouter {
    pub fn new(
        workflows: Arc<dyn WorkflowStore>,
        executor: WorkflowExecutor,
        resumer: WorkflowResumer,
        wait_batch_size: i64,
    ) -> Self {
        Self {
            workflows,
            executor,
            resumer,
            wait_batch_size,
        }
    }

    /// Start every enabled workflow whose trigger matches `event`.
    ///
    /// Returns the number of workflows started. Executions run in the
    /// background; their failures land on the execution records.
    pub async fn route_event(&self, event: Event) -> AppResult<usize> {
        let dispatched = self.dispatch(&event).await?;
        let matched = dispatched.len();

        let router = self.clone();
        tokio::spawn(async move {
            let _ = router
                .resume_waiting(&event)
                .await
                .log("resuming executions waiting on event");
        });

        Ok(matched)
    }

    /// Same dispatch as [`route_event`](Self::route_event), awaiting every
    /// started execution and any resumed event waits.
    pub async fn route_event_and_wait(&self, event: Event) -> AppResult<RouteReport> {
        let dispatched = self.dispatch(&event).await?;

        let mut outcomes = Vec::with_capacity(dispatched.len());
        for d in dispatched {
            let outcome = match d.handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(AppError::Panicked(e.to_string())),
            };
            outcomes.push(DispatchOutcome {
                workflow_id: d.workflow_id,
                execution_id: d.execution_id,
                outcome,
            });
        }

        let resumed = self.resume_waiting(&event).await?;
        Ok(RouteReport {
            event_id: event.id,
            dispatched: outcomes,
            resumed,
        })
    }

    /// Start `workflow_id` without trigger matching. Disabled workflows run too.
    pub async fn trigger_workflow_manually(
        &self,
        workflow_id: &str,
        payload: Value,
    ) -> AppResult<Uuid> {
        let workflow = self
            .workflows
            .get(workflow_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Workflow '{}' not found", workflow_id)))?;
        let event = Event::new(MANUAL_EVENT_TYPE, payload).with_source(MANUAL_EVENT_TYPE);

        let dispatched = self.start(workflow, event).await?;
        info!(
            workflow_id = %workflow_id,
            execution_id = %dispatched.execution_id,
            "Workflow triggered manually"
        );
        Ok(dispatched.execution_id)
    }

    async fn dispatch(&self, event: &Event) -> AppResult<Vec<Dispatched>> {
        let matching: Vec<Arc<Workflow>> = self
            .workflows
            .list_enabled()
            .await?
            .into_iter()
            .filter(|w| {
                w.trigger
                    .event_pattern()
                    .is_some_and(|pattern| matches_event(pattern, &event.event_type))
            })
            .collect();

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            matched = matching.len(),
            "Routing event"
        );

        let mut dispatched = Vec::with_capacity(matching.len());
        for workflow in matching {
            let workflow_id = workflow.id.clone();
            match self.start(workflow, event.clone()).await {
                Ok(d) => dispatched.push(d),
                Err(e) => {
                    error!(
                        event_id = %event.id,
                        workflow_id = %workflow_id,
                        error = %e,
                        "Failed to create execution"
                    );
                }
            }
        }
        Ok(dispatched)
    }

    /// Persist a pending execution, then run it on its own task.
    async fn start(&self, workflow: Arc<Workflow>, event: Event) -> AppResult<Dispatched> {
        let exec = self.executor.create_execution(&workflow, &event).await?;
        let execution_id = exec.id;
        let workflow_id = workflow.id.clone();
        let executor = self.executor.clone();

        let handle = tokio::spawn(async move {
            let run = executor.run(execution_id, workflow, event);
            let error = match AssertUnwindSafe(run).catch_unwind().await {
                Ok(Ok(summary)) => return Ok(summary),
                Ok(Err(e)) => e,
                Err(panic) => AppError::Panicked(panic_message(panic.as_ref())),
            };
            error!(execution_id = %execution_id, error = %error, "Execution task failed");
            executor.mark_failed(execution_id, error).await
        });

        Ok(Dispatched {
            workflow_id,
            execution_id,
            handle,
        })
    }

    /// Resume executions paused on a `wait` step for this event type.
    async fn resume_waiting(&self, event: &Event) -> AppResult<Vec<Uuid>> {
        let waiting = self
            .executor
            .store()
            .get_paused_by_reason(PauseReason::EventWait, self.wait_batch_size)
            .await?;

        let mut resumed = Vec::new();
        for exec in waiting {
            let Some(workflow) = self
                .workflows
                .get(&exec.workflow_id)
                .await?
                .log_none(format!("workflow '{}' of waiting execution {}", exec.workflow_id, exec.id))
            else {
                continue;
            };
            let awaited = exec
                .paused_step_id
                .as_deref()
                .and_then(|id| workflow.find_step(id))
                .and_then(|step| match &step.kind {
                    StepKind::Wait { event, .. } => Some(event.as_str()),
                    _ => None,
                });
            if awaited != Some(event.event_type.as_str()) {
                continue;
            }

            debug!(execution_id = %exec.id, event_type = %event.event_type, "Waking execution waiting on event");
            let data = json!({"event": event.payload, "event_type": event.event_type});
            match self.resumer.resume(exec.id, data).await {
                Ok(ResumeOutcome::Resumed(_)) => resumed.push(exec.id),
                Ok(ResumeOutcome::AlreadyResumed(_)) => {}
                Err(e) => {
                    warn!(execution_id = %exec.id, error = %e, "Failed to resume waiting execution");
                }
            }
        }
        Ok(resumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ExecutionStatus;
    use crate::testing::{fixture, Harness};

    #[test]
    fn test_wildcard_matching() {
        assert!(matches_event("order.created", "order.created"));
        assert!(!matches_event("order.created", "order.updated"));
        assert!(matches_event("order.*", "order.created"));
        assert!(!matches_event("order.*", "order.item.added"));
        assert!(!matches_event("order.*", "order"));
        assert!(!matches_event("order.*", "orders.created"));
        assert!(matches_event("*", "anything.at.all"));
    }

    fn allow_on(id: &str, pattern: &str) -> Workflow {
        fixture(json!({
            "id": id,
            "trigger": {"type": "event", "event": pattern, "entry": "go"},
            "steps": [{"id": "go", "type": "action", "action": "allow"}]
        }))
    }

    #[tokio::test]
    async fn test_route_event_runs_each_match() {
        let mut disabled = allow_on("disabled", "order.*");
        disabled.enabled = false;
        let h = Harness::new(vec![
            allow_on("exact", "order.created"),
            allow_on("wild", "order.*"),
            allow_on("other", "cart.updated"),
            disabled,
        ]);

        let report = h
            .router
            .route_event_and_wait(Event::new("order.created", json!({"order": {"id": "o-1"}})))
            .await
            .unwrap();

        let mut ids: Vec<_> = report.dispatched.iter().map(|d| d.workflow_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["exact", "wild"]);
        for d in &report.dispatched {
            let summary = d.outcome.as_ref().unwrap();
            assert_eq!(summary.status, ExecutionStatus::Completed);
            assert_eq!(summary.result.as_deref(), Some("allowed"));
        }
    }

    #[tokio::test]
    async fn test_failed_workflow_does_not_affect_others() {
        let broken = fixture(json!({
            "id": "broken",
            "trigger": {"type": "event", "event": "order.created", "entry": "check"},
            "steps": [
                {"id": "check", "type": "condition",
                 "condition": {"field": "order.missing", "op": "eq", "value": 1},
                 "on_true": "go"},
                {"id": "go", "type": "action", "action": "allow"}
            ]
        }));
        let h = Harness::new(vec![broken, allow_on("fine", "order.created")]);

        let report = h
            .router
            .route_event_and_wait(Event::new("order.created", json!({"order": {}})))
            .await
            .unwrap();

        for d in &report.dispatched {
            let summary = d.outcome.as_ref().unwrap();
            match d.workflow_id.as_str() {
                "broken" => {
                    assert_eq!(summary.status, ExecutionStatus::Failed);
                    assert!(summary.error.as_deref().unwrap().contains("order.missing"));
                }
                _ => assert_eq!(summary.status, ExecutionStatus::Completed),
            }
        }
    }

    #[tokio::test]
    async fn test_manual_trigger_unknown_workflow() {
        let h = Harness::new(vec![]);
        let err = h
            .router
            .trigger_workflow_manually("nope", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_manual_trigger_runs_disabled_workflow() {
        let mut workflow = allow_on("quiet", "order.created");
        workflow.enabled = false;
        let h = Harness::new(vec![workflow]);

        let id = h
            .router
            .trigger_workflow_manually("quiet", json!({"note": "by hand"}))
            .await
            .unwrap();
        let exec = h.wait_for_terminal(id).await;
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.context["trigger"]["type"], json!("manual"));
    }

    #[tokio::test]
    async fn test_event_wakes_waiting_execution() {
        let workflow = fixture(json!({
            "id": "await_payment",
            "trigger": {"type": "event", "event": "order.created", "entry": "wait_payment"},
            "steps": [
                {"id": "wait_payment", "type": "wait", "event": "payment.captured", "next": "fulfil"},
                {"id": "fulfil", "type": "action", "action": "execute",
                 "actions": [{"type": "log", "message": "paid ${resume.event.amount}"}]}
            ]
        }));
        let h = Harness::new(vec![workflow]);

        let first = h
            .router
            .route_event_and_wait(Event::new("order.created", json!({"order": {"id": "o-9"}})))
            .await
            .unwrap();
        let summary = first.dispatched[0].outcome.as_ref().unwrap();
        assert_eq!(summary.status, ExecutionStatus::Paused);
        assert_eq!(summary.paused_reason, Some(PauseReason::EventWait));

        let unrelated = h
            .router
            .route_event_and_wait(Event::new("payment.failed", json!({})))
            .await
            .unwrap();
        assert!(unrelated.resumed.is_empty());

        let second = h
            .router
            .route_event_and_wait(Event::new("payment.captured", json!({"amount": 120})))
            .await
            .unwrap();
        assert_eq!(second.resumed, vec![summary.execution_id]);

        let exec = h.execution(summary.execution_id).await;
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.result.as_deref(), Some("executed"));
        assert_eq!(exec.context["resume"]["event_type"], json!("payment.captured"));
    }
}
