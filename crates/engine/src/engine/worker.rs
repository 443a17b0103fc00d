//! Background resume worker.
//!
//! Periodically scans paused executions and resumes those whose stored
//! resume data already carries a decision (an approval verdict or an
//! awaited event). Stale pauses are only reported.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::db::models::WorkflowExecution;
use crate::engine::resumer::{ResumeOutcome, WorkflowResumer};
use crate::error::{AppError, AppResult};
use crate::result_ext::ResultExt;
use crate::store::ExecutionStore;

/// Counts from one worker cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub resumed: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct ResumeWorker {
    store: Arc<dyn ExecutionStore>,
    resumer: WorkflowResumer,
    config: EngineConfig,
}

impl ResumeWorker {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        resumer: WorkflowResumer,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            resumer,
            config,
        }
    }

    /// Run cycles until `shutdown` flips to `true`.
    ///
    /// A cycle in progress always completes; shutdown only prevents the next.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.resume_interval.as_secs(),
            batch_size = self.config.resume_batch_size,
            "Resume worker started"
        );
        let mut ticker = tokio::time::interval(self.config.resume_interval);
        ticker.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Ok(report) = self.run_cycle().await.log("resume worker cycle") {
                if report != CycleReport::default() {
                    info!(
                        resumed = report.resumed,
                        skipped = report.skipped,
                        failed = report.failed,
                        "Resume cycle finished"
                    );
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("Resume worker stopped");
    }

    /// One pass over the oldest paused executions.
    pub async fn run_cycle(&self) -> AppResult<CycleReport> {
        let paused = self
            .store
            .get_paused_executions(self.config.resume_batch_size)
            .await?;
        let mut report = CycleReport::default();
        let now = Utc::now();

        for exec in paused {
            let paused_secs = exec.paused_secs(now).unwrap_or(0);

            if paused_secs > self.config.max_pause_duration.as_secs() as i64 {
                warn!(
                    execution_id = %exec.id,
                    workflow_id = %exec.workflow_id,
                    paused_secs,
                    "Execution exceeded max pause duration, manual intervention required"
                );
                report.skipped += 1;
                continue;
            }

            if !has_decision(&exec) {
                if paused_secs > self.config.pause_warning.as_secs() as i64 {
                    warn!(
                        execution_id = %exec.id,
                        workflow_id = %exec.workflow_id,
                        reason = exec.paused_reason.map(|r| r.as_str()).unwrap_or(""),
                        paused_secs,
                        "Execution paused for a long time"
                    );
                }
                report.skipped += 1;
                continue;
            }

            match self.resumer.resume(exec.id, json!({})).await {
                Ok(ResumeOutcome::Resumed(summary)) => {
                    debug!(execution_id = %exec.id, status = %summary.status, "Resumed by worker");
                    report.resumed += 1;
                }
                Ok(ResumeOutcome::AlreadyResumed(_)) | Err(AppError::NotPaused(_)) => {
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(execution_id = %exec.id, error = %e, "Worker failed to resume execution");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

/// Whether stored resume data carries something to act on.
fn has_decision(exec: &WorkflowExecution) -> bool {
    exec.resume_data.as_ref().is_some_and(|data| {
        data.get("approved").is_some_and(Value::is_boolean) || data.get("event").is_some()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{ApprovalStatus, ExecutionStatus};
    use crate::store::ApprovalStore;
    use crate::testing::{fixture, Harness};
    use std::time::Duration;

    fn review_workflow() -> crate::workflow::Workflow {
        fixture(json!({
            "id": "review",
            "trigger": {"type": "event", "event": "order.created", "entry": "hold"},
            "steps": [
                {"id": "hold", "type": "action", "action": "block",
                 "approval": {"role": "ops"}, "next": "ship"},
                {"id": "ship", "type": "action", "action": "allow"}
            ]
        }))
    }

    #[tokio::test]
    async fn test_cycle_resumes_only_decided_executions() {
        let h = Harness::new(vec![review_workflow()]);
        let decided = h.run("review", json!({})).await;
        let undecided = h.run("review", json!({})).await;
        h.store
            .set_resume_data(decided.execution_id, &json!({"approved": true}))
            .await
            .unwrap();

        let report = h.worker().run_cycle().await.unwrap();
        assert_eq!(
            report,
            CycleReport {
                resumed: 1,
                skipped: 1,
                failed: 0
            }
        );
        assert_eq!(
            h.execution(decided.execution_id).await.status,
            ExecutionStatus::Completed
        );
        assert_eq!(
            h.execution(undecided.execution_id).await.status,
            ExecutionStatus::Paused
        );
    }

    #[tokio::test]
    async fn test_second_gate_waits_for_its_own_decision() {
        let h = Harness::new(vec![fixture(json!({
            "id": "two_gates",
            "trigger": {"type": "event", "event": "order.created", "entry": "gate1"},
            "steps": [
                {"id": "gate1", "type": "action", "action": "block",
                 "approval": {"role": "ops"}, "next": "gate2"},
                {"id": "gate2", "type": "action", "action": "block",
                 "approval": {"role": "finance"}, "next": "ship"},
                {"id": "ship", "type": "action", "action": "allow"}
            ]
        }))]);
        let summary = h.run("two_gates", json!({})).await;
        h.resumer
            .resume(summary.execution_id, json!({"approved": true}))
            .await
            .unwrap();

        let exec = h.execution(summary.execution_id).await;
        assert_eq!(exec.status, ExecutionStatus::Paused);
        assert_eq!(exec.paused_step_id.as_deref(), Some("gate2"));
        assert!(exec.resume_data.is_none());

        let report = h.worker().run_cycle().await.unwrap();
        assert_eq!(report.resumed, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(
            h.execution(summary.execution_id).await.status,
            ExecutionStatus::Paused
        );

        let approvals = h
            .store
            .get_approvals_by_execution(summary.execution_id)
            .await
            .unwrap();
        let gate2 = approvals.iter().find(|a| a.step_id == "gate2").unwrap();
        assert_eq!(gate2.status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn test_cycle_skips_expired_pause() {
        let h = Harness::new(vec![review_workflow()]);
        let summary = h.run("review", json!({})).await;
        h.store
            .set_resume_data(summary.execution_id, &json!({"approved": true}))
            .await
            .unwrap();
        let mut exec = h.execution(summary.execution_id).await;
        exec.paused_at = Some(Utc::now() - chrono::Duration::days(30));
        h.store.put_execution(exec).await;

        let report = h.worker().run_cycle().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.resumed, 0);
        assert_eq!(
            h.execution(summary.execution_id).await.status,
            ExecutionStatus::Paused
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = Harness::with_config(
            vec![review_workflow()],
            EngineConfig {
                resume_interval: Duration::from_millis(10),
                ..EngineConfig::default()
            },
        );
        let worker = h.worker();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker should stop")
            .unwrap();
    }
}
