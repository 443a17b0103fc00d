//! In-memory store, used by tests and the `memory` backend.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::models::{
    merge_objects, ApprovalDecision, ApprovalRequest, ApprovalStatus, ExecutionPatch,
    ExecutionStatus, PauseReason, StepExecution, WorkflowExecution,
};
use crate::error::{AppError, AppResult};
use crate::store::{check_transition, ApprovalStore, ExecutionStore};

#[derive(Default)]
pub struct MemoryStore {
    executions: RwLock<HashMap<Uuid, WorkflowExecution>>,
    steps: RwLock<HashMap<Uuid, Vec<StepExecution>>>,
    approvals: RwLock<HashMap<Uuid, ApprovalRequest>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a stored execution as-is. Test fixtures use it to age pauses.
    pub async fn put_execution(&self, exec: WorkflowExecution) {
        self.executions.write().await.insert(exec.id, exec);
    }

    async fn paused(&self, reason: Option<PauseReason>, limit: i64) -> Vec<WorkflowExecution> {
        let guard = self.executions.read().await;
        let mut paused: Vec<_> = guard
            .values()
            .filter(|e| e.status == ExecutionStatus::Paused)
            .filter(|e| reason.map_or(true, |r| e.paused_reason == Some(r)))
            .cloned()
            .collect();
        paused.sort_by_key(|e| e.paused_at);
        paused.truncate(limit.max(0) as usize);
        paused
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create_execution(&self, exec: &WorkflowExecution) -> AppResult<()> {
        let mut guard = self.executions.write().await;
        if guard.contains_key(&exec.id) {
            return Err(AppError::Conflict(format!("Execution {} already exists", exec.id)));
        }
        guard.insert(exec.id, exec.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> AppResult<Option<WorkflowExecution>> {
        Ok(self.executions.read().await.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        patch: ExecutionPatch,
    ) -> AppResult<Option<WorkflowExecution>> {
        check_transition(from, to, &patch)?;

        let mut guard = self.executions.write().await;
        let Some(exec) = guard.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&exec.status) {
            return Ok(None);
        }

        let now = Utc::now();
        exec.status = to;
        exec.updated_at = now;
        if to == ExecutionStatus::Running && exec.started_at.is_none() {
            exec.started_at = Some(now);
        }
        if to.is_terminal() {
            exec.completed_at = Some(now);
        }
        if let Some(result) = patch.result {
            exec.result = Some(result);
        }
        if let Some(error) = patch.error {
            exec.error = Some(error);
        }
        if let Some(context) = patch.context {
            exec.context = context;
        }

        match (to, patch.pause) {
            (ExecutionStatus::Paused, Some(pause)) => {
                exec.paused_at = Some(now);
                exec.paused_reason = Some(pause.reason);
                exec.paused_step_id = pause.paused_step_id;
                exec.next_step_id = pause.next_step_id;
                // A new pause only honours decisions made for it.
                exec.resume_data = None;
            }
            _ => {
                exec.paused_at = None;
                exec.paused_reason = None;
                exec.paused_step_id = None;
                exec.next_step_id = None;
            }
        }

        if let Some(data) = patch.merge_resume_data {
            let merged = merge_objects(exec.resume_data.as_ref(), &data);
            if let Some(ctx) = exec.context.as_object_mut() {
                ctx.insert("resume".to_string(), merged.clone());
            }
            exec.resume_data = Some(merged);
        }
        if patch.mark_resumed {
            exec.resume_count += 1;
            exec.last_resumed_at = Some(now);
        }

        Ok(Some(exec.clone()))
    }

    async fn save_context(&self, id: Uuid, context: &serde_json::Value) -> AppResult<bool> {
        let mut guard = self.executions.write().await;
        match guard.get_mut(&id) {
            Some(exec)
                if matches!(
                    exec.status,
                    ExecutionStatus::Pending | ExecutionStatus::Running | ExecutionStatus::Resuming
                ) =>
            {
                exec.context = context.clone();
                exec.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_paused_executions(&self, limit: i64) -> AppResult<Vec<WorkflowExecution>> {
        Ok(self.paused(None, limit).await)
    }

    async fn get_paused_by_reason(
        &self,
        reason: PauseReason,
        limit: i64,
    ) -> AppResult<Vec<WorkflowExecution>> {
        Ok(self.paused(Some(reason), limit).await)
    }

    async fn set_resume_data(&self, id: Uuid, data: &serde_json::Value) -> AppResult<bool> {
        let mut guard = self.executions.write().await;
        match guard.get_mut(&id) {
            Some(exec) if exec.status == ExecutionStatus::Paused => {
                exec.resume_data = Some(merge_objects(exec.resume_data.as_ref(), data));
                exec.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_pause_continuation(
        &self,
        id: Uuid,
        next_step_id: Option<&str>,
    ) -> AppResult<bool> {
        let mut guard = self.executions.write().await;
        match guard.get_mut(&id) {
            Some(exec) if exec.status == ExecutionStatus::Paused => {
                exec.next_step_id = next_step_id.map(str::to_string);
                exec.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_step_execution(&self, step: &StepExecution) -> AppResult<()> {
        self.steps
            .write()
            .await
            .entry(step.execution_id)
            .or_default()
            .push(step.clone());
        Ok(())
    }

    async fn update_step_execution(&self, step: &StepExecution) -> AppResult<()> {
        let mut guard = self.steps.write().await;
        let record = guard
            .get_mut(&step.execution_id)
            .and_then(|steps| steps.iter_mut().find(|s| s.id == step.id))
            .ok_or_else(|| AppError::NotFound(format!("Step execution {} not found", step.id)))?;
        *record = step.clone();
        Ok(())
    }

    async fn list_step_executions(&self, execution_id: Uuid) -> AppResult<Vec<StepExecution>> {
        Ok(self
            .steps
            .read()
            .await
            .get(&execution_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl ApprovalStore for MemoryStore {
    async fn create_approval(&self, request: &ApprovalRequest) -> AppResult<()> {
        self.approvals
            .write()
            .await
            .insert(request.id, request.clone());
        Ok(())
    }

    async fn get_approval(&self, id: Uuid) -> AppResult<Option<ApprovalRequest>> {
        Ok(self.approvals.read().await.get(&id).cloned())
    }

    async fn get_approvals_by_execution(
        &self,
        execution_id: Uuid,
    ) -> AppResult<Vec<ApprovalRequest>> {
        let mut approvals: Vec<_> = self
            .approvals
            .read()
            .await
            .values()
            .filter(|a| a.execution_id == execution_id)
            .cloned()
            .collect();
        approvals.sort_by_key(|a| a.created_at);
        Ok(approvals)
    }

    async fn record_decision(
        &self,
        id: Uuid,
        decision: &ApprovalDecision,
    ) -> AppResult<Option<ApprovalRequest>> {
        let mut guard = self.approvals.write().await;
        match guard.get_mut(&id) {
            Some(request) if request.status == ApprovalStatus::Pending => {
                request.status = decision.status();
                request.decided_by = Some(decision.decided_by.clone());
                request.comment = decision.comment.clone();
                request.decided_at = Some(Utc::now());
                Ok(Some(request.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::PauseInfo;
    use serde_json::json;
    use std::sync::Arc;

    fn pause_patch(next: &str) -> ExecutionPatch {
        ExecutionPatch {
            pause: Some(PauseInfo {
                reason: PauseReason::ApprovalRequired,
                paused_step_id: Some("gate".to_string()),
                next_step_id: Some(next.to_string()),
            }),
            ..Default::default()
        }
    }

    async fn running(store: &MemoryStore) -> Uuid {
        let exec = WorkflowExecution::new("wf", 1, None, json!({}));
        let id = exec.id;
        store.create_execution(&exec).await.unwrap();
        store
            .transition(id, &[ExecutionStatus::Pending], ExecutionStatus::Running, ExecutionPatch::default())
            .await
            .unwrap()
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_transition_guard() {
        let store = MemoryStore::new();
        let id = running(&store).await;

        let stale = store
            .transition(id, &[ExecutionStatus::Pending], ExecutionStatus::Running, ExecutionPatch::default())
            .await
            .unwrap();
        assert!(stale.is_none());

        let exec = store.get_execution(id).await.unwrap().unwrap();
        assert!(exec.started_at.is_some());
    }

    #[tokio::test]
    async fn test_pause_fields_follow_status() {
        let store = MemoryStore::new();
        let id = running(&store).await;

        let paused = store
            .transition(id, &[ExecutionStatus::Running], ExecutionStatus::Paused, pause_patch("approve"))
            .await
            .unwrap()
            .unwrap();
        assert!(paused.paused_at.is_some());
        assert_eq!(paused.next_step_id.as_deref(), Some("approve"));

        let cancelled = store
            .transition(id, &[ExecutionStatus::Paused], ExecutionStatus::Cancelled, ExecutionPatch::default())
            .await
            .unwrap()
            .unwrap();
        assert!(cancelled.paused_at.is_none());
        assert!(cancelled.paused_reason.is_none());
        assert!(cancelled.paused_step_id.is_none());
        assert!(cancelled.next_step_id.is_none());
        assert!(cancelled.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_new_pause_drops_previous_resume_data() {
        let store = MemoryStore::new();
        let id = running(&store).await;
        store
            .transition(id, &[ExecutionStatus::Running], ExecutionStatus::Paused, pause_patch("gate2"))
            .await
            .unwrap();
        let resumed = store
            .transition(
                id,
                &[ExecutionStatus::Paused],
                ExecutionStatus::Resuming,
                ExecutionPatch {
                    merge_resume_data: Some(json!({"approved": true})),
                    mark_resumed: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(resumed.next_step_id.is_none());
        store
            .transition(id, &[ExecutionStatus::Resuming], ExecutionStatus::Running, ExecutionPatch::default())
            .await
            .unwrap();

        let paused_again = store
            .transition(id, &[ExecutionStatus::Running], ExecutionStatus::Paused, pause_patch("done"))
            .await
            .unwrap()
            .unwrap();
        assert!(paused_again.resume_data.is_none());
        assert_eq!(paused_again.resume_count, 1);
    }

    #[tokio::test]
    async fn test_resume_patch_merges_data_into_context() {
        let store = MemoryStore::new();
        let id = running(&store).await;
        store
            .transition(id, &[ExecutionStatus::Running], ExecutionStatus::Paused, pause_patch("approve"))
            .await
            .unwrap();
        assert!(store.set_resume_data(id, &json!({"approved": true})).await.unwrap());

        let resumed = store
            .transition(
                id,
                &[ExecutionStatus::Paused],
                ExecutionStatus::Resuming,
                ExecutionPatch {
                    merge_resume_data: Some(json!({"comment": "ok"})),
                    mark_resumed: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(resumed.resume_count, 1);
        assert_eq!(resumed.resume_data, Some(json!({"approved": true, "comment": "ok"})));
        assert_eq!(resumed.context["resume"]["approved"], json!(true));
        assert!(resumed.last_resumed_at.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_cas_has_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let id = running(&store).await;
        store
            .transition(id, &[ExecutionStatus::Running], ExecutionStatus::Paused, pause_patch("approve"))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .transition(
                        id,
                        &[ExecutionStatus::Paused],
                        ExecutionStatus::Resuming,
                        ExecutionPatch {
                            mark_resumed: true,
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap()
                    .is_some()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.get_execution(id).await.unwrap().unwrap().resume_count, 1);
    }

    #[tokio::test]
    async fn test_paused_listing_is_oldest_first() {
        let store = MemoryStore::new();
        let first = running(&store).await;
        let second = running(&store).await;
        for id in [second, first] {
            store
                .transition(id, &[ExecutionStatus::Running], ExecutionStatus::Paused, pause_patch("next"))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let paused = store.get_paused_executions(10).await.unwrap();
        let ids: Vec<_> = paused.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![second, first]);
        assert_eq!(store.get_paused_executions(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_decision_recorded_once() {
        let store = MemoryStore::new();
        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            step_id: "gate".to_string(),
            entity_type: "order".to_string(),
            entity_id: "o-1".to_string(),
            approver_role: "manager".to_string(),
            reason: None,
            status: ApprovalStatus::Pending,
            expires_at: None,
            created_at: Utc::now(),
            decided_by: None,
            decided_at: None,
            comment: None,
        };
        store.create_approval(&request).await.unwrap();

        let decision = ApprovalDecision {
            approved: true,
            decided_by: "alice".to_string(),
            comment: None,
        };
        let first = store.record_decision(request.id, &decision).await.unwrap();
        assert_eq!(first.unwrap().status, ApprovalStatus::Approved);
        assert!(store.record_decision(request.id, &decision).await.unwrap().is_none());
    }
}
