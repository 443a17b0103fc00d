//! Approval decisions.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::db::models::{ApprovalDecision, ApprovalRequest, ApprovalStatus};
use crate::engine::resumer::{ResumeOutcome, WorkflowResumer};
use crate::error::{AppError, AppResult};
use crate::store::{ApprovalStore, ExecutionStore};

/// Result of deciding an approval request.
#[derive(Debug, Serialize)]
pub struct DecisionOutcome {
    pub approval: ApprovalRequest,
    /// Present when the decision was applied to the execution immediately.
    pub resume: Option<ResumeOutcome>,
}

#[derive(Clone)]
pub struct ApprovalService {
    approvals: Arc<dyn ApprovalStore>,
    store: Arc<dyn ExecutionStore>,
    resumer: WorkflowResumer,
}

impl ApprovalService {
    pub fn new(
        approvals: Arc<dyn ApprovalStore>,
        store: Arc<dyn ExecutionStore>,
        resumer: WorkflowResumer,
    ) -> Self {
        Self {
            approvals,
            store,
            resumer,
        }
    }

    pub async fn get(&self, approval_id: Uuid) -> AppResult<ApprovalRequest> {
        self.approvals
            .get_approval(approval_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Approval {} not found", approval_id)))
    }

    /// Record a decision and hand it to the paused execution as resume data.
    ///
    /// With `resume_now` the execution is resumed in this call; otherwise the
    /// resume worker picks the decision up on its next cycle.
    pub async fn decide(
        &self,
        approval_id: Uuid,
        decision: ApprovalDecision,
        resume_now: bool,
    ) -> AppResult<DecisionOutcome> {
        let request = self.get(approval_id).await?;
        if request.status != ApprovalStatus::Pending {
            return Err(AppError::Conflict(format!(
                "Approval {} already {}",
                approval_id, request.status
            )));
        }
        if request.is_expired(chrono::Utc::now()) {
            return Err(AppError::Conflict(format!(
                "Approval {} expired",
                approval_id
            )));
        }

        let approval = self
            .approvals
            .record_decision(approval_id, &decision)
            .await?
            .ok_or_else(|| {
                AppError::Conflict(format!("Approval {} decided concurrently", approval_id))
            })?;

        info!(
            approval_id = %approval_id,
            execution_id = %approval.execution_id,
            approved = decision.approved,
            decided_by = %decision.decided_by,
            "Approval decided"
        );

        let data = json!({
            "approved": decision.approved,
            "decided_by": decision.decided_by,
            "comment": decision.comment,
            "approval_id": approval_id,
        });

        let resume = if resume_now {
            Some(self.resumer.resume(approval.execution_id, data).await?)
        } else {
            if !self.store.set_resume_data(approval.execution_id, &data).await? {
                return Err(AppError::NotPaused(approval.execution_id));
            }
            None
        };

        Ok(DecisionOutcome { approval, resume })
    }
}
