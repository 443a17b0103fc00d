//! Workflow step-graph execution.
//!
//! An execution runs in segments: the initial run from the entry step, and
//! one continuation per resume. Each segment walks the graph sequentially,
//! checking the stored status at every step boundary so pauses and
//! cancellations made elsewhere are observed, and is bounded by the
//! workflow's execution timeout.
//!
//! Parallel steps fan out one task per child on a `JoinSet`. A panicking
//! child becomes a failed step record; it never takes down its siblings.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::db::models::{
    ApprovalRequest, ApprovalStatus, Event, ExecutionPatch, ExecutionStatus, PauseInfo,
    PauseReason, StepExecution, StepStatus, WorkflowExecution,
};
use crate::engine::actions::ActionExecutor;
use crate::engine::context::ContextBuilder;
use crate::engine::evaluator::ConditionEvaluator;
use crate::engine::interpolate::interpolate_str;
use crate::engine::resumer::pause_execution;
use crate::error::{AppError, AppResult};
use crate::result_ext::ResultExt;
use crate::store::{require_execution, ApprovalStore, ExecutionStore};
use crate::workflow::types::{
    ActionKind, ApprovalRequirement, JoinStrategy, MissingFieldPolicy, Step, StepKind, Workflow,
};

/// Where a continuation segment starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePoint {
    /// Continue the graph at this step.
    Step(String),
    /// Nothing left to run; finish with this status and result.
    Finish {
        status: ExecutionStatus,
        result: String,
    },
}

/// Caller-facing view of an execution after a segment ends.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub paused_reason: Option<PauseReason>,
    pub next_step_id: Option<String>,
    pub resume_count: i32,
}

impl From<&WorkflowExecution> for ExecutionSummary {
    fn from(exec: &WorkflowExecution) -> Self {
        Self {
            execution_id: exec.id,
            workflow_id: exec.workflow_id.clone(),
            status: exec.status,
            result: exec.result.clone(),
            error: exec.error.clone(),
            paused_reason: exec.paused_reason,
            next_step_id: exec.next_step_id.clone(),
            resume_count: exec.resume_count,
        }
    }
}

#[derive(Debug, Clone)]
enum StepFlow {
    Next(Option<String>),
    Finish {
        status: ExecutionStatus,
        result: &'static str,
    },
    Pause {
        reason: PauseReason,
        next: Option<String>,
    },
}

#[derive(Debug, Clone)]
struct StepResult {
    flow: StepFlow,
    output: Value,
    /// Result label of an action step that continues.
    action_result: Option<&'static str>,
    /// Outputs of parallel children, merged at `steps.<child id>`.
    child_outputs: Vec<(String, Value)>,
    /// `false` for a condition that did not match.
    matched: bool,
}

impl StepResult {
    fn new(flow: StepFlow, output: Value) -> Self {
        Self {
            flow,
            output,
            action_result: None,
            child_outputs: Vec::new(),
            matched: true,
        }
    }

    /// Whether a parallel child counts as passed.
    fn passes(&self) -> bool {
        self.matched && matches!(self.flow, StepFlow::Next(_))
    }
}

enum SegmentEnd {
    Finished {
        status: ExecutionStatus,
        result: String,
        context: Value,
    },
    Paused,
    Interrupted(ExecutionStatus),
}

/// Walks workflow step graphs.
#[derive(Clone)]
pub struct WorkflowExecutor {
    store: Arc<dyn ExecutionStore>,
    approvals: Arc<dyn ApprovalStore>,
    context_builder: ContextBuilder,
    evaluator: ConditionEvaluator,
    actions: ActionExecutor,
    config: EngineConfig,
}

impl WorkflowExecutor {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        approvals: Arc<dyn ApprovalStore>,
        context_builder: ContextBuilder,
        actions: ActionExecutor,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            approvals,
            context_builder,
            evaluator: ConditionEvaluator::new(),
            actions,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Persist a pending execution for `workflow` triggered by `event`.
    pub async fn create_execution(
        &self,
        workflow: &Workflow,
        event: &Event,
    ) -> AppResult<WorkflowExecution> {
        let exec = WorkflowExecution::new(
            workflow.id.clone(),
            workflow.version,
            Some(event.id),
            event.payload.clone(),
        );
        self.store.create_execution(&exec).await?;
        debug!(
            execution_id = %exec.id,
            workflow_id = %workflow.id,
            event_type = %event.event_type,
            "Execution created"
        );
        Ok(exec)
    }

    /// Run a pending execution from the workflow's entry step.
    ///
    /// Step failures end the execution as `failed` and are reported through
    /// the summary; `Err` means the store itself failed.
    pub async fn run(
        &self,
        execution_id: Uuid,
        workflow: Arc<Workflow>,
        event: Event,
    ) -> AppResult<ExecutionSummary> {
        let started = self
            .store
            .transition(
                execution_id,
                &[ExecutionStatus::Pending],
                ExecutionStatus::Running,
                ExecutionPatch::default(),
            )
            .await?;
        if started.is_none() {
            return Err(AppError::Conflict(format!(
                "Execution {} is not pending",
                execution_id
            )));
        }
        info!(execution_id = %execution_id, workflow_id = %workflow.id, "Execution started");

        let context = match self
            .context_builder
            .build_context(&event, &workflow.context.load)
            .await
        {
            Ok(context) => context,
            Err(e) => return self.mark_failed(execution_id, e).await,
        };
        self.store.save_context(execution_id, &context).await?;

        let entry = workflow.entry_step_id().map(str::to_string);
        self.run_segment(execution_id, &workflow, context, entry, None)
            .await
    }

    /// Continue a resumed (running) execution.
    pub async fn continue_execution(
        &self,
        exec: WorkflowExecution,
        workflow: Arc<Workflow>,
        point: ResumePoint,
    ) -> AppResult<ExecutionSummary> {
        info!(
            execution_id = %exec.id,
            workflow_id = %workflow.id,
            resume_point = ?point,
            "Continuing execution"
        );
        match point {
            ResumePoint::Step(step_id) => {
                self.run_segment(exec.id, &workflow, exec.context, Some(step_id), exec.result)
                    .await
            }
            ResumePoint::Finish { status, result } => {
                self.finish(exec.id, status, ExecutionPatch::result(result))
                    .await
            }
        }
    }

    /// Fail a live execution with `error`.
    pub async fn mark_failed(
        &self,
        execution_id: Uuid,
        error: AppError,
    ) -> AppResult<ExecutionSummary> {
        error!(execution_id = %execution_id, error = %error, "Execution failed");
        let updated = self
            .store
            .transition(
                execution_id,
                &[
                    ExecutionStatus::Pending,
                    ExecutionStatus::Running,
                    ExecutionStatus::Resuming,
                ],
                ExecutionStatus::Failed,
                ExecutionPatch::error(error.to_string()),
            )
            .await?;
        match updated {
            Some(exec) => Ok(ExecutionSummary::from(&exec)),
            None => self.summary(execution_id).await,
        }
    }

    async fn summary(&self, execution_id: Uuid) -> AppResult<ExecutionSummary> {
        let exec = require_execution(self.store.as_ref(), execution_id).await?;
        Ok(ExecutionSummary::from(&exec))
    }

    async fn finish(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        patch: ExecutionPatch,
    ) -> AppResult<ExecutionSummary> {
        let updated = self
            .store
            .transition(execution_id, &[ExecutionStatus::Running], status, patch)
            .await?;
        match updated {
            Some(exec) => {
                info!(
                    execution_id = %execution_id,
                    status = %exec.status,
                    result = exec.result.as_deref().unwrap_or(""),
                    "Execution finished"
                );
                Ok(ExecutionSummary::from(&exec))
            }
            None => {
                debug!(execution_id = %execution_id, "Execution changed state concurrently");
                self.summary(execution_id).await
            }
        }
    }

    async fn run_segment(
        &self,
        execution_id: Uuid,
        workflow: &Arc<Workflow>,
        context: Value,
        start: Option<String>,
        last_result: Option<String>,
    ) -> AppResult<ExecutionSummary> {
        let limit = workflow.timeout(self.config.execution_timeout);
        let driven = tokio::time::timeout(
            limit,
            self.drive(execution_id, workflow, context, start, last_result),
        )
        .await;

        let end = match driven {
            Ok(Ok(end)) => end,
            Ok(Err(e)) => return self.mark_failed(execution_id, e).await,
            Err(_) => {
                self.abandon_running_steps(execution_id, "execution timed out")
                    .await;
                let e = AppError::Timeout(format!(
                    "execution exceeded {}s",
                    limit.as_secs_f64()
                ));
                return self.mark_failed(execution_id, e).await;
            }
        };

        match end {
            SegmentEnd::Finished {
                status,
                result,
                context,
            } => {
                self.finish(
                    execution_id,
                    status,
                    ExecutionPatch::result(result).with_context(context),
                )
                .await
            }
            SegmentEnd::Paused => self.summary(execution_id).await,
            SegmentEnd::Interrupted(status) => {
                info!(execution_id = %execution_id, status = %status, "Execution interrupted at step boundary");
                self.summary(execution_id).await
            }
        }
    }

    async fn drive(
        &self,
        execution_id: Uuid,
        workflow: &Arc<Workflow>,
        mut context: Value,
        start: Option<String>,
        mut last_result: Option<String>,
    ) -> AppResult<SegmentEnd> {
        let mut current = start;

        while let Some(step_id) = current.take() {
            let status = require_execution(self.store.as_ref(), execution_id)
                .await?
                .status;
            if status != ExecutionStatus::Running {
                return Ok(SegmentEnd::Interrupted(status));
            }

            let step = workflow.find_step(&step_id).ok_or_else(|| {
                AppError::Validation(format!(
                    "Step '{}' not found in workflow '{}'",
                    step_id, workflow.id
                ))
            })?;

            let record = StepExecution::start(
                execution_id,
                &step.id,
                step.step_type(),
                None,
                Some(step_input(step)),
            );
            self.store.create_step_execution(&record).await?;

            let result = self
                .execute_step_with_retry(execution_id, workflow, step, &context, record)
                .await?;
            record_output(&mut context, &step.id, &result);
            if let Some(label) = result.action_result {
                last_result = Some(label.to_string());
            }

            match result.flow {
                StepFlow::Next(next) => {
                    self.store.save_context(execution_id, &context).await?;
                    current = next;
                }
                StepFlow::Finish { status, result } => {
                    return Ok(SegmentEnd::Finished {
                        status,
                        result: result.to_string(),
                        context,
                    });
                }
                StepFlow::Pause { reason, next } => {
                    let info = PauseInfo {
                        reason,
                        paused_step_id: Some(step.id.clone()),
                        next_step_id: next,
                    };
                    pause_execution(
                        self.store.as_ref(),
                        execution_id,
                        info,
                        Some(context),
                        last_result,
                    )
                    .await?;
                    return Ok(SegmentEnd::Paused);
                }
            }
        }

        Ok(SegmentEnd::Finished {
            status: ExecutionStatus::Completed,
            result: last_result.unwrap_or_else(|| "completed".to_string()),
            context,
        })
    }

    /// Run one step with its retry policy and per-attempt timeout, keeping
    /// `record` current.
    fn execute_step_with_retry<'a>(
        &'a self,
        execution_id: Uuid,
        workflow: &'a Arc<Workflow>,
        step: &'a Step,
        context: &'a Value,
        mut record: StepExecution,
    ) -> BoxFuture<'a, AppResult<StepResult>> {
        async move {
            let policy = step.retry.clone().unwrap_or_default();
            let max_attempts = policy.max_attempts.max(1);
            let mut attempt: u32 = 1;

            loop {
                record.attempt = attempt as i32;
                let once = self.execute_step_once(execution_id, workflow, step, context);
                let outcome = match step.timeout_seconds {
                    Some(secs) => tokio::time::timeout(Duration::from_secs(secs), once)
                        .await
                        .unwrap_or_else(|_| {
                            Err(AppError::StepTimeout {
                                step_id: step.id.clone(),
                                after_ms: secs.saturating_mul(1000),
                            })
                        }),
                    None => once.await,
                };

                match outcome {
                    Ok(result) => {
                        let status = match result.flow {
                            StepFlow::Pause { .. } => StepStatus::Paused,
                            _ => StepStatus::Completed,
                        };
                        record.finish(status, Some(result.output.clone()), None);
                        self.store.update_step_execution(&record).await?;
                        return Ok(result);
                    }
                    Err(e) if attempt < max_attempts && e.is_retryable_for(&policy.retry_on) => {
                        let delay = policy.delay_after(attempt);
                        warn!(
                            execution_id = %execution_id,
                            step_id = %step.id,
                            attempt,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Step attempt failed, retrying"
                        );
                        record.error = Some(e.to_string());
                        record.attempt = (attempt + 1) as i32;
                        self.store.update_step_execution(&record).await?;
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(e) => {
                        warn!(
                            execution_id = %execution_id,
                            step_id = %step.id,
                            attempt,
                            error = %e,
                            "Step failed"
                        );
                        record.finish(StepStatus::Failed, None, Some(e.to_string()));
                        let _ = self
                            .store
                            .update_step_execution(&record)
                            .await
                            .log("recording step failure");
                        return Err(e);
                    }
                }
            }
        }
        .boxed()
    }

    fn execute_step_once<'a>(
        &'a self,
        execution_id: Uuid,
        workflow: &'a Arc<Workflow>,
        step: &'a Step,
        context: &'a Value,
    ) -> BoxFuture<'a, AppResult<StepResult>> {
        async move {
            match &step.kind {
                StepKind::Condition {
                    condition,
                    on_true,
                    on_false,
                } => {
                    let matched = match self.evaluator.evaluate(condition, context) {
                        Ok(matched) => matched,
                        Err(AppError::MissingField(field))
                            if workflow.on_missing_field == MissingFieldPolicy::TreatAsFalse =>
                        {
                            debug!(step_id = %step.id, field = %field, "Missing field treated as false");
                            false
                        }
                        Err(e) => return Err(e),
                    };
                    let next = if matched { on_true } else { on_false };
                    let mut result =
                        StepResult::new(StepFlow::Next(next.clone()), json!({"matched": matched}));
                    result.matched = matched;
                    Ok(result)
                }
                StepKind::Action {
                    action,
                    actions,
                    approval,
                    next,
                } => {
                    let outcome = self.actions.execute(*action, actions, context).await?;
                    let mut output = outcome.to_value();
                    match (action, approval) {
                        (ActionKind::Block, Some(requirement)) => {
                            let request = self
                                .request_approval(execution_id, step, requirement, context)
                                .await?;
                            output["approval_id"] = json!(request.id);
                            Ok(StepResult::new(
                                StepFlow::Pause {
                                    reason: PauseReason::ApprovalRequired,
                                    next: next.clone(),
                                },
                                output,
                            ))
                        }
                        (ActionKind::Block, None) => Ok(StepResult::new(
                            StepFlow::Finish {
                                status: ExecutionStatus::Blocked,
                                result: outcome.result,
                            },
                            output,
                        )),
                        _ => {
                            let mut result = StepResult::new(StepFlow::Next(next.clone()), output);
                            result.action_result = Some(outcome.result);
                            Ok(result)
                        }
                    }
                }
                StepKind::Parallel { steps, join, next } => {
                    let (output, child_outputs) = self
                        .run_parallel(execution_id, workflow, step, steps, *join, context)
                        .await?;
                    let mut result = StepResult::new(StepFlow::Next(next.clone()), output);
                    result.child_outputs = child_outputs;
                    Ok(result)
                }
                StepKind::Wait { event, next } => Ok(StepResult::new(
                    StepFlow::Pause {
                        reason: PauseReason::EventWait,
                        next: next.clone(),
                    },
                    json!({"waiting_for": event}),
                )),
            }
        }
        .boxed()
    }

    async fn request_approval(
        &self,
        execution_id: Uuid,
        step: &Step,
        requirement: &ApprovalRequirement,
        context: &Value,
    ) -> AppResult<ApprovalRequest> {
        let now = chrono::Utc::now();
        let entity_id = match requirement.entity_id.as_deref() {
            Some(template) => interpolate_str(template, context)?,
            None => execution_id.to_string(),
        };
        let reason = requirement
            .reason
            .as_deref()
            .map(|r| interpolate_str(r, context))
            .transpose()?;

        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            execution_id,
            step_id: step.id.clone(),
            entity_type: requirement
                .entity_type
                .clone()
                .unwrap_or_else(|| "execution".to_string()),
            entity_id,
            approver_role: requirement.role.clone(),
            reason,
            status: ApprovalStatus::Pending,
            expires_at: requirement
                .timeout_seconds
                .map(|secs| now + chrono::Duration::seconds(secs as i64)),
            created_at: now,
            decided_by: None,
            decided_at: None,
            comment: None,
        };
        self.approvals.create_approval(&request).await?;

        info!(
            execution_id = %execution_id,
            step_id = %step.id,
            approval_id = %request.id,
            role = %request.approver_role,
            "Approval requested"
        );
        Ok(request)
    }

    async fn run_parallel(
        &self,
        execution_id: Uuid,
        workflow: &Arc<Workflow>,
        parent: &Step,
        children: &[Step],
        join: JoinStrategy,
        context: &Value,
    ) -> AppResult<(Value, Vec<(String, Value)>)> {
        let mut records = Vec::with_capacity(children.len());
        for child in children {
            let record = StepExecution::start(
                execution_id,
                &child.id,
                child.step_type(),
                Some(parent.id.clone()),
                Some(step_input(child)),
            );
            self.store.create_step_execution(&record).await?;
            records.push(record);
        }

        let snapshot = Arc::new(context.clone());
        let mut set = JoinSet::new();
        for (index, (child, record)) in children.iter().zip(records.iter()).enumerate() {
            let this = self.clone();
            let workflow = workflow.clone();
            let child = child.clone();
            let snapshot = snapshot.clone();
            let record = record.clone();
            set.spawn(async move {
                let run = this.execute_step_with_retry(execution_id, &workflow, &child, &snapshot, record);
                let outcome = AssertUnwindSafe(run)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(AppError::Panicked(panic_message(panic.as_ref()))));
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<AppResult<StepResult>>> =
            (0..children.len()).map(|_| None).collect();
        let mut winner: Option<usize> = None;

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    let passed = matches!(&outcome, Ok(r) if r.passes());
                    outcomes[index] = Some(outcome);
                    if join == JoinStrategy::Race && passed && winner.is_none() {
                        winner = Some(index);
                        set.abort_all();
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    error!(execution_id = %execution_id, step_id = %parent.id, error = %e, "Parallel child task failed");
                }
            }
        }

        let mut children_json = Map::new();
        let mut child_outputs = Vec::new();
        let mut failures = Vec::new();

        for (index, child) in children.iter().enumerate() {
            let mut record = records[index].clone();
            let entry = match outcomes[index].take() {
                Some(Ok(result)) => {
                    let passed = result.passes();
                    if !passed {
                        failures.push(format!("{}: did not pass", child.id));
                    }
                    child_outputs.push((child.id.clone(), result.output.clone()));
                    json!({"passed": passed, "output": result.output})
                }
                Some(Err(e)) => {
                    if matches!(e, AppError::Panicked(_)) {
                        record.finish(StepStatus::Failed, None, Some(e.to_string()));
                        let _ = self
                            .store
                            .update_step_execution(&record)
                            .await
                            .log("recording panicked parallel child");
                    }
                    failures.push(format!("{}: {}", child.id, e));
                    json!({"passed": false, "error": e.to_string()})
                }
                None => {
                    record.finish(StepStatus::Cancelled, None, Some("cancelled by race".to_string()));
                    let _ = self
                        .store
                        .update_step_execution(&record)
                        .await
                        .log("recording cancelled parallel child");
                    json!({"passed": false, "cancelled": true})
                }
            };
            children_json.insert(child.id.clone(), entry);
        }

        let output = json!({
            "join": join,
            "winner": winner.map(|i| children[i].id.clone()),
            "children": children_json,
        });

        match join {
            JoinStrategy::AllMustPass if !failures.is_empty() => Err(AppError::Action(format!(
                "parallel step '{}' failed: {}",
                parent.id,
                failures.join("; ")
            ))),
            JoinStrategy::Race if winner.is_none() => Err(AppError::Action(format!(
                "parallel step '{}': no child succeeded ({})",
                parent.id,
                failures.join("; ")
            ))),
            _ => Ok((output, child_outputs)),
        }
    }

    /// Mark step records still `running` as failed after a segment is cut short.
    async fn abandon_running_steps(&self, execution_id: Uuid, reason: &str) {
        let Ok(steps) = self
            .store
            .list_step_executions(execution_id)
            .await
            .log("listing steps of timed out execution")
        else {
            return;
        };
        for mut step in steps.into_iter().filter(|s| s.status == StepStatus::Running) {
            step.finish(StepStatus::Failed, None, Some(reason.to_string()));
            let _ = self
                .store
                .update_step_execution(&step)
                .await
                .log("abandoning running step");
        }
    }
}

fn step_input(step: &Step) -> Value {
    json!({
        "type": step.step_type(),
        "definition": serde_json::to_value(&step.kind).ok(),
    })
}

fn record_output(context: &mut Value, step_id: &str, result: &StepResult) {
    let Some(root) = context.as_object_mut() else {
        return;
    };
    let steps = root
        .entry("steps")
        .or_insert_with(|| Value::Object(Map::new()));
    if !steps.is_object() {
        *steps = Value::Object(Map::new());
    }
    if let Some(steps) = steps.as_object_mut() {
        for (child_id, output) in &result.child_outputs {
            steps.insert(child_id.clone(), output.clone());
        }
        steps.insert(step_id.to_string(), result.output.clone());
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
