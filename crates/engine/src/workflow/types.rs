//! Storeflow workflow definition types.
//!
//! A workflow is an immutable, versioned JSON (or YAML) document:
//! - `trigger`: event-type pattern (`order.*`) or manual invocation
//! - `context.load`: ordered enrichment resources
//! - `steps`: graph of condition / action / parallel / wait steps, each with
//!   a stable `id` unique within the workflow

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

fn default_true() -> bool {
    true
}

fn default_version() -> i32 {
    1
}

// ============================================================================
// Workflow
// ============================================================================

/// A deployed workflow definition. The engine only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow identifier.
    pub id: String,

    /// Definition version.
    #[serde(default = "default_version")]
    pub version: i32,

    /// Human readable name.
    #[serde(default)]
    pub name: Option<String>,

    /// Description.
    #[serde(default)]
    pub description: Option<String>,

    /// What starts this workflow.
    pub trigger: Trigger,

    /// Disabled workflows are skipped by event routing.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Context enrichment configuration.
    #[serde(default)]
    pub context: ContextSpec,

    /// Step graph. The first step is the entry unless the trigger names one.
    pub steps: Vec<Step>,

    /// Per-workflow execution deadline, overriding the engine default.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// How a condition over a missing field is treated.
    #[serde(default)]
    pub on_missing_field: MissingFieldPolicy,
}

impl Workflow {
    /// Find a step by id, including children of parallel steps.
    pub fn find_step(&self, step_id: &str) -> Option<&Step> {
        fn find<'a>(steps: &'a [Step], step_id: &str) -> Option<&'a Step> {
            for step in steps {
                if step.id == step_id {
                    return Some(step);
                }
                if let StepKind::Parallel { steps: children, .. } = &step.kind {
                    if let Some(found) = find(children, step_id) {
                        return Some(found);
                    }
                }
            }
            None
        }
        find(&self.steps, step_id)
    }

    /// Whether a step id exists anywhere in the definition.
    pub fn has_step(&self, step_id: &str) -> bool {
        self.find_step(step_id).is_some()
    }

    /// Id of the step execution starts at.
    pub fn entry_step_id(&self) -> Option<&str> {
        self.trigger
            .entry()
            .or_else(|| self.steps.first().map(|s| s.id.as_str()))
    }

    /// All steps, depth first, parallel children included.
    pub fn all_steps(&self) -> Vec<&Step> {
        fn collect<'a>(steps: &'a [Step], out: &mut Vec<&'a Step>) {
            for step in steps {
                out.push(step);
                if let StepKind::Parallel { steps: children, .. } = &step.kind {
                    collect(children, out);
                }
            }
        }
        let mut out = Vec::new();
        collect(&self.steps, &mut out);
        out
    }

    /// Execution deadline for this workflow.
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(default)
    }
}

/// Workflow trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Started by inbound events whose type matches `event`
    /// (exact, or single-level wildcard such as `order.*`).
    Event {
        event: String,
        #[serde(default)]
        entry: Option<String>,
    },
    /// Started only through a direct call.
    Manual {
        #[serde(default)]
        entry: Option<String>,
    },
}

impl Trigger {
    /// Event-type pattern, if this is an event trigger.
    pub fn event_pattern(&self) -> Option<&str> {
        match self {
            Trigger::Event { event, .. } => Some(event),
            Trigger::Manual { .. } => None,
        }
    }

    /// Explicit entry step.
    pub fn entry(&self) -> Option<&str> {
        match self {
            Trigger::Event { entry, .. } | Trigger::Manual { entry } => entry.as_deref(),
        }
    }
}

/// Behavior when a condition references a field absent from the context.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MissingFieldPolicy {
    /// The condition step fails.
    #[default]
    Fail,
    /// The condition evaluates to false.
    TreatAsFalse,
}

// ============================================================================
// Context Enrichment
// ============================================================================

/// Context enrichment configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContextSpec {
    /// Resources loaded in declaration order.
    #[serde(default)]
    pub load: Vec<ResourceSpec>,
}

/// A single enrichment resource, merged at its dot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Dot path, e.g. `order.details`.
    pub resource: String,

    /// A failed required resource aborts context building.
    #[serde(default = "default_true")]
    pub required: bool,

    /// Loader parameters; strings may contain `${...}` tokens.
    #[serde(default)]
    pub params: Option<serde_json::Value>,

    /// Whether the loaded value may be served from the cache.
    #[serde(default = "default_true")]
    pub cache: bool,
}

// ============================================================================
// Steps
// ============================================================================

/// One node of the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Stable identifier, unique within the workflow.
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Step variant.
    #[serde(flatten)]
    pub kind: StepKind,

    /// Retry policy applied to each attempt of this step.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    /// Per-attempt timeout.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl Step {
    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }

    /// Successor references declared by this step.
    pub fn successors(&self) -> Vec<&str> {
        let mut out = Vec::new();
        match &self.kind {
            StepKind::Condition {
                on_true, on_false, ..
            } => {
                out.extend(on_true.as_deref());
                out.extend(on_false.as_deref());
            }
            StepKind::Action { next, approval, .. } => {
                out.extend(next.as_deref());
                if let Some(approval) = approval {
                    out.extend(approval.on_reject.as_deref());
                }
            }
            StepKind::Parallel { next, .. } | StepKind::Wait { next, .. } => {
                out.extend(next.as_deref());
            }
        }
        out
    }
}

/// Tagged step variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Evaluate a predicate and branch.
    Condition {
        condition: Condition,
        #[serde(default)]
        on_true: Option<String>,
        #[serde(default)]
        on_false: Option<String>,
    },
    /// Terminal decision plus side-effecting sub-actions.
    Action {
        action: ActionKind,
        #[serde(default)]
        actions: Vec<SubAction>,
        #[serde(default)]
        approval: Option<ApprovalRequirement>,
        #[serde(default)]
        next: Option<String>,
    },
    /// Concurrent fan-out over child steps.
    Parallel {
        steps: Vec<Step>,
        #[serde(default)]
        join: JoinStrategy,
        #[serde(default)]
        next: Option<String>,
    },
    /// Suspend until the named event arrives.
    Wait {
        event: String,
        #[serde(default)]
        next: Option<String>,
    },
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            StepKind::Condition { .. } => StepType::Condition,
            StepKind::Action { .. } => StepType::Action,
            StepKind::Parallel { .. } => StepType::Parallel,
            StepKind::Wait { .. } => StepType::Wait,
        }
    }
}

/// Step type discriminator, as recorded on step executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Condition,
    Action,
    Parallel,
    Wait,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepType::Condition => "condition",
            StepType::Action => "action",
            StepType::Parallel => "parallel",
            StepType::Wait => "wait",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "condition" => Ok(StepType::Condition),
            "action" => Ok(StepType::Action),
            "parallel" => Ok(StepType::Parallel),
            "wait" => Ok(StepType::Wait),
            other => Err(format!("unknown step type '{}'", other)),
        }
    }
}

/// Terminal action kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Allow,
    Block,
    Execute,
}

impl ActionKind {
    /// Execution result label produced by this action.
    pub fn result_label(&self) -> &'static str {
        match self {
            ActionKind::Allow => "allowed",
            ActionKind::Block => "blocked",
            ActionKind::Execute => "executed",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionKind::Allow => "allow",
            ActionKind::Block => "block",
            ActionKind::Execute => "execute",
        };
        write!(f, "{}", s)
    }
}

/// Approval gate on a block action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequirement {
    /// Role allowed to decide.
    pub role: String,

    /// Approval request expiry.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    #[serde(default)]
    pub reason: Option<String>,

    /// Entity under review (default: `execution`).
    #[serde(default)]
    pub entity_type: Option<String>,

    /// Entity id; may be a `${...}` token (default: the execution id).
    #[serde(default)]
    pub entity_id: Option<String>,

    /// Step to continue at when the request is rejected.
    #[serde(default)]
    pub on_reject: Option<String>,
}

/// Join strategy for parallel steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    /// Any child failure fails the parallel step.
    #[default]
    AllMustPass,
    /// First successful child completes the step.
    Race,
    /// Child failures are ignored.
    BestEffort,
}

// ============================================================================
// Conditions
// ============================================================================

/// Predicate tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    And { and: Vec<Condition> },
    Or { or: Vec<Condition> },
    Not { not: Box<Condition> },
    Compare(Comparison),
}

/// Leaf comparison: `field op value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comparison {
    /// Dot path into the execution context.
    pub field: String,

    pub op: Operator,

    #[serde(default)]
    pub value: serde_json::Value,

    #[serde(skip)]
    compiled: OnceLock<Regex>,
}

impl Comparison {
    /// The `value` pattern of a `regex` comparison, compiled on first use
    /// and kept for the lifetime of the definition.
    pub fn compiled_regex(&self) -> AppResult<&Regex> {
        if let Some(re) = self.compiled.get() {
            return Ok(re);
        }
        let pattern = self.value.as_str().ok_or_else(|| {
            AppError::Validation(format!("'regex' on '{}' requires a string pattern", self.field))
        })?;
        let re = Regex::new(pattern)
            .map_err(|e| AppError::Validation(format!("invalid regex '{}': {}", pattern, e)))?;
        Ok(self.compiled.get_or_init(|| re))
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    #[serde(alias = "ne")]
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Contains,
    Regex,
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operator::Eq => "eq",
            Operator::Neq => "neq",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::In => "in",
            Operator::Contains => "contains",
            Operator::Regex => "regex",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Sub-actions
// ============================================================================

/// Side-effecting sub-action of an action step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubAction {
    Notify(NotifySpec),
    Webhook(HttpRequestSpec),
    HttpRequest(HttpRequestSpec),
    CreateRecord(RecordSpec),
    UpdateRecord(RecordSpec),
    Log(LogSpec),
}

impl SubAction {
    pub fn kind_name(&self) -> &'static str {
        match self {
            SubAction::Notify(_) => "notify",
            SubAction::Webhook(_) => "webhook",
            SubAction::HttpRequest(_) => "http_request",
            SubAction::CreateRecord(_) => "create_record",
            SubAction::UpdateRecord(_) => "update_record",
            SubAction::Log(_) => "log",
        }
    }
}

/// Notification sub-action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySpec {
    pub recipients: Vec<String>,
    pub message: String,
    #[serde(default)]
    pub subject: Option<String>,
    /// Delivery channel hint (email, slack, ...).
    #[serde(default)]
    pub channel: Option<String>,
}

fn default_method() -> String {
    "POST".to_string()
}

/// Outbound HTTP sub-action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequestSpec {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Record create/update delegated to a service integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSpec {
    /// Target service, e.g. `crm`.
    pub service: String,
    /// Entity type, e.g. `ticket`.
    pub entity: String,
    /// Record id (required for updates).
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Structured log sub-action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSpec {
    pub message: String,
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub fields: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

// ============================================================================
// Retry
// ============================================================================

/// Step retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: Backoff,

    /// Base delay between attempts.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    /// Upper bound on a single delay.
    #[serde(default)]
    pub max_delay_ms: Option<u64>,

    /// Error classes to retry; empty retries any retryable error.
    #[serde(default)]
    pub retry_on: Vec<RetryOn>,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_delay_ms() -> u64 {
    500
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
            delay_ms: default_delay_ms(),
            max_delay_ms: None,
            retry_on: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base = self.delay_ms;
        let ms = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Linear => base.saturating_mul(attempt as u64),
            Backoff::Exponential => {
                let shift = attempt.saturating_sub(1).min(20);
                base.saturating_mul(1u64 << shift)
            }
        };
        let ms = match self.max_delay_ms {
            Some(cap) => ms.min(cap),
            None => ms,
        };
        Duration::from_millis(ms)
    }
}

/// Backoff policy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

/// Retryable error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOn {
    Timeout,
    #[serde(alias = "5xx")]
    ServerError,
    Network,
    Any,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_kinds_deserialize() {
        let steps: Vec<Step> = serde_json::from_value(json!([
            {
                "id": "check",
                "type": "condition",
                "condition": {"field": "order.total", "op": "gte", "value": 10000},
                "on_true": "review",
                "on_false": "approve"
            },
            {
                "id": "review",
                "type": "action",
                "action": "block",
                "approval": {"role": "manager"},
                "next": "approve"
            },
            {
                "id": "fanout",
                "type": "parallel",
                "join": "race",
                "steps": [{"id": "a", "type": "action", "action": "execute"}]
            },
            {"id": "hold", "type": "wait", "event": "payment.captured"}
        ]))
        .unwrap();

        assert_eq!(steps[0].step_type(), StepType::Condition);
        assert_eq!(steps[0].successors(), vec!["review", "approve"]);
        match &steps[1].kind {
            StepKind::Action {
                action, approval, ..
            } => {
                assert_eq!(*action, ActionKind::Block);
                assert_eq!(approval.as_ref().unwrap().role, "manager");
            }
            other => panic!("unexpected kind {:?}", other),
        }
        match &steps[2].kind {
            StepKind::Parallel { join, steps, .. } => {
                assert_eq!(*join, JoinStrategy::Race);
                assert_eq!(steps.len(), 1);
            }
            other => panic!("unexpected kind {:?}", other),
        }
        assert_eq!(steps[3].step_type(), StepType::Wait);
    }

    #[test]
    fn test_condition_tree_deserialize() {
        let condition: Condition = serde_json::from_value(json!({
            "and": [
                {"field": "cart.items", "op": "contains", "value": "gift-card"},
                {"not": {"field": "customer.tier", "op": "eq", "value": "vip"}},
                {"or": [
                    {"field": "order.total", "op": "gt", "value": 100},
                    {"field": "order.country", "op": "in", "value": ["US", "CA"]}
                ]}
            ]
        }))
        .unwrap();

        match condition {
            Condition::And { and } => {
                assert_eq!(and.len(), 3);
                assert!(matches!(and[0], Condition::Compare(_)));
                assert!(matches!(and[1], Condition::Not { .. }));
                assert!(matches!(and[2], Condition::Or { .. }));
            }
            other => panic!("unexpected condition {:?}", other),
        }
    }

    #[test]
    fn test_sub_actions_deserialize() {
        let actions: Vec<SubAction> = serde_json::from_value(json!([
            {"type": "notify", "recipients": ["ops@example.com"], "message": "hi"},
            {"type": "webhook", "url": "https://hooks.example.com/x"},
            {"type": "http_request", "url": "https://api.example.com", "method": "GET"},
            {"type": "create_record", "service": "crm", "entity": "ticket"},
            {"type": "log", "message": "done", "level": "warn"}
        ]))
        .unwrap();

        assert_eq!(actions[0].kind_name(), "notify");
        match &actions[1] {
            SubAction::Webhook(spec) => assert_eq!(spec.method, "POST"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(actions[2].kind_name(), "http_request");
        assert_eq!(actions[4].kind_name(), "log");
    }

    #[test]
    fn test_retry_delays() {
        let mut policy = RetryPolicy {
            max_attempts: 4,
            delay_ms: 100,
            ..Default::default()
        };
        assert_eq!(policy.delay_after(3), Duration::from_millis(100));

        policy.backoff = Backoff::Linear;
        assert_eq!(policy.delay_after(3), Duration::from_millis(300));

        policy.backoff = Backoff::Exponential;
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));

        policy.max_delay_ms = Some(250);
        assert_eq!(policy.delay_after(3), Duration::from_millis(250));
    }

    #[test]
    fn test_find_step_in_parallel_children() {
        let workflow: Workflow = serde_json::from_value(json!({
            "id": "wf",
            "trigger": {"type": "manual"},
            "steps": [{
                "id": "fanout",
                "type": "parallel",
                "steps": [{"id": "child", "type": "action", "action": "allow"}]
            }]
        }))
        .unwrap();

        assert!(workflow.has_step("child"));
        assert_eq!(workflow.entry_step_id(), Some("fanout"));
        assert_eq!(workflow.all_steps().len(), 2);
        assert_eq!(workflow.version, 1);
        assert!(workflow.enabled);
    }
}
