//! Workflow definitions.
//!
//! - Type definitions for the workflow document
//! - JSON / YAML parsing
//! - Validation

pub mod parser;
pub mod types;

pub use parser::{load_dir, parse_workflow, validate_workflow, RESERVED_CONTEXT_KEYS};
pub use types::{
    ActionKind, ApprovalRequirement, Backoff, Condition, Comparison, JoinStrategy,
    MissingFieldPolicy, Operator, ResourceSpec, RetryOn, RetryPolicy, Step, StepKind, StepType,
    SubAction, Trigger, Workflow,
};
