//! Workflow definition parser.
//!
//! Definitions are JSON or YAML documents. Every definition is validated
//! before the engine sees it:
//! - step ids unique across the whole graph, parallel children included
//! - every successor reference names an existing step
//! - approval gates and waits never sit inside a parallel step
//! - regex and `in` comparisons are well formed
//! - enrichment never targets reserved context keys

use std::collections::HashSet;
use std::path::Path;

use crate::error::{AppError, AppResult};
use crate::workflow::types::{ActionKind, Condition, Operator, Step, StepKind, Workflow};

/// Top-level context keys owned by the engine.
pub const RESERVED_CONTEXT_KEYS: [&str; 4] = ["event", "trigger", "steps", "resume"];

/// Parse a JSON or YAML string into a validated Workflow.
pub fn parse_workflow(content: &str) -> AppResult<Workflow> {
    let workflow: Workflow = if content.trim_start().starts_with('{') {
        serde_json::from_str(content).map_err(|e| AppError::Parse(e.to_string()))?
    } else {
        serde_yaml::from_str(content)?
    };

    validate_workflow(&workflow)?;

    Ok(workflow)
}

/// Validate a parsed workflow.
pub fn validate_workflow(workflow: &Workflow) -> AppResult<()> {
    if workflow.id.trim().is_empty() {
        return Err(AppError::Validation("Workflow id must not be empty".to_string()));
    }

    if workflow.steps.is_empty() {
        return Err(AppError::Validation(format!(
            "Workflow '{}' must have at least one step",
            workflow.id
        )));
    }

    if let Some(pattern) = workflow.trigger.event_pattern() {
        validate_event_pattern(pattern, &workflow.id)?;
    }

    // Duplicate ids, including parallel children
    let mut seen = HashSet::new();
    for step in workflow.all_steps() {
        if step.id.trim().is_empty() {
            return Err(AppError::Validation(format!(
                "Workflow '{}' has a step with an empty id",
                workflow.id
            )));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(AppError::Validation(format!(
                "Duplicate step id: {}",
                step.id
            )));
        }
    }

    if let Some(entry) = workflow.trigger.entry() {
        if !seen.contains(entry) {
            return Err(AppError::Validation(format!(
                "Workflow '{}': trigger entry references unknown step '{}'",
                workflow.id, entry
            )));
        }
    }

    for step in workflow.all_steps() {
        for successor in step.successors() {
            if !seen.contains(successor) {
                return Err(AppError::Validation(format!(
                    "Step '{}' references unknown step '{}'",
                    step.id, successor
                )));
            }
        }
        validate_step(step)?;
    }

    for resource in &workflow.context.load {
        validate_resource_path(&resource.resource)?;
    }

    Ok(())
}

fn validate_event_pattern(pattern: &str, workflow_id: &str) -> AppResult<()> {
    let empty_segment = pattern.split('.').any(|segment| segment.is_empty());
    if pattern.trim().is_empty() || empty_segment {
        return Err(AppError::Validation(format!(
            "Workflow '{}': invalid trigger event pattern '{}'",
            workflow_id, pattern
        )));
    }
    Ok(())
}

fn validate_step(step: &Step) -> AppResult<()> {
    if let Some(ref retry) = step.retry {
        if retry.max_attempts == 0 {
            return Err(AppError::Validation(format!(
                "Step '{}': retry.max_attempts must be at least 1",
                step.id
            )));
        }
    }

    match &step.kind {
        StepKind::Condition { condition, .. } => validate_condition(condition, &step.id),
        StepKind::Parallel { steps, .. } => {
            if steps.is_empty() {
                return Err(AppError::Validation(format!(
                    "Step '{}': parallel step must have at least one child",
                    step.id
                )));
            }
            for child in steps {
                validate_parallel_child(child, &step.id)?;
            }
            Ok(())
        }
        StepKind::Action {
            action,
            approval: Some(_),
            ..
        } if *action != ActionKind::Block => Err(AppError::Validation(format!(
            "Step '{}': approval is only valid on block actions",
            step.id
        ))),
        StepKind::Wait { event, .. } if event.trim().is_empty() => Err(AppError::Validation(
            format!("Step '{}': wait step must name an event", step.id),
        )),
        _ => Ok(()),
    }
}

/// Parallel children cannot suspend the execution.
fn validate_parallel_child(child: &Step, parent_id: &str) -> AppResult<()> {
    match &child.kind {
        StepKind::Action {
            approval: Some(_), ..
        } => Err(AppError::Validation(format!(
            "Step '{}': approval-gated step '{}' cannot run inside a parallel step",
            parent_id, child.id
        ))),
        StepKind::Wait { .. } => Err(AppError::Validation(format!(
            "Step '{}': wait step '{}' cannot run inside a parallel step",
            parent_id, child.id
        ))),
        StepKind::Parallel { steps, .. } => {
            for grandchild in steps {
                validate_parallel_child(grandchild, &child.id)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn validate_condition(condition: &Condition, step_id: &str) -> AppResult<()> {
    match condition {
        Condition::And { and: items } | Condition::Or { or: items } => {
            if items.is_empty() {
                return Err(AppError::Validation(format!(
                    "Step '{}': logical condition must have at least one operand",
                    step_id
                )));
            }
            for item in items {
                validate_condition(item, step_id)?;
            }
            Ok(())
        }
        Condition::Not { not } => validate_condition(not, step_id),
        Condition::Compare(cmp) => {
            if cmp.field.trim().is_empty() {
                return Err(AppError::Validation(format!(
                    "Step '{}': comparison field must not be empty",
                    step_id
                )));
            }
            match cmp.op {
                Operator::In if !cmp.value.is_array() => Err(AppError::Validation(format!(
                    "Step '{}': 'in' on '{}' requires a list value",
                    step_id, cmp.field
                ))),
                Operator::Regex => cmp.compiled_regex().map(|_| ()).map_err(|e| match e {
                    AppError::Validation(msg) => {
                        AppError::Validation(format!("Step '{}': {}", step_id, msg))
                    }
                    other => other,
                }),
                _ => Ok(()),
            }
        }
    }
}

fn validate_resource_path(path: &str) -> AppResult<()> {
    let first = path.split('.').next().unwrap_or_default();
    if path.trim().is_empty() || path.split('.').any(|s| s.is_empty()) {
        return Err(AppError::Validation(format!(
            "Invalid enrichment resource path '{}'",
            path
        )));
    }
    if RESERVED_CONTEXT_KEYS.contains(&first) {
        return Err(AppError::Validation(format!(
            "Enrichment resource '{}' targets reserved context key '{}'",
            path, first
        )));
    }
    Ok(())
}

/// Load and validate every `.json`, `.yaml` and `.yml` definition in a directory.
///
/// Files are read in name order; a duplicate workflow id is rejected.
pub fn load_dir(dir: &Path) -> AppResult<Vec<Workflow>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        AppError::Config(format!("Cannot read workflows dir {}: {}", dir.display(), e))
    })?;

    let mut paths: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("json") | Some("yaml") | Some("yml")
            )
        })
        .collect();
    paths.sort();

    let mut workflows: Vec<Workflow> = Vec::with_capacity(paths.len());
    for path in paths {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            AppError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let workflow = parse_workflow(&content).map_err(|e| {
            AppError::Validation(format!("{}: {}", path.display(), e))
        })?;
        if workflows.iter().any(|w| w.id == workflow.id) {
            return Err(AppError::Validation(format!(
                "Duplicate workflow id '{}' in {}",
                workflow.id,
                path.display()
            )));
        }
        tracing::debug!(workflow_id = %workflow.id, path = %path.display(), "Loaded workflow");
        workflows.push(workflow);
    }

    Ok(workflows)
}
