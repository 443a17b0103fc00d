//! Condition evaluation.
//!
//! Pure function of (condition tree, context). Missing fields are errors,
//! never a silent `false`; the executor applies the workflow's
//! `on_missing_field` policy on top.

use std::cmp::Ordering;

use serde_json::Value;

use crate::engine::path::resolve_path;
use crate::error::{AppError, AppResult};
use crate::workflow::types::{Comparison, Condition, Operator};

/// Evaluates condition trees against an execution context.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate a condition tree. `and`/`or` short-circuit left to right.
    pub fn evaluate(&self, condition: &Condition, context: &Value) -> AppResult<bool> {
        match condition {
            Condition::And { and } => {
                for child in and {
                    if !self.evaluate(child, context)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Or { or } => {
                for child in or {
                    if self.evaluate(child, context)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not { not } => Ok(!self.evaluate(not, context)?),
            Condition::Compare(cmp) => self.compare(cmp, context),
        }
    }

    fn compare(&self, cmp: &Comparison, context: &Value) -> AppResult<bool> {
        let actual = resolve_path(context, &cmp.field)?;
        let expected = &cmp.value;

        match cmp.op {
            Operator::Eq => strict_eq(cmp.op, actual, expected),
            Operator::Neq => strict_eq(cmp.op, actual, expected).map(|eq| !eq),
            Operator::Gt => numeric_cmp(cmp.op, actual, expected).map(|o| o == Ordering::Greater),
            Operator::Gte => numeric_cmp(cmp.op, actual, expected).map(|o| o != Ordering::Less),
            Operator::Lt => numeric_cmp(cmp.op, actual, expected).map(|o| o == Ordering::Less),
            Operator::Lte => numeric_cmp(cmp.op, actual, expected).map(|o| o != Ordering::Greater),
            Operator::In => match expected {
                Value::Array(items) => Ok(items.iter().any(|item| loose_eq(actual, item))),
                other => Err(type_mismatch(
                    cmp.op,
                    format!("expected a list value, got {}", type_name(other)),
                )),
            },
            Operator::Contains => match (actual, expected) {
                (Value::Array(items), _) => Ok(items.iter().any(|item| loose_eq(item, expected))),
                (Value::String(haystack), Value::String(needle)) => {
                    Ok(haystack.contains(needle.as_str()))
                }
                (a, b) => Err(type_mismatch(
                    cmp.op,
                    format!("cannot check {} contains {}", type_name(a), type_name(b)),
                )),
            },
            Operator::Regex => {
                let re = cmp.compiled_regex()?;
                match actual {
                    Value::String(s) => Ok(re.is_match(s)),
                    other => Err(type_mismatch(
                        cmp.op,
                        format!("regex needs a string field, got {}", type_name(other)),
                    )),
                }
            }
        }
    }
}

/// Type-strict equality. Numbers compare by value (`1 == 1.0`); `null`
/// compares unequal to any non-null value.
fn strict_eq(op: Operator, a: &Value, b: &Value) -> AppResult<bool> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => Ok(a.is_null() && b.is_null()),
        (Value::Number(_), Value::Number(_)) => Ok(loose_eq(a, b)),
        (Value::String(x), Value::String(y)) => Ok(x == y),
        (Value::Bool(x), Value::Bool(y)) => Ok(x == y),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => Ok(a == b),
        _ => Err(type_mismatch(
            op,
            format!("cannot compare {} with {}", type_name(a), type_name(b)),
        )),
    }
}

/// JSON equality with numeric normalization.
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn numeric_cmp(op: Operator, a: &Value, b: &Value) -> AppResult<Ordering> {
    let x = as_number(a).ok_or_else(|| {
        type_mismatch(op, format!("left operand is {}, not numeric", type_name(a)))
    })?;
    let y = as_number(b).ok_or_else(|| {
        type_mismatch(op, format!("right operand is {}, not numeric", type_name(b)))
    })?;
    x.partial_cmp(&y)
        .ok_or_else(|| type_mismatch(op, "operands are not comparable".to_string()))
}

/// Numbers, and strings that parse as numbers.
fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn type_mismatch(op: Operator, detail: String) -> AppError {
    AppError::TypeMismatch {
        op: op.to_string(),
        detail,
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(v: Value) -> Condition {
        serde_json::from_value(v).unwrap()
    }

    fn eval(c: Value, ctx: Value) -> AppResult<bool> {
        ConditionEvaluator::new().evaluate(&cond(c), &ctx)
    }

    #[test]
    fn test_gte_is_reflexive() {
        for x in [json!(0), json!(15000), json!(-3.5), json!("42")] {
            let ctx = json!({"event": {"x": x.clone()}});
            assert!(eval(json!({"field": "x", "op": "gte", "value": x}), ctx).unwrap());
        }
    }

    #[test]
    fn test_numeric_coercion() {
        let ctx = json!({"event": {"order": {"total": "15000"}}});
        assert!(eval(json!({"field": "order.total", "op": "gt", "value": 10000}), ctx.clone()).unwrap());
        assert!(!eval(json!({"field": "order.total", "op": "lt", "value": "9999.5"}), ctx).unwrap());
    }

    #[test]
    fn test_numeric_type_error() {
        let ctx = json!({"event": {"order": {"total": true}}});
        let err = eval(json!({"field": "order.total", "op": "gt", "value": 1}), ctx).unwrap_err();
        assert_eq!(err.code(), "type_mismatch");
    }

    #[test]
    fn test_eq_is_type_strict() {
        let ctx = json!({"event": {"qty": 1, "sku": "1"}});
        assert!(eval(json!({"field": "qty", "op": "eq", "value": 1.0}), ctx.clone()).unwrap());
        let err = eval(json!({"field": "sku", "op": "eq", "value": 1}), ctx.clone()).unwrap_err();
        assert!(matches!(err, AppError::TypeMismatch { .. }));
        let err = eval(json!({"field": "qty", "op": "neq", "value": "1"}), ctx).unwrap_err();
        assert!(matches!(err, AppError::TypeMismatch { .. }));
    }

    #[test]
    fn test_null_equality() {
        let ctx = json!({"profile": null});
        assert!(!eval(json!({"field": "profile", "op": "eq", "value": "vip"}), ctx.clone()).unwrap());
        assert!(eval(json!({"field": "profile", "op": "eq", "value": null}), ctx).unwrap());
    }

    #[test]
    fn test_in_and_contains() {
        let ctx = json!({"event": {"country": "CA", "tags": ["gift", "rush"], "note": "please gift wrap"}});
        assert!(eval(json!({"field": "country", "op": "in", "value": ["US", "CA"]}), ctx.clone()).unwrap());
        assert!(eval(json!({"field": "tags", "op": "contains", "value": "rush"}), ctx.clone()).unwrap());
        assert!(eval(json!({"field": "note", "op": "contains", "value": "gift"}), ctx.clone()).unwrap());
        assert!(eval(json!({"field": "country", "op": "contains", "value": 1}), ctx).is_err());
    }

    #[test]
    fn test_regex() {
        let ctx = json!({"event": {"email": "ops@example.com"}});
        assert!(eval(json!({"field": "email", "op": "regex", "value": "@example\\.com$"}), ctx.clone()).unwrap());
        let err = eval(json!({"field": "email", "op": "regex", "value": "("}), ctx).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_regex_compiles_once_per_comparison() {
        let cmp: Comparison =
            serde_json::from_value(json!({"field": "sku", "op": "regex", "value": "^SKU-\\d+$"})).unwrap();
        let condition = Condition::Compare(cmp);
        let evaluator = ConditionEvaluator::new();
        for sku in ["SKU-1", "SKU-22", "sku-3"] {
            let ctx = json!({"event": {"sku": sku}});
            assert_eq!(evaluator.evaluate(&condition, &ctx).unwrap(), sku.starts_with("SKU"));
        }

        let Condition::Compare(cmp) = &condition else {
            unreachable!()
        };
        let first = cmp.compiled_regex().unwrap();
        assert!(std::ptr::eq(first, cmp.compiled_regex().unwrap()));
    }

    #[test]
    fn test_missing_field_is_error() {
        let err = eval(json!({"field": "order.total", "op": "gt", "value": 1}), json!({"event": {}})).unwrap_err();
        assert!(matches!(err, AppError::MissingField(_)));
    }

    #[test]
    fn test_logical_composition_short_circuits() {
        let ctx = json!({"event": {"a": 1}});
        // Second operand would be a missing-field error if evaluated.
        assert!(!eval(
            json!({"and": [{"field": "a", "op": "eq", "value": 2}, {"field": "zzz", "op": "eq", "value": 1}]}),
            ctx.clone()
        )
        .unwrap());
        assert!(eval(
            json!({"or": [{"field": "a", "op": "eq", "value": 1}, {"field": "zzz", "op": "eq", "value": 1}]}),
            ctx.clone()
        )
        .unwrap());
        assert!(eval(json!({"not": {"field": "a", "op": "eq", "value": 2}}), ctx).unwrap());
    }
}
