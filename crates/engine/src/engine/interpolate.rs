//! `${path}` interpolation over the execution context.
//!
//! Tokens resolve through [`resolve_path`], so `${context.order.id}`,
//! `${order.id}` and `${steps.check.output}` all work. Unresolved tokens
//! are an error, never an empty string.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::engine::path::resolve_path;
use crate::error::{AppError, AppResult};

fn token_regex() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| Regex::new(r"\$\{\s*([A-Za-z0-9_.\-]+)\s*\}").expect("valid token pattern"))
}

/// Interpolate every token in `template`, rendering non-string values as JSON.
pub fn interpolate_str(template: &str, context: &Value) -> AppResult<String> {
    let re = token_regex();
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in re.captures_iter(template) {
        let (Some(whole), Some(path)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = lookup(path.as_str(), context)?;
        out.push_str(&template[last..whole.start()]);
        match value {
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
        last = whole.end();
    }
    out.push_str(&template[last..]);

    Ok(out)
}

/// Interpolate strings anywhere inside a JSON value.
///
/// A string that is exactly one token is replaced by the typed value.
pub fn interpolate_value(value: &Value, context: &Value) -> AppResult<Value> {
    match value {
        Value::String(s) => {
            if let Some(path) = sole_token(s) {
                return lookup(path, context).cloned();
            }
            Ok(Value::String(interpolate_str(s, context)?))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| interpolate_value(item, context))
            .collect::<AppResult<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), interpolate_value(v, context)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn sole_token(s: &str) -> Option<&str> {
    let caps = token_regex().captures(s)?;
    let whole = caps.get(0)?;
    if whole.start() == 0 && whole.end() == s.len() {
        caps.get(1).map(|m| m.as_str())
    } else {
        None
    }
}

fn lookup<'a>(path: &str, context: &'a Value) -> AppResult<&'a Value> {
    resolve_path(context, path)
        .map_err(|_| AppError::Interpolation(format!("unresolved token '${{{}}}'", path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_interpolate_str() {
        let ctx = json!({"event": {"order": {"id": "o-9", "total": 120}}});
        assert_eq!(
            interpolate_str("Order ${context.order.id} totals ${order.total}", &ctx).unwrap(),
            "Order o-9 totals 120"
        );
    }

    #[test]
    fn test_unresolved_token_errors() {
        let err = interpolate_str("hi ${customer.name}", &json!({"event": {}})).unwrap_err();
        assert_eq!(err.code(), "interpolation_error");
    }

    #[test]
    fn test_sole_token_keeps_type() {
        let ctx = json!({"event": {"order": {"total": 120, "items": [1, 2]}}});
        let body = json!({"total": "${order.total}", "items": "${order.items}", "label": "t=${order.total}"});
        assert_eq!(
            interpolate_value(&body, &ctx).unwrap(),
            json!({"total": 120, "items": [1, 2], "label": "t=120"})
        );
    }
}
