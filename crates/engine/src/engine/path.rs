//! Dot-path access into the execution context.
//!
//! Paths look like `order.total` or `cart.items.0.sku`. A leading
//! `context.` is accepted and ignored. A path that does not resolve from the
//! context root is retried under `event.`, so payload fields stay
//! addressable without the prefix even when enrichment shares their first
//! segment. Reserved keys never fall back.

use serde_json::{Map, Value};

use crate::error::{AppError, AppResult};
use crate::workflow::parser::RESERVED_CONTEXT_KEYS;

/// Resolve `path` against `context`.
///
/// A key present with a `null` value resolves to `Value::Null`; an absent
/// key is `AppError::MissingField`.
pub fn resolve_path<'a>(context: &'a Value, path: &str) -> AppResult<&'a Value> {
    let path = path.strip_prefix("context.").unwrap_or(path);
    if path.is_empty() {
        return Err(AppError::MissingField(path.to_string()));
    }

    if let Some(found) = walk(context, path) {
        return Ok(found);
    }

    let first = path.split('.').next().unwrap_or_default();
    if !RESERVED_CONTEXT_KEYS.contains(&first) {
        if let Some(found) = context.get("event").and_then(|event| walk(event, path)) {
            return Ok(found);
        }
    }

    Err(AppError::MissingField(path.to_string()))
}

fn walk<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Write `value` at `path`, creating intermediate objects.
///
/// Non-object intermediates are replaced.
pub fn set_path(context: &mut Value, path: &str, value: Value) {
    let path = path.strip_prefix("context.").unwrap_or(path);
    let mut current = context;
    let mut segments = path.split('.').peekable();

    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_nested_and_indexed() {
        let ctx = json!({"event": {"cart": {"items": [{"sku": "A1"}]}}, "customer": {"tier": "vip"}});
        assert_eq!(resolve_path(&ctx, "customer.tier").unwrap(), "vip");
        assert_eq!(resolve_path(&ctx, "event.cart.items.0.sku").unwrap(), "A1");
        assert_eq!(resolve_path(&ctx, "context.customer.tier").unwrap(), "vip");
    }

    #[test]
    fn test_bare_payload_paths_fall_back_to_event() {
        let ctx = json!({"event": {"order": {"total": 15000}}});
        assert_eq!(resolve_path(&ctx, "order.total").unwrap(), 15000);
    }

    #[test]
    fn test_enrichment_sharing_a_segment_does_not_hide_payload() {
        let ctx = json!({
            "order": {"details": {"sku": "A"}},
            "event": {"order": {"total": 15000}}
        });
        assert_eq!(resolve_path(&ctx, "order.total").unwrap(), 15000);
        assert_eq!(resolve_path(&ctx, "order.details.sku").unwrap(), "A");
        assert!(matches!(
            resolve_path(&ctx, "order.missing"),
            Err(AppError::MissingField(_))
        ));
    }

    #[test]
    fn test_reserved_keys_do_not_fall_back() {
        let ctx = json!({"steps": {}, "event": {"steps": {"s": 1}}});
        assert!(resolve_path(&ctx, "steps.s").is_err());
    }

    #[test]
    fn test_null_is_present() {
        let ctx = json!({"profile": null});
        assert_eq!(resolve_path(&ctx, "profile").unwrap(), &Value::Null);
        assert!(resolve_path(&ctx, "profile.name").is_err());
    }

    #[test]
    fn test_set_path_creates_intermediates() {
        let mut ctx = json!({"order": 5});
        set_path(&mut ctx, "order.details.status", json!("paid"));
        set_path(&mut ctx, "customer", json!({"id": 1}));
        assert_eq!(ctx, json!({"order": {"details": {"status": "paid"}}, "customer": {"id": 1}}));
    }
}
