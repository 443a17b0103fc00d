//! Execution context construction.
//!
//! The context is a JSON object with engine-owned keys:
//! - `event`: trigger payload
//! - `trigger`: event type, source, id and receipt time
//! - `steps`: step outputs by step id
//! - `resume`: merged resume data (written on resume)
//!
//! Enrichment resources are merged at their dot paths in declaration order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::db::models::Event;
use crate::engine::interpolate::interpolate_value;
use crate::engine::path::set_path;
use crate::error::{AppError, AppResult};
use crate::workflow::parser::RESERVED_CONTEXT_KEYS;
use crate::workflow::types::ResourceSpec;

/// Loads one enrichment resource.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    /// `spec.params` arrive already interpolated.
    async fn load(&self, spec: &ResourceSpec, context: &Value) -> AppResult<Value>;
}

/// Cache in front of the resource loader.
#[async_trait]
pub trait ContextCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;
    async fn put(&self, key: &str, value: Value);
}

/// Fails every load. Optional resources merge as `null`.
#[derive(Debug, Default)]
pub struct UnconfiguredResourceLoader;

#[async_trait]
impl ResourceLoader for UnconfiguredResourceLoader {
    async fn load(&self, spec: &ResourceSpec, _context: &Value) -> AppResult<Value> {
        Err(AppError::Resource(format!(
            "no resource loader configured for '{}'",
            spec.resource
        )))
    }
}

/// Serves fixed values by resource path.
#[derive(Debug, Default)]
pub struct StaticResourceLoader {
    values: HashMap<String, Value>,
}

impl StaticResourceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, resource: impl Into<String>, value: Value) -> Self {
        self.values.insert(resource.into(), value);
        self
    }
}

#[async_trait]
impl ResourceLoader for StaticResourceLoader {
    async fn load(&self, spec: &ResourceSpec, _context: &Value) -> AppResult<Value> {
        self.values
            .get(&spec.resource)
            .cloned()
            .ok_or_else(|| AppError::Resource(format!("unknown resource '{}'", spec.resource)))
    }
}

/// TTL cache held in process memory.
pub struct MemoryCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, (Instant, Value)>>,
}

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of entries held, expired ones included until the next `put`.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl ContextCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Value> {
        let guard = self.entries.read().await;
        guard
            .get(key)
            .filter(|(stored, _)| stored.elapsed() < self.ttl)
            .map(|(_, value)| value.clone())
    }

    /// Stores `value` and evicts every expired entry.
    async fn put(&self, key: &str, value: Value) {
        let ttl = self.ttl;
        let mut guard = self.entries.write().await;
        guard.retain(|_, (stored, _)| stored.elapsed() < ttl);
        guard.insert(key.to_string(), (Instant::now(), value));
    }
}

/// Seeds and enriches execution contexts.
#[derive(Clone)]
pub struct ContextBuilder {
    loader: Arc<dyn ResourceLoader>,
    cache: Arc<dyn ContextCache>,
}

impl ContextBuilder {
    pub fn new(loader: Arc<dyn ResourceLoader>, cache: Arc<dyn ContextCache>) -> Self {
        Self { loader, cache }
    }

    /// Seed context for `event` without enrichment.
    pub fn seed(event: &Event) -> Value {
        json!({
            "event": event.payload,
            "trigger": {
                "type": event.event_type,
                "source": event.source,
                "event_id": event.id,
                "received_at": event.received_at,
            },
            "steps": {},
        })
    }

    /// Seed from `event` and merge every resource in `load`.
    pub async fn build_context(&self, event: &Event, load: &[ResourceSpec]) -> AppResult<Value> {
        let mut context = Self::seed(event);

        for spec in load {
            let first = spec.resource.split('.').next().unwrap_or_default();
            if RESERVED_CONTEXT_KEYS.contains(&first) {
                return Err(AppError::Validation(format!(
                    "Enrichment resource '{}' targets reserved context key '{}'",
                    spec.resource, first
                )));
            }

            let value = match self.load_one(spec, &context).await {
                Ok(value) => value,
                Err(e) if spec.required => {
                    return Err(AppError::Resource(format!("{}: {}", spec.resource, e)));
                }
                Err(e) => {
                    tracing::warn!(
                        resource = %spec.resource,
                        error = %e,
                        "Optional resource failed to load, merging null"
                    );
                    Value::Null
                }
            };
            set_path(&mut context, &spec.resource, value);
        }

        Ok(context)
    }

    async fn load_one(&self, spec: &ResourceSpec, context: &Value) -> AppResult<Value> {
        let params = spec
            .params
            .as_ref()
            .map(|p| interpolate_value(p, context))
            .transpose()?;
        let resolved = ResourceSpec {
            params,
            ..spec.clone()
        };

        let key = format!(
            "{}:{}",
            resolved.resource,
            resolved.params.as_ref().map(Value::to_string).unwrap_or_default()
        );
        if resolved.cache {
            if let Some(hit) = self.cache.get(&key).await {
                tracing::debug!(resource = %resolved.resource, "Context cache hit");
                return Ok(hit);
            }
        }

        let value = self.loader.load(&resolved, context).await?;
        if resolved.cache {
            self.cache.put(&key, value.clone()).await;
        }
        Ok(value)
    }
}
