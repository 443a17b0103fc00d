//! Workflow definition store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::AppResult;
use crate::workflow::{load_dir, validate_workflow, Workflow};

/// Read access to deployed workflow definitions.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Enabled workflows in id order.
    async fn list_enabled(&self) -> AppResult<Vec<Arc<Workflow>>>;

    /// Any workflow by id, enabled or not.
    async fn get(&self, workflow_id: &str) -> AppResult<Option<Arc<Workflow>>>;
}

#[derive(Default)]
pub struct MemoryWorkflowStore {
    workflows: RwLock<HashMap<String, Arc<Workflow>>>,
}

impl MemoryWorkflowStore {
    /// Build from already-parsed definitions; each is validated.
    pub fn new(workflows: Vec<Workflow>) -> AppResult<Self> {
        let mut map = HashMap::with_capacity(workflows.len());
        for workflow in workflows {
            validate_workflow(&workflow)?;
            map.insert(workflow.id.clone(), Arc::new(workflow));
        }
        Ok(Self {
            workflows: RwLock::new(map),
        })
    }

    /// Load every definition in `dir`.
    pub fn from_dir(dir: &Path) -> AppResult<Self> {
        Self::new(load_dir(dir)?)
    }

    /// Deploy or replace a definition.
    pub async fn upsert(&self, workflow: Workflow) -> AppResult<()> {
        validate_workflow(&workflow)?;
        self.workflows
            .write()
            .await
            .insert(workflow.id.clone(), Arc::new(workflow));
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.workflows.read().await.len()
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn list_enabled(&self) -> AppResult<Vec<Arc<Workflow>>> {
        let mut enabled: Vec<_> = self
            .workflows
            .read()
            .await
            .values()
            .filter(|w| w.enabled)
            .cloned()
            .collect();
        enabled.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(enabled)
    }

    async fn get(&self, workflow_id: &str) -> AppResult<Option<Arc<Workflow>>> {
        Ok(self.workflows.read().await.get(workflow_id).cloned())
    }
}
