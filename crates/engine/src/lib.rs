//! Storeflow Engine Library
//!
//! Event-driven workflow engine for e-commerce automation:
//!
//! - **Routing**: match inbound domain events to workflow triggers
//! - **Execution**: walk a step graph of conditions, actions, parallel
//!   fan-outs and waits against a JSON execution context
//! - **Pause/Resume**: approval gates and event waits suspend executions as
//!   persisted state; resumes are guarded by conditional status updates
//! - **Resume Worker**: background pickup of decided pauses
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from environment variables
//! - [`db`]: PostgreSQL connectivity, models and queries
//! - [`engine`]: Router, executor, resumer and their collaborators
//! - [`error`]: Custom error types with Axum integration
//! - [`handlers`]: Operational HTTP API
//! - [`state`]: Shared application state
//! - [`store`]: Execution, approval and workflow stores
//! - [`workflow`]: Workflow definition types, parsing and validation
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use storeflow_engine::{
//!     config::AppConfig,
//!     db::models::Event,
//!     state::{AppState, Collaborators},
//!     store::MemoryWorkflowStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let workflows = Arc::new(MemoryWorkflowStore::from_dir("workflows".as_ref())?);
//!     let state = AppState::in_memory(AppConfig::default(), workflows, Collaborators::default());
//!     let event = Event::new("order.created", serde_json::json!({"order": {"total": 120}}));
//!     let matched = state.router.route_event(event).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod result_ext;
pub mod state;
pub mod store;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{AppError, AppResult};
pub use result_ext::ResultExt;
