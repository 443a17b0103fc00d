//! Configuration module for the Storeflow engine.
//!
//! Configuration is loaded from environment variables using the `envy`
//! crate for type-safe parsing.

mod app;
mod database;

pub use app::{AppConfig, EngineConfig, LogFormat, StoreBackend};
pub use database::DatabaseConfig;
