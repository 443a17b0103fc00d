//! Database module for the Storeflow engine.
//!
//! Connectivity, models and queries for PostgreSQL using SQLx.

pub mod models;
pub mod pool;
pub mod queries;

pub use pool::{create_pool, health_check, init_schema, DbPool};
