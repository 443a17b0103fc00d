//! Database queries for the Storeflow engine.
//!
//! Plain functions over the pool; the Postgres store composes them.

pub mod approval;
pub mod execution;
pub mod step;
