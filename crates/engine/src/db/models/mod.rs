//! Database models for the Storeflow engine.

pub mod approval;
pub mod event;
pub mod execution;
pub mod step;

pub use approval::*;
pub use event::*;
pub use execution::*;
pub use step::*;
