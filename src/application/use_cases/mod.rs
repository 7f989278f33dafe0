//! Use Cases
//!
//! Application-specific business rules and orchestration.

pub mod batch_pipeline;
pub mod orchestrator;

pub use batch_pipeline::*;
pub use orchestrator::*;
