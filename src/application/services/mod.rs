//! Application Services
//!
//! Orchestration services for complex operations.

mod detector_registry;
mod event_bus;
mod grouping_engine;
mod priority_queue;
mod recovery_supervisor;
mod result_cache;
mod sandbox_adapter;
mod version_store;

pub use detector_registry::*;
pub use event_bus::*;
pub use grouping_engine::*;
pub use priority_queue::*;
pub use recovery_supervisor::*;
pub use result_cache::*;
pub use sandbox_adapter::*;
pub use version_store::*;
