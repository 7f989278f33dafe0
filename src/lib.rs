//! Detector Orchestration Engine
//!
//! Re-exports the engine's layers for use from the binary and from
//! integration tests: `domain` (entities, value objects, collaborator
//! traits), `application` (the nine components of SPEC_FULL.md S4), and
//! `infrastructure` (config, the filesystem reference storage adapter, and
//! the HTTP/WebSocket external surface of SPEC_FULL.md S10.4).

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::services;
pub use application::use_cases;
pub use domain::entities;
pub use domain::events;
pub use domain::repositories;
pub use domain::value_objects;
pub use infrastructure::config::EngineConfig;
pub use infrastructure::server::Server;
