//! Application State
//!
//! Shared state for the HTTP server: the engine's long-lived services
//! (event bus, result cache, detector registry, version store) plus the
//! in-process registry of per-take orchestrators the API routes drive.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::warn;

use crate::application::services::{DetectorRegistry, EventBus, ResultCache, VersionStore};
use crate::application::use_cases::Orchestrator;
use crate::domain::repositories::{FrameSource, ResultSink};
use crate::infrastructure::config::EngineConfig;
use crate::infrastructure::storage::{FilesystemFrameSource, FilesystemResultSink};

/// Application state shared across HTTP/WebSocket handlers.
pub struct AppState {
    pub config: EngineConfig,
    pub event_bus: EventBus,
    pub cache: Arc<ResultCache>,
    pub registry: Arc<DetectorRegistry>,
    pub version_store: Arc<VersionStore>,
    pub frame_source: Arc<dyn FrameSource>,
    pub result_sink: Arc<dyn ResultSink>,
    takes: Mutex<HashMap<i64, Arc<Orchestrator>>>,
}

impl AppState {
    /// Creates new application state, wiring up the engine's services per
    /// `EngineConfig`. No detector is enabled yet: a take's orchestrator
    /// starts with an empty detector set until a scene's enabled detectors
    /// are attached out-of-band (storage CRUD is an external collaborator,
    /// per spec.md S1).
    pub async fn new(config: &EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.detector_install_dir)?;

        let event_bus = EventBus::new();
        let cache = Arc::new(ResultCache::new(config.cache.clone()));

        let registry = Arc::new(DetectorRegistry::new(config.detector_install_dir.clone()));
        if let Err(e) = registry.discover() {
            warn!(error = %e, "detector discovery failed at startup, continuing with an empty registry");
        }

        let version_store = Arc::new(VersionStore::new(config.data_dir.clone()));

        let frame_source: Arc<dyn FrameSource> = Arc::new(FilesystemFrameSource::new(config.data_dir.join("frames")));
        let result_sink: Arc<dyn ResultSink> = Arc::new(FilesystemResultSink::new(config.data_dir.join("results")));

        Ok(Self {
            config: config.clone(),
            event_bus,
            cache,
            registry,
            version_store,
            frame_source,
            result_sink,
            takes: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the orchestrator for a take, constructing one the first
    /// time this process sees that take id.
    pub async fn orchestrator(&self, take_id: i64) -> Arc<Orchestrator> {
        let mut takes = self.takes.lock().await;
        takes
            .entry(take_id)
            .or_insert_with(|| {
                Arc::new(Orchestrator::with_supervisor_config(
                    take_id,
                    self.frame_source.clone(),
                    self.result_sink.clone(),
                    self.cache.clone(),
                    self.event_bus.clone(),
                    HashMap::new(),
                    self.config.supervisor.clone(),
                ))
            })
            .clone()
    }
}
