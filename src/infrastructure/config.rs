//! Engine Configuration
//!
//! Loads configuration from environment variables, struct-of-defaults
//! style: `EngineConfig::default()` carries every literal the spec pins
//! down, and `load()` overrides field-by-field from the environment after
//! `dotenvy::dotenv()`.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::application::services::{CacheConfig, SupervisorConfig};
use crate::application::use_cases::BatchConfig;

/// Tunables for the per-detector priority queue (C1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub capacity: usize,
    pub high_water_mark_fraction: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 500, high_water_mark_fraction: 0.8 }
    }
}

/// Top-level engine configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub detector_install_dir: PathBuf,
    pub cors_origin: String,
    pub log_level: String,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub supervisor: SupervisorConfig,
    pub batch: BatchConfig,
    /// Default sandbox call timeout (seconds), before adaptive smoothing
    /// takes over.
    pub default_sandbox_timeout_seconds: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("camf-detector-engine");

        Self {
            host: "127.0.0.1".to_string(),
            port: 7889,
            data_dir: data_dir.clone(),
            detector_install_dir: data_dir.join("detectors"),
            cors_origin: "http://localhost:7900".to_string(),
            log_level: "info".to_string(),
            queue: QueueConfig::default(),
            cache: CacheConfig { cache_dir: data_dir.join("cache"), ..CacheConfig::default() },
            supervisor: SupervisorConfig { checkpoint_path: Some(data_dir.join("health_state.json")), ..SupervisorConfig::default() },
            batch: BatchConfig::default(),
            default_sandbox_timeout_seconds: 30.0,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from environment variables, overriding the
    /// struct-of-defaults field by field.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        if let Ok(host) = std::env::var("CAMF_HOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("CAMF_PORT") {
            config.port = port.parse().unwrap_or(config.port);
        }
        if let Ok(data_dir) = std::env::var("CAMF_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
            config.detector_install_dir = config.data_dir.join("detectors");
            config.cache.cache_dir = config.data_dir.join("cache");
            config.supervisor.checkpoint_path = Some(config.data_dir.join("health_state.json"));
        }
        if let Ok(cors_origin) = std::env::var("CAMF_CORS_ORIGIN") {
            config.cors_origin = cors_origin;
        }
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            config.log_level = log_level;
        }
        if let Ok(queue_capacity) = std::env::var("CAMF_QUEUE_CAPACITY") {
            config.queue.capacity = queue_capacity.parse().unwrap_or(config.queue.capacity);
        }
        if let Ok(cache_memory_capacity) = std::env::var("CAMF_CACHE_MEMORY_CAPACITY") {
            config.cache.memory_capacity = cache_memory_capacity.parse().unwrap_or(config.cache.memory_capacity);
        }
        if let Ok(segment_size) = std::env::var("CAMF_BATCH_SEGMENT_SIZE") {
            config.batch.segment_size = segment_size.parse().unwrap_or(config.batch.segment_size);
        }
        if let Ok(default_timeout) = std::env::var("CAMF_SANDBOX_TIMEOUT_SECONDS") {
            config.default_sandbox_timeout_seconds = default_timeout.parse().unwrap_or(config.default_sandbox_timeout_seconds);
        }

        Ok(config)
    }

    /// Directory the version store keeps published detector package
    /// versions under.
    pub fn versions_dir(&self) -> PathBuf {
        self.data_dir.join("versions")
    }

    /// Path to the false-positive annotations file.
    pub fn false_positive_file(&self) -> PathBuf {
        self.data_dir.join("false_positives.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_port() {
        let config = EngineConfig::default();
        assert_eq!(config.port, 7889);
    }

    #[test]
    fn default_config_nests_cache_dir_under_data_dir() {
        let config = EngineConfig::default();
        assert!(config.cache.cache_dir.starts_with(&config.data_dir));
    }

    #[test]
    fn default_queue_high_water_mark_matches_spec() {
        let config = QueueConfig::default();
        assert_eq!(config.high_water_mark_fraction, 0.8);
    }

    #[test]
    fn default_batch_segment_size_matches_spec() {
        let config = BatchConfig::default();
        assert_eq!(config.segment_size, 300);
        assert_eq!(config.max_parallel_segments, 4);
        assert_eq!(config.early_termination_error_threshold, 10);
    }
}
