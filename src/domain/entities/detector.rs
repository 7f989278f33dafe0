//! DetectorPackage and DetectorInstance Entities

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::domain::value_objects::{DetectorConfig, DetectorConfigurationSchema};

/// A detector package as discovered on disk. Identity is the name slug
/// matching the install directory. Created by installation, superseded by
/// upgrade (old versions preserved in the version store), destroyed by
/// uninstall.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorPackage {
    pub name: String,
    pub display_name: String,
    pub version: String,
    pub author: String,
    pub category: String,
    pub requires_reference: bool,
    pub min_frames_required: u32,
    pub schema: DetectorConfigurationSchema,
    /// SHA-256 hash covering every file in the package directory.
    pub content_hash: String,
    pub install_dir: PathBuf,
}

impl DetectorPackage {
    /// The slug used in cache keys and grouping: lowercase, spaces to
    /// underscores.
    pub fn slug(&self) -> String {
        self.name.trim().to_lowercase().replace(' ', "_")
    }
}

/// The lifecycle state of a sandboxed detector instance.
///
/// `created -> initialized (on successful initialize) -> running (request
/// outstanding) -> idle (between requests)`; `idle -> failed` on any error,
/// `failed -> initialized` on successful recovery; any state `-> stopped` on
/// cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorStatus {
    Created,
    Initialized,
    Running,
    Idle,
    Failed,
    Stopped,
}

impl DetectorStatus {
    /// Applies a lifecycle transition, returning the new state. Invalid
    /// transitions are no-ops (the state machine has no illegal-transition
    /// error; sandbox failures are reported through C5, not through the
    /// status machine itself).
    pub fn on_initialize_ok(self) -> Self {
        DetectorStatus::Initialized
    }

    pub fn on_request_start(self) -> Self {
        DetectorStatus::Running
    }

    pub fn on_request_complete(self) -> Self {
        DetectorStatus::Idle
    }

    pub fn on_failure(self) -> Self {
        if self == DetectorStatus::Stopped {
            self
        } else {
            DetectorStatus::Failed
        }
    }

    pub fn on_recovery_ok(self) -> Self {
        DetectorStatus::Initialized
    }

    pub fn on_cleanup(self) -> Self {
        DetectorStatus::Stopped
    }

    pub fn is_usable(self) -> bool {
        matches!(self, DetectorStatus::Initialized | DetectorStatus::Idle)
    }
}

/// A running incarnation of a DetectorPackage for a specific scene.
#[derive(Debug, Clone)]
pub struct DetectorInstance {
    pub package_name: String,
    pub package_version: String,
    pub scene_id: i64,
    pub config: DetectorConfig,
    pub status: DetectorStatus,
    pub total_processed: u64,
    pub total_errors_found: u64,
    /// Rolling average processing time (ms), window 100.
    pub average_processing_time_ms: f64,
    pub current_timeout_secs: f64,
}

impl DetectorInstance {
    pub fn new(package_name: impl Into<String>, package_version: impl Into<String>, scene_id: i64, config: DetectorConfig, initial_timeout_secs: f64) -> Self {
        Self {
            package_name: package_name.into(),
            package_version: package_version.into(),
            scene_id,
            config,
            status: DetectorStatus::Created,
            total_processed: 0,
            total_errors_found: 0,
            average_processing_time_ms: 0.0,
            current_timeout_secs: initial_timeout_secs,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.status.is_usable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn slug_lowercases_and_replaces_spaces() {
        let pkg = DetectorPackage {
            name: "Red Prop Check".into(),
            display_name: "Red Prop Check".into(),
            version: "1.0.0".into(),
            author: "a".into(),
            category: "general".into(),
            requires_reference: false,
            min_frames_required: 1,
            schema: DetectorConfigurationSchema::default(),
            content_hash: "abc".into(),
            install_dir: PathBuf::from("/tmp/x"),
        };
        assert_eq!(pkg.slug(), "red_prop_check");
    }

    #[test]
    fn status_machine_transitions_match_spec() {
        let s = DetectorStatus::Created;
        let s = s.on_initialize_ok();
        assert_eq!(s, DetectorStatus::Initialized);
        let s = s.on_request_start();
        assert_eq!(s, DetectorStatus::Running);
        let s = s.on_request_complete();
        assert_eq!(s, DetectorStatus::Idle);
        let s = s.on_failure();
        assert_eq!(s, DetectorStatus::Failed);
        let s = s.on_recovery_ok();
        assert_eq!(s, DetectorStatus::Initialized);
        let s = s.on_cleanup();
        assert_eq!(s, DetectorStatus::Stopped);
    }

    #[test]
    fn new_instance_is_not_enabled_until_initialized() {
        let instance = DetectorInstance::new("d", "1.0.0", 1, HashMap::new(), 30.0);
        assert!(!instance.is_enabled());
    }
}
