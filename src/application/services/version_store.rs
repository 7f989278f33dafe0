//! Detector Version Store & migration (C4, part 2)
//!
//! Keeps every published version of a detector package under
//! `versions/{name}/{version}/` plus a JSON index of release metadata, and
//! walks migration chains across major-version upgrades, applying each
//! step's `migrate_configuration`/`validate_migration` to every scene's
//! stored config for that detector.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::domain::value_objects::DetectorConfig;

#[derive(Debug, thiserror::Error)]
pub enum VersionStoreError {
    #[error("malformed version string '{0}'")]
    InvalidVersion(String),
    #[error("version I/O error: {0}")]
    Io(String),
    #[error("no version recorded for detector '{0}'")]
    NoVersions(String),
    #[error("migration from {from} to {to} failed: {reason}")]
    MigrationFailed { from: String, to: String, reason: String },
}

/// What kind of change a new version represents, declared by the caller at
/// creation time (the store does not infer it from a diff).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionChangeKind {
    Major,
    Minor,
    Patch,
}

/// One published version's metadata, as recorded in the version index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: String,
    pub release_date: DateTime<Utc>,
    pub changelog: String,
    pub content_hash: String,
    pub is_stable: bool,
    pub deprecated: bool,
    pub migration_from: Option<String>,
    pub breaking_changes: Vec<String>,
}

/// A migration step applied when crossing a major-version boundary. In
/// production this loads a script shipped alongside the target version; in
/// the engine it is represented as a pure function pair so migrations can
/// be supplied in-process (e.g. by a Rust-native detector SDK) as well as
/// shelled out to script files.
pub trait MigrationStep: Send + Sync {
    fn migrate_configuration(&self, old: &DetectorConfig) -> Result<DetectorConfig, String>;
    fn migrate_data(&self, old: Option<&serde_json::Value>) -> Result<Option<serde_json::Value>, String> {
        Ok(old.cloned())
    }
    fn validate_migration(&self, config: &DetectorConfig, data: Option<&serde_json::Value>) -> bool {
        let _ = (config, data);
        true
    }
}

/// Per-detector index of published versions plus the migration chain
/// between any two of them.
struct DetectorVersionIndex {
    versions: Vec<VersionRecord>,
    migrations: HashMap<(String, String), Box<dyn MigrationStep>>,
}

/// Tracks every published version of every detector package and runs
/// migration chains on upgrade. One store per engine instance, backed by
/// `base_path/versions/{name}/index.json`.
pub struct VersionStore {
    base_path: PathBuf,
    index: std::sync::Mutex<HashMap<String, DetectorVersionIndex>>,
}

impl VersionStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        let mut loaded = HashMap::new();
        if let Ok(entries) = fs::read_dir(base_path.join("versions")) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(versions) = Self::load_index(&base_path, &name) {
                    loaded.insert(name, DetectorVersionIndex { versions, migrations: HashMap::new() });
                }
            }
        }
        Self { base_path, index: std::sync::Mutex::new(loaded) }
    }

    fn index_path(base_path: &Path, name: &str) -> PathBuf {
        base_path.join("versions").join(name).join("index.json")
    }

    fn load_index(base_path: &Path, name: &str) -> Option<Vec<VersionRecord>> {
        let bytes = fs::read(Self::index_path(base_path, name)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn save_index(&self, name: &str, versions: &[VersionRecord]) -> Result<(), VersionStoreError> {
        let dir = self.base_path.join("versions").join(name);
        fs::create_dir_all(&dir).map_err(|e| VersionStoreError::Io(e.to_string()))?;
        let path = Self::index_path(&self.base_path, name);
        let tmp_path = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(versions).map_err(|e| VersionStoreError::Io(e.to_string()))?;
        fs::write(&tmp_path, bytes).map_err(|e| VersionStoreError::Io(e.to_string()))?;
        fs::rename(&tmp_path, &path).map_err(|e| VersionStoreError::Io(e.to_string()))?;
        Ok(())
    }

    /// Derives the next version number from the current latest, per the
    /// declared change kind, and records it in the index.
    pub fn create_version(
        &self,
        name: &str,
        kind: VersionChangeKind,
        changelog: impl Into<String>,
        content_hash: impl Into<String>,
        breaking_changes: Vec<String>,
    ) -> Result<VersionRecord, VersionStoreError> {
        let mut index = self.index.lock().unwrap();
        let entry = index.entry(name.to_string()).or_insert_with(|| DetectorVersionIndex {
            versions: Vec::new(),
            migrations: HashMap::new(),
        });

        let current = entry.versions.last().map(|v| v.version.clone());
        let next_version = match &current {
            None => "1.0.0".to_string(),
            Some(current) => {
                let mut parsed = Version::parse(current).map_err(|_| VersionStoreError::InvalidVersion(current.clone()))?;
                match kind {
                    VersionChangeKind::Major => {
                        parsed.major += 1;
                        parsed.minor = 0;
                        parsed.patch = 0;
                    }
                    VersionChangeKind::Minor => {
                        parsed.minor += 1;
                        parsed.patch = 0;
                    }
                    VersionChangeKind::Patch => parsed.patch += 1,
                }
                parsed.to_string()
            }
        };

        let record = VersionRecord {
            version: next_version,
            release_date: Utc::now(),
            changelog: changelog.into(),
            content_hash: content_hash.into(),
            is_stable: true,
            deprecated: false,
            migration_from: current,
            breaking_changes,
        };

        entry.versions.push(record.clone());
        self.save_index(name, &entry.versions)?;
        Ok(record)
    }

    pub fn latest_version(&self, name: &str) -> Result<String, VersionStoreError> {
        let index = self.index.lock().unwrap();
        index
            .get(name)
            .and_then(|entry| entry.versions.last())
            .map(|v| v.version.clone())
            .ok_or_else(|| VersionStoreError::NoVersions(name.to_string()))
    }

    pub fn list_versions(&self, name: &str) -> Vec<VersionRecord> {
        self.index.lock().unwrap().get(name).map(|entry| entry.versions.clone()).unwrap_or_default()
    }

    /// Registers the migration step to run when a detector's active
    /// version moves from `from` to `to` (direct predecessor/successor
    /// pair in the chain; `run_upgrade` walks multiple such steps).
    pub fn register_migration(&self, name: &str, from: impl Into<String>, to: impl Into<String>, step: Box<dyn MigrationStep>) {
        let mut index = self.index.lock().unwrap();
        let entry = index.entry(name.to_string()).or_insert_with(|| DetectorVersionIndex {
            versions: Vec::new(),
            migrations: HashMap::new(),
        });
        entry.migrations.insert((from.into(), to.into()), step);
    }

    pub fn deprecate_version(&self, name: &str, version: &str, _reason: &str) -> Result<(), VersionStoreError> {
        let mut index = self.index.lock().unwrap();
        let entry = index.get_mut(name).ok_or_else(|| VersionStoreError::NoVersions(name.to_string()))?;
        if let Some(record) = entry.versions.iter_mut().find(|v| v.version == version) {
            record.deprecated = true;
        }
        self.save_index(name, &entry.versions)
    }

    /// Builds the chain of version strings `from -> ... -> to` by following
    /// each version's recorded `migration_from` pointer. `None` if no chain
    /// connects them.
    fn migration_path(&self, name: &str, from: &str, to: &str) -> Option<Vec<String>> {
        let index = self.index.lock().unwrap();
        let entry = index.get(name)?;

        let mut path = Vec::new();
        let mut current = from.to_string();
        loop {
            let next = entry.versions.iter().find(|v| v.migration_from.as_deref() == Some(current.as_str()))?;
            path.push(next.version.clone());
            if next.version == to {
                return Some(path);
            }
            current = next.version.clone();
            if path.len() > entry.versions.len() {
                return None;
            }
        }
    }

    /// Upgrades one detector's active config from `from` to `to`. No
    /// migration is needed within the same major version. Across a major
    /// boundary, every step in the chain runs `migrate_configuration` then
    /// `validate_migration`; any failure aborts the whole upgrade and
    /// leaves the input config/data untouched, per spec.md S4.4's
    /// "abort, leave the old version active" rule.
    pub fn run_upgrade(
        &self,
        name: &str,
        from: &str,
        to: &str,
        config: DetectorConfig,
        data: Option<serde_json::Value>,
    ) -> Result<(DetectorConfig, Option<serde_json::Value>), VersionStoreError> {
        let from_ver = Version::parse(from).map_err(|_| VersionStoreError::InvalidVersion(from.to_string()))?;
        let to_ver = Version::parse(to).map_err(|_| VersionStoreError::InvalidVersion(to.to_string()))?;

        if from_ver.major == to_ver.major {
            return Ok((config, data));
        }

        let chain = self.migration_path(name, from, to).ok_or_else(|| VersionStoreError::MigrationFailed {
            from: from.to_string(),
            to: to.to_string(),
            reason: "no migration path found".to_string(),
        })?;

        let mut migrated_config = config;
        let mut migrated_data = data;
        let mut current_version = from.to_string();

        for step_version in chain {
            let index = self.index.lock().unwrap();
            let entry = index.get(name).ok_or_else(|| VersionStoreError::NoVersions(name.to_string()))?;
            let step = entry
                .migrations
                .get(&(current_version.clone(), step_version.clone()))
                .ok_or_else(|| VersionStoreError::MigrationFailed {
                    from: current_version.clone(),
                    to: step_version.clone(),
                    reason: "no migration script registered for this step".to_string(),
                })?;

            migrated_config = step.migrate_configuration(&migrated_config).map_err(|reason| {
                VersionStoreError::MigrationFailed { from: current_version.clone(), to: step_version.clone(), reason }
            })?;
            migrated_data = step
                .migrate_data(migrated_data.as_ref())
                .map_err(|reason| VersionStoreError::MigrationFailed { from: current_version.clone(), to: step_version.clone(), reason })?;

            if !step.validate_migration(&migrated_config, migrated_data.as_ref()) {
                return Err(VersionStoreError::MigrationFailed {
                    from: current_version.clone(),
                    to: step_version.clone(),
                    reason: "validate_migration returned false".to_string(),
                });
            }

            current_version = step_version;
        }

        Ok((migrated_config, migrated_data))
    }

    /// Upgrades every scene's stored config for a detector, per spec.md
    /// S4.4 step 3. Any single scene's failure aborts the whole upgrade
    /// (the caller is expected to have taken a snapshot to roll back to).
    pub fn run_upgrade_for_all_scenes(
        &self,
        name: &str,
        from: &str,
        to: &str,
        scene_configs: HashMap<i64, DetectorConfig>,
    ) -> Result<HashMap<i64, DetectorConfig>, VersionStoreError> {
        let mut migrated = HashMap::with_capacity(scene_configs.len());
        for (scene_id, config) in scene_configs {
            let (new_config, _) = self.run_upgrade(name, from, to, config, None)?;
            migrated.insert(scene_id, new_config);
        }
        Ok(migrated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::ConfigValue;

    struct AddFieldMigration;
    impl MigrationStep for AddFieldMigration {
        fn migrate_configuration(&self, old: &DetectorConfig) -> Result<DetectorConfig, String> {
            let mut new_config = old.clone();
            new_config.insert("sensitivity".to_string(), ConfigValue::Number(0.5));
            Ok(new_config)
        }
    }

    struct FailingMigration;
    impl MigrationStep for FailingMigration {
        fn migrate_configuration(&self, _old: &DetectorConfig) -> Result<DetectorConfig, String> {
            Err("incompatible schema".to_string())
        }
    }

    #[test]
    fn same_major_version_needs_no_migration() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VersionStore::new(tmp.path());
        let config = DetectorConfig::new();
        let (migrated, _) = store.run_upgrade("d", "1.0.0", "1.2.0", config.clone(), None).unwrap();
        assert_eq!(migrated, config);
    }

    #[test]
    fn major_upgrade_runs_registered_migration() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VersionStore::new(tmp.path());
        store.create_version("d", VersionChangeKind::Major, "v1", "hash1", vec![]).unwrap();
        store.create_version("d", VersionChangeKind::Major, "breaking change", "hash2", vec!["removed legacy field".into()]).unwrap();
        store.register_migration("d", "1.0.0", "2.0.0", Box::new(AddFieldMigration));

        let (migrated, _) = store.run_upgrade("d", "1.0.0", "2.0.0", DetectorConfig::new(), None).unwrap();
        assert!(migrated.contains_key("sensitivity"));
    }

    #[test]
    fn failing_migration_aborts_and_reports_the_step() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VersionStore::new(tmp.path());
        store.create_version("d", VersionChangeKind::Major, "v1", "hash1", vec![]).unwrap();
        store.create_version("d", VersionChangeKind::Major, "v2", "hash2", vec![]).unwrap();
        store.register_migration("d", "1.0.0", "2.0.0", Box::new(FailingMigration));

        let result = store.run_upgrade("d", "1.0.0", "2.0.0", DetectorConfig::new(), None);
        assert!(result.is_err());
    }

    #[test]
    fn missing_migration_path_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VersionStore::new(tmp.path());
        let result = store.run_upgrade("unknown-detector", "1.0.0", "2.0.0", DetectorConfig::new(), None);
        assert!(result.is_err());
    }

    #[test]
    fn create_version_derives_next_number_by_kind() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VersionStore::new(tmp.path());
        let v1 = store.create_version("d", VersionChangeKind::Major, "first", "h1", vec![]).unwrap();
        assert_eq!(v1.version, "1.0.0");
        let v2 = store.create_version("d", VersionChangeKind::Minor, "feature", "h2", vec![]).unwrap();
        assert_eq!(v2.version, "1.1.0");
        let v3 = store.create_version("d", VersionChangeKind::Patch, "fix", "h3", vec![]).unwrap();
        assert_eq!(v3.version, "1.1.1");
    }

    #[test]
    fn upgrade_across_all_scene_configs_migrates_each() {
        let tmp = tempfile::tempdir().unwrap();
        let store = VersionStore::new(tmp.path());
        store.create_version("d", VersionChangeKind::Major, "v1", "hash1", vec![]).unwrap();
        store.create_version("d", VersionChangeKind::Major, "v2", "hash2", vec![]).unwrap();
        store.register_migration("d", "1.0.0", "2.0.0", Box::new(AddFieldMigration));

        let mut scene_configs = HashMap::new();
        scene_configs.insert(1, DetectorConfig::new());
        scene_configs.insert(2, DetectorConfig::new());

        let migrated = store.run_upgrade_for_all_scenes("d", "1.0.0", "2.0.0", scene_configs).unwrap();
        assert_eq!(migrated.len(), 2);
        assert!(migrated.values().all(|c| c.contains_key("sensitivity")));
    }
}
