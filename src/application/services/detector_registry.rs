//! Detector Registry & static validation (C4, part 1)
//!
//! Discovers detector packages on disk, parses their manifest, and runs the
//! static checks a package must pass before the engine will ever hand it a
//! frame: directory structure, manifest shape, schema field types, a
//! forbidden-construct scan over the entrypoint source, and (if the package
//! ships its own container build file) a sandbox-escape check on it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::domain::value_objects::DetectorConfigurationSchema;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("package '{0}' failed validation: {1}")]
    Invalid(String, String),
    #[error("package I/O error: {0}")]
    Io(String),
    #[error("malformed manifest: {0}")]
    Manifest(String),
    #[error("package '{0}' not found")]
    NotFound(String),
}

/// On-disk manifest shape, deserialized directly from the package's
/// manifest file (`detector.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub requires_reference: bool,
    #[serde(default = "default_min_frames")]
    pub min_frames_required: u32,
    #[serde(default)]
    pub schema: DetectorConfigurationSchema,
}

fn default_min_frames() -> u32 {
    1
}

/// Result of running `DetectorRegistry::validate_package`: errors block
/// activation, warnings do not.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn error(&mut self, message: impl Into<String>) {
        self.valid = false;
        self.errors.push(message.into());
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// A validated, discovered detector package as tracked by the registry.
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredPackage {
    pub manifest: DetectorManifest,
    pub install_dir: PathBuf,
    pub content_hash: String,
}

impl RegisteredPackage {
    pub fn slug(&self) -> String {
        self.manifest.name.trim().to_lowercase().replace(' ', "_")
    }
}

/// Substrings that mark an entrypoint as reaching outside the sandbox:
/// dynamic code evaluation, process/network access, or dynamic attribute
/// manipulation. Grounded on `detector_validator.py`'s `SUSPICIOUS_PATTERNS`
/// and `DANGEROUS_IMPORTS`, collapsed to the subset that are genuine
/// sandbox-escape vectors rather than merely "requires review".
const FORBIDDEN_CONSTRUCTS: &[(&str, &str)] = &[
    ("eval(", "dynamic code evaluation via eval()"),
    ("exec(", "dynamic code evaluation via exec()"),
    ("compile(", "dynamic code compilation via compile()"),
    ("__import__(", "dynamic import via __import__()"),
    ("importlib", "dynamic module loading via importlib"),
    ("subprocess", "process execution via subprocess"),
    ("os.system", "process execution via os.system"),
    ("os.popen", "process execution via os.popen"),
    ("socket.", "raw network access via socket"),
    ("urllib", "network access via urllib"),
    ("requests.", "network access via requests"),
    ("getattr(", "dynamic attribute access via getattr()"),
    ("setattr(", "dynamic attribute mutation via setattr()"),
    ("delattr(", "dynamic attribute deletion via delattr()"),
];

/// Dockerfile directives that request sandbox-breaking privileges.
const FORBIDDEN_DOCKERFILE_PATTERNS: &[(&str, &str)] = &[
    ("--privileged", "privileged container mode"),
    ("--network host", "host network namespace"),
    ("--network=host", "host network namespace"),
    ("--pid host", "host PID namespace"),
    ("--pid=host", "host PID namespace"),
    ("--ipc host", "host IPC namespace"),
    ("--ipc=host", "host IPC namespace"),
];

/// Discovers, parses, and statically validates detector packages under an
/// install directory. Does not itself run detectors; that is C3's job once
/// a package has passed validation here.
pub struct DetectorRegistry {
    install_dir: PathBuf,
    packages: std::sync::RwLock<HashMap<String, RegisteredPackage>>,
}

impl DetectorRegistry {
    pub fn new(install_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
            packages: std::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Scans the install directory for candidate packages: subdirectories
    /// whose name does not start with `.` or `_` and that contain a
    /// manifest file. Each candidate is validated; only valid packages are
    /// registered. Returns the validation report for every candidate seen
    /// (including rejected ones) so the caller can surface failures.
    pub fn discover(&self) -> Result<Vec<(String, ValidationReport)>, RegistryError> {
        let mut reports = Vec::new();
        let entries = match fs::read_dir(&self.install_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(reports),
            Err(e) => return Err(RegistryError::Io(e.to_string())),
        };

        for entry in entries {
            let entry = entry.map_err(|e| RegistryError::Io(e.to_string()))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().to_string();
            if dir_name.starts_with('.') || dir_name.starts_with('_') {
                continue;
            }
            if !Self::manifest_path(&path).exists() {
                continue;
            }

            let report = self.validate_package(&path);
            match &report {
                Ok(report) if report.valid => {
                    if let Ok(manifest) = self.load_manifest(&path) {
                        let content_hash = Self::content_hash(&path).unwrap_or_default();
                        let package = RegisteredPackage { manifest, install_dir: path.clone(), content_hash };
                        info!(package = %package.slug(), version = %package.manifest.version, "detector package registered");
                        self.packages.write().unwrap().insert(package.slug(), package);
                    }
                }
                Ok(report) => {
                    warn!(dir = %dir_name, errors = ?report.errors, "detector package failed validation");
                }
                Err(e) => {
                    warn!(dir = %dir_name, error = %e, "detector package validation errored");
                }
            }
            reports.push((dir_name, report.unwrap_or_else(|e| {
                let mut r = ValidationReport::default();
                r.error(e.to_string());
                r
            })));
        }

        Ok(reports)
    }

    fn manifest_path(package_dir: &Path) -> PathBuf {
        package_dir.join("detector.json")
    }

    fn entrypoint_path(package_dir: &Path) -> PathBuf {
        package_dir.join("detector.py")
    }

    fn load_manifest(&self, package_dir: &Path) -> Result<DetectorManifest, RegistryError> {
        let bytes = fs::read(Self::manifest_path(package_dir)).map_err(|e| RegistryError::Io(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| RegistryError::Manifest(e.to_string()))
    }

    /// Runs every static check on one candidate package directory.
    /// Grounded on `detector_validator.py::validate_detector` and its
    /// helper checks.
    pub fn validate_package(&self, package_dir: &Path) -> Result<ValidationReport, RegistryError> {
        let mut report = ValidationReport { valid: true, ..Default::default() };

        if !Self::manifest_path(package_dir).exists() {
            report.error("missing required file: detector.json");
        }
        if !Self::entrypoint_path(package_dir).exists() {
            report.error("missing required file: detector.py");
        }
        if !report.valid {
            return Ok(report);
        }

        match self.load_manifest(package_dir) {
            Ok(manifest) => {
                if manifest.name.trim().is_empty() {
                    report.error("manifest field 'name' must not be empty");
                }
                if semver::Version::parse(&manifest.version).is_err() {
                    report.error(format!("manifest version '{}' is not MAJOR.MINOR.PATCH", manifest.version));
                }
                for (field_name, field) in &manifest.schema.fields {
                    if field.minimum.is_some() && field.maximum.is_some() {
                        let (min, max) = (field.minimum.unwrap(), field.maximum.unwrap());
                        if min > max {
                            report.error(format!("field '{field_name}' has minimum > maximum"));
                        }
                    }
                }
            }
            Err(e) => report.error(format!("invalid manifest JSON: {e}")),
        }

        if let Ok(source) = fs::read_to_string(Self::entrypoint_path(package_dir)) {
            for (pattern, message) in FORBIDDEN_CONSTRUCTS {
                if source.contains(pattern) {
                    report.error(format!("entrypoint uses forbidden construct: {message}"));
                }
            }
        }

        let dockerfile = package_dir.join("Dockerfile");
        if dockerfile.exists() {
            if let Ok(contents) = fs::read_to_string(&dockerfile) {
                for (pattern, message) in FORBIDDEN_DOCKERFILE_PATTERNS {
                    if contents.to_lowercase().contains(&pattern.to_lowercase()) {
                        report.error(format!("container build file requests {message}"));
                    }
                }
                if contents.contains(":latest") {
                    report.warn("container build file uses an untagged (:latest) base image");
                }
            }
        }

        Ok(report)
    }

    /// SHA-256 over every file in the package directory, concatenated in a
    /// deterministic (sorted relative path) order, covering upgrades and
    /// tamper detection.
    fn content_hash(package_dir: &Path) -> Result<String, RegistryError> {
        let mut files = Vec::new();
        Self::collect_files(package_dir, package_dir, &mut files)?;
        files.sort();

        let mut hasher = Sha256::new();
        for relative in &files {
            hasher.update(relative.to_string_lossy().as_bytes());
            let bytes = fs::read(package_dir.join(relative)).map_err(|e| RegistryError::Io(e.to_string()))?;
            hasher.update(&bytes);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), RegistryError> {
        for entry in fs::read_dir(dir).map_err(|e| RegistryError::Io(e.to_string()))? {
            let entry = entry.map_err(|e| RegistryError::Io(e.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                Self::collect_files(root, &path, out)?;
            } else if let Ok(relative) = path.strip_prefix(root) {
                out.push(relative.to_path_buf());
            }
        }
        Ok(())
    }

    pub fn get(&self, slug: &str) -> Option<RegisteredPackage> {
        self.packages.read().unwrap().get(slug).cloned()
    }

    pub fn list(&self) -> Vec<RegisteredPackage> {
        self.packages.read().unwrap().values().cloned().collect()
    }

    pub fn register(&self, package: RegisteredPackage) {
        self.packages.write().unwrap().insert(package.slug(), package);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_package(dir: &Path, manifest_json: &str, entrypoint_source: &str) {
        fs::create_dir_all(dir).unwrap();
        let mut manifest = fs::File::create(dir.join("detector.json")).unwrap();
        manifest.write_all(manifest_json.as_bytes()).unwrap();
        let mut entrypoint = fs::File::create(dir.join("detector.py")).unwrap();
        entrypoint.write_all(entrypoint_source.as_bytes()).unwrap();
    }

    fn valid_manifest() -> &'static str {
        r#"{"name": "Continuity Check", "version": "1.0.0", "author": "studio", "description": "x"}"#
    }

    #[test]
    fn well_formed_package_passes_validation() {
        let tmp = tempfile::tempdir().unwrap();
        let pkg_dir = tmp.path().join("continuity_check");
        write_package(&pkg_dir, valid_manifest(), "def process(frame): return []\n");

        let registry = DetectorRegistry::new(tmp.path());
        let report = registry.validate_package(&pkg_dir).unwrap();
        assert!(report.valid, "{:?}", report.errors);
    }

    #[test]
    fn missing_entrypoint_fails_validation() {
        let tmp = tempfile::tempdir().unwrap();
        let pkg_dir = tmp.path().join("broken");
        fs::create_dir_all(&pkg_dir).unwrap();
        fs::write(pkg_dir.join("detector.json"), valid_manifest()).unwrap();

        let registry = DetectorRegistry::new(tmp.path());
        let report = registry.validate_package(&pkg_dir).unwrap();
        assert!(!report.valid);
    }

    #[test]
    fn non_semver_version_fails_validation() {
        let tmp = tempfile::tempdir().unwrap();
        let pkg_dir = tmp.path().join("bad_version");
        write_package(
            &pkg_dir,
            r#"{"name": "X", "version": "1.0", "author": "a", "description": "x"}"#,
            "def process(frame): return []\n",
        );

        let registry = DetectorRegistry::new(tmp.path());
        let report = registry.validate_package(&pkg_dir).unwrap();
        assert!(!report.valid);
    }

    #[test]
    fn forbidden_construct_fails_validation() {
        let tmp = tempfile::tempdir().unwrap();
        let pkg_dir = tmp.path().join("dangerous");
        write_package(&pkg_dir, valid_manifest(), "import subprocess\nsubprocess.run(['ls'])\n");

        let registry = DetectorRegistry::new(tmp.path());
        let report = registry.validate_package(&pkg_dir).unwrap();
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("subprocess")));
    }

    #[test]
    fn privileged_dockerfile_fails_validation() {
        let tmp = tempfile::tempdir().unwrap();
        let pkg_dir = tmp.path().join("privileged");
        write_package(&pkg_dir, valid_manifest(), "def process(frame): return []\n");
        fs::write(pkg_dir.join("Dockerfile"), "FROM scratch\nRUN docker run --privileged\n").unwrap();

        let registry = DetectorRegistry::new(tmp.path());
        let report = registry.validate_package(&pkg_dir).unwrap();
        assert!(!report.valid);
    }

    #[test]
    fn untagged_base_image_is_a_warning_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let pkg_dir = tmp.path().join("untagged");
        write_package(&pkg_dir, valid_manifest(), "def process(frame): return []\n");
        fs::write(pkg_dir.join("Dockerfile"), "FROM python:latest\n").unwrap();

        let registry = DetectorRegistry::new(tmp.path());
        let report = registry.validate_package(&pkg_dir).unwrap();
        assert!(report.valid);
        assert!(!report.warnings.is_empty());
    }

    #[test]
    fn discover_registers_only_valid_candidates() {
        let tmp = tempfile::tempdir().unwrap();
        write_package(&tmp.path().join("good_detector"), valid_manifest(), "def process(frame): return []\n");
        write_package(
            &tmp.path().join("bad_detector"),
            r#"{"name": "Bad Detector", "version": "1.0.0", "author": "a", "description": "x"}"#,
            "import subprocess\n",
        );
        fs::create_dir_all(tmp.path().join(".hidden")).unwrap();

        let registry = DetectorRegistry::new(tmp.path());
        registry.discover().unwrap();

        assert!(registry.get("continuity_check").is_some());
        assert!(registry.get("bad_detector").is_none());
        assert_eq!(registry.list().len(), 1);
    }
}
