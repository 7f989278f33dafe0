//! Reference Storage Adapter
//!
//! spec.md S1 treats the projects/scenes/angles/takes/frames store as an
//! external collaborator the engine never owns. This module is a small
//! filesystem-backed implementation of `FrameSource`/`ResultSink` so the
//! binary has something concrete to embed: frames are read from
//! `data_dir/frames/{take_id}/{frame_number}.bin`, and results are appended
//! as JSON lines under `data_dir/results/{take_id}.jsonl`. A real deployment
//! would swap this for an adapter that calls the actual storage service;
//! the orchestrator only ever depends on the `FrameSource`/`ResultSink`
//! trait objects, never on this module directly.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::entities::{ContinuousError, Frame, SceneContext};
use crate::domain::repositories::{FrameSource, RepoResult, RepositoryError, ResultSink};
use crate::domain::value_objects::BoundingBox;

/// Key a raw Detection is addressed by for idempotent storage, per
/// spec.md S6/S8 P12: re-appending the same `(frame_id, detector_name,
/// description)` updates the existing record instead of creating a second
/// one.
type DetectionKey = (u32, String, String);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDetection {
    frame_id: u32,
    detector_name: String,
    confidence: f32,
    description: String,
    bounding_boxes: Vec<BoundingBox>,
    metadata: HashMap<String, Value>,
}

/// One take's angle/scene/project context plus its configured reference
/// take, as the storage layer would otherwise supply from its own schema.
#[derive(Debug, Clone)]
pub struct TakeContext {
    pub scene: SceneContext,
    pub reference_take_id: Option<i64>,
}

/// Filesystem-backed `FrameSource`. Frame bytes live under
/// `frames_dir/{take_id}/{frame_number}.bin`; take context is registered
/// in-process since there is no schema here to read it from.
pub struct FilesystemFrameSource {
    frames_dir: PathBuf,
    contexts: RwLock<HashMap<i64, TakeContext>>,
}

impl FilesystemFrameSource {
    pub fn new(frames_dir: impl Into<PathBuf>) -> Self {
        Self { frames_dir: frames_dir.into(), contexts: RwLock::new(HashMap::new()) }
    }

    pub fn register_take(&self, take_id: i64, context: TakeContext) {
        self.contexts.write().unwrap().insert(take_id, context);
    }

    fn take_dir(&self, take_id: i64) -> PathBuf {
        self.frames_dir.join(take_id.to_string())
    }
}

#[async_trait]
impl FrameSource for FilesystemFrameSource {
    async fn scene_context(&self, take_id: i64) -> RepoResult<SceneContext> {
        self.contexts
            .read()
            .unwrap()
            .get(&take_id)
            .map(|ctx| ctx.scene.clone())
            .ok_or_else(|| RepositoryError::NotFound(format!("no scene context registered for take {take_id}")))
    }

    async fn frame(&self, take_id: i64, frame_number: u32) -> RepoResult<Frame> {
        let path = self.take_dir(take_id).join(format!("{frame_number}.bin"));
        let bytes = fs::read(&path).map_err(|e| RepositoryError::Io(format!("{}: {e}", path.display())))?;
        Ok(Frame::new(take_id, frame_number, frame_number as f64, bytes))
    }

    async fn reference_frame_number(&self, take_id: i64, current_frame_number: u32) -> RepoResult<Option<u32>> {
        let contexts = self.contexts.read().unwrap();
        let Some(ctx) = contexts.get(&take_id) else { return Ok(None) };
        let Some(reference_take_id) = ctx.reference_take_id else { return Ok(None) };
        drop(contexts);

        let reference_count = self.frame_count(reference_take_id).await?;
        if reference_count == 0 {
            return Ok(None);
        }
        Ok(Some(current_frame_number.min(reference_count - 1)))
    }

    async fn frame_count(&self, take_id: i64) -> RepoResult<u32> {
        let dir = self.take_dir(take_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(RepositoryError::Io(e.to_string())),
        };

        let mut max_number: Option<u32> = None;
        for entry in entries.flatten() {
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                if let Ok(n) = stem.parse::<u32>() {
                    max_number = Some(max_number.map_or(n, |m| m.max(n)));
                }
            }
        }
        Ok(max_number.map(|n| n + 1).unwrap_or(0))
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "record_type", rename_all = "snake_case")]
enum ResultRecord {
    Error(ContinuousError),
    FrameProcessed { frame_number: u32 },
    Complete,
}

/// Filesystem-backed `ResultSink`. Appends one JSON line per progress/error
/// event under `results_dir/{take_id}.jsonl` for the audit trail; a real
/// adapter would instead call back into the storage service's write API.
///
/// Raw detections are addressable rather than append-only: `append_detection`
/// keys on `(frame_id, detector_name, description)` and rewrites the
/// snapshot file in place on a repeat key, per spec.md S6/S8 P12.
pub struct FilesystemResultSink {
    results_dir: PathBuf,
    detections: RwLock<HashMap<i64, HashMap<DetectionKey, StoredDetection>>>,
    grouped: RwLock<HashMap<i64, HashMap<String, ContinuousError>>>,
}

impl FilesystemResultSink {
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self { results_dir: results_dir.into(), detections: RwLock::new(HashMap::new()), grouped: RwLock::new(HashMap::new()) }
    }

    fn append(&self, take_id: i64, record: &ResultRecord) -> RepoResult<()> {
        fs::create_dir_all(&self.results_dir).map_err(|e| RepositoryError::Io(e.to_string()))?;
        let path = self.results_dir.join(format!("{take_id}.jsonl"));
        let mut line = serde_json::to_string(record).map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        line.push('\n');
        use std::io::Write;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| RepositoryError::Io(e.to_string()))?;
        file.write_all(line.as_bytes()).map_err(|e| RepositoryError::Io(e.to_string()))
    }

    fn detections_snapshot_path(&self, take_id: i64) -> PathBuf {
        self.results_dir.join(format!("{take_id}.detections.json"))
    }

    /// Atomic temp-file-then-rename write of a take's full detection
    /// snapshot, matching the write pattern the cache/supervisor
    /// checkpoints use.
    fn write_detections_snapshot(&self, take_id: i64, detections: &HashMap<DetectionKey, StoredDetection>) -> RepoResult<()> {
        fs::create_dir_all(&self.results_dir).map_err(|e| RepositoryError::Io(e.to_string()))?;
        let path = self.detections_snapshot_path(take_id);
        let tmp_path = path.with_extension("json.tmp");
        let values: Vec<&StoredDetection> = detections.values().collect();
        let bytes = serde_json::to_vec(&values).map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        fs::write(&tmp_path, bytes).map_err(|e| RepositoryError::Io(e.to_string()))?;
        fs::rename(&tmp_path, &path).map_err(|e| RepositoryError::Io(e.to_string()))
    }
}

#[async_trait]
impl ResultSink for FilesystemResultSink {
    async fn record_error(&self, take_id: i64, error: &ContinuousError) -> RepoResult<()> {
        self.grouped.write().unwrap().entry(take_id).or_default().insert(error.group_id.clone(), error.clone());
        self.append(take_id, &ResultRecord::Error(error.clone()))
    }

    async fn record_frame_processed(&self, take_id: i64, frame_number: u32) -> RepoResult<()> {
        self.append(take_id, &ResultRecord::FrameProcessed { frame_number })
    }

    async fn record_processing_complete(&self, take_id: i64) -> RepoResult<()> {
        self.append(take_id, &ResultRecord::Complete)
    }

    async fn append_detection(
        &self,
        take_id: i64,
        frame_id: u32,
        detector_name: &str,
        confidence: f32,
        description: &str,
        bounding_boxes: &[BoundingBox],
        metadata: &HashMap<String, Value>,
    ) -> RepoResult<()> {
        let key: DetectionKey = (frame_id, detector_name.to_string(), description.to_string());
        let stored = StoredDetection {
            frame_id,
            detector_name: detector_name.to_string(),
            confidence,
            description: description.to_string(),
            bounding_boxes: bounding_boxes.to_vec(),
            metadata: metadata.clone(),
        };

        let snapshot = {
            let mut detections = self.detections.write().unwrap();
            let take_detections = detections.entry(take_id).or_default();
            // Re-inserting an existing key updates the record in place
            // rather than creating a second one (P12).
            take_detections.insert(key, stored);
            take_detections.clone()
        };

        self.write_detections_snapshot(take_id, &snapshot)
    }

    async fn get_grouped_results(&self, take_id: i64) -> RepoResult<Vec<ContinuousError>> {
        Ok(self.grouped.read().unwrap().get(&take_id).map(|groups| groups.values().cloned().collect()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::Detection;

    fn write_frame(dir: &std::path::Path, take_id: i64, frame_number: u32, bytes: &[u8]) {
        let take_dir = dir.join(take_id.to_string());
        fs::create_dir_all(&take_dir).unwrap();
        fs::write(take_dir.join(format!("{frame_number}.bin")), bytes).unwrap();
    }

    #[tokio::test]
    async fn frame_count_is_one_past_the_highest_numbered_file() {
        let tmp = tempfile::tempdir().unwrap();
        write_frame(tmp.path(), 1, 0, b"a");
        write_frame(tmp.path(), 1, 1, b"b");
        write_frame(tmp.path(), 1, 5, b"c");

        let source = FilesystemFrameSource::new(tmp.path());
        assert_eq!(source.frame_count(1).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn missing_take_directory_has_zero_frames() {
        let tmp = tempfile::tempdir().unwrap();
        let source = FilesystemFrameSource::new(tmp.path());
        assert_eq!(source.frame_count(999).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reference_frame_number_clamps_to_the_reference_takes_last_frame() {
        let tmp = tempfile::tempdir().unwrap();
        write_frame(tmp.path(), 1, 0, b"a");
        write_frame(tmp.path(), 2, 0, b"a");
        write_frame(tmp.path(), 2, 1, b"b");

        let source = FilesystemFrameSource::new(tmp.path());
        source.register_take(1, TakeContext { scene: SceneContext::new(1, 1, 1), reference_take_id: Some(2) });

        assert_eq!(source.reference_frame_number(1, 10).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn result_sink_appends_one_json_line_per_call() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = FilesystemResultSink::new(tmp.path());
        sink.record_frame_processed(1, 0).await.unwrap();
        sink.record_frame_processed(1, 1).await.unwrap();

        let contents = fs::read_to_string(tmp.path().join("1.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn result_sink_records_error_groups() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = FilesystemResultSink::new(tmp.path());
        let group = ContinuousError {
            group_id: "g1".into(),
            detector_name: "d".into(),
            description: "x".into(),
            first_frame: 0,
            last_frame: 1,
            average_confidence: 0.9,
            members: vec![Detection::new("d", "1.0.0", 1, 0, 0.9, "x")],
            all_false_positive: false,
        };
        sink.record_error(1, &group).await.unwrap();
        let contents = fs::read_to_string(tmp.path().join("1.jsonl")).unwrap();
        assert!(contents.contains("\"group_id\":\"g1\""));

        let grouped = sink.get_grouped_results(1).await.unwrap();
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].group_id, "g1");
    }

    #[tokio::test]
    async fn scenario_p12_repeated_append_detection_updates_rather_than_duplicates() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = FilesystemResultSink::new(tmp.path());
        let metadata = HashMap::new();

        sink.append_detection(1, 7, "d", 0.4, "red prop missing", &[], &metadata).await.unwrap();
        sink.append_detection(1, 7, "d", 0.9, "red prop missing", &[], &metadata).await.unwrap();

        let snapshot_path = tmp.path().join("1.detections.json");
        let contents = fs::read_to_string(&snapshot_path).unwrap();
        let stored: Vec<StoredDetection> = serde_json::from_str(&contents).unwrap();

        assert_eq!(stored.len(), 1, "a repeated (take_id, frame_id, detector_name, description) key must update, not append");
        assert_eq!(stored[0].confidence, 0.9, "the update must win over the original value");
    }

    #[tokio::test]
    async fn append_detection_with_a_different_key_adds_a_second_record() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = FilesystemResultSink::new(tmp.path());
        let metadata = HashMap::new();

        sink.append_detection(1, 7, "d", 0.4, "red prop missing", &[], &metadata).await.unwrap();
        sink.append_detection(1, 8, "d", 0.4, "red prop missing", &[], &metadata).await.unwrap();

        let snapshot_path = tmp.path().join("1.detections.json");
        let contents = fs::read_to_string(&snapshot_path).unwrap();
        let stored: Vec<StoredDetection> = serde_json::from_str(&contents).unwrap();
        assert_eq!(stored.len(), 2);
    }
}
