//! Orchestrator (C7)
//!
//! Drives processing of one take: enumerates frame pairs, fans each pair
//! out to every enabled detector, merges results through the grouping
//! engine, and reports progress on the event bus. One orchestrator exists
//! per active take.
//!
//! Every detector call's outcome is reported to an embedded recovery
//! supervisor (C5): a failed frame calls `report_failure`, everything else
//! calls `report_success`. The supervisor decides what to do about repeated
//! failures and drives the detector's enabled/disabled state through
//! `OrchestratorDetectorControl` in response.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lru::LruCache;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::application::services::{
    DetectorControl, EventBus, GroupingEngine, RecoverySupervisor, ResultCache, SandboxAdapter, SupervisorConfig, SupervisorSink,
};
use crate::domain::entities::{CacheKey, ContinuousError, Detection, DetectorInstance, Frame, FramePair};
use crate::domain::events::{DomainEvent, FrameProcessedEvent, ProcessingCompleteEvent, ProcessingStartedEvent};
use crate::domain::repositories::{FrameSource, RepoResult, ResultSink};
use crate::domain::value_objects::DetectorConfig;

const DECODE_CACHE_CAPACITY: usize = 100;
const PER_DETECTOR_JOIN_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const FINAL_COMPLETION_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("take {0} has no frames")]
    EmptyTake(i64),
    #[error("no reference take configured for take {0}")]
    NoReferenceTake(i64),
    #[error("collaborator error: {0}")]
    Collaborator(#[from] crate::domain::repositories::RepositoryError),
    #[error("a processing run is already active for this take")]
    AlreadyRunning,
    #[error("no processing run is active for this take")]
    NotRunning,
}

/// One detector's sandbox adapter plus the bookkeeping the orchestrator
/// needs to drive it: its declared config (for cache-key config hashing)
/// and its live lifecycle/progress state.
pub struct DetectorSlot {
    pub adapter: Arc<SandboxAdapter>,
    pub config: DetectorConfig,
    pub instance: std::sync::Mutex<DetectorInstance>,
}

/// Per-take progress snapshot, guarded by a single orchestrator mutex per
/// spec.md's shared-resource policy.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ProcessingStatus {
    pub take_id: i64,
    pub total_frames: u32,
    pub processed_frames: u32,
    pub failed_frames: u32,
    pub is_running: bool,
    pub per_detector: HashMap<String, (u64, u64)>,
}

struct TakeState {
    total_frames: u32,
    processed_frames: u32,
    failed_frames: u32,
    is_running: bool,
    started_at: Option<chrono::DateTime<Utc>>,
    accumulated: HashMap<String, Vec<Detection>>,
}

impl Default for TakeState {
    fn default() -> Self {
        Self {
            total_frames: 0,
            processed_frames: 0,
            failed_frames: 0,
            is_running: false,
            started_at: None,
            accumulated: HashMap::new(),
        }
    }
}

/// Drives one take's frame-by-frame processing across every enabled
/// detector for its scene.
pub struct Orchestrator {
    take_id: i64,
    frame_source: Arc<dyn FrameSource>,
    result_sink: Arc<dyn ResultSink>,
    cache: Arc<ResultCache>,
    event_bus: EventBus,
    grouping: GroupingEngine,
    detectors: HashMap<String, Arc<DetectorSlot>>,
    supervisor: RecoverySupervisor,
    state: std::sync::Mutex<TakeState>,
    decode_cache: std::sync::Mutex<LruCache<(i64, u32), Frame>>,
    stop_requested: Arc<AtomicBool>,
    worker_handle: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        take_id: i64,
        frame_source: Arc<dyn FrameSource>,
        result_sink: Arc<dyn ResultSink>,
        cache: Arc<ResultCache>,
        event_bus: EventBus,
        detectors: HashMap<String, Arc<DetectorSlot>>,
    ) -> Self {
        Self::with_supervisor_config(take_id, frame_source, result_sink, cache, event_bus, detectors, SupervisorConfig::default())
    }

    /// Same as `new`, but lets the caller supply the recovery supervisor's
    /// tunables (backoff schedule, disable threshold, checkpoint path)
    /// instead of taking the defaults.
    pub fn with_supervisor_config(
        take_id: i64,
        frame_source: Arc<dyn FrameSource>,
        result_sink: Arc<dyn ResultSink>,
        cache: Arc<ResultCache>,
        event_bus: EventBus,
        detectors: HashMap<String, Arc<DetectorSlot>>,
        supervisor_config: SupervisorConfig,
    ) -> Self {
        let supervisor = build_recovery_supervisor(take_id, supervisor_config, event_bus.clone(), detectors.clone());
        Self {
            take_id,
            frame_source,
            result_sink,
            cache,
            event_bus,
            grouping: GroupingEngine::new(),
            detectors,
            supervisor,
            state: std::sync::Mutex::new(TakeState::default()),
            decode_cache: std::sync::Mutex::new(LruCache::new(NonZeroUsize::new(DECODE_CACHE_CAPACITY).unwrap())),
            stop_requested: Arc::new(AtomicBool::new(false)),
            worker_handle: AsyncMutex::new(None),
        }
    }

    /// Validates both takes have frames, computes the frame bound per P10,
    /// and launches the worker task.
    pub async fn start(self: &Arc<Self>, reference_take_id: i64) -> Result<(), OrchestratorError> {
        {
            let state = self.state.lock().unwrap();
            if state.is_running {
                return Err(OrchestratorError::AlreadyRunning);
            }
        }

        let current_count = self.frame_source.frame_count(self.take_id).await?;
        let reference_count = self.frame_source.frame_count(reference_take_id).await?;
        if current_count == 0 {
            return Err(OrchestratorError::EmptyTake(self.take_id));
        }
        if reference_count == 0 {
            return Err(OrchestratorError::NoReferenceTake(reference_take_id));
        }

        let total_frames = current_count.min(reference_count);
        self.stop_requested.store(false, Ordering::SeqCst);

        {
            let mut state = self.state.lock().unwrap();
            state.total_frames = total_frames;
            state.processed_frames = 0;
            state.failed_frames = 0;
            state.is_running = true;
            state.started_at = Some(Utc::now());
            state.accumulated.clear();
        }

        self.event_bus.publish(DomainEvent::ProcessingStarted(ProcessingStartedEvent {
            take_id: self.take_id,
            scene_id: reference_take_id,
            detector_count: self.detectors.len(),
            timestamp: Utc::now(),
        }));

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run_worker(reference_take_id, total_frames).await });
        *self.worker_handle.lock().await = Some(handle);
        Ok(())
    }

    /// Sets the stop flag and joins the worker with a 10s timeout.
    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        self.stop_requested.store(true, Ordering::SeqCst);
        let mut guard = self.worker_handle.lock().await;
        let Some(handle) = guard.take() else { return Err(OrchestratorError::NotRunning) };
        if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
            warn!(take_id = self.take_id, "worker did not join within the stop timeout");
        }
        Ok(())
    }

    pub fn status(&self) -> ProcessingStatus {
        let state = self.state.lock().unwrap();
        let per_detector = self
            .detectors
            .iter()
            .map(|(name, slot)| {
                let instance = slot.instance.lock().unwrap();
                (name.clone(), (instance.total_processed, instance.total_errors_found))
            })
            .collect();
        ProcessingStatus {
            take_id: self.take_id,
            total_frames: state.total_frames,
            processed_frames: state.processed_frames,
            failed_frames: state.failed_frames,
            is_running: state.is_running,
            per_detector,
        }
    }

    async fn run_worker(self: Arc<Self>, reference_take_id: i64, total_frames: u32) {
        for frame_number in 0..total_frames {
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }

            match self.build_frame_pair(reference_take_id, frame_number).await {
                Ok(pair) => {
                    self.process_pair_across_detectors(pair).await;
                    let mut state = self.state.lock().unwrap();
                    state.processed_frames += 1;
                }
                Err(e) => {
                    warn!(take_id = self.take_id, frame_number, error = %e, "frame payload failed to decode, skipping");
                    let mut state = self.state.lock().unwrap();
                    state.failed_frames += 1;
                }
            }

            if self.result_sink.record_frame_processed(self.take_id, frame_number).await.is_ok() {
                self.event_bus.publish(DomainEvent::FrameProcessed(FrameProcessedEvent {
                    take_id: self.take_id,
                    frame_number,
                    detections_found: 0,
                    timestamp: Utc::now(),
                }));
            }
        }

        let _ = tokio::time::timeout(FINAL_COMPLETION_WAIT, self.await_detector_quiescence()).await;
        self.finalize().await;
    }

    /// Best-effort wait for every detector's in-flight request to settle;
    /// the per-frame join timeouts already bound this, so this is a short
    /// formality rather than a real blocking wait in the common case.
    async fn await_detector_quiescence(&self) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn build_frame_pair(&self, reference_take_id: i64, frame_number: u32) -> RepoResult<FramePair> {
        let scene = self.frame_source.scene_context(self.take_id).await?;
        let reference_frame_number = self
            .frame_source
            .reference_frame_number(self.take_id, frame_number)
            .await?
            .unwrap_or(0);

        let current_frame = self.decode_frame(self.take_id, frame_number).await?;
        let reference_frame = self.decode_frame(reference_take_id, reference_frame_number).await?;

        Ok(FramePair::new(current_frame, reference_frame, scene))
    }

    async fn decode_frame(&self, take_id: i64, frame_number: u32) -> RepoResult<Frame> {
        if let Some(frame) = self.decode_cache.lock().unwrap().get(&(take_id, frame_number)).cloned() {
            return Ok(frame);
        }
        let frame = self.frame_source.frame(take_id, frame_number).await?;
        self.decode_cache.lock().unwrap().put((take_id, frame_number), frame.clone());
        Ok(frame)
    }

    async fn process_pair_across_detectors(&self, pair: FramePair) {
        let scene_tag = pair.scene.cache_tag();
        let frame_number = pair.current_frame_number;
        let mut tasks = Vec::new();

        for (name, slot) in &self.detectors {
            let is_enabled = slot.instance.lock().unwrap().is_enabled();
            if !is_enabled {
                continue;
            }

            let name = name.clone();
            let slot = Arc::clone(slot);
            let cache = Arc::clone(&self.cache);
            let pair = pair.clone();
            let scene_tag = scene_tag.clone();

            let task = tokio::spawn(async move {
                let frame_hash = CacheKey::frame_content_hash(&pair.current_frame.bytes);
                let config_hash = CacheKey::config_hash(&slot.config);
                let version = { slot.instance.lock().unwrap().package_version.clone() };
                let key = CacheKey::new(&frame_hash, &name, &version, &config_hash, Some(&scene_tag));

                let started = std::time::Instant::now();
                let detections = match cache.get(&key) {
                    Some(cached) => cached,
                    None => {
                        let fetched = slot.adapter.process_frame(pair.current_frame_number, pair.take_id).await;
                        let _ = cache.put(&key, fetched.clone());
                        fetched
                    }
                };
                let processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;

                {
                    let mut instance = slot.instance.lock().unwrap();
                    instance.total_processed += 1;
                    instance.total_errors_found += detections.iter().filter(|d| !d.is_failure() && d.confidence > 0.5).count() as u64;
                }

                (name, detections, processing_time_ms)
            });
            tasks.push(task);
        }

        for task in tasks {
            match tokio::time::timeout(PER_DETECTOR_JOIN_TIMEOUT, task).await {
                Ok(Ok((name, detections, processing_time_ms))) => {
                    match detections.iter().find(|d| d.is_failure()) {
                        Some(failure) => {
                            self.supervisor.report_failure(&name, frame_number, &failure.description);
                        }
                        None => self.supervisor.report_success(&name, frame_number, processing_time_ms),
                    }

                    for detection in &detections {
                        let result = self
                            .result_sink
                            .append_detection(
                                self.take_id,
                                detection.frame_number,
                                &detection.detector_name,
                                detection.confidence,
                                &detection.description,
                                &detection.bounding_boxes,
                                &detection.metadata,
                            )
                            .await;
                        if result.is_err() {
                            warn!(take_id = self.take_id, detector = %name, frame_number, "failed to append detection to result sink");
                        }
                    }

                    let mut state = self.state.lock().unwrap();
                    state.accumulated.entry(name).or_default().extend(detections);
                }
                Ok(Err(e)) => warn!(take_id = self.take_id, error = %e, "detector worker task panicked"),
                Err(_) => warn!(take_id = self.take_id, "detector worker task timed out waiting 30s"),
            }
        }
    }

    /// Single-shot path used during live capture: one frame pair, all
    /// enabled detectors for the scene, no worker-loop bookkeeping.
    pub async fn process_frame_pair_live(&self, reference_take_id: i64, frame_number: u32) -> Result<(), OrchestratorError> {
        let pair = self.build_frame_pair(reference_take_id, frame_number).await?;
        self.process_pair_across_detectors(pair).await;
        self.result_sink.record_frame_processed(self.take_id, frame_number).await?;
        Ok(())
    }

    async fn finalize(&self) {
        let accumulated = {
            let mut state = self.state.lock().unwrap();
            state.is_running = false;
            std::mem::take(&mut state.accumulated)
        };

        let mut total_errors_found = 0u64;
        for (_, detections) in accumulated {
            let groups: Vec<ContinuousError> = self.grouping.group_and_summarize(detections);
            total_errors_found += groups.len() as u64;
            for group in groups {
                if self.result_sink.record_error(self.take_id, &group).await.is_err() {
                    warn!(take_id = self.take_id, group_id = %group.group_id, "failed to persist continuity error group");
                }
            }
        }

        let _ = self.result_sink.record_processing_complete(self.take_id).await;

        let (total_frames_processed, started_at) = {
            let state = self.state.lock().unwrap();
            (state.processed_frames, state.started_at)
        };
        let duration_ms = started_at.map(|s| (Utc::now() - s).num_milliseconds()).unwrap_or(0);

        self.event_bus.publish(DomainEvent::ProcessingComplete(ProcessingCompleteEvent {
            take_id: self.take_id,
            total_frames_processed,
            total_errors_found,
            duration_ms,
            timestamp: Utc::now(),
        }));

        info!(take_id = self.take_id, total_frames_processed, total_errors_found, "take processing complete");
    }
}

/// Bridges the orchestrator's detector map into the recovery supervisor's
/// narrow `DetectorControl` view, so the supervisor never needs the
/// orchestrator's full type.
pub struct OrchestratorDetectorControl {
    detectors: HashMap<String, Arc<DetectorSlot>>,
}

impl OrchestratorDetectorControl {
    pub fn new(detectors: HashMap<String, Arc<DetectorSlot>>) -> Self {
        Self { detectors }
    }
}

impl DetectorControl for OrchestratorDetectorControl {
    fn restart(&self, detector_name: &str) -> Result<(), String> {
        let slot = self.detectors.get(detector_name).ok_or("unknown detector")?;
        let mut instance = slot.instance.lock().unwrap();
        instance.status = instance.status.on_recovery_ok();
        Ok(())
    }

    fn restart_skip_frames(&self, detector_name: &str, _skip_count: u32) -> Result<(), String> {
        self.restart(detector_name)
    }

    fn enable_fallback_mode(&self, detector_name: &str) -> Result<(), String> {
        self.restart(detector_name)
    }

    fn disable(&self, detector_name: &str, _reason: &str) -> Result<(), String> {
        let slot = self.detectors.get(detector_name).ok_or("unknown detector")?;
        let mut instance = slot.instance.lock().unwrap();
        instance.status = instance.status.on_failure();
        Ok(())
    }
}

/// Bridges the recovery supervisor's event reports onto the shared event
/// bus, so the supervisor never holds an `EventBus` directly.
pub struct EventBusSupervisorSink {
    event_bus: EventBus,
}

impl EventBusSupervisorSink {
    pub fn new(event_bus: EventBus) -> Self {
        Self { event_bus }
    }
}

impl SupervisorSink for EventBusSupervisorSink {
    fn emit(&self, event: DomainEvent) {
        self.event_bus.publish(event);
    }
}

/// Convenience constructor tying an orchestrator's detectors to a fresh
/// recovery supervisor through the narrow trait pair.
pub fn build_recovery_supervisor(
    take_id: i64,
    config: crate::application::services::SupervisorConfig,
    event_bus: EventBus,
    detectors: HashMap<String, Arc<DetectorSlot>>,
) -> RecoverySupervisor {
    let sink = Arc::new(EventBusSupervisorSink::new(event_bus));
    let control = Arc::new(OrchestratorDetectorControl::new(detectors));
    RecoverySupervisor::new(take_id, config, sink, control)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::services::{CacheConfig, SandboxTransport};
    use crate::domain::entities::SceneContext;
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex as StdMutex;

    struct FakeFrameSource {
        current_count: u32,
        reference_count: u32,
    }

    #[async_trait]
    impl FrameSource for FakeFrameSource {
        async fn scene_context(&self, _take_id: i64) -> RepoResult<SceneContext> {
            Ok(SceneContext::new(1, 1, 1))
        }

        async fn frame(&self, take_id: i64, frame_number: u32) -> RepoResult<Frame> {
            Ok(Frame::new(take_id, frame_number, frame_number as f64, vec![frame_number as u8; 8]))
        }

        async fn reference_frame_number(&self, _take_id: i64, current_frame_number: u32) -> RepoResult<Option<u32>> {
            Ok(Some(current_frame_number.min(self.reference_count.saturating_sub(1))))
        }

        async fn frame_count(&self, take_id: i64) -> RepoResult<u32> {
            if take_id == 1 { Ok(self.current_count) } else { Ok(self.reference_count) }
        }
    }

    #[derive(Default)]
    struct RecordingResultSink {
        frames_processed: StdMutex<Vec<u32>>,
        errors: StdMutex<Vec<ContinuousError>>,
        completed: StdMutex<bool>,
        detections: StdMutex<StdHashMap<(u32, String, String), Detection>>,
    }

    #[async_trait]
    impl ResultSink for RecordingResultSink {
        async fn record_error(&self, _take_id: i64, error: &ContinuousError) -> RepoResult<()> {
            self.errors.lock().unwrap().push(error.clone());
            Ok(())
        }

        async fn record_frame_processed(&self, _take_id: i64, frame_number: u32) -> RepoResult<()> {
            self.frames_processed.lock().unwrap().push(frame_number);
            Ok(())
        }

        async fn record_processing_complete(&self, _take_id: i64) -> RepoResult<()> {
            *self.completed.lock().unwrap() = true;
            Ok(())
        }

        async fn append_detection(
            &self,
            take_id: i64,
            frame_id: u32,
            detector_name: &str,
            confidence: f32,
            description: &str,
            bounding_boxes: &[crate::domain::value_objects::BoundingBox],
            metadata: &StdHashMap<String, serde_json::Value>,
        ) -> RepoResult<()> {
            let mut detection = Detection::new(detector_name, "1.0.0", take_id, frame_id, confidence, description);
            detection.bounding_boxes = bounding_boxes.to_vec();
            detection.metadata = metadata.clone();
            self.detections
                .lock()
                .unwrap()
                .insert((frame_id, detector_name.to_string(), description.to_string()), detection);
            Ok(())
        }

        async fn get_grouped_results(&self, _take_id: i64) -> RepoResult<Vec<ContinuousError>> {
            Ok(self.errors.lock().unwrap().clone())
        }
    }

    struct StubTransport;
    impl SandboxTransport for StubTransport {
        fn call(&mut self, request: serde_json::Value, _timeout: Duration) -> Result<serde_json::Value, crate::application::services::SandboxError> {
            let method = request.get("method").and_then(serde_json::Value::as_str).unwrap_or_default();
            match method {
                "process_frame" => Ok(serde_json::json!({ "success": true, "data": [] })),
                _ => Ok(serde_json::json!({ "success": true })),
            }
        }
    }

    fn detector_slot(name: &str) -> Arc<DetectorSlot> {
        let adapter = SandboxAdapter::new(name, "1.0.0", Box::new(StubTransport), Duration::from_secs(5));
        let mut instance = DetectorInstance::new(name, "1.0.0", 1, DetectorConfig::new(), 5.0);
        instance.status = instance.status.on_initialize_ok();
        Arc::new(DetectorSlot { adapter: Arc::new(adapter), config: DetectorConfig::new(), instance: std::sync::Mutex::new(instance) })
    }

    struct DetectingTransport;
    impl SandboxTransport for DetectingTransport {
        fn call(&mut self, request: serde_json::Value, _timeout: Duration) -> Result<serde_json::Value, crate::application::services::SandboxError> {
            let method = request.get("method").and_then(serde_json::Value::as_str).unwrap_or_default();
            match method {
                "process_frame" => {
                    let frame_id = request.get("params").and_then(|p| p.get("frame_id")).cloned().unwrap_or(serde_json::json!(0));
                    Ok(serde_json::json!({
                        "success": true,
                        "data": [{
                            "confidence": 0.9,
                            "description": "red prop missing",
                            "frame_id": frame_id,
                            "bounding_boxes": [],
                            "metadata": {},
                        }],
                    }))
                }
                _ => Ok(serde_json::json!({ "success": true })),
            }
        }
    }

    fn detecting_detector_slot(name: &str) -> Arc<DetectorSlot> {
        let adapter = SandboxAdapter::new(name, "1.0.0", Box::new(DetectingTransport), Duration::from_secs(5));
        let mut instance = DetectorInstance::new(name, "1.0.0", 1, DetectorConfig::new(), 5.0);
        instance.status = instance.status.on_initialize_ok();
        Arc::new(DetectorSlot { adapter: Arc::new(adapter), config: DetectorConfig::new(), instance: std::sync::Mutex::new(instance) })
    }

    #[tokio::test]
    async fn scenario_p12_orchestrator_appends_each_detection_to_the_result_sink() {
        let frame_source = Arc::new(FakeFrameSource { current_count: 3, reference_count: 3 });
        let sink = Arc::new(RecordingResultSink::default());
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ResultCache::new(CacheConfig { cache_dir: cache_dir.path().to_path_buf(), ..CacheConfig::default() }));
        let bus = EventBus::new();

        let mut detectors = StdHashMap::new();
        detectors.insert("d".to_string(), detecting_detector_slot("d"));

        let orchestrator = Arc::new(Orchestrator::new(1, frame_source, sink.clone(), cache, bus, detectors));
        orchestrator.start(2).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        orchestrator.stop().await.ok();

        let detections = sink.detections.lock().unwrap();
        assert!(!detections.is_empty(), "the orchestrator must append every produced detection to the result sink");
        assert!(detections.values().all(|d| d.description == "red prop missing"));
    }

    #[tokio::test]
    async fn scenario_six_orchestrator_truncates_to_shorter_take() {
        let frame_source = Arc::new(FakeFrameSource { current_count: 100, reference_count: 50 });
        let sink = Arc::new(RecordingResultSink::default());
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ResultCache::new(CacheConfig { cache_dir: cache_dir.path().to_path_buf(), ..CacheConfig::default() }));
        let bus = EventBus::new();

        let mut detectors = StdHashMap::new();
        detectors.insert("d".to_string(), detector_slot("d"));

        let orchestrator = Arc::new(Orchestrator::new(1, frame_source, sink.clone(), cache, bus, detectors));
        orchestrator.start(2).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        orchestrator.stop().await.ok();

        let frames_seen = sink.frames_processed.lock().unwrap().clone();
        assert!(frames_seen.iter().all(|&f| f < 50), "no frame >= 50 should ever be offered: {frames_seen:?}");
        assert_eq!(orchestrator.status().total_frames, 50);
    }

    struct FailingTransport;
    impl SandboxTransport for FailingTransport {
        fn call(&mut self, request: serde_json::Value, _timeout: Duration) -> Result<serde_json::Value, crate::application::services::SandboxError> {
            let method = request.get("method").and_then(serde_json::Value::as_str).unwrap_or_default();
            match method {
                "process_frame" => Ok(serde_json::json!({ "success": false, "error": "model failed to load" })),
                _ => Ok(serde_json::json!({ "success": true })),
            }
        }
    }

    fn failing_detector_slot(name: &str) -> Arc<DetectorSlot> {
        let adapter = SandboxAdapter::new(name, "1.0.0", Box::new(FailingTransport), Duration::from_secs(5));
        let mut instance = DetectorInstance::new(name, "1.0.0", 1, DetectorConfig::new(), 5.0);
        instance.status = instance.status.on_initialize_ok();
        Arc::new(DetectorSlot { adapter: Arc::new(adapter), config: DetectorConfig::new(), instance: std::sync::Mutex::new(instance) })
    }

    #[tokio::test]
    async fn repeated_detector_failures_publish_failure_and_disabled_events() {
        let frame_source = Arc::new(FakeFrameSource { current_count: 20, reference_count: 20 });
        let sink = Arc::new(RecordingResultSink::default());
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ResultCache::new(CacheConfig { cache_dir: cache_dir.path().to_path_buf(), ..CacheConfig::default() }));
        let bus = EventBus::new();
        let mut subscriber = bus.subscribe();

        let mut detectors = StdHashMap::new();
        detectors.insert("d".to_string(), failing_detector_slot("d"));

        let orchestrator = Arc::new(Orchestrator::new(1, frame_source, sink.clone(), cache, bus, detectors));
        orchestrator.start(2).await.unwrap();

        let mut saw_failure = false;
        let mut saw_disabled = false;
        for _ in 0..200 {
            match tokio::time::timeout(Duration::from_millis(50), subscriber.recv()).await {
                Ok(Some(event)) => match &*event {
                    DomainEvent::DetectorFailure(_) => saw_failure = true,
                    DomainEvent::DetectorDisabled(_) => saw_disabled = true,
                    _ => {}
                },
                _ => {
                    if saw_disabled {
                        break;
                    }
                }
            }
        }
        orchestrator.stop().await.ok();

        assert!(saw_failure, "expected at least one DetectorFailure event");
        assert!(saw_disabled, "expected the detector to be disabled after repeated failures");
    }

    #[tokio::test]
    async fn start_rejects_empty_reference_take() {
        let frame_source = Arc::new(FakeFrameSource { current_count: 10, reference_count: 0 });
        let sink = Arc::new(RecordingResultSink::default());
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ResultCache::new(CacheConfig { cache_dir: cache_dir.path().to_path_buf(), ..CacheConfig::default() }));
        let bus = EventBus::new();
        let orchestrator = Arc::new(Orchestrator::new(1, frame_source, sink, cache, bus, StdHashMap::new()));

        let result = orchestrator.start(2).await;
        assert!(matches!(result, Err(OrchestratorError::NoReferenceTake(_))));
    }
}
