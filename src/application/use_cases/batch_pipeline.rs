//! Batch Pipeline (C8)
//!
//! Processes an uploaded video file end to end: segments it into fixed-size
//! chunks, runs segments across a resource-throttled worker pool, optionally
//! deduplicates near-identical frames with a cheap perceptual hash, and
//! terminates a segment early once the cumulative error count floods past a
//! threshold. This is the parallel variant of the orchestrator (C7) driven
//! from a video file instead of a live capture feed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use image::GenericImageView;
use md5::{Digest, Md5};
use sysinfo::System;
use tracing::{info, warn};

use crate::application::services::EventBus;
use crate::domain::entities::Detection;
use crate::domain::events::{BatchProgressEvent, DomainEvent};
use crate::domain::repositories::{RepoResult, VideoSource};

/// Tunables for the batch video pipeline, mirrored 1:1 on spec.md S4.8's
/// literal defaults.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub segment_size: u32,
    pub max_parallel_segments: usize,
    pub early_termination_error_threshold: u32,
    pub processing_timeout_seconds: u64,
    pub dedup_enabled: bool,
    pub resource_poll_interval_seconds: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            segment_size: 300,
            max_parallel_segments: 4,
            early_termination_error_threshold: 10,
            processing_timeout_seconds: 300,
            dedup_enabled: true,
            resource_poll_interval_seconds: 2,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("video source error: {0}")]
    Video(#[from] crate::domain::repositories::RepositoryError),
    #[error("segment {0} timed out after {1}s")]
    SegmentTimeout(u32, u64),
}

/// One fixed-size chunk of the video, processed independently.
#[derive(Debug, Clone)]
pub struct VideoSegment {
    pub segment_id: u32,
    pub start_frame: u32,
    pub end_frame: u32,
    pub total_frames: u32,
}

/// Lifecycle status of one segment's processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Per-segment progress, reported into the aggregated `BatchProgress`.
#[derive(Debug, Clone)]
pub struct SegmentProgress {
    pub segment_id: u32,
    pub status: SegmentStatus,
    pub processed_frames: u32,
    pub total_frames: u32,
    pub error: Option<String>,
    pub processing_time_ms: Option<i64>,
}

impl SegmentProgress {
    fn pending(segment: &VideoSegment) -> Self {
        Self {
            segment_id: segment.segment_id,
            status: SegmentStatus::Pending,
            processed_frames: 0,
            total_frames: segment.total_frames,
            error: None,
            processing_time_ms: None,
        }
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_frames == 0 {
            0.0
        } else {
            (self.processed_frames as f64 / self.total_frames as f64) * 100.0
        }
    }
}

/// Aggregated progress across every segment in the batch.
#[derive(Debug, Clone)]
pub struct BatchProgress {
    pub batch_id: String,
    pub segments: Vec<SegmentProgress>,
    pub fps: f64,
    pub eta_seconds: Option<f64>,
}

impl BatchProgress {
    pub fn completed_segments(&self) -> u32 {
        self.segments.iter().filter(|s| s.status == SegmentStatus::Completed).count() as u32
    }

    pub fn failed_segments(&self) -> u32 {
        self.segments.iter().filter(|s| s.status == SegmentStatus::Failed).count() as u32
    }
}

/// Final summary returned once every segment has settled.
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub batch_id: String,
    pub total_segments: u32,
    pub successful_segments: u32,
    pub failed_segments: u32,
    pub total_frames_processed: u32,
    pub duration_ms: i64,
    pub results: HashMap<u32, Vec<Detection>>,
}

/// Narrow interface onto the detector fan-out, so the batch pipeline does
/// not depend on the orchestrator's full type — mirroring the
/// `SupervisorSink`/`DetectorControl` split spec.md S9 calls for between
/// the orchestrator and supervisor.
pub trait BatchDetectorFanOut: Send + Sync {
    fn process_frame(&self, take_id: i64, frame_number: u32, frame_bytes: &[u8]) -> Vec<Detection>;
}

/// Polls system memory/CPU every `poll_interval` and recommends a worker
/// count: halve the configured maximum above 80% utilization, take
/// three-quarters above 60%.
pub struct ResourceMonitor {
    system: Mutex<System>,
    max_workers: usize,
    memory_percent: AtomicU32,
    cpu_percent: AtomicU32,
}

impl ResourceMonitor {
    pub fn new(max_workers: usize) -> Self {
        Self {
            system: Mutex::new(System::new_all()),
            max_workers,
            memory_percent: AtomicU32::new(0),
            cpu_percent: AtomicU32::new(0),
        }
    }

    /// Re-samples memory and CPU usage. Cheap enough to call from a
    /// periodic background task.
    pub fn refresh(&self) {
        let mut system = self.system.lock().unwrap();
        system.refresh_memory();
        system.refresh_cpu_usage();

        let memory_percent = if system.total_memory() > 0 {
            (system.used_memory() as f64 / system.total_memory() as f64) * 100.0
        } else {
            0.0
        };
        let cpu_percent = if system.cpus().is_empty() {
            0.0
        } else {
            system.cpus().iter().map(|c| c.cpu_usage() as f64).sum::<f64>() / system.cpus().len() as f64
        };

        self.memory_percent.store(memory_percent as u32, Ordering::Relaxed);
        self.cpu_percent.store(cpu_percent as u32, Ordering::Relaxed);
    }

    fn throttle(base: usize, usage_percent: f64) -> usize {
        if usage_percent > 80.0 {
            (base / 2).max(1)
        } else if usage_percent > 60.0 {
            ((base as f64 * 0.75) as usize).max(1)
        } else {
            base
        }
    }

    pub fn recommended_workers(&self) -> usize {
        let memory = self.memory_percent.load(Ordering::Relaxed) as f64;
        let cpu = self.cpu_percent.load(Ordering::Relaxed) as f64;
        let by_cpu = Self::throttle(self.max_workers, cpu);
        let by_memory = Self::throttle(self.max_workers, memory);
        by_cpu.min(by_memory).max(1)
    }

    pub fn stats(&self) -> (f64, f64, usize) {
        (
            self.memory_percent.load(Ordering::Relaxed) as f64,
            self.cpu_percent.load(Ordering::Relaxed) as f64,
            self.recommended_workers(),
        )
    }
}

/// Rough near-duplicate detector over a rolling window of the last 30
/// frame hashes. A 32x32 greyscale MD5 is not a robust similarity measure
/// (spec.md S9 flags this explicitly); it is kept exactly as specified and
/// gated behind `BatchConfig::dedup_enabled` so correctness-critical runs
/// can disable it.
pub struct FrameDeduplicator {
    recent_hashes: Mutex<Vec<(String, u32)>>,
}

const RECENT_HASH_WINDOW: usize = 30;
const SIMILARITY_THRESHOLD: f64 = 0.8;

impl FrameDeduplicator {
    pub fn new() -> Self {
        Self { recent_hashes: Mutex::new(Vec::new()) }
    }

    /// MD5 of a 32x32 greyscale downsample of the frame.
    pub fn compute_hash(frame_bytes: &[u8]) -> Option<String> {
        let image = image::load_from_memory(frame_bytes).ok()?;
        let small = image.resize_exact(32, 32, image::imageops::FilterType::Nearest).grayscale();
        let (w, h) = small.dimensions();
        let mut hasher = Md5::new();
        for y in 0..h {
            for x in 0..w {
                hasher.update([small.get_pixel(x, y).0[0]]);
            }
        }
        Some(format!("{:x}", hasher.finalize()))
    }

    fn hashes_similar(a: &str, b: &str) -> bool {
        if a.len() != b.len() || a.is_empty() {
            return false;
        }
        let matches = a.chars().zip(b.chars()).filter(|(x, y)| x == y).count();
        (matches as f64 / a.len() as f64) >= SIMILARITY_THRESHOLD
    }

    /// Returns the original frame number this frame duplicates, if any, and
    /// records the frame's hash either way.
    pub fn check(&self, frame_number: u32, frame_bytes: &[u8]) -> Option<u32> {
        let Some(hash) = Self::compute_hash(frame_bytes) else { return None };
        let mut recent = self.recent_hashes.lock().unwrap();

        if let Some((_, original)) = recent.iter().find(|(h, _)| h == &hash) {
            return Some(*original);
        }

        for (stored_hash, original) in recent.iter().rev().take(RECENT_HASH_WINDOW) {
            if Self::hashes_similar(&hash, stored_hash) {
                return Some(*original);
            }
        }

        recent.push((hash, frame_number));
        if recent.len() > RECENT_HASH_WINDOW {
            recent.remove(0);
        }
        None
    }
}

impl Default for FrameDeduplicator {
    fn default() -> Self {
        Self::new()
    }
}

/// Processes one video file end to end for one take.
pub struct BatchPipeline {
    batch_id: String,
    take_id: i64,
    config: BatchConfig,
    video: Arc<dyn VideoSource>,
    fan_out: Arc<dyn BatchDetectorFanOut>,
    event_bus: EventBus,
    resource_monitor: Arc<ResourceMonitor>,
    cumulative_errors: Arc<AtomicU32>,
}

impl BatchPipeline {
    pub fn new(
        batch_id: impl Into<String>,
        take_id: i64,
        config: BatchConfig,
        video: Arc<dyn VideoSource>,
        fan_out: Arc<dyn BatchDetectorFanOut>,
        event_bus: EventBus,
    ) -> Self {
        let resource_monitor = Arc::new(ResourceMonitor::new(config.max_parallel_segments));
        Self {
            batch_id: batch_id.into(),
            take_id,
            config,
            video,
            fan_out,
            event_bus,
            resource_monitor,
            cumulative_errors: Arc::new(AtomicU32::new(0)),
        }
    }

    /// `ceil(total_frames / segment_size)` segments covering the whole
    /// video, the last one possibly shorter.
    pub fn segment_video(&self, total_frames: u32) -> Vec<VideoSegment> {
        if total_frames == 0 {
            return Vec::new();
        }
        let segment_size = self.config.segment_size.max(1);
        let segment_count = total_frames.div_ceil(segment_size);

        (0..segment_count)
            .map(|i| {
                let start_frame = i * segment_size;
                let end_frame = ((i + 1) * segment_size).min(total_frames);
                VideoSegment { segment_id: i, start_frame, end_frame, total_frames: end_frame - start_frame }
            })
            .collect()
    }

    /// Runs every segment through the resource-throttled worker pool and
    /// returns the merged results once the whole video has settled.
    pub async fn run(self: Arc<Self>) -> Result<BatchSummary, BatchError> {
        let start = Instant::now();
        let total_frames = self.video.total_frames()?;
        let segments = self.segment_video(total_frames);
        let total_segments = segments.len() as u32;

        let progress: Arc<Mutex<Vec<SegmentProgress>>> =
            Arc::new(Mutex::new(segments.iter().map(SegmentProgress::pending).collect()));
        let results: Arc<Mutex<HashMap<u32, Vec<Detection>>>> = Arc::new(Mutex::new(HashMap::new()));
        let deduplicator = Arc::new(FrameDeduplicator::new());

        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let monitor_handle = {
            let resource_monitor = Arc::clone(&self.resource_monitor);
            let done = Arc::clone(&done);
            let poll_interval = Duration::from_secs(self.config.resource_poll_interval_seconds.max(1));
            tokio::spawn(async move {
                resource_monitor.refresh();
                while !done.load(Ordering::Relaxed) {
                    tokio::time::sleep(poll_interval).await;
                    resource_monitor.refresh();
                }
            })
        };

        let active = Arc::new(AtomicUsize::new(0));
        let mut join_set = tokio::task::JoinSet::new();

        for segment in segments {
            loop {
                if active.load(Ordering::SeqCst) < self.resource_monitor.recommended_workers() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }

            active.fetch_add(1, Ordering::SeqCst);
            let pipeline = Arc::clone(&self);
            let progress = Arc::clone(&progress);
            let results = Arc::clone(&results);
            let deduplicator = Arc::clone(&deduplicator);
            let active = Arc::clone(&active);

            join_set.spawn(async move {
                let timeout = Duration::from_secs(pipeline.config.processing_timeout_seconds);
                let outcome = tokio::time::timeout(
                    timeout,
                    pipeline.process_segment(segment.clone(), Arc::clone(&deduplicator)),
                )
                .await;

                let segment_progress = match outcome {
                    Ok(Ok((segment_results, processed))) => {
                        results.lock().unwrap().extend(segment_results);
                        SegmentProgress {
                            segment_id: segment.segment_id,
                            status: SegmentStatus::Completed,
                            processed_frames: processed,
                            total_frames: segment.total_frames,
                            error: None,
                            processing_time_ms: None,
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(segment_id = segment.segment_id, error = %e, "batch segment failed");
                        SegmentProgress {
                            segment_id: segment.segment_id,
                            status: SegmentStatus::Failed,
                            processed_frames: 0,
                            total_frames: segment.total_frames,
                            error: Some(e.to_string()),
                            processing_time_ms: None,
                        }
                    }
                    Err(_) => {
                        warn!(segment_id = segment.segment_id, "batch segment timed out");
                        SegmentProgress {
                            segment_id: segment.segment_id,
                            status: SegmentStatus::Failed,
                            processed_frames: 0,
                            total_frames: segment.total_frames,
                            error: Some("segment processing timed out".to_string()),
                            processing_time_ms: None,
                        }
                    }
                };

                {
                    let mut progress = progress.lock().unwrap();
                    if let Some(slot) = progress.iter_mut().find(|p| p.segment_id == segment_progress.segment_id) {
                        *slot = segment_progress;
                    }
                }
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }

        while join_set.join_next().await.is_some() {
            let snapshot = progress.lock().unwrap().clone();
            self.publish_progress(&snapshot, total_segments, start.elapsed());
        }

        done.store(true, Ordering::Relaxed);
        let _ = monitor_handle.await;

        let final_progress = progress.lock().unwrap().clone();
        let successful_segments = final_progress.iter().filter(|p| p.status == SegmentStatus::Completed).count() as u32;
        let failed_segments = final_progress.iter().filter(|p| p.status == SegmentStatus::Failed).count() as u32;
        let total_frames_processed: u32 = final_progress.iter().map(|p| p.processed_frames).sum();

        Ok(BatchSummary {
            batch_id: self.batch_id.clone(),
            total_segments,
            successful_segments,
            failed_segments,
            total_frames_processed,
            duration_ms: start.elapsed().as_millis() as i64,
            results: Arc::try_unwrap(results).map(|m| m.into_inner().unwrap()).unwrap_or_default(),
        })
    }

    fn publish_progress(&self, segments: &[SegmentProgress], total_segments: u32, elapsed: Duration) {
        let completed = segments.iter().filter(|p| p.status == SegmentStatus::Completed).count() as u32;
        let failed = segments.iter().filter(|p| p.status == SegmentStatus::Failed).count() as u32;
        let processed_frames: u32 = segments.iter().map(|p| p.processed_frames).sum();
        let fps = if elapsed.as_secs_f64() > 0.0 { processed_frames as f64 / elapsed.as_secs_f64() } else { 0.0 };
        let remaining_segments = total_segments.saturating_sub(completed + failed);
        let eta_seconds = if completed > 0 && fps > 0.0 {
            let avg_frames_per_segment = processed_frames as f64 / completed.max(1) as f64;
            Some((remaining_segments as f64 * avg_frames_per_segment) / fps)
        } else {
            None
        };

        self.event_bus.publish(DomainEvent::BatchProgress(BatchProgressEvent {
            batch_id: self.batch_id.clone(),
            completed_segments: completed,
            total_segments,
            failed_segments: failed,
            fps,
            eta_seconds,
            timestamp: Utc::now(),
        }));
    }

    /// Processes one segment: reads frames sequentially, optionally
    /// deduplicates, and hands each frame to the detector fan-out,
    /// stopping early once the pipeline-wide error count floods past the
    /// configured threshold.
    async fn process_segment(
        &self,
        segment: VideoSegment,
        deduplicator: Arc<FrameDeduplicator>,
    ) -> Result<(HashMap<u32, Vec<Detection>>, u32), BatchError> {
        let mut results = HashMap::new();
        let mut processed = 0u32;

        for frame_number in segment.start_frame..segment.end_frame {
            if self.cumulative_errors.load(Ordering::Relaxed) >= self.config.early_termination_error_threshold {
                info!(segment_id = segment.segment_id, "early termination: error flood threshold reached");
                break;
            }

            let frame_bytes = self.video.read_frame(frame_number)?;

            if self.config.dedup_enabled {
                if let Some(original) = deduplicator.check(frame_number, &frame_bytes) {
                    let reused = results.get(&original).cloned().unwrap_or_default();
                    results.insert(frame_number, reused);
                    processed += 1;
                    continue;
                }
            }

            let detections = self.fan_out.process_frame(self.take_id, frame_number, &frame_bytes);
            let error_count = detections.iter().filter(|d| !d.is_failure() && d.confidence > 0.5).count() as u32;
            self.cumulative_errors.fetch_add(error_count, Ordering::Relaxed);

            results.insert(frame_number, detections);
            processed += 1;
        }

        Ok((results, processed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FakeVideo {
        frame_count: u32,
    }

    impl VideoSource for FakeVideo {
        fn total_frames(&self) -> RepoResult<u32> {
            Ok(self.frame_count)
        }

        fn read_frame(&self, frame_number: u32) -> RepoResult<Vec<u8>> {
            Ok(vec![frame_number as u8; 16])
        }
    }

    struct CountingFanOut {
        calls: std::sync::atomic::AtomicU32,
        confidence: f32,
    }

    impl BatchDetectorFanOut for CountingFanOut {
        fn process_frame(&self, take_id: i64, frame_number: u32, _frame_bytes: &[u8]) -> Vec<Detection> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            vec![Detection::new("d", "1.0.0", take_id, frame_number, self.confidence, "x")]
        }
    }

    fn pipeline(frame_count: u32, config: BatchConfig, confidence: f32) -> (Arc<BatchPipeline>, Arc<CountingFanOut>) {
        let video = Arc::new(FakeVideo { frame_count });
        let fan_out = Arc::new(CountingFanOut { calls: std::sync::atomic::AtomicU32::new(0), confidence });
        let bus = EventBus::new();
        let pipeline = Arc::new(BatchPipeline::new("batch-1", 1, config, video, fan_out.clone(), bus));
        (pipeline, fan_out)
    }

    #[test]
    fn segment_count_is_ceiling_division() {
        let (pipeline, _) = pipeline(0, BatchConfig { segment_size: 300, ..BatchConfig::default() }, 0.1);
        let segments = pipeline.segment_video(650);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[2].start_frame, 600);
        assert_eq!(segments[2].end_frame, 650);
        assert_eq!(segments[2].total_frames, 50);
    }

    #[test]
    fn empty_video_has_no_segments() {
        let (pipeline, _) = pipeline(0, BatchConfig::default(), 0.1);
        assert!(pipeline.segment_video(0).is_empty());
    }

    #[tokio::test]
    async fn run_processes_every_frame_when_below_error_threshold() {
        let config = BatchConfig { segment_size: 10, max_parallel_segments: 2, dedup_enabled: false, ..BatchConfig::default() };
        let (pipeline, fan_out) = pipeline(25, config, 0.1);
        let summary = pipeline.run().await.unwrap();

        assert_eq!(summary.total_frames_processed, 25);
        assert_eq!(summary.successful_segments, 3);
        assert_eq!(fan_out.calls.load(Ordering::SeqCst), 25);
    }

    #[tokio::test]
    async fn run_stops_early_once_cumulative_errors_flood() {
        let config = BatchConfig {
            segment_size: 50,
            max_parallel_segments: 1,
            early_termination_error_threshold: 3,
            dedup_enabled: false,
            ..BatchConfig::default()
        };
        let (pipeline, fan_out) = pipeline(50, config, 0.9);
        let summary = pipeline.run().await.unwrap();

        assert!(summary.total_frames_processed < 50);
        assert!(fan_out.calls.load(Ordering::SeqCst) < 50);
    }

    #[test]
    fn resource_monitor_halves_workers_above_80_percent() {
        let monitor = ResourceMonitor::new(4);
        monitor.memory_percent.store(90, Ordering::Relaxed);
        monitor.cpu_percent.store(10, Ordering::Relaxed);
        assert_eq!(monitor.recommended_workers(), 2);
    }

    #[test]
    fn resource_monitor_takes_three_quarters_above_60_percent() {
        let monitor = ResourceMonitor::new(4);
        monitor.memory_percent.store(65, Ordering::Relaxed);
        monitor.cpu_percent.store(10, Ordering::Relaxed);
        assert_eq!(monitor.recommended_workers(), 3);
    }

    #[test]
    fn hashes_sharing_exactly_80_percent_of_characters_count_as_similar() {
        // 10-char hashes sharing 8 characters sit exactly on the spec's
        // ">= 80%" boundary and must count as a duplicate.
        assert!(FrameDeduplicator::hashes_similar("aaaaaaaaaa", "aaaaaaaabb"));
        assert!(!FrameDeduplicator::hashes_similar("aaaaaaaaaa", "aaaaaaabbb"));
    }

    #[test]
    fn deduplicator_flags_exact_hash_repeats() {
        let dedup = FrameDeduplicator::new();
        // two 1x1 PNGs with identical pixel content hash identically.
        let bytes = one_pixel_png();
        assert_eq!(dedup.check(0, &bytes), None);
        assert_eq!(dedup.check(1, &bytes), Some(0));
    }

    fn one_pixel_png() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([10, 10, 10]));
        let mut bytes = Vec::new();
        let mut cursor = std::io::Cursor::new(&mut bytes);
        image::DynamicImage::ImageRgb8(img).write_to(&mut cursor, image::ImageOutputFormat::Png).unwrap();
        bytes
    }

    #[allow(dead_code)]
    async fn _type_check_async_trait_import() {
        // keeps the async_trait import meaningful if a future trait here needs it.
        struct _Unused;
        #[async_trait]
        trait _Marker {}
        impl _Marker for _Unused {}
    }
}
