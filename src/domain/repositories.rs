//! Collaborator Traits
//!
//! The engine never owns persistent storage; takes, scenes, frames, and the
//! final error record all live in an external system. These traits are the
//! seam: the engine pulls frame pairs through `FrameSource` and pushes
//! results through `ResultSink`, and the binary wires in whatever adapter
//! talks to the real storage layer.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::entities::{ContinuousError, Frame, SceneContext};
use crate::domain::value_objects::BoundingBox;

/// Result type for collaborator operations.
pub type RepoResult<T> = Result<T, RepositoryError>;

/// Collaborator error types.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("collaborator I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Supplies frames for a take. The engine calls this to pull the next frame
/// pair to queue; it never reads frame bytes from disk itself.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// The scene/angle/project context for a take, used for cache scoping
    /// and detector selection.
    async fn scene_context(&self, take_id: i64) -> RepoResult<SceneContext>;

    /// Fetches a single frame by take and frame number.
    async fn frame(&self, take_id: i64, frame_number: u32) -> RepoResult<Frame>;

    /// The reference-take frame number paired with a given current-take
    /// frame number, if a reference take is configured for the scene.
    async fn reference_frame_number(&self, take_id: i64, current_frame_number: u32) -> RepoResult<Option<u32>>;

    /// Total frame count for a take, used to detect end-of-take.
    async fn frame_count(&self, take_id: i64) -> RepoResult<u32>;
}

/// Receives the engine's output: continuity error groups and per-frame
/// progress. The engine never persists these itself.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Persists a finalized continuity error group.
    async fn record_error(&self, take_id: i64, error: &ContinuousError) -> RepoResult<()>;

    /// Records that a frame finished processing, for progress reporting.
    async fn record_frame_processed(&self, take_id: i64, frame_number: u32) -> RepoResult<()>;

    /// Marks a take's processing run complete.
    async fn record_processing_complete(&self, take_id: i64) -> RepoResult<()>;

    /// Persists a single raw per-frame Detection, per spec.md S6. Keyed by
    /// `(take_id, frame_id, detector_name, description)`: a call that
    /// repeats an existing key is an update to that record, not a second
    /// append (P12 - idempotent store).
    async fn append_detection(
        &self,
        take_id: i64,
        frame_id: u32,
        detector_name: &str,
        confidence: f32,
        description: &str,
        bounding_boxes: &[BoundingBox],
        metadata: &HashMap<String, Value>,
    ) -> RepoResult<()>;

    /// The continuity error groups recorded so far for a take, as last
    /// written by `record_error`.
    async fn get_grouped_results(&self, take_id: i64) -> RepoResult<Vec<ContinuousError>>;
}

/// Supplies raw, decoded frame bytes from an uploaded video file for the
/// batch pipeline (C8). Distinct from `FrameSource`, which reads already
/// extracted per-frame assets out of storage: a batch run operates
/// directly on a video container, so opening/seeking/decoding it is
/// treated the same way capture is — an opaque external collaborator the
/// engine is handed a handle to, not something it implements itself.
pub trait VideoSource: Send + Sync {
    /// Total decodable frame count in the container.
    fn total_frames(&self) -> RepoResult<u32>;

    /// Reads one frame's raw (encoded) bytes by its index in the
    /// container.
    fn read_frame(&self, frame_number: u32) -> RepoResult<Vec<u8>>;
}
