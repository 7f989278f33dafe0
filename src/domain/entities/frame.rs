//! Frame and FramePair Entities
//!
//! A Frame is a single captured image; a FramePair ships a current frame and its
//! reference-take counterpart to detectors together.

use chrono::{DateTime, Utc};

/// A single captured frame. Identity is `(take_id, frame_number)`.
/// Immutable once written, owned by storage; the engine only ever holds
/// short-lived decoded copies.
#[derive(Debug, Clone)]
pub struct Frame {
    pub take_id: i64,
    pub frame_number: u32,
    /// Monotonic seconds from the start of the take.
    pub capture_timestamp: f64,
    /// Opaque encoded (PNG/JPEG) image bytes.
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(take_id: i64, frame_number: u32, capture_timestamp: f64, bytes: Vec<u8>) -> Self {
        Self {
            take_id,
            frame_number,
            capture_timestamp,
            bytes,
            width: 0,
            height: 0,
        }
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

/// Scene/angle/project context carried alongside a FramePair for cache scoping
/// and event payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneContext {
    pub project_id: i64,
    pub scene_id: i64,
    pub angle_id: i64,
}

impl SceneContext {
    pub fn new(project_id: i64, scene_id: i64, angle_id: i64) -> Self {
        Self {
            project_id,
            scene_id,
            angle_id,
        }
    }

    /// The `scene_{id}_angle_{id}` tag used to scope cache keys.
    pub fn cache_tag(&self) -> String {
        format!("scene_{}_angle_{}", self.scene_id, self.angle_id)
    }
}

/// A pair of frames shipped together to a detector: the current take's frame
/// and the corresponding frame from the reference take. Constructed by the
/// orchestrator; its lifetime is a single queueing+processing cycle.
#[derive(Debug, Clone)]
pub struct FramePair {
    pub take_id: i64,
    pub current_frame_number: u32,
    pub reference_frame_number: u32,
    pub current_frame: Frame,
    pub reference_frame: Frame,
    pub scene: SceneContext,
    pub created_at: DateTime<Utc>,
}

impl FramePair {
    pub fn new(current_frame: Frame, reference_frame: Frame, scene: SceneContext) -> Self {
        Self {
            take_id: current_frame.take_id,
            current_frame_number: current_frame.frame_number,
            reference_frame_number: reference_frame.frame_number,
            current_frame,
            reference_frame,
            scene,
            created_at: Utc::now(),
        }
    }

    /// Identity tuple used for de-duplication and logging.
    pub fn identity(&self) -> (i64, u32, u32) {
        (self.take_id, self.current_frame_number, self.reference_frame_number)
    }
}
