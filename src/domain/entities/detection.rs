//! Detection and ContinuousError Entities
//!
//! A Detection is a single per-frame finding from one detector; a ContinuousError
//! is the grouping engine's derived view of the same underlying problem recurring
//! across consecutive or near-consecutive frames.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::value_objects::BoundingBox;

/// Sentinel confidence meaning "detector execution failed".
pub const FAILURE_CONFIDENCE: f32 = -1.0;

/// A single finding from one detector on one frame.
///
/// Invariant: `frame_number` matches the current frame of the pair it was
/// produced from. Immutable once stored except for the `false_positive` flag
/// and reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub confidence: f32,
    pub description: String,
    pub frame_number: u32,
    pub take_id: i64,
    pub detector_name: String,
    pub detector_version: String,
    #[serde(default)]
    pub bounding_boxes: Vec<BoundingBox>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub error_type: Option<String>,
    pub false_positive: bool,
    pub false_positive_reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Detection {
    pub fn new(
        detector_name: impl Into<String>,
        detector_version: impl Into<String>,
        take_id: i64,
        frame_number: u32,
        confidence: f32,
        description: impl Into<String>,
    ) -> Self {
        Self {
            confidence,
            description: description.into(),
            frame_number,
            take_id,
            detector_name: detector_name.into(),
            detector_version: detector_version.into(),
            bounding_boxes: Vec::new(),
            metadata: HashMap::new(),
            error_type: None,
            false_positive: false,
            false_positive_reason: None,
            timestamp: Utc::now(),
        }
    }

    /// A Detection representing a detector's own failure to execute.
    pub fn failure(
        detector_name: impl Into<String>,
        detector_version: impl Into<String>,
        take_id: i64,
        frame_number: u32,
        message: impl Into<String>,
    ) -> Self {
        Self::new(detector_name, detector_version, take_id, frame_number, FAILURE_CONFIDENCE, message)
    }

    pub fn with_bounding_boxes(mut self, boxes: Vec<BoundingBox>) -> Self {
        self.bounding_boxes = boxes;
        self
    }

    pub fn is_failure(&self) -> bool {
        self.confidence == FAILURE_CONFIDENCE
    }

    pub fn mark_false_positive(&mut self, reason: Option<String>) {
        self.false_positive = true;
        self.false_positive_reason = reason;
    }

    /// Description matching rule used throughout grouping: case-insensitive,
    /// trimmed.
    pub fn description_key(&self) -> String {
        self.description.trim().to_lowercase()
    }
}

/// Maps the deprecated enumerated confidence scale onto the float scheme.
/// `0 -> 0.0, 1 -> 0.9, 2 -> 0.6, 3 -> -1.0`. Used only at ingestion boundaries
/// that still emit the legacy enum; the engine itself only ever produces and
/// consumes the float scheme.
pub fn legacy_confidence_to_float(legacy: i32) -> f32 {
    match legacy {
        0 => 0.0,
        1 => 0.9,
        2 => 0.6,
        3 => FAILURE_CONFIDENCE,
        _ => FAILURE_CONFIDENCE,
    }
}

/// A grouping of Detections judged to be the same underlying continuity
/// problem appearing across consecutive or near-consecutive frames.
///
/// Invariant: all members share the same detector; frame numbers strictly
/// increase; any gap between consecutive member frames is <= 5.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuousError {
    pub group_id: String,
    pub detector_name: String,
    pub description: String,
    pub first_frame: u32,
    pub last_frame: u32,
    pub average_confidence: f32,
    pub members: Vec<Detection>,
    pub all_false_positive: bool,
}

impl ContinuousError {
    /// `"f"` when the group spans a single frame, `"f-g"` otherwise.
    pub fn frame_range(&self) -> String {
        if self.first_frame == self.last_frame {
            self.first_frame.to_string()
        } else {
            format!("{}-{}", self.first_frame, self.last_frame)
        }
    }

    pub fn is_single_frame(&self) -> bool {
        self.first_frame == self.last_frame
    }

    pub fn frame_count(&self) -> usize {
        self.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_detection_is_not_a_failure() {
        let d = Detection::new("D", "1.0.0", 1, 7, 0.9, "x");
        assert!(!d.is_failure());
    }

    #[test]
    fn failure_detection_carries_sentinel_confidence() {
        let d = Detection::failure("D", "1.0.0", 1, 7, "No response from detector process");
        assert!(d.is_failure());
        assert_eq!(d.confidence, FAILURE_CONFIDENCE);
    }

    #[test]
    fn description_key_is_trimmed_and_lowercased() {
        let d = Detection::new("D", "1.0.0", 1, 7, 0.9, "  Red Prop Missing  ");
        assert_eq!(d.description_key(), "red prop missing");
    }

    #[test]
    fn legacy_mapping_matches_documented_table() {
        assert_eq!(legacy_confidence_to_float(0), 0.0);
        assert_eq!(legacy_confidence_to_float(1), 0.9);
        assert_eq!(legacy_confidence_to_float(2), 0.6);
        assert_eq!(legacy_confidence_to_float(3), -1.0);
    }

    #[test]
    fn frame_range_formats_single_and_multi_frame_groups() {
        let mut group = ContinuousError {
            group_id: "g1".into(),
            detector_name: "D".into(),
            description: "x".into(),
            first_frame: 10,
            last_frame: 10,
            average_confidence: 0.9,
            members: vec![],
            all_false_positive: false,
        };
        assert_eq!(group.frame_range(), "10");
        group.last_frame = 20;
        assert_eq!(group.frame_range(), "10-20");
    }
}
