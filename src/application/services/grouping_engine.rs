//! Deduplication / Grouping Engine (C6)
//!
//! Collapses per-frame Detections from the same detector into continuous
//! error groups: the same underlying continuity problem recurring across
//! consecutive or near-consecutive frames is one finding for a human
//! reviewer, not one per frame.

use std::collections::HashMap;

use uuid::Uuid;

use crate::domain::entities::{ContinuousError, Detection};

/// Max frame gap between two detections of the same detector before they
/// are considered separate incidents.
const FRAME_GAP_THRESHOLD: u32 = 5;

/// Bounding-box IoU at or above this counts as a spatial match.
const IOU_THRESHOLD: f32 = 0.5;

/// Bounding-box center distance at or under this, in pixels, counts as a
/// spatial match even when IoU is zero (e.g. a slowly sliding prop).
const POSITION_THRESHOLD: f64 = 100.0;

struct OpenGroup {
    group_id: String,
    last_detection: Detection,
}

/// Stateless grouping: given a detector's Detections for a take (already
/// sorted or not), produces the same Detections tagged with group ids,
/// plus the derived `ContinuousError` summaries.
#[derive(Debug, Default)]
pub struct GroupingEngine;

impl GroupingEngine {
    pub fn new() -> Self {
        Self
    }

    /// Groups detections into continuous errors. Detections are first sorted
    /// by `(detector_name, frame_number)`, matching the grouping engine's
    /// scan order regardless of arrival order.
    ///
    /// Returns `(group_id, detection)` pairs in scan order, one per input
    /// detection (false-positive detections are grouped like any other;
    /// callers filter those out downstream if they want).
    pub fn group(&self, detections: Vec<Detection>) -> Vec<(String, Detection)> {
        if detections.is_empty() {
            return Vec::new();
        }

        let mut sorted = detections;
        sorted.sort_by(|a, b| {
            a.detector_name
                .cmp(&b.detector_name)
                .then(a.frame_number.cmp(&b.frame_number))
        });

        let mut open_groups: Vec<OpenGroup> = Vec::new();
        let mut tagged = Vec::with_capacity(sorted.len());

        for detection in sorted {
            let matched_index = open_groups.iter().position(|group| {
                group.last_detection.detector_name == detection.detector_name
                    && detection.frame_number >= group.last_detection.frame_number
                    && detection.frame_number - group.last_detection.frame_number <= FRAME_GAP_THRESHOLD
                    && Self::errors_match(&detection, &group.last_detection)
            });

            let group_id = match matched_index {
                Some(index) => {
                    let group = &mut open_groups[index];
                    group.last_detection = detection.clone();
                    group.group_id.clone()
                }
                None => {
                    let group_id = Uuid::new_v4().to_string();
                    open_groups.push(OpenGroup {
                        group_id: group_id.clone(),
                        last_detection: detection.clone(),
                    });
                    group_id
                }
            };

            tagged.push((group_id, detection));
        }

        tagged
    }

    /// Two detections describe the same incident when their (trimmed,
    /// lowercased) descriptions match, and either has no bounding boxes at
    /// all (text-only match) or at least one box pair overlaps by IoU or
    /// sits within the position threshold of each other.
    fn errors_match(a: &Detection, b: &Detection) -> bool {
        if a.description_key() != b.description_key() {
            return false;
        }

        if a.bounding_boxes.is_empty() || b.bounding_boxes.is_empty() {
            return true;
        }

        for box_a in &a.bounding_boxes {
            for box_b in &b.bounding_boxes {
                if box_a.iou(box_b) >= IOU_THRESHOLD {
                    return true;
                }
                if box_a.center_distance(box_b) <= POSITION_THRESHOLD {
                    return true;
                }
            }
        }

        false
    }

    /// Summarizes grouped detections into `ContinuousError`s, one per group
    /// id, sorted by first frame.
    pub fn summarize(&self, tagged: Vec<(String, Detection)>) -> Vec<ContinuousError> {
        let mut groups: HashMap<String, Vec<Detection>> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        for (group_id, detection) in tagged {
            if !groups.contains_key(&group_id) {
                order.push(group_id.clone());
            }
            groups.entry(group_id).or_default().push(detection);
        }

        let mut summaries: Vec<ContinuousError> = order
            .into_iter()
            .map(|group_id| {
                let members = groups.remove(&group_id).unwrap();
                let first_frame = members.iter().map(|d| d.frame_number).min().unwrap();
                let last_frame = members.iter().map(|d| d.frame_number).max().unwrap();
                let confidence_sum: f32 = members.iter().map(|d| d.confidence).sum();
                let average_confidence = confidence_sum / members.len() as f32;
                let all_false_positive = members.iter().all(|d| d.false_positive);
                let detector_name = members[0].detector_name.clone();
                let description = members[0].description.clone();

                ContinuousError {
                    group_id,
                    detector_name,
                    description,
                    first_frame,
                    last_frame,
                    average_confidence,
                    members,
                    all_false_positive,
                }
            })
            .collect();

        summaries.sort_by_key(|group| group.first_frame);
        summaries
    }

    /// Convenience: group then summarize in one call.
    pub fn group_and_summarize(&self, detections: Vec<Detection>) -> Vec<ContinuousError> {
        let tagged = self.group(detections);
        self.summarize(tagged)
    }
}
