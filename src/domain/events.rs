//! Domain Events
//!
//! Events that represent significant occurrences in the engine, broadcast to
//! WebSocket clients and any other subscriber via the event bus (C9).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::entities::RecoveryStrategy;

/// A domain event that can be broadcast to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// A take's processing run was started.
    ProcessingStarted(ProcessingStartedEvent),
    /// A take finished processing (queue drained, no more frame pairs
    /// expected).
    ProcessingComplete(ProcessingCompleteEvent),
    /// A single frame pair finished processing across all applicable
    /// detectors.
    FrameProcessed(FrameProcessedEvent),
    /// A detector failed on a frame and the recovery supervisor recorded it.
    DetectorFailure(DetectorFailureEvent),
    /// A previously-failed detector was restarted and passed its health
    /// check.
    DetectorRecovered(DetectorRecoveredEvent),
    /// A detector was permanently disabled for the remainder of the take.
    DetectorDisabled(DetectorDisabledEvent),
    /// Progress update for a batch (video-file) processing run.
    BatchProgress(BatchProgressEvent),
}

/// Event emitted when a take's processing run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingStartedEvent {
    pub take_id: i64,
    pub scene_id: i64,
    pub detector_count: usize,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted when a take's processing run completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingCompleteEvent {
    pub take_id: i64,
    pub total_frames_processed: u32,
    pub total_errors_found: u64,
    pub duration_ms: i64,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted after a frame pair has been processed by every applicable
/// detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameProcessedEvent {
    pub take_id: i64,
    pub frame_number: u32,
    pub detections_found: usize,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted when a detector fails and the supervisor records the
/// failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorFailureEvent {
    pub detector_name: String,
    pub take_id: i64,
    pub frame_number: u32,
    pub error_message: String,
    pub consecutive_failures: u32,
    pub strategy: RecoveryStrategy,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted when a previously-failed detector successfully recovers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorRecoveredEvent {
    pub detector_name: String,
    pub take_id: i64,
    pub recovery_attempts: u64,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted when a detector is permanently disabled for a take.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorDisabledEvent {
    pub detector_name: String,
    pub take_id: i64,
    pub total_failures: u64,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted on batch (video-file) processing progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchProgressEvent {
    pub batch_id: String,
    pub completed_segments: u32,
    pub total_segments: u32,
    pub failed_segments: u32,
    pub fps: f64,
    pub eta_seconds: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent {
    /// Returns the event timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::ProcessingStarted(e) => e.timestamp,
            DomainEvent::ProcessingComplete(e) => e.timestamp,
            DomainEvent::FrameProcessed(e) => e.timestamp,
            DomainEvent::DetectorFailure(e) => e.timestamp,
            DomainEvent::DetectorRecovered(e) => e.timestamp,
            DomainEvent::DetectorDisabled(e) => e.timestamp,
            DomainEvent::BatchProgress(e) => e.timestamp,
        }
    }

    /// Returns the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::ProcessingStarted(_) => "processing_started",
            DomainEvent::ProcessingComplete(_) => "processing_complete",
            DomainEvent::FrameProcessed(_) => "frame_processed",
            DomainEvent::DetectorFailure(_) => "detector_failure",
            DomainEvent::DetectorRecovered(_) => "detector_recovered",
            DomainEvent::DetectorDisabled(_) => "detector_disabled",
            DomainEvent::BatchProgress(_) => "batch_progress",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_matches_serde_tag() {
        let event = DomainEvent::ProcessingStarted(ProcessingStartedEvent {
            take_id: 1,
            scene_id: 1,
            detector_count: 3,
            timestamp: Utc::now(),
        });
        assert_eq!(event.event_type(), "processing_started");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "processing_started");
    }
}
