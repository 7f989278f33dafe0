//! DetectorHealthRecord Entity
//!
//! Per-detector-name persistent state tracked by the recovery supervisor (C5).

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Recovery strategies the supervisor can select for a failing detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    RestartImmediate,
    ExponentialBackoff,
    SkipFrames,
    FallbackMode,
    Disable,
}

/// A single recorded failure, bounded to the most recent 100 per detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub frame_number: u32,
    pub error_message: String,
    pub stack_trace: Option<String>,
    pub recovery_attempted: bool,
    pub recovery_successful: bool,
}

impl FailureRecord {
    pub fn new(frame_number: u32, error_message: impl Into<String>, stack_trace: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            frame_number,
            error_message: error_message.into(),
            stack_trace,
            recovery_attempted: false,
            recovery_successful: false,
        }
    }
}

const MAX_HISTORY: usize = 100;
const MAX_PROCESSING_SAMPLES: usize = 100;

/// Per-detector-name persistent health state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorHealthRecord {
    pub detector_name: String,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_failure_message: Option<String>,
    pub last_successful_frame: Option<u32>,
    pub recovery_attempts: u64,
    pub current_backoff_seconds: f64,
    pub is_healthy: bool,
    pub failure_history: VecDeque<FailureRecord>,
    pub performance_degraded: bool,
    pub average_processing_time_ms: f64,
    processing_time_samples: VecDeque<f64>,
}

impl DetectorHealthRecord {
    pub fn new(detector_name: impl Into<String>, initial_backoff_seconds: f64) -> Self {
        Self {
            detector_name: detector_name.into(),
            total_failures: 0,
            consecutive_failures: 0,
            last_failure: None,
            last_failure_message: None,
            last_successful_frame: None,
            recovery_attempts: 0,
            current_backoff_seconds: initial_backoff_seconds,
            is_healthy: true,
            failure_history: VecDeque::with_capacity(MAX_HISTORY),
            performance_degraded: false,
            average_processing_time_ms: 0.0,
            processing_time_samples: VecDeque::with_capacity(MAX_PROCESSING_SAMPLES),
        }
    }

    /// Records a failure, bounding history to the most recent 100.
    pub fn record_failure(&mut self, record: FailureRecord) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.last_failure = Some(record.timestamp);
        self.last_failure_message = Some(record.error_message.clone());
        self.is_healthy = false;

        if self.failure_history.len() >= MAX_HISTORY {
            self.failure_history.pop_front();
        }
        self.failure_history.push_back(record);
    }

    /// Records a success: resets consecutive-failure tracking and folds the
    /// processing time into the rolling average (window 100).
    pub fn record_success(&mut self, frame_number: u32, processing_time_ms: f64) {
        self.consecutive_failures = 0;
        self.current_backoff_seconds = self.current_backoff_seconds.min(1.0).max(1.0);
        self.last_successful_frame = Some(frame_number);
        self.is_healthy = true;

        if self.processing_time_samples.len() >= MAX_PROCESSING_SAMPLES {
            self.processing_time_samples.pop_front();
        }
        self.processing_time_samples.push_back(processing_time_ms);

        let sum: f64 = self.processing_time_samples.iter().sum();
        self.average_processing_time_ms = sum / self.processing_time_samples.len() as f64;
        self.performance_degraded = self.average_processing_time_ms > 100.0;
    }

    /// Failures recorded within the last `window` relative to `now`.
    pub fn failures_within(&self, now: DateTime<Utc>, window: chrono::Duration) -> usize {
        self.failure_history
            .iter()
            .filter(|f| now - f.timestamp <= window)
            .count()
    }

    /// True if there are at least `n` recorded failures and the same frame
    /// number appears in all of the last `n`.
    pub fn same_frame_in_last(&self, frame_number: u32, n: usize) -> bool {
        n > 0
            && self.failure_history.len() >= n
            && self.failure_history.iter().rev().take(n).all(|f| f.frame_number == frame_number)
    }
}
