//! Recovery Supervisor (C5)
//!
//! Tracks per-detector health, chooses a recovery strategy on failure, and
//! schedules exponential-backoff retries. Talks to the orchestrator through
//! two narrow traits (`SupervisorSink`, `DetectorControl`) instead of a
//! direct dependency, so the orchestrator and supervisor can each hold a
//! reference to the other's narrow interface without an ownership cycle.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::entities::{DetectorHealthRecord, FailureRecord, RecoveryStrategy};
use crate::domain::events::{DetectorDisabledEvent, DetectorFailureEvent, DetectorRecoveredEvent, DomainEvent};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("no configuration available to restart detector '{0}'")]
    NoConfigAvailable(String),
    #[error("checkpoint I/O error: {0}")]
    Io(String),
}

/// Tunables for backoff scheduling and strategy thresholds. Defaults mirror
/// the recovery manager this component is grounded on.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub max_consecutive_failures: u32,
    pub initial_backoff_seconds: f64,
    pub max_backoff_seconds: f64,
    pub backoff_factor: f64,
    pub checkpoint_path: Option<PathBuf>,
    pub silence_window: ChronoDuration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            initial_backoff_seconds: 1.0,
            max_backoff_seconds: 60.0,
            backoff_factor: 2.0,
            checkpoint_path: None,
            silence_window: ChronoDuration::seconds(300),
        }
    }
}

/// Emits domain events on recovery-relevant transitions. The orchestrator
/// implements this over its `EventBus` handle; the supervisor never holds
/// the bus directly.
pub trait SupervisorSink: Send + Sync {
    fn emit(&self, event: DomainEvent);
}

/// The control surface the supervisor needs over a running detector,
/// without depending on the orchestrator's full type.
pub trait DetectorControl: Send + Sync {
    fn restart(&self, detector_name: &str) -> Result<(), String>;
    fn restart_skip_frames(&self, detector_name: &str, skip_count: u32) -> Result<(), String>;
    fn enable_fallback_mode(&self, detector_name: &str) -> Result<(), String>;
    fn disable(&self, detector_name: &str, reason: &str) -> Result<(), String>;
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct CheckpointState {
    records: HashMap<String, DetectorHealthRecord>,
}

/// Owns every detector's `DetectorHealthRecord` for one take and decides
/// what to do about a failure.
pub struct RecoverySupervisor {
    config: SupervisorConfig,
    records: Mutex<HashMap<String, DetectorHealthRecord>>,
    take_id: i64,
    sink: Arc<dyn SupervisorSink>,
    control: Arc<dyn DetectorControl>,
}

impl RecoverySupervisor {
    pub fn new(
        take_id: i64,
        config: SupervisorConfig,
        sink: Arc<dyn SupervisorSink>,
        control: Arc<dyn DetectorControl>,
    ) -> Self {
        Self { config, records: Mutex::new(HashMap::new()), take_id, sink, control }
    }

    fn record_for<'a>(records: &'a mut HashMap<String, DetectorHealthRecord>, config: &SupervisorConfig, detector_name: &str) -> &'a mut DetectorHealthRecord {
        records
            .entry(detector_name.to_string())
            .or_insert_with(|| DetectorHealthRecord::new(detector_name, config.initial_backoff_seconds))
    }

    /// Reports a detector failure on a frame, chooses a recovery strategy,
    /// applies it through `DetectorControl`, and emits the corresponding
    /// event. Returns the strategy chosen so the caller can log/test it.
    pub fn report_failure(&self, detector_name: &str, frame_number: u32, error_message: &str) -> RecoveryStrategy {
        let mut records = self.records.lock().unwrap();
        let record = Self::record_for(&mut records, &self.config, detector_name);
        record.record_failure(FailureRecord::new(frame_number, error_message, None));

        let strategy = self.determine_strategy(record, frame_number);
        let consecutive_failures = record.consecutive_failures;

        self.sink.emit(DomainEvent::DetectorFailure(DetectorFailureEvent {
            detector_name: detector_name.to_string(),
            take_id: self.take_id,
            frame_number,
            error_message: error_message.to_string(),
            consecutive_failures,
            strategy,
            timestamp: Utc::now(),
        }));

        match strategy {
            RecoveryStrategy::Disable => {
                let reason = format!("{consecutive_failures} consecutive failures");
                if self.control.disable(detector_name, &reason).is_ok() {
                    self.sink.emit(DomainEvent::DetectorDisabled(DetectorDisabledEvent {
                        detector_name: detector_name.to_string(),
                        take_id: self.take_id,
                        total_failures: record.total_failures,
                        reason,
                        timestamp: Utc::now(),
                    }));
                }
            }
            RecoveryStrategy::SkipFrames => {
                record.recovery_attempts += 1;
                let _ = self.control.restart_skip_frames(detector_name, 5);
            }
            RecoveryStrategy::FallbackMode => {
                record.recovery_attempts += 1;
                let _ = self.control.enable_fallback_mode(detector_name);
            }
            RecoveryStrategy::ExponentialBackoff | RecoveryStrategy::RestartImmediate => {
                record.recovery_attempts += 1;
                record.current_backoff_seconds =
                    (self.config.initial_backoff_seconds * self.config.backoff_factor.powi((record.recovery_attempts - 1) as i32))
                        .min(self.config.max_backoff_seconds);
            }
        }

        strategy
    }

    /// Strategy selection, grounded on `_determine_recovery_strategy`:
    /// disable outranks everything once a detector has failed twice its
    /// normal threshold; skip-frames covers either a flood (>10 in 5 min)
    /// or a single stuck frame (same frame three times running); anything
    /// else backs off.
    fn determine_strategy(&self, record: &DetectorHealthRecord, frame_number: u32) -> RecoveryStrategy {
        if record.consecutive_failures >= self.config.max_consecutive_failures * 2 {
            return RecoveryStrategy::Disable;
        }
        let recent_failures = record.failures_within(Utc::now(), self.config.silence_window);
        if recent_failures > 10 || record.same_frame_in_last(frame_number, 3) {
            return RecoveryStrategy::SkipFrames;
        }
        RecoveryStrategy::ExponentialBackoff
    }

    /// Restarts a detector that has been backing off and its backoff
    /// window has elapsed, then records a successful recovery.
    pub fn attempt_restart(&self, detector_name: &str) -> Result<(), SupervisorError> {
        self.control
            .restart(detector_name)
            .map_err(|_| SupervisorError::NoConfigAvailable(detector_name.to_string()))?;

        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.get_mut(detector_name) {
            record.recovery_attempts += 1;
        }
        drop(records);

        self.sink.emit(DomainEvent::DetectorRecovered(DetectorRecoveredEvent {
            detector_name: detector_name.to_string(),
            take_id: self.take_id,
            recovery_attempts: self.records.lock().unwrap().get(detector_name).map(|r| r.recovery_attempts).unwrap_or(0),
            timestamp: Utc::now(),
        }));
        Ok(())
    }

    /// Records a successful frame for a detector, resetting its
    /// consecutive-failure counter and backoff.
    pub fn report_success(&self, detector_name: &str, frame_number: u32, processing_time_ms: f64) {
        let mut records = self.records.lock().unwrap();
        let record = Self::record_for(&mut records, &self.config, detector_name);
        record.record_success(frame_number, processing_time_ms);
    }

    /// Milliseconds to wait before the next retry is due for a backing-off
    /// detector.
    pub fn current_backoff(&self, detector_name: &str) -> Duration {
        self.records
            .lock()
            .unwrap()
            .get(detector_name)
            .map(|r| Duration::from_secs_f64(r.current_backoff_seconds))
            .unwrap_or_else(|| Duration::from_secs_f64(self.config.initial_backoff_seconds))
    }

    /// True if a detector has gone silent (no success or failure) longer
    /// than the configured silence window while previously healthy.
    pub fn is_unhealthy_from_silence(&self, detector_name: &str) -> bool {
        let records = self.records.lock().unwrap();
        match records.get(detector_name) {
            Some(record) => match record.last_failure {
                Some(last) => record.is_healthy && Utc::now() - last > self.config.silence_window,
                None => false,
            },
            None => false,
        }
    }

    pub fn health_snapshot(&self, detector_name: &str) -> Option<DetectorHealthRecord> {
        self.records.lock().unwrap().get(detector_name).cloned()
    }

    pub fn all_health(&self) -> HashMap<String, DetectorHealthRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Atomic temp-then-rename checkpoint write, run on a 60s tick by the
    /// caller's worker loop.
    pub fn checkpoint(&self) -> Result<(), SupervisorError> {
        let Some(path) = &self.config.checkpoint_path else { return Ok(()) };
        let state = CheckpointState { records: self.records.lock().unwrap().clone() };
        write_checkpoint_atomic(path, &state)
    }

    pub fn restore_checkpoint(&self) -> Result<(), SupervisorError> {
        let Some(path) = &self.config.checkpoint_path else { return Ok(()) };
        if !path.exists() {
            return Ok(());
        }
        let bytes = fs::read(path).map_err(|e| SupervisorError::Io(e.to_string()))?;
        let state: CheckpointState = serde_json::from_slice(&bytes).map_err(|e| SupervisorError::Io(e.to_string()))?;
        *self.records.lock().unwrap() = state.records;
        Ok(())
    }

    /// Runs one tick of the background worker loop: checks every known
    /// detector for silence-based unhealthiness and logs it. Callers wrap
    /// this in a `tokio::time::interval(Duration::from_secs(1))` loop.
    pub fn tick(&self) {
        let names: Vec<String> = self.records.lock().unwrap().keys().cloned().collect();
        for name in names {
            if self.is_unhealthy_from_silence(&name) {
                warn!(detector = %name, "detector has gone silent past the health window");
                if let Some(record) = self.records.lock().unwrap().get_mut(&name) {
                    record.is_healthy = false;
                }
            }
        }
    }
}

fn write_checkpoint_atomic(path: &Path, state: &CheckpointState) -> Result<(), SupervisorError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| SupervisorError::Io(e.to_string()))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(state).map_err(|e| SupervisorError::Io(e.to_string()))?;
    fs::write(&tmp_path, bytes).map_err(|e| SupervisorError::Io(e.to_string()))?;
    fs::rename(&tmp_path, path).map_err(|e| SupervisorError::Io(e.to_string()))?;
    info!(path = %path.display(), "recovery supervisor checkpoint written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct NullSink;
    impl SupervisorSink for NullSink {
        fn emit(&self, _event: DomainEvent) {}
    }

    #[derive(Default)]
    struct RecordingControl {
        disabled: Mutex<Vec<String>>,
        restart_failures: AtomicBool,
    }
    impl DetectorControl for RecordingControl {
        fn restart(&self, _detector_name: &str) -> Result<(), String> {
            if self.restart_failures.load(Ordering::SeqCst) { Err("no config".into()) } else { Ok(()) }
        }
        fn restart_skip_frames(&self, _detector_name: &str, _skip_count: u32) -> Result<(), String> {
            Ok(())
        }
        fn enable_fallback_mode(&self, _detector_name: &str) -> Result<(), String> {
            Ok(())
        }
        fn disable(&self, detector_name: &str, _reason: &str) -> Result<(), String> {
            self.disabled.lock().unwrap().push(detector_name.to_string());
            Ok(())
        }
    }

    fn supervisor() -> (RecoverySupervisor, Arc<RecordingControl>) {
        let control = Arc::new(RecordingControl::default());
        let supervisor = RecoverySupervisor::new(1, SupervisorConfig::default(), Arc::new(NullSink), control.clone());
        (supervisor, control)
    }

    #[test]
    fn backoff_sequence_follows_exponential_growth() {
        let (supervisor, _control) = supervisor();
        let expected = [1.0, 2.0, 4.0, 8.0, 16.0];
        for (i, expected_seconds) in expected.iter().enumerate() {
            supervisor.report_failure("d", i as u32, "boom");
            let backoff = supervisor.current_backoff("d").as_secs_f64();
            assert!((backoff - expected_seconds).abs() < 0.001, "iteration {i}: expected {expected_seconds}, got {backoff}");
        }
    }

    #[test]
    fn sixth_consecutive_failure_disables_the_detector() {
        let (supervisor, control) = supervisor();
        for i in 0..6 {
            supervisor.report_failure("d", i, "boom");
        }
        assert_eq!(control.disabled.lock().unwrap().as_slice(), &["d".to_string()]);
    }

    #[test]
    fn same_frame_three_times_triggers_skip_frames() {
        let (supervisor, _control) = supervisor();
        supervisor.report_failure("d", 42, "boom");
        supervisor.report_failure("d", 42, "boom");
        let strategy = supervisor.report_failure("d", 42, "boom");
        assert_eq!(strategy, RecoveryStrategy::SkipFrames);
    }

    #[test]
    fn first_failure_on_a_frame_backs_off_rather_than_skipping() {
        let (supervisor, _control) = supervisor();
        let strategy = supervisor.report_failure("d", 42, "boom");
        assert_eq!(strategy, RecoveryStrategy::ExponentialBackoff);
    }

    #[test]
    fn success_resets_consecutive_failure_count() {
        let (supervisor, _control) = supervisor();
        supervisor.report_failure("d", 1, "boom");
        supervisor.report_success("d", 2, 10.0);
        let snapshot = supervisor.health_snapshot("d").unwrap();
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(snapshot.is_healthy);
    }

    #[test]
    fn restart_without_config_surfaces_no_config_available() {
        let control = Arc::new(RecordingControl { restart_failures: AtomicBool::new(true), ..Default::default() });
        let supervisor = RecoverySupervisor::new(1, SupervisorConfig::default(), Arc::new(NullSink), control);
        let result = supervisor.attempt_restart("d");
        assert!(matches!(result, Err(SupervisorError::NoConfigAvailable(_))));
    }

    #[test]
    fn checkpoint_round_trips_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let checkpoint_path = tmp.path().join("health.json");
        let (supervisor, _control) = {
            let mut config = SupervisorConfig::default();
            config.checkpoint_path = Some(checkpoint_path.clone());
            let control = Arc::new(RecordingControl::default());
            (RecoverySupervisor::new(1, config, Arc::new(NullSink), control.clone()), control)
        };
        supervisor.report_failure("d", 1, "boom");
        supervisor.checkpoint().unwrap();

        let mut restored_config = SupervisorConfig::default();
        restored_config.checkpoint_path = Some(checkpoint_path);
        let restored = RecoverySupervisor::new(1, restored_config, Arc::new(NullSink), Arc::new(RecordingControl::default()));
        restored.restore_checkpoint().unwrap();
        assert_eq!(restored.health_snapshot("d").unwrap().total_failures, 1);
    }
}
