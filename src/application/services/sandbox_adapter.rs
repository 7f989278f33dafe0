//! Detector Sandbox Adapter (C3)
//!
//! Wraps a detector running in an opaque sandbox (a separate process or a
//! container) behind a small request/response RPC contract, the same way
//! the engine wraps any blocking, non-async resource: a dedicated OS
//! thread owns the transport, callers talk to it over a bounded channel
//! and a `tokio::sync::oneshot` reply, and the adaptive timeout keeps a
//! single slow detector from stalling its caller forever.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::domain::entities::{Detection, DetectorStatus};
use crate::domain::value_objects::{BoundingBox, DetectorConfig};

const MIN_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_TIMEOUT: Duration = Duration::from_secs(300);
const PROCESSING_TIME_WINDOW: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox process I/O error: {0}")]
    Io(String),
    #[error("malformed sandbox response: {0}")]
    Protocol(String),
    #[error("sandbox request timed out")]
    Timeout,
    #[error("sandbox transport is not running")]
    NotRunning,
}

/// The detector-process side of the RPC contract: initialize, process one
/// frame pair by id, cleanup. Implemented by `ChildProcessTransport` for a
/// real sandbox and by an in-process stub in tests.
pub trait SandboxTransport: Send {
    /// Sends one JSON-RPC request line and blocks for a response line, up
    /// to `timeout`. Returns the raw response JSON.
    fn call(&mut self, request: Value, timeout: Duration) -> Result<Value, SandboxError>;
}

/// A transport backed by a real child process communicating over
/// line-delimited JSON on stdin/stdout, mirroring the sandbox's own
/// request/response queue pattern.
pub struct ChildProcessTransport {
    child: Child,
    stdin: std::process::ChildStdin,
    line_rx: Receiver<std::io::Result<String>>,
}

impl ChildProcessTransport {
    pub fn spawn(program: &str, args: &[String]) -> Result<Self, SandboxError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SandboxError::Io(e.to_string()))?;

        let stdin = child.stdin.take().ok_or_else(|| SandboxError::Io("no stdin".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| SandboxError::Io("no stdout".into()))?;

        let (line_tx, line_rx) = bounded(16);
        thread::Builder::new()
            .name("sandbox-stdout-reader".to_string())
            .spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines() {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| SandboxError::Io(e.to_string()))?;

        Ok(Self { child, stdin, line_rx })
    }
}

impl SandboxTransport for ChildProcessTransport {
    fn call(&mut self, request: Value, timeout: Duration) -> Result<Value, SandboxError> {
        let mut line = serde_json::to_string(&request).map_err(|e| SandboxError::Protocol(e.to_string()))?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).map_err(|e| SandboxError::Io(e.to_string()))?;
        self.stdin.flush().map_err(|e| SandboxError::Io(e.to_string()))?;

        match self.line_rx.recv_timeout(timeout) {
            Ok(Ok(response_line)) => {
                serde_json::from_str(&response_line).map_err(|e| SandboxError::Protocol(e.to_string()))
            }
            Ok(Err(e)) => Err(SandboxError::Io(e.to_string())),
            Err(_) => Err(SandboxError::Timeout),
        }
    }
}

impl Drop for ChildProcessTransport {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireDetection {
    confidence: f32,
    description: String,
    frame_id: u32,
    #[serde(default)]
    detector_name: String,
    #[serde(default)]
    bounding_boxes: Vec<WireBoundingBox>,
    #[serde(default)]
    metadata: std::collections::HashMap<String, Value>,
    #[serde(default)]
    error_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireBoundingBox {
    x: i32,
    y: i32,
    width: i32,
    height: i32,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

impl WireDetection {
    fn into_domain(self, take_id: i64, detector_name: &str, detector_version: &str) -> Detection {
        let boxes = self
            .bounding_boxes
            .into_iter()
            .map(|b| {
                let mut bbox = BoundingBox::new(b.x, b.y, b.width, b.height);
                if let Some(label) = b.label {
                    bbox = bbox.with_label(label);
                }
                if let Some(confidence) = b.confidence {
                    bbox = bbox.with_confidence(confidence);
                }
                bbox
            })
            .collect();

        let mut detection = Detection::new(
            detector_name,
            detector_version,
            take_id,
            self.frame_id,
            self.confidence,
            self.description,
        )
        .with_bounding_boxes(boxes);
        detection.metadata = self.metadata;
        detection.error_type = self.error_type;
        detection
    }
}

enum SandboxRequest {
    Initialize {
        config: DetectorConfig,
        respond: tokio::sync::oneshot::Sender<Result<(), SandboxError>>,
    },
    ProcessFrame {
        frame_id: u32,
        take_id: i64,
        respond: tokio::sync::oneshot::Sender<Vec<Detection>>,
    },
    Cleanup {
        respond: tokio::sync::oneshot::Sender<Result<(), SandboxError>>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct SandboxStats {
    pub total_processed: u64,
    pub total_errors_found: u64,
    pub average_processing_time_ms: f64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

struct ProcessingWindow {
    samples: std::collections::VecDeque<f64>,
}

impl ProcessingWindow {
    fn new() -> Self {
        Self { samples: std::collections::VecDeque::with_capacity(PROCESSING_TIME_WINDOW) }
    }

    fn push(&mut self, sample_ms: f64) -> f64 {
        if self.samples.len() >= PROCESSING_TIME_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample_ms);
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

/// Adapter for one detector instance's sandbox. Owns a dedicated thread
/// that drives the transport; the async-facing API returns futures that
/// resolve via `tokio::sync::oneshot`.
pub struct SandboxAdapter {
    request_tx: Sender<SandboxRequest>,
    status: Arc<Mutex<DetectorStatus>>,
    stats: Arc<Mutex<SandboxStats>>,
    detector_name: String,
    detector_version: String,
    processed_count: Arc<AtomicU64>,
}

impl SandboxAdapter {
    /// Spawns the adapter thread around the given transport (a real child
    /// process in production, a stub in tests) with an initial adaptive
    /// timeout estimate.
    pub fn new(
        detector_name: impl Into<String>,
        detector_version: impl Into<String>,
        transport: Box<dyn SandboxTransport>,
        initial_timeout: Duration,
    ) -> Self {
        let detector_name = detector_name.into();
        let detector_version = detector_version.into();
        let (request_tx, request_rx) = bounded::<SandboxRequest>(8);
        let status = Arc::new(Mutex::new(DetectorStatus::Created));
        let stats = Arc::new(Mutex::new(SandboxStats::default()));
        let processed_count = Arc::new(AtomicU64::new(0));

        let thread_status = status.clone();
        let thread_stats = stats.clone();
        let thread_name = detector_name.clone();
        let thread_version = detector_version.clone();
        let thread_processed = processed_count.clone();

        thread::Builder::new()
            .name(format!("sandbox-{thread_name}"))
            .spawn(move || {
                Self::adapter_thread(
                    request_rx,
                    transport,
                    thread_status,
                    thread_stats,
                    thread_processed,
                    thread_name,
                    thread_version,
                    initial_timeout,
                )
            })
            .expect("spawning sandbox adapter thread");

        Self {
            request_tx,
            status,
            stats,
            detector_name,
            detector_version,
            processed_count,
        }
    }

    fn adapter_thread(
        request_rx: Receiver<SandboxRequest>,
        mut transport: Box<dyn SandboxTransport>,
        status: Arc<Mutex<DetectorStatus>>,
        stats: Arc<Mutex<SandboxStats>>,
        processed_count: Arc<AtomicU64>,
        detector_name: String,
        detector_version: String,
        initial_timeout: Duration,
    ) {
        let mut timeout_estimate = initial_timeout.clamp(MIN_TIMEOUT, MAX_TIMEOUT);
        let mut processing_window = ProcessingWindow::new();

        while let Ok(request) = request_rx.recv() {
            match request {
                SandboxRequest::Initialize { config, respond } => {
                    let params = serde_json::json!({ "config": config });
                    let request_json = serde_json::json!({ "method": "initialize", "params": params });
                    let result = transport.call(request_json, timeout_estimate);

                    let outcome = match result {
                        Ok(response) => {
                            let success = response.get("success").and_then(Value::as_bool).unwrap_or(false);
                            if success {
                                *status.lock().unwrap() = DetectorStatus::Initialized;
                                Ok(())
                            } else {
                                let message = response
                                    .get("error")
                                    .and_then(Value::as_str)
                                    .unwrap_or("initialize failed")
                                    .to_string();
                                *status.lock().unwrap() = DetectorStatus::Failed;
                                Err(SandboxError::Protocol(message))
                            }
                        }
                        Err(e) => {
                            *status.lock().unwrap() = DetectorStatus::Failed;
                            Err(e)
                        }
                    };
                    let _ = respond.send(outcome);
                }

                SandboxRequest::ProcessFrame { frame_id, take_id, respond } => {
                    *status.lock().unwrap() = DetectorStatus::Running;
                    let params = serde_json::json!({ "frame_id": frame_id, "take_id": take_id });
                    let request_json = serde_json::json!({ "method": "process_frame", "params": params });

                    let start = Instant::now();
                    let result = transport.call(request_json, timeout_estimate);
                    let observed = start.elapsed();

                    timeout_estimate = Duration::from_secs_f64(
                        (0.9 * timeout_estimate.as_secs_f64() + 0.1 * (2.0 * observed.as_secs_f64()))
                            .clamp(MIN_TIMEOUT.as_secs_f64(), MAX_TIMEOUT.as_secs_f64()),
                    );

                    let detections = match result {
                        Ok(response) => {
                            let success = response.get("success").and_then(Value::as_bool).unwrap_or(false);
                            if success {
                                let wire: Vec<WireDetection> = response
                                    .get("data")
                                    .cloned()
                                    .map(serde_json::from_value)
                                    .transpose()
                                    .unwrap_or(None)
                                    .unwrap_or_default();
                                *status.lock().unwrap() = DetectorStatus::Idle;
                                wire.into_iter()
                                    .map(|d| d.into_domain(take_id, &detector_name, &detector_version))
                                    .collect::<Vec<_>>()
                            } else {
                                let message = response
                                    .get("error")
                                    .and_then(Value::as_str)
                                    .unwrap_or("detector reported failure")
                                    .to_string();
                                *status.lock().unwrap() = DetectorStatus::Failed;
                                let mut stats = stats.lock().unwrap();
                                stats.last_error = Some(message.clone());
                                stats.last_error_at = Some(Utc::now());
                                vec![Detection::failure(&detector_name, &detector_version, take_id, frame_id, message)]
                            }
                        }
                        Err(e) => {
                            warn!(detector = %detector_name, error = %e, "sandbox call failed");
                            *status.lock().unwrap() = DetectorStatus::Failed;
                            let mut stats = stats.lock().unwrap();
                            stats.last_error = Some(e.to_string());
                            stats.last_error_at = Some(Utc::now());
                            vec![Detection::failure(
                                &detector_name,
                                &detector_version,
                                take_id,
                                frame_id,
                                "No response from detector process",
                            )]
                        }
                    };

                    {
                        let mut stats = stats.lock().unwrap();
                        stats.total_processed += 1;
                        stats.total_errors_found += detections.iter().filter(|d| d.confidence > 0.5).count() as u64;
                        stats.average_processing_time_ms =
                            processing_window.push(observed.as_secs_f64() * 1000.0);
                    }
                    processed_count.fetch_add(1, Ordering::Relaxed);

                    let _ = respond.send(detections);
                }

                SandboxRequest::Cleanup { respond } => {
                    let request_json = serde_json::json!({ "method": "cleanup", "params": {} });
                    let result = transport.call(request_json, timeout_estimate);
                    *status.lock().unwrap() = DetectorStatus::Stopped;
                    let outcome = match result {
                        Ok(_) => Ok(()),
                        Err(e) => {
                            error!(detector = %detector_name, error = %e, "cleanup call failed, stopping anyway");
                            Ok(())
                        }
                    };
                    let _ = respond.send(outcome);
                    break;
                }
            }
        }
        debug!(detector = %detector_name, "sandbox adapter thread exiting");
    }

    pub async fn initialize(&self, config: DetectorConfig) -> Result<(), SandboxError> {
        let (respond, receiver) = tokio::sync::oneshot::channel();
        if self.request_tx.send(SandboxRequest::Initialize { config, respond }).is_err() {
            return Err(SandboxError::NotRunning);
        }
        receiver.await.map_err(|_| SandboxError::NotRunning)?
    }

    pub async fn process_frame(&self, frame_id: u32, take_id: i64) -> Vec<Detection> {
        let (respond, receiver) = tokio::sync::oneshot::channel();
        if self.request_tx.send(SandboxRequest::ProcessFrame { frame_id, take_id, respond }).is_err() {
            return vec![Detection::failure(
                &self.detector_name,
                &self.detector_version,
                take_id,
                frame_id,
                "No response from detector process",
            )];
        }
        receiver.await.unwrap_or_else(|_| {
            vec![Detection::failure(
                &self.detector_name,
                &self.detector_version,
                take_id,
                frame_id,
                "No response from detector process",
            )]
        })
    }

    pub async fn cleanup(&self) -> Result<(), SandboxError> {
        let (respond, receiver) = tokio::sync::oneshot::channel();
        if self.request_tx.send(SandboxRequest::Cleanup { respond }).is_err() {
            return Err(SandboxError::NotRunning);
        }
        receiver.await.map_err(|_| SandboxError::NotRunning)?
    }

    pub fn status(&self) -> DetectorStatus {
        self.status.lock().unwrap().clone()
    }

    pub fn stats(&self) -> SandboxStats {
        self.stats.lock().unwrap().clone()
    }

    pub fn total_processed(&self) -> u64 {
        self.processed_count.load(Ordering::Relaxed)
    }
}
