//! Recognition orchestrator - bounded retry loop around plate recognition
//!
//! One scan is a finite loop of attempts. Each attempt captures a frame and
//! submits it to the recognizer under a per-attempt timeout. The first hit
//! wins; misses, errors and timeouts wait out the inter-attempt delay and
//! try again until the attempt budget is spent.
//!
//! Cancellation is cooperative: it is checked before every attempt and
//! raced against the delay, but never interrupts an attempt in flight.

use crate::domain::error::{GateError, GateResult};
use crate::domain::pass::Plate;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Raw recognizer response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    pub found: bool,
    pub text: String,
    pub confidence: f32,
    pub cropped_image: Option<Bytes>,
}

/// Produces one camera frame per call. `None` means no frame was available.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn capture(&self) -> anyhow::Result<Option<Bytes>>;
}

/// Plate recognition capability
#[async_trait]
pub trait PlateRecognizer: Send + Sync {
    async fn recognize(&self, image: Bytes) -> anyhow::Result<Detection>;
}

/// Retry policy for one scan
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionPolicy {
    pub max_attempts: u32,
    pub inter_attempt_delay: Duration,
    pub per_attempt_timeout: Duration,
    /// Hits below this confidence count as misses
    pub min_confidence: Option<f32>,
}

impl Default for RecognitionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            inter_attempt_delay: Duration::from_millis(700),
            per_attempt_timeout: Duration::from_secs(10),
            min_confidence: None,
        }
    }
}

impl RecognitionPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.recognition_max_attempts(),
            inter_attempt_delay: config.inter_attempt_delay(),
            per_attempt_timeout: config.per_attempt_timeout(),
            min_confidence: config.min_confidence(),
        }
    }
}

/// Successful scan result
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub plate: Plate,
    pub confidence: f32,
    pub cropped_image: Option<Bytes>,
    pub original_capture: Bytes,
    /// 1-based attempt that produced the hit
    pub attempt: u32,
}

/// Requests cancellation of one scan
#[derive(Debug, Clone)]
pub struct ScanHandle {
    tx: Arc<watch::Sender<bool>>,
}

/// Cancellation flag observed by the scan loop
#[derive(Debug, Clone)]
pub struct ScanCancel {
    rx: watch::Receiver<bool>,
}

/// Create a linked cancel handle and flag
pub fn scan_cancel_pair() -> (ScanHandle, ScanCancel) {
    let (tx, rx) = watch::channel(false);
    (ScanHandle { tx: Arc::new(tx) }, ScanCancel { rx })
}

impl ScanHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl ScanCancel {
    /// A flag that is never raised
    pub fn never() -> Self {
        let (_, cancel) = scan_cancel_pair();
        cancel
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Pends forever if the handle
    /// was dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

enum AttemptOutcome {
    Hit(Recognition),
    Miss(&'static str),
}

pub struct RecognitionOrchestrator {
    frames: Arc<dyn FrameSource>,
    recognizer: Arc<dyn PlateRecognizer>,
    policy: RecognitionPolicy,
    metrics: Arc<Metrics>,
}

impl RecognitionOrchestrator {
    pub fn new(
        frames: Arc<dyn FrameSource>,
        recognizer: Arc<dyn PlateRecognizer>,
        policy: RecognitionPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { frames, recognizer, policy, metrics }
    }

    /// Run one scan until a plate is recognized, the budget is spent, or
    /// `cancel` is raised.
    pub async fn run(&self, cancel: &mut ScanCancel) -> GateResult<Recognition> {
        let max_attempts = self.policy.max_attempts;
        self.metrics.record_scan_started();
        info!(max_attempts = %max_attempts, "scan_started");

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(self.cancelled(attempt - 1));
            }

            let started = Instant::now();
            let outcome =
                tokio::time::timeout(self.policy.per_attempt_timeout, self.attempt(attempt)).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            let reason = match outcome {
                Ok(AttemptOutcome::Hit(recognition)) => {
                    self.metrics.record_recognition_attempt(latency_ms, false);
                    self.metrics.record_scan_succeeded();
                    info!(
                        plate = %recognition.plate,
                        confidence = %recognition.confidence,
                        attempt = %attempt,
                        latency_ms = %latency_ms,
                        "scan_succeeded"
                    );
                    return Ok(recognition);
                }
                Ok(AttemptOutcome::Miss(reason)) => reason,
                Err(_) => "timeout",
            };

            self.metrics.record_recognition_attempt(latency_ms, true);
            debug!(attempt = %attempt, reason = %reason, latency_ms = %latency_ms, "recognition_attempt_missed");

            if attempt < max_attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(self.cancelled(attempt)),
                    _ = tokio::time::sleep(self.policy.inter_attempt_delay) => {}
                }
            }
        }

        self.metrics.record_scan_exhausted();
        warn!(attempts = %max_attempts, "scan_exhausted");
        Err(GateError::RecognitionExhausted { attempts: max_attempts })
    }

    fn cancelled(&self, attempts: u32) -> GateError {
        self.metrics.record_scan_cancelled();
        info!(attempts = %attempts, "scan_cancelled");
        GateError::ScanCancelled { attempts }
    }

    async fn attempt(&self, attempt: u32) -> AttemptOutcome {
        let frame = match self.frames.capture().await {
            Ok(Some(frame)) if !frame.is_empty() => frame,
            Ok(_) => return AttemptOutcome::Miss("no_frame"),
            Err(e) => {
                debug!(attempt = %attempt, error = %e, "frame_capture_failed");
                return AttemptOutcome::Miss("capture_error");
            }
        };

        let detection = match self.recognizer.recognize(frame.clone()).await {
            Ok(detection) => detection,
            Err(e) => {
                debug!(attempt = %attempt, error = %e, "recognizer_call_failed");
                return AttemptOutcome::Miss("recognizer_error");
            }
        };

        if !detection.found {
            return AttemptOutcome::Miss("not_found");
        }
        let Some(plate) = Plate::parse(&detection.text) else {
            return AttemptOutcome::Miss("empty_plate");
        };
        if let Some(min) = self.policy.min_confidence {
            if detection.confidence < min {
                debug!(
                    attempt = %attempt,
                    plate = %plate,
                    confidence = %detection.confidence,
                    min_confidence = %min,
                    "recognition_below_threshold"
                );
                return AttemptOutcome::Miss("low_confidence");
            }
        }

        AttemptOutcome::Hit(Recognition {
            plate,
            confidence: detection.confidence,
            cropped_image: detection.cropped_image,
            original_capture: frame,
            attempt,
        })
    }
}
