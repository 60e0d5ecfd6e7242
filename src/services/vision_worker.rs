//! Vision worker - camera capture, classification and presence tracking
//!
//! One task per process. Every frame tick:
//! 1. capture a JPEG and publish it to the frame buffer
//! 2. start a classification if the detection interval elapsed and none is
//!    in flight (classification runs off the tick path so the stream keeps
//!    its frame rate)
//! 3. sweep the presence tracker for lost labels
//!
//! Finished classifications are fed to the tracker as they complete, stamped
//! with the capture time of the frame they ran on. The tracker never leaves
//! this task.

use crate::domain::ClassificationSample;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::infra::shutdown::{self, ShutdownRx};
use crate::io::camera::{CapturedFrame, FrameSource};
use crate::io::classifier::{Classifier, ClassifierError, Prediction};
use crate::services::frame_buffer::FrameBroadcastBuffer;
use crate::services::hub::EventDispatchHub;
use crate::services::presence::PresenceTracker;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Capture time of the classified frame plus the classifier outcome
type ClassificationOutcome = (Instant, Result<Prediction, ClassifierError>);
type PendingClassification = JoinHandle<ClassificationOutcome>;

/// Shortest frame tick; `interval` rejects a zero period
const MIN_FRAME_INTERVAL: Duration = Duration::from_millis(1);

/// Timing and gating for the vision loop
#[derive(Debug, Clone)]
pub struct VisionSettings {
    pub frame_interval: Duration,
    pub detection_interval: Duration,
    pub confidence_threshold: f32,
    pub lost_timeout: Duration,
}

impl VisionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            frame_interval: config.frame_interval(),
            detection_interval: config.detection_interval(),
            confidence_threshold: config.confidence_threshold(),
            lost_timeout: config.lost_timeout(),
        }
    }
}

pub struct VisionWorker {
    source: Box<dyn FrameSource>,
    classifier: Option<Arc<dyn Classifier>>,
    tracker: PresenceTracker,
    frames: Arc<FrameBroadcastBuffer>,
    hub: Arc<EventDispatchHub>,
    metrics: Arc<Metrics>,
    frame_interval: Duration,
    detection_interval: Duration,
    last_detection: Option<Instant>,
    consecutive_capture_errors: u32,
}

/// Await the in-flight classification, or never resolve if there is none
async fn join_pending(pending: &mut Option<PendingClassification>) -> Result<ClassificationOutcome, JoinError> {
    match pending {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

impl VisionWorker {
    pub fn new(
        source: Box<dyn FrameSource>,
        classifier: Option<Arc<dyn Classifier>>,
        settings: VisionSettings,
        frames: Arc<FrameBroadcastBuffer>,
        hub: Arc<EventDispatchHub>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            source,
            classifier,
            tracker: PresenceTracker::new(settings.confidence_threshold, settings.lost_timeout),
            frames,
            hub,
            metrics,
            frame_interval: settings.frame_interval.max(MIN_FRAME_INTERVAL),
            detection_interval: settings.detection_interval,
            last_detection: None,
            consecutive_capture_errors: 0,
        }
    }

    /// Run until shutdown. A camera that cannot be opened ends this task only.
    pub async fn run(mut self, mut shutdown: ShutdownRx) {
        if let Err(e) = self.source.open().await {
            error!(camera = %self.source.name(), error = %e, "camera_unavailable");
            return;
        }

        info!(
            camera = %self.source.name(),
            frame_interval_ms = %self.frame_interval.as_millis(),
            detection_interval_ms = %self.detection_interval.as_millis(),
            classifier = %self.classifier.is_some(),
            "vision_worker_started"
        );

        let mut ticker = interval(self.frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut pending: Option<PendingClassification> = None;

        loop {
            tokio::select! {
                _ = shutdown::signalled(&mut shutdown) => {
                    if let Some(handle) = pending.take() {
                        handle.abort();
                    }
                    info!("vision_worker_shutdown");
                    return;
                }
                result = join_pending(&mut pending) => {
                    pending = None;
                    self.handle_classification(result);
                }
                _ = ticker.tick() => {
                    if let Some(frame) = self.capture().await {
                        if pending.is_none() {
                            pending = self.maybe_classify(frame, Instant::now());
                        }
                    }
                    self.sweep(Instant::now());
                }
            }
        }
    }

    /// Capture one frame and publish it to viewers
    async fn capture(&mut self) -> Option<CapturedFrame> {
        match self.source.capture().await {
            Ok(frame) => {
                if self.consecutive_capture_errors > 0 {
                    info!(failed = %self.consecutive_capture_errors, "camera_capture_recovered");
                    self.consecutive_capture_errors = 0;
                }
                let seq = self.frames.publish(frame.jpeg.clone());
                self.metrics.record_frame_published();
                tracing::trace!(seq = %seq, bytes = %frame.jpeg.len(), "frame_published");
                Some(frame)
            }
            Err(e) => {
                self.metrics.record_frame_capture_error();
                self.consecutive_capture_errors += 1;
                if self.consecutive_capture_errors == 1 {
                    warn!(camera = %self.source.name(), error = %e, "camera_capture_failed");
                } else {
                    debug!(error = %e, failed = %self.consecutive_capture_errors, "camera_capture_failed");
                }
                None
            }
        }
    }

    /// Spawn a classification when one is due
    fn maybe_classify(&mut self, frame: CapturedFrame, now: Instant) -> Option<PendingClassification> {
        let classifier = self.classifier.clone()?;

        let due = self
            .last_detection
            .map_or(true, |last| now.saturating_duration_since(last) >= self.detection_interval);
        if !due {
            return None;
        }
        self.last_detection = Some(now);

        Some(tokio::spawn(async move {
            let result = classifier.classify(&frame).await;
            (frame.captured_at, result)
        }))
    }

    /// Feed a finished classification to the tracker. The sample is seen at
    /// the capture time, not when inference returned.
    fn handle_classification(&mut self, result: Result<ClassificationOutcome, JoinError>) {
        let (captured_at, prediction) = match result {
            Ok((captured_at, Ok(prediction))) => (captured_at, prediction),
            Ok((_, Err(e))) => {
                self.metrics.record_classification_error();
                warn!(error = %e, "classification_failed");
                return;
            }
            Err(e) => {
                self.metrics.record_classification_error();
                error!(error = %e, "classification_task_failed");
                return;
            }
        };

        self.metrics.record_classification();
        debug!(label = %prediction.label, confidence = %prediction.confidence, "classification");

        let sample = ClassificationSample::new(prediction.label, prediction.confidence, captured_at);
        if let Some(event) = self.tracker.observe(&sample, sample.timestamp) {
            self.metrics.record_face_detected();
            self.hub.publish(event);
        }
    }

    fn sweep(&mut self, now: Instant) {
        for event in self.tracker.sweep(now) {
            self.metrics.record_face_lost();
            self.hub.publish(event);
        }
    }
}
