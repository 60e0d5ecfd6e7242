//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! Every execution context records into the same `Arc<Metrics>`.
//!
//! NOTE: All atomics use Relaxed ordering: these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Lock-free metrics collector
pub struct Metrics {
    started_at: Instant,
    /// Frames written to the broadcast buffer
    frames_published: AtomicU64,
    /// Camera capture failures after startup
    frame_capture_errors: AtomicU64,
    /// Classifier invocations that returned a prediction
    classifications: AtomicU64,
    /// Classifier invocations that failed
    classification_errors: AtomicU64,
    /// FaceDetected events emitted
    faces_detected: AtomicU64,
    /// FaceLost events emitted
    faces_lost: AtomicU64,
    /// Raw lines read from the serial device
    serial_lines: AtomicU64,
    /// Domain events decoded from serial lines
    serial_events: AtomicU64,
    /// Lines in a recognized form that failed to decode
    malformed_lines: AtomicU64,
    /// Events handed to the hub
    hub_events_published: AtomicU64,
    /// Per-subscriber deliveries dropped because the queue was full
    hub_deliveries_dropped: AtomicU64,
    /// Currently registered subscribers (gauge)
    subscribers: AtomicU64,
    /// Currently open MJPEG viewers (gauge)
    stream_viewers: AtomicU64,
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Default)]
pub struct MetricsSummary {
    pub uptime_secs: u64,
    pub frames_published: u64,
    pub frame_capture_errors: u64,
    pub classifications: u64,
    pub classification_errors: u64,
    pub faces_detected: u64,
    pub faces_lost: u64,
    pub serial_lines: u64,
    pub serial_events: u64,
    pub malformed_lines: u64,
    pub hub_events_published: u64,
    pub hub_deliveries_dropped: u64,
    pub subscribers: u64,
    pub stream_viewers: u64,
}

impl MetricsSummary {
    /// Log the summary as a single structured line
    pub fn log(&self) {
        info!(
            uptime_secs = %self.uptime_secs,
            frames = %self.frames_published,
            frame_errors = %self.frame_capture_errors,
            classifications = %self.classifications,
            classification_errors = %self.classification_errors,
            detected = %self.faces_detected,
            lost = %self.faces_lost,
            serial_lines = %self.serial_lines,
            serial_events = %self.serial_events,
            malformed = %self.malformed_lines,
            published = %self.hub_events_published,
            dropped = %self.hub_deliveries_dropped,
            subscribers = %self.subscribers,
            viewers = %self.stream_viewers,
            "metrics_summary"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            frames_published: AtomicU64::new(0),
            frame_capture_errors: AtomicU64::new(0),
            classifications: AtomicU64::new(0),
            classification_errors: AtomicU64::new(0),
            faces_detected: AtomicU64::new(0),
            faces_lost: AtomicU64::new(0),
            serial_lines: AtomicU64::new(0),
            serial_events: AtomicU64::new(0),
            malformed_lines: AtomicU64::new(0),
            hub_events_published: AtomicU64::new(0),
            hub_deliveries_dropped: AtomicU64::new(0),
            subscribers: AtomicU64::new(0),
            stream_viewers: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_frame_published(&self) {
        self.frames_published.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frame_capture_error(&self) {
        self.frame_capture_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_classification(&self) {
        self.classifications.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_classification_error(&self) {
        self.classification_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_face_detected(&self) {
        self.faces_detected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_face_lost(&self) {
        self.faces_lost.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_serial_line(&self) {
        self.serial_lines.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_serial_events(&self, count: u64) {
        self.serial_events.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_malformed_line(&self) {
        self.malformed_lines.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_hub_published(&self) {
        self.hub_events_published.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_hub_dropped(&self) {
        self.hub_deliveries_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_subscribers(&self, count: usize) {
        self.subscribers.store(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn stream_viewer_opened(&self) {
        self.stream_viewers.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn stream_viewer_closed(&self) {
        // Saturating: a close without a matching open must not wrap the gauge
        let _ = self.stream_viewers.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    /// Snapshot all counters without resetting them
    pub fn report(&self) -> MetricsSummary {
        MetricsSummary {
            uptime_secs: self.started_at.elapsed().as_secs(),
            frames_published: self.frames_published.load(Ordering::Relaxed),
            frame_capture_errors: self.frame_capture_errors.load(Ordering::Relaxed),
            classifications: self.classifications.load(Ordering::Relaxed),
            classification_errors: self.classification_errors.load(Ordering::Relaxed),
            faces_detected: self.faces_detected.load(Ordering::Relaxed),
            faces_lost: self.faces_lost.load(Ordering::Relaxed),
            serial_lines: self.serial_lines.load(Ordering::Relaxed),
            serial_events: self.serial_events.load(Ordering::Relaxed),
            malformed_lines: self.malformed_lines.load(Ordering::Relaxed),
            hub_events_published: self.hub_events_published.load(Ordering::Relaxed),
            hub_deliveries_dropped: self.hub_deliveries_dropped.load(Ordering::Relaxed),
            subscribers: self.subscribers.load(Ordering::Relaxed),
            stream_viewers: self.stream_viewers.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_frame_published();
        metrics.record_frame_published();
        metrics.record_serial_events(3);
        metrics.record_hub_dropped();

        let summary = metrics.report();
        assert_eq!(summary.frames_published, 2);
        assert_eq!(summary.serial_events, 3);
        assert_eq!(summary.hub_deliveries_dropped, 1);
        assert_eq!(summary.faces_detected, 0);
    }

    #[test]
    fn test_viewer_gauge_does_not_underflow() {
        let metrics = Metrics::new();
        metrics.stream_viewer_closed();
        assert_eq!(metrics.report().stream_viewers, 0);

        metrics.stream_viewer_opened();
        metrics.stream_viewer_opened();
        metrics.stream_viewer_closed();
        assert_eq!(metrics.report().stream_viewers, 1);
    }
}
