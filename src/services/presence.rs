//! Presence lifecycle tracking for classifier output
//!
//! Two-phase policy: a sample must clear the confidence gate to count, and a
//! label is only declared lost after `lost_timeout` with no qualifying sample.
//! Single-frame recognition is noisy, so the timeout absorbs transient
//! misclassifications without flapping.
//!
//! Owned by the vision worker; never shared across tasks.

use crate::domain::{ClassificationSample, DomainEvent};
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A label currently considered visible
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub label: String,
    pub last_seen: Instant,
}

pub struct PresenceTracker {
    /// At most one entry per label
    entries: FxHashMap<String, PresenceEntry>,
    threshold: f32,
    lost_timeout: Duration,
}

impl PresenceTracker {
    pub fn new(threshold: f32, lost_timeout: Duration) -> Self {
        Self { entries: FxHashMap::default(), threshold, lost_timeout }
    }

    /// Feed one classifier sample.
    ///
    /// Below the threshold nothing changes. Otherwise the label's entry is
    /// created or refreshed to `now` and a `FaceDetected` is returned for
    /// every qualifying sample, repeats included.
    pub fn observe(&mut self, sample: &ClassificationSample, now: Instant) -> Option<DomainEvent> {
        if sample.confidence < self.threshold {
            debug!(
                label = %sample.label,
                confidence = %sample.confidence,
                threshold = %self.threshold,
                "presence_low_confidence_skipped"
            );
            return None;
        }

        match self.entries.get_mut(&sample.label) {
            Some(entry) => entry.last_seen = now,
            None => {
                info!(label = %sample.label, confidence = %sample.confidence, "presence_appeared");
                self.entries.insert(
                    sample.label.clone(),
                    PresenceEntry { label: sample.label.clone(), last_seen: now },
                );
            }
        }

        Some(DomainEvent::FaceDetected { label: sample.label.clone(), confidence: sample.confidence })
    }

    /// Drop every entry silent for longer than the lost timeout.
    ///
    /// Returns one `FaceLost` per removed label, sorted by label. A removed
    /// label is not reported again until it reappears.
    pub fn sweep(&mut self, now: Instant) -> Vec<DomainEvent> {
        let lost_timeout = self.lost_timeout;
        let mut lost: Vec<String> = self
            .entries
            .values()
            .filter(|entry| now.saturating_duration_since(entry.last_seen) > lost_timeout)
            .map(|entry| entry.label.clone())
            .collect();

        if lost.is_empty() {
            return Vec::new();
        }
        lost.sort_unstable();

        lost.into_iter()
            .map(|label| {
                self.entries.remove(&label);
                info!(label = %label, "presence_lost");
                DomainEvent::FaceLost { label }
            })
            .collect()
    }

    /// Currently visible labels, sorted
    pub fn visible_labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        labels.sort_unstable();
        labels
    }

    pub fn entry(&self, label: &str) -> Option<&PresenceEntry> {
        self.entries.get(label)
    }
}
