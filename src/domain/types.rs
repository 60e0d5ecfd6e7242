//! Shared types for the presence bridge

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Voltage reported for a pole whose line is intact
pub const POLE_NOMINAL_VOLTAGE: u32 = 220;

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// One classifier result, produced once per inference cycle
#[derive(Debug, Clone)]
pub struct ClassificationSample {
    pub label: String,
    /// Probability of `label`, in [0, 1]
    pub confidence: f32,
    pub timestamp: Instant,
}

impl ClassificationSample {
    pub fn new(label: impl Into<String>, confidence: f32, timestamp: Instant) -> Self {
        Self { label: label.into(), confidence, timestamp }
    }
}

/// Pole line state as reported by the microcontroller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoleState {
    Ok,
    Broken,
}

impl PoleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoleState::Ok => "ok",
            PoleState::Broken => "broken",
        }
    }

    /// Voltage the dashboard shows for this state
    pub fn voltage(&self) -> u32 {
        match self {
            PoleState::Ok => POLE_NOMINAL_VOLTAGE,
            PoleState::Broken => 0,
        }
    }
}

/// Normalized event flowing from the sensors to every subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    FaceDetected { label: String, confidence: f32 },
    FaceLost { label: String },
    Temperature { celsius: f64, humidity_pct: f64 },
    PoleStatus { pole_id: String, status: PoleState, voltage: u32 },
    Log { message: String },
}

impl DomainEvent {
    /// Pole status event with the voltage implied by `status`
    pub fn pole(pole_id: impl Into<String>, status: PoleState) -> Self {
        DomainEvent::PoleStatus { pole_id: pole_id.into(), status, voltage: status.voltage() }
    }

    /// Wire name of the event, stable across payload versions
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::FaceDetected { .. } => "face_detection",
            DomainEvent::FaceLost { .. } => "face_lost",
            DomainEvent::Temperature { .. } => "temperature",
            DomainEvent::PoleStatus { .. } => "pole_status",
            DomainEvent::Log { .. } => "esp32_log",
        }
    }
}
