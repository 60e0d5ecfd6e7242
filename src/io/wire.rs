//! JSON envelope pushed to live event subscribers
//!
//! Every message is `{"event": <name>, "v": 1, "ts": <epoch ms>, "data": {...}}`.
//! `data` field names are what the dashboard scripts read and must stay
//! stable within a schema version.

use crate::domain::DomainEvent;
use serde::Serialize;

/// Payload schema version carried in every envelope
pub const SCHEMA_VERSION: u8 = 1;

#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub event: &'static str,
    pub v: u8,
    pub ts: u64,
    pub data: Payload<'a>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Payload<'a> {
    FaceDetection { label: &'a str, confidence: f64 },
    FaceLost { label: &'a str },
    Temperature { temperature: f64, humidity: f64 },
    PoleStatus { pole: &'a str, status: &'static str, voltage: u32 },
    Log { msg: &'a str },
}

/// Round to 4 decimal places, as displayed by the dashboard
fn round4(value: f32) -> f64 {
    (f64::from(value) * 10_000.0).round() / 10_000.0
}

impl<'a> Envelope<'a> {
    pub fn new(event: &'a DomainEvent, ts: u64) -> Self {
        let data = match event {
            DomainEvent::FaceDetected { label, confidence } => {
                Payload::FaceDetection { label, confidence: round4(*confidence) }
            }
            DomainEvent::FaceLost { label } => Payload::FaceLost { label },
            DomainEvent::Temperature { celsius, humidity_pct } => {
                Payload::Temperature { temperature: *celsius, humidity: *humidity_pct }
            }
            DomainEvent::PoleStatus { pole_id, status, voltage } => {
                Payload::PoleStatus { pole: pole_id, status: status.as_str(), voltage: *voltage }
            }
            DomainEvent::Log { message } => Payload::Log { msg: message },
        };
        Self { event: event.name(), v: SCHEMA_VERSION, ts, data }
    }
}

/// Serialize an event into its wire text
pub fn encode(event: &DomainEvent, ts: u64) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Envelope::new(event, ts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PoleState;
    use serde_json::{json, Value};

    fn encoded(event: &DomainEvent) -> Value {
        serde_json::from_str(&encode(event, 1_700_000_000_000).unwrap()).unwrap()
    }

    #[test]
    fn test_face_detection_rounds_confidence() {
        let event = DomainEvent::FaceDetected { label: "Aarush".to_string(), confidence: 0.912_345 };
        assert_eq!(
            encoded(&event),
            json!({
                "event": "face_detection",
                "v": 1,
                "ts": 1_700_000_000_000u64,
                "data": { "label": "Aarush", "confidence": 0.9123 }
            })
        );
    }

    #[test]
    fn test_pole_status_payload() {
        let event = DomainEvent::pole("P-03", PoleState::Broken);
        assert_eq!(encoded(&event)["data"], json!({ "pole": "P-03", "status": "broken", "voltage": 0 }));
        assert_eq!(encoded(&event)["event"], "pole_status");
    }

    #[test]
    fn test_temperature_payload() {
        let event = DomainEvent::Temperature { celsius: 23.5, humidity_pct: 41.0 };
        assert_eq!(encoded(&event)["data"], json!({ "temperature": 23.5, "humidity": 41.0 }));
    }

    #[test]
    fn test_log_and_lost_payloads() {
        let log = DomainEvent::Log { message: "booting".to_string() };
        assert_eq!(encoded(&log)["data"], json!({ "msg": "booting" }));

        let lost = DomainEvent::FaceLost { label: "Mukti".to_string() };
        assert_eq!(encoded(&lost)["data"], json!({ "label": "Mukti" }));
    }
}
