//! Line protocol spoken by the ESP32 sensor board
//!
//! Protocol (one message per `\n`-terminated line, keywords case-insensitive):
//! - `Temperature: <f> ... Humidity: <f>` - DHT11 reading, anywhere in the line
//! - `POLE:BREAK` - wire break toggling started (informational)
//! - `POLE:RESET` - every pole restored
//! - `POLE_BREAK:<idx>` / `POLE_OK:<idx>` - single LED channel changed state
//! - anything else - free-form device chatter, forwarded as a log line

use crate::domain::{DomainEvent, PoleMapping, PoleState};
use smallvec::{smallvec, SmallVec};
use thiserror::Error;

const TEMPERATURE_KEY: &str = "temperature:";
const HUMIDITY_KEY: &str = "humidity:";
const BREAK_SENTINEL: &str = "POLE:BREAK";
const RESET_SENTINEL: &str = "POLE:RESET";
const POLE_BREAK_PREFIX: &str = "POLE_BREAK:";
const POLE_OK_PREFIX: &str = "POLE_OK:";

/// Message forwarded when the board starts toggling LEDs for a wire break
pub const BREAK_STARTED_MESSAGE: &str = "ESP32: wire break detected, LEDs toggling";

/// Events decoded from a single line. Most lines yield zero or one event;
/// the reset sentinel yields one per mapped pole.
pub type DecodedEvents = SmallVec<[DomainEvent; 1]>;

/// Shape of a raw line, before pole indices are resolved
#[derive(Debug, Clone, PartialEq)]
pub enum LineKind<'a> {
    Empty,
    Reading { celsius: f64, humidity_pct: f64 },
    /// Reading keywords matched but a number did not parse
    MalformedReading { detail: String },
    BreakStarted,
    PolesReset,
    Pole { status: PoleState, index: u32 },
    /// Pole prefix matched but the index is not an integer
    MalformedPole { raw_index: &'a str },
    Unrecognized(&'a str),
}

/// Recoverable decode failures; never fatal to the serial loop
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("malformed line {line:?}: {detail}")]
    MalformedLine { line: String, detail: String },

    #[error("unknown pole index {index}")]
    UnknownPoleIndex { index: u32 },
}

/// Strip `prefix` ignoring ASCII case
fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    if line.len() >= prefix.len()
        && line.is_char_boundary(prefix.len())
        && line[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}

/// Leading run of digits and dots after optional whitespace.
/// Returns the run and the byte offset just past it.
fn number_at(line: &str, at: usize) -> Option<(&str, usize)> {
    let rest = &line[at..];
    let trimmed = rest.trim_start();
    let start = at + (rest.len() - trimmed.len());
    let len = trimmed.bytes().take_while(|b| b.is_ascii_digit() || *b == b'.').count();
    if len == 0 {
        None
    } else {
        Some((&line[start..start + len], start + len))
    }
}

/// Locate `Temperature: <n> ... Humidity: <n>`, returning both numeric runs.
///
/// Mirrors a leftmost, lazy search: the first temperature keyword followed by
/// a number, then the first humidity keyword after it followed by a number.
fn find_reading(line: &str) -> Option<(&str, &str)> {
    // ASCII lowercasing keeps byte offsets aligned with `line`
    let lower = line.to_ascii_lowercase();

    for (temp_pos, _) in lower.match_indices(TEMPERATURE_KEY) {
        let Some((temperature, after)) = number_at(line, temp_pos + TEMPERATURE_KEY.len())
        else {
            continue;
        };
        for (hum_pos, _) in lower[after..].match_indices(HUMIDITY_KEY) {
            let key_end = after + hum_pos + HUMIDITY_KEY.len();
            if let Some((humidity, _)) = number_at(line, key_end) {
                return Some((temperature, humidity));
            }
        }
    }
    None
}

/// Classify a raw line by dispatching on its leading keyword.
///
/// Pure; pole indices are left unresolved.
pub fn classify_line(raw: &str) -> LineKind<'_> {
    let line = raw.trim();
    if line.is_empty() {
        return LineKind::Empty;
    }

    if let Some((temperature, humidity)) = find_reading(line) {
        return match (temperature.parse::<f64>(), humidity.parse::<f64>()) {
            (Ok(celsius), Ok(humidity_pct)) => LineKind::Reading { celsius, humidity_pct },
            _ => LineKind::MalformedReading {
                detail: format!("unparseable reading temperature={temperature} humidity={humidity}"),
            },
        };
    }

    if line.eq_ignore_ascii_case(BREAK_SENTINEL) {
        return LineKind::BreakStarted;
    }
    if line.eq_ignore_ascii_case(RESET_SENTINEL) {
        return LineKind::PolesReset;
    }

    let pole = strip_prefix_ignore_case(line, POLE_BREAK_PREFIX)
        .map(|rest| (PoleState::Broken, rest))
        .or_else(|| strip_prefix_ignore_case(line, POLE_OK_PREFIX).map(|rest| (PoleState::Ok, rest)));

    if let Some((status, rest)) = pole {
        // Trailing `:` fields are ignored, only the first one is the index
        let raw_index = rest.split(':').next().unwrap_or_default().trim();
        return match raw_index.parse::<u32>() {
            Ok(index) => LineKind::Pole { status, index },
            Err(_) => LineKind::MalformedPole { raw_index },
        };
    }

    LineKind::Unrecognized(line)
}

/// Turns raw serial lines into domain events using the static pole table
#[derive(Debug, Clone, Default)]
pub struct ProtocolDecoder {
    poles: PoleMapping,
}

impl ProtocolDecoder {
    pub fn new(poles: PoleMapping) -> Self {
        Self { poles }
    }

    /// Decode one line.
    ///
    /// `Ok` with no events for blank lines; `Err` for lines in a recognized
    /// form that cannot be turned into an event.
    pub fn decode(&self, raw: &str) -> Result<DecodedEvents, DecodeError> {
        match classify_line(raw) {
            LineKind::Empty => Ok(SmallVec::new()),
            LineKind::Reading { celsius, humidity_pct } => {
                Ok(smallvec![DomainEvent::Temperature { celsius, humidity_pct }])
            }
            LineKind::MalformedReading { detail } => {
                Err(DecodeError::MalformedLine { line: raw.trim().to_string(), detail })
            }
            LineKind::BreakStarted => {
                Ok(smallvec![DomainEvent::Log { message: BREAK_STARTED_MESSAGE.to_string() }])
            }
            LineKind::PolesReset => {
                Ok(self.poles.pole_ids().map(|id| DomainEvent::pole(id, PoleState::Ok)).collect())
            }
            LineKind::Pole { status, index } => match self.poles.pole_id(index) {
                Some(id) => Ok(smallvec![DomainEvent::pole(id, status)]),
                None => Err(DecodeError::UnknownPoleIndex { index }),
            },
            LineKind::MalformedPole { raw_index } => Err(DecodeError::MalformedLine {
                line: raw.trim().to_string(),
                detail: format!("pole index {raw_index:?} is not an integer"),
            }),
            LineKind::Unrecognized(line) => {
                Ok(smallvec![DomainEvent::Log { message: line.to_string() }])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> ProtocolDecoder {
        ProtocolDecoder::new(PoleMapping::default())
    }

    fn decode_one(line: &str) -> DomainEvent {
        let events = decoder().decode(line).unwrap();
        assert_eq!(events.len(), 1, "expected one event for {line:?}");
        events.into_iter().next().unwrap()
    }

    #[test]
    fn test_temperature_with_surrounding_text() {
        let event = decode_one("DHT11 -> Temperature: 23.5 C | Humidity: 41.0 %");
        assert_eq!(event, DomainEvent::Temperature { celsius: 23.5, humidity_pct: 41.0 });
    }

    #[test]
    fn test_temperature_case_and_whitespace_insensitive() {
        let event = decode_one("   tEmPeRaTuRe:    23.5   humidity:41.0   ");
        assert_eq!(event, DomainEvent::Temperature { celsius: 23.5, humidity_pct: 41.0 });
    }

    #[test]
    fn test_temperature_integer_values() {
        let event = decode_one("Temperature: 21 Humidity: 60");
        assert_eq!(event, DomainEvent::Temperature { celsius: 21.0, humidity_pct: 60.0 });
    }

    #[test]
    fn test_temperature_unparseable_number_is_diagnostic() {
        let err = decoder().decode("Temperature: 1.2.3 Humidity: 40").unwrap_err();
        assert!(matches!(err, DecodeError::MalformedLine { .. }));
    }

    #[test]
    fn test_temperature_without_humidity_is_log() {
        let event = decode_one("Temperature: 23.5");
        assert_eq!(event, DomainEvent::Log { message: "Temperature: 23.5".to_string() });
    }

    #[test]
    fn test_temperature_keyword_without_number_is_log() {
        let event = decode_one("Temperature: n/a Humidity: n/a");
        assert!(matches!(event, DomainEvent::Log { .. }));
    }

    #[test]
    fn test_break_sentinel() {
        let event = decode_one("POLE:BREAK");
        assert_eq!(event, DomainEvent::Log { message: BREAK_STARTED_MESSAGE.to_string() });
    }

    #[test]
    fn test_reset_sentinel_bursts_in_mapping_order() {
        let events = decoder().decode("POLE:RESET\r").unwrap();
        let expected: Vec<DomainEvent> =
            ["P-01", "P-02", "P-03"].iter().map(|id| DomainEvent::pole(*id, PoleState::Ok)).collect();
        assert_eq!(events.into_vec(), expected);
    }

    #[test]
    fn test_reset_with_custom_mapping() {
        let decoder = ProtocolDecoder::new(PoleMapping::from_pairs([(7, "EAST"), (2, "WEST")]));
        let events = decoder.decode("pole:reset").unwrap();
        assert_eq!(
            events.into_vec(),
            vec![DomainEvent::pole("WEST", PoleState::Ok), DomainEvent::pole("EAST", PoleState::Ok)]
        );
    }

    #[test]
    fn test_pole_break_mapped() {
        let event = decode_one("POLE_BREAK:1");
        assert_eq!(
            event,
            DomainEvent::PoleStatus {
                pole_id: "P-02".to_string(),
                status: PoleState::Broken,
                voltage: 0,
            }
        );
    }

    #[test]
    fn test_pole_ok_mapped() {
        let event = decode_one("pole_ok: 0 ");
        assert_eq!(
            event,
            DomainEvent::PoleStatus { pole_id: "P-01".to_string(), status: PoleState::Ok, voltage: 220 }
        );
    }

    #[test]
    fn test_pole_break_unmapped_index() {
        let err = decoder().decode("POLE_BREAK:9").unwrap_err();
        assert_eq!(err, DecodeError::UnknownPoleIndex { index: 9 });
    }

    #[test]
    fn test_pole_break_bad_index() {
        let err = decoder().decode("POLE_BREAK:x").unwrap_err();
        assert!(matches!(err, DecodeError::MalformedLine { .. }));
        assert!(decoder().decode("POLE_OK:").is_err());
        assert!(decoder().decode("POLE_OK:-1").is_err());
    }

    #[test]
    fn test_pole_extra_fields_ignored() {
        let event = decode_one("POLE_BREAK:2:LED2");
        assert_eq!(event, DomainEvent::pole("P-03", PoleState::Broken));
    }

    #[test]
    fn test_unrecognized_line_is_log() {
        let event = decode_one("  WiFi connected  ");
        assert_eq!(event, DomainEvent::Log { message: "WiFi connected".to_string() });
    }

    #[test]
    fn test_empty_line_no_event() {
        assert!(decoder().decode("").unwrap().is_empty());
        assert!(decoder().decode(" \r\n").unwrap().is_empty());
    }

    #[test]
    fn test_sentinel_must_be_exact() {
        assert_eq!(classify_line("POLE:BREAK now"), LineKind::Unrecognized("POLE:BREAK now"));
        assert_eq!(classify_line("xPOLE:RESET"), LineKind::Unrecognized("xPOLE:RESET"));
    }

    #[test]
    fn test_non_ascii_input_never_panics() {
        for line in ["POLE_BREAK:ü", "é", "Température: 20 Humidity: 3", "POLE_Ö"] {
            let _ = decoder().decode(line);
        }
    }
}
