//! Wire envelope decoding.
//!
//! A payload is a JSON list of envelopes (or one bare envelope). Each envelope
//! carries exactly one named sensor variant plus a device timestamp. Several
//! historical envelope layouts exist; they are tried in `EnvelopeFormat::ALL`
//! order until one claims the envelope.

use serde_json::{Map, Value};

use crate::error::PResult;
use crate::types::RawReading;

const TIMESTAMP_KEYS: [&str; 4] = ["timestamp", "ts", "t", "time"];
const FLAT_TYPE_KEYS: [&str; 3] = ["type", "sensor", "stream"];

/// Variant whose three components fan out into independent scalar readings.
const ENVIRONMENT_VARIANT: &str = "baro";
const ENVIRONMENT_FIELDS: [&str; 3] = ["temp", "pressure", "altitude"];

/// Result of decoding one payload.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Decoded {
    pub readings: Vec<RawReading>,
    /// Envelopes rejected as malformed.
    pub skipped: usize,
}

/// Outcome of applying one format rule to an envelope.
#[derive(Debug, PartialEq)]
enum Extraction {
    /// Rule does not recognise this layout, try the next one.
    NoMatch,
    /// Layout recognised but the envelope is malformed.
    Rejected(&'static str),
    /// Recognised. May be empty for variants this build does not know.
    Readings(Vec<RawReading>),
}

/// Known envelope layouts, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeFormat {
    /// `{"timestamp": n, "measurement": {"Accel": [x, y, z]}}`
    Tagged,
    /// `{"type": "accel", "ts": n, "x": .., "y": .., "z": ..}`
    Flat,
    /// `{"Accel": [x, y, z], "timestamp": n}`
    Inline,
}

impl EnvelopeFormat {
    pub const ALL: [EnvelopeFormat; 3] = [
        EnvelopeFormat::Tagged,
        EnvelopeFormat::Flat,
        EnvelopeFormat::Inline,
    ];

    fn extract(&self, env: &Map<String, Value>) -> Extraction {
        match self {
            EnvelopeFormat::Tagged => extract_tagged(env),
            EnvelopeFormat::Flat => extract_flat(env),
            EnvelopeFormat::Inline => extract_inline(env),
        }
    }
}

/// Decode one transport payload.
///
/// Malformed JSON fails the whole payload. Malformed envelopes inside a valid
/// payload are skipped and counted.
pub fn decode(payload: &str) -> PResult<Decoded> {
    let parsed: Value = serde_json::from_str(payload)?;
    let envelopes = match parsed {
        Value::Array(items) => items,
        other => vec![other],
    };

    let mut decoded = Decoded::default();
    for envelope in &envelopes {
        match decode_envelope(envelope) {
            Ok(readings) => decoded.readings.extend(readings),
            Err(reason) => {
                log::trace!("[DECODE] Skipping envelope: {reason}");
                decoded.skipped += 1;
            }
        }
    }
    Ok(decoded)
}

fn decode_envelope(envelope: &Value) -> Result<Vec<RawReading>, &'static str> {
    let env = envelope.as_object().ok_or("envelope is not an object")?;
    for format in EnvelopeFormat::ALL {
        match format.extract(env) {
            Extraction::NoMatch => continue,
            Extraction::Rejected(reason) => return Err(reason),
            Extraction::Readings(readings) => return Ok(readings),
        }
    }
    Err("no envelope format matched")
}

fn extract_tagged(env: &Map<String, Value>) -> Extraction {
    let Some(measurement) = env.get("measurement") else {
        return Extraction::NoMatch;
    };
    let Some(ts) = timestamp(env) else {
        return Extraction::Rejected("missing timestamp");
    };
    let Some(variants) = measurement.as_object() else {
        return Extraction::Rejected("measurement is not an object");
    };
    match single_entry(variants.iter()) {
        Some((variant, payload)) => variant_readings(variant, payload, ts),
        None => Extraction::Rejected("measurement must hold exactly one variant"),
    }
}

fn extract_inline(env: &Map<String, Value>) -> Extraction {
    let Some(ts) = timestamp(env) else {
        return Extraction::Rejected("missing timestamp");
    };
    let variants = env
        .iter()
        .filter(|(key, _)| !TIMESTAMP_KEYS.contains(&key.as_str()));
    match single_entry(variants) {
        Some((variant, payload)) => variant_readings(variant, payload, ts),
        None => Extraction::Rejected("envelope must hold exactly one variant"),
    }
}

fn extract_flat(env: &Map<String, Value>) -> Extraction {
    let Some(kind) = FLAT_TYPE_KEYS
        .iter()
        .find_map(|key| env.get(*key))
        .and_then(Value::as_str)
    else {
        return Extraction::NoMatch;
    };
    let kind = kind.to_ascii_lowercase();
    let Some(ts) = timestamp(env) else {
        return Extraction::Rejected("missing timestamp");
    };

    match kind.as_str() {
        "accel" | "gyro" | "mag" => {
            let axes = ["x", "y", "z"].map(|axis| env.get(axis).and_then(number));
            match axes {
                [Some(x), Some(y), Some(z)] => {
                    Extraction::Readings(vec![RawReading::vector(&kind, [x, y, z], ts)])
                }
                _ => Extraction::Rejected("flat vector record missing an axis"),
            }
        }
        "temp" | "temperature" | "pressure" | "baro" | "barometer" | "altitude" => {
            let value = ["value", kind.as_str(), "temp", "temperature", "pressure", "baro", "altitude"]
                .iter()
                .find_map(|key| env.get(*key).and_then(number));
            match value {
                Some(value) => Extraction::Readings(vec![RawReading::scalar(&kind, value, ts)]),
                None => Extraction::Rejected("flat scalar record missing its value"),
            }
        }
        other => {
            log::trace!("[DECODE] Dropping unknown sensor type {other}");
            Extraction::Readings(Vec::new())
        }
    }
}

fn variant_readings(variant: &str, payload: &Value, ts: f64) -> Extraction {
    let id = variant.to_ascii_lowercase();
    match id.as_str() {
        "accel" | "gyro" | "mag" => match triple(payload, ["x", "y", "z"]) {
            Some(axes) => Extraction::Readings(vec![RawReading::vector(&id, axes, ts)]),
            None => Extraction::Rejected("vector variant needs three numbers"),
        },
        ENVIRONMENT_VARIANT => match triple(payload, ["temperature", "pressure", "altitude"]) {
            Some(values) => Extraction::Readings(
                ENVIRONMENT_FIELDS
                    .iter()
                    .zip(values)
                    .map(|(field, value)| RawReading::scalar(field, value, ts))
                    .collect(),
            ),
            None => Extraction::Rejected("environment variant needs three numbers"),
        },
        "temp" | "temperature" | "pressure" | "altitude" => match scalar(payload) {
            Some(value) => Extraction::Readings(vec![RawReading::scalar(&id, value, ts)]),
            None => Extraction::Rejected("scalar variant needs one number"),
        },
        _ => {
            log::trace!("[DECODE] Dropping unknown variant {variant}");
            Extraction::Readings(Vec::new())
        }
    }
}

fn single_entry<'a>(
    mut entries: impl Iterator<Item = (&'a String, &'a Value)>,
) -> Option<(&'a String, &'a Value)> {
    let first = entries.next()?;
    match entries.next() {
        Some(_) => None,
        None => Some(first),
    }
}

fn timestamp(env: &Map<String, Value>) -> Option<f64> {
    TIMESTAMP_KEYS
        .iter()
        .find_map(|key| env.get(*key))
        .and_then(number)
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Three components, either as `[a, b, c]` or as an object with the given keys.
fn triple(value: &Value, keys: [&str; 3]) -> Option<[f64; 3]> {
    match value {
        Value::Array(items) if items.len() == 3 => {
            Some([number(&items[0])?, number(&items[1])?, number(&items[2])?])
        }
        Value::Object(fields) => Some([
            number(fields.get(keys[0])?)?,
            number(fields.get(keys[1])?)?,
            number(fields.get(keys[2])?)?,
        ]),
        _ => None,
    }
}

fn scalar(value: &Value) -> Option<f64> {
    match value {
        Value::Array(items) if items.len() == 1 => number(&items[0]),
        Value::Object(fields) => fields.get("value").and_then(number),
        other => number(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_vector() {
        let decoded =
            decode(r#"[{"timestamp": 1700000000000, "measurement": {"Accel": [0.1, 0.2, 9.8]}}]"#)
                .unwrap();
        assert_eq!(
            decoded.readings,
            vec![RawReading::vector("accel", [0.1, 0.2, 9.8], 1.7e12)]
        );
        assert_eq!(decoded.skipped, 0);
    }

    #[test]
    fn test_single_envelope_without_list() {
        let decoded = decode(r#"{"timestamp": 5, "measurement": {"Gyro": [1, 2, 3]}}"#).unwrap();
        assert_eq!(decoded.readings.len(), 1);
        assert_eq!(decoded.readings[0].id(), "gyro");
    }

    #[test]
    fn test_environment_fan_out() {
        let decoded =
            decode(r#"{"timestamp": 77, "measurement": {"Baro": [25.0, 1013.25, 120.0]}}"#)
                .unwrap();
        assert_eq!(
            decoded.readings,
            vec![
                RawReading::scalar("temp", 25.0, 77.0),
                RawReading::scalar("pressure", 1013.25, 77.0),
                RawReading::scalar("altitude", 120.0, 77.0),
            ]
        );
    }

    #[test]
    fn test_malformed_json_fails_whole_payload() {
        assert!(decode(r#"[{"timestamp": 1, "measurement": {"Accel": [1,2,3]}}"#).is_err());
        assert!(decode("").is_err());
    }

    #[test]
    fn test_bad_envelopes_are_skipped() {
        let payload = r#"[
            {"timestamp": 1, "measurement": {}},
            {"timestamp": 1, "measurement": {"Accel": [1,2,3], "Gyro": [1,2,3]}},
            {"timestamp": 1, "measurement": {"Accel": [1,2]}},
            {"measurement": {"Accel": [1,2,3]}},
            42,
            {"timestamp": 2, "measurement": {"Mag": [4,5,6]}}
        ]"#;
        let decoded = decode(payload).unwrap();
        assert_eq!(decoded.skipped, 5);
        assert_eq!(decoded.readings, vec![RawReading::vector("mag", [4.0, 5.0, 6.0], 2.0)]);
    }

    #[test]
    fn test_unknown_variant_dropped_silently() {
        let decoded =
            decode(r#"[{"timestamp": 1, "measurement": {"Humidity": [40.0]}}]"#).unwrap();
        assert!(decoded.readings.is_empty());
        assert_eq!(decoded.skipped, 0);
    }

    #[test]
    fn test_inline_variant() {
        let decoded = decode(r#"{"Mag": {"x": 1, "y": 2, "z": 3}, "ts": 10}"#).unwrap();
        assert_eq!(decoded.readings, vec![RawReading::vector("mag", [1.0, 2.0, 3.0], 10.0)]);

        let decoded = decode(r#"{"Mag": [1, 2, 3], "Accel": [1, 2, 3], "ts": 10}"#).unwrap();
        assert_eq!(decoded.skipped, 1);
    }

    #[test]
    fn test_flat_records() {
        let payload = r#"[
            {"type": "ACCEL", "t": 1700000000, "x": 1, "y": 0, "z": 0, "mag": 99, "theta": 7},
            {"sensor": "temperature", "ts": 1700000000, "temperature": 21.5},
            {"stream": "baro", "time": "1700000000", "value": 1000.0},
            {"type": "gps", "ts": 1, "lat": 0}
        ]"#;
        let decoded = decode(payload).unwrap();
        assert_eq!(
            decoded.readings,
            vec![
                RawReading::vector("accel", [1.0, 0.0, 0.0], 1.7e9),
                RawReading::scalar("temperature", 21.5, 1.7e9),
                RawReading::scalar("baro", 1000.0, 1.7e9),
            ]
        );
        assert_eq!(decoded.skipped, 0);
    }

    #[test]
    fn test_flat_vector_missing_axis_rejected() {
        let decoded = decode(r#"{"type": "gyro", "ts": 1, "x": 1, "y": 2}"#).unwrap();
        assert!(decoded.readings.is_empty());
        assert_eq!(decoded.skipped, 1);
    }
}
