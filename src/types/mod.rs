use serde::{Deserialize, Serialize};
use std::fmt;

/// Known sensor channels. Accel/gyro/mag carry a 3-axis vector, the rest a single value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorId {
    Accel,
    Gyro,
    Mag,
    Temp,
    Pressure,
    Altitude,
}

impl SensorId {
    pub const ALL: [SensorId; 6] = [
        SensorId::Accel,
        SensorId::Gyro,
        SensorId::Mag,
        SensorId::Temp,
        SensorId::Pressure,
        SensorId::Altitude,
    ];

    /// Parse a wire identifier, case-insensitive, accepting the historical aliases.
    pub fn parse(id: &str) -> Option<Self> {
        match id.trim().to_ascii_lowercase().as_str() {
            "accel" | "accelerometer" => Some(SensorId::Accel),
            "gyro" | "gyroscope" => Some(SensorId::Gyro),
            "mag" | "magnetometer" => Some(SensorId::Mag),
            "temp" | "temperature" => Some(SensorId::Temp),
            "pressure" | "baro" | "barometer" => Some(SensorId::Pressure),
            "altitude" | "alt" => Some(SensorId::Altitude),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorId::Accel => "accel",
            SensorId::Gyro => "gyro",
            SensorId::Mag => "mag",
            SensorId::Temp => "temp",
            SensorId::Pressure => "pressure",
            SensorId::Altitude => "altitude",
        }
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, SensorId::Accel | SensorId::Gyro | SensorId::Mag)
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoder output, before any validation of the sensor id or numeric fields.
#[derive(Clone, Debug, PartialEq)]
pub enum RawReading {
    Vector { id: String, axes: [f64; 3], ts: f64 },
    Scalar { id: String, value: f64, ts: f64 },
}

impl RawReading {
    pub fn vector(id: &str, axes: [f64; 3], ts: f64) -> Self {
        RawReading::Vector {
            id: id.to_ascii_lowercase(),
            axes,
            ts,
        }
    }

    pub fn scalar(id: &str, value: f64, ts: f64) -> Self {
        RawReading::Scalar {
            id: id.to_ascii_lowercase(),
            value,
            ts,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            RawReading::Vector { id, .. } | RawReading::Scalar { id, .. } => id,
        }
    }

    pub fn ts(&self) -> f64 {
        match self {
            RawReading::Vector { ts, .. } | RawReading::Scalar { ts, .. } => *ts,
        }
    }
}

/// Axes plus the derived magnitude and spherical angles (degrees).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VectorFields {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub mag: f64,
    pub theta_deg: f64,
    pub phi_deg: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reading {
    Vector(VectorFields),
    Value(f64),
}

/// Canonical sample flowing through queue, window and recorder.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedSample {
    pub sensor: SensorId,
    pub ts_ms: i64,
    #[serde(flatten)]
    pub reading: Reading,
}

impl NormalizedSample {
    pub fn vector(&self) -> Option<&VectorFields> {
        match &self.reading {
            Reading::Vector(v) => Some(v),
            Reading::Value(_) => None,
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self.reading {
            Reading::Value(v) => Some(v),
            Reading::Vector(_) => None,
        }
    }

    /// Scalar used for window stats: magnitude for vectors, the value otherwise.
    pub fn level(&self) -> f64 {
        match self.reading {
            Reading::Vector(v) => v.mag,
            Reading::Value(v) => v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_aliases() {
        assert_eq!(SensorId::parse("ACCEL"), Some(SensorId::Accel));
        assert_eq!(SensorId::parse("temperature"), Some(SensorId::Temp));
        assert_eq!(SensorId::parse("baro"), Some(SensorId::Pressure));
        assert_eq!(SensorId::parse("humidity"), None);
    }

    #[test]
    fn test_vector_class() {
        let vectors: Vec<_> = SensorId::ALL.iter().filter(|s| s.is_vector()).collect();
        assert_eq!(vectors, vec![&SensorId::Accel, &SensorId::Gyro, &SensorId::Mag]);
    }

    #[test]
    fn test_sample_serializes_one_payload_field() {
        let sample = NormalizedSample {
            sensor: SensorId::Temp,
            ts_ms: 42,
            reading: Reading::Value(21.5),
        };
        let json = serde_json::to_value(sample).unwrap();
        assert_eq!(json["sensor"], "temp");
        assert_eq!(json["value"], 21.5);
        assert!(json.get("vector").is_none());
    }
}
