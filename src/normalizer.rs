use crate::types::{NormalizedSample, RawReading, Reading, SensorId, VectorFields};

/// Convert a raw device timestamp into integer epoch milliseconds.
///
/// The unit is guessed from the order of magnitude:
/// seconds ~1e9..1e10, ms ~1e12..1e13, µs ~1e15..1e16, ns ~1e18..1e19.
/// Anything outside those bands is taken as milliseconds already.
pub fn normalize_timestamp_ms(raw: f64) -> Option<i64> {
    if !raw.is_finite() {
        return None;
    }

    let ms = match raw.abs() {
        a if (1e9..1e11).contains(&a) => raw * 1e3,
        a if (1e12..1e14).contains(&a) => raw,
        a if (1e15..1e17).contains(&a) => raw / 1e3,
        a if (1e18..1e20).contains(&a) => raw / 1e6,
        _ => raw,
    }
    .round();

    if ms.abs() >= i64::MAX as f64 {
        return None;
    }
    Some(ms as i64)
}

/// Magnitude and spherical angles of a 3-axis vector.
///
/// `theta_deg = atan2(sqrt(x²+y²), z)`, `phi_deg = atan2(y, x)`. A zero vector
/// reports both angles as 0.
pub fn vector_fields(x: f64, y: f64, z: f64) -> VectorFields {
    let mag = x.hypot(y).hypot(z);
    if mag == 0.0 {
        return VectorFields {
            x,
            y,
            z,
            mag: 0.0,
            theta_deg: 0.0,
            phi_deg: 0.0,
        };
    }

    let rho = x.hypot(y);
    VectorFields {
        x,
        y,
        z,
        mag,
        theta_deg: rho.atan2(z).to_degrees(),
        phi_deg: y.atan2(x).to_degrees(),
    }
}

/// Turn a raw reading into a canonical sample.
///
/// Returns `None` for unknown sensors, a vector/scalar class mismatch, or any
/// non-finite number. Derived fields are always recomputed from the axes.
pub fn normalize(raw: &RawReading) -> Option<NormalizedSample> {
    let sensor = SensorId::parse(raw.id())?;
    let ts_ms = normalize_timestamp_ms(raw.ts())?;

    let reading = match raw {
        RawReading::Vector { axes, .. } if sensor.is_vector() => {
            if !axes.iter().all(|a| a.is_finite()) {
                return None;
            }
            let fields = vector_fields(axes[0], axes[1], axes[2]);
            if !fields.mag.is_finite() {
                return None;
            }
            Reading::Vector(fields)
        }
        RawReading::Scalar { value, .. } if !sensor.is_vector() => {
            if !value.is_finite() {
                return None;
            }
            Reading::Value(*value)
        }
        _ => return None,
    };

    Some(NormalizedSample {
        sensor,
        ts_ms,
        reading,
    })
}
