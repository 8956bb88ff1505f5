//! Structural and range validation of inbound telemetry payloads.

use serde_json::Value;

use crate::{EngineStatus, TelemetryRecord, VehicleId};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("vehicleId is empty")]
    EmptyVehicleId,
    #[error("{field} is not a finite number")]
    NotFinite { field: &'static str },
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("invalid engineStatus: {0}")]
    InvalidEngineStatus(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Validate a decoded payload and emit the normalised record: trimmed id,
/// coerced numbers, lowercased status, canonical timestamp.
pub fn validate(raw: &Value) -> Result<TelemetryRecord, ValidationError> {
    let obj = raw.as_object().ok_or(ValidationError::NotAnObject)?;

    let vehicle_id = obj
        .get("vehicleId")
        .and_then(Value::as_str)
        .ok_or(ValidationError::MissingField("vehicleId"))?
        .trim();
    if vehicle_id.is_empty() {
        return Err(ValidationError::EmptyVehicleId);
    }

    let lat = coerce_number(obj.get("lat"), "lat")?;
    if !(-90.0..=90.0).contains(&lat) {
        return Err(ValidationError::OutOfRange { field: "lat", value: lat });
    }

    let lng = coerce_number(obj.get("lng"), "lng")?;
    if !(-180.0..=180.0).contains(&lng) {
        return Err(ValidationError::OutOfRange { field: "lng", value: lng });
    }

    let fuel_level = coerce_number(obj.get("fuelLevel"), "fuelLevel")?;
    if !(0.0..=100.0).contains(&fuel_level) {
        return Err(ValidationError::OutOfRange { field: "fuelLevel", value: fuel_level });
    }

    let engine_status = obj
        .get("engineStatus")
        .and_then(Value::as_str)
        .ok_or(ValidationError::MissingField("engineStatus"))?;
    let engine_status: EngineStatus = engine_status
        .trim()
        .parse()
        .map_err(|_| ValidationError::InvalidEngineStatus(engine_status.to_owned()))?;

    let timestamp = parse_timestamp(obj.get("timestamp").or_else(|| obj.get("ts")))?;

    Ok(TelemetryRecord {
        vehicle_id: VehicleId::new(vehicle_id),
        lat,
        lng,
        timestamp,
        fuel_level,
        engine_status,
    })
}

/// Numbers arrive as JSON numbers or as numeric strings; both coerce.
fn coerce_number(value: Option<&Value>, field: &'static str) -> Result<f64, ValidationError> {
    let value = value.ok_or(ValidationError::MissingField(field))?;
    let n = match value {
        Value::Number(n) => n.as_f64().ok_or(ValidationError::NotFinite { field })?,
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| ValidationError::NotFinite { field })?,
        _ => return Err(ValidationError::NotFinite { field }),
    };
    if !n.is_finite() {
        return Err(ValidationError::NotFinite { field });
    }
    Ok(n)
}

/// A timestamp is an ISO-8601 instant, or an epoch-millisecond number.
fn parse_timestamp(value: Option<&Value>) -> Result<jiff::Timestamp, ValidationError> {
    let value = value.ok_or(ValidationError::MissingField("timestamp"))?;
    match value {
        Value::String(s) => s
            .parse()
            .map_err(|_| ValidationError::InvalidTimestamp(s.clone())),
        Value::Number(n) => {
            let ms = n
                .as_i64()
                .ok_or_else(|| ValidationError::InvalidTimestamp(n.to_string()))?;
            jiff::Timestamp::from_millisecond(ms)
                .map_err(|_| ValidationError::InvalidTimestamp(n.to_string()))
        }
        other => Err(ValidationError::InvalidTimestamp(other.to_string())),
    }
}
