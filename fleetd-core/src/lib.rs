pub mod geo;
pub mod validate;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

type BoxStr = Box<str>;

/// External identifier of a vehicle, as reported by the telemetry source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VehicleId(BoxStr);

impl VehicleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().into_boxed_str())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VehicleId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Row id of a persisted telemetry event. Assigned by the store, ascending.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Running,
    Idle,
    Off,
}

impl EngineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineStatus::Running => "running",
            EngineStatus::Idle => "idle",
            EngineStatus::Off => "off",
        }
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown engine status: {0}")]
pub struct ParseEngineStatusError(pub String);

impl FromStr for EngineStatus {
    type Err = ParseEngineStatusError;

    /// Case-insensitive match of the three wire values.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("running") {
            Ok(EngineStatus::Running)
        } else if s.eq_ignore_ascii_case("idle") {
            Ok(EngineStatus::Idle)
        } else if s.eq_ignore_ascii_case("off") {
            Ok(EngineStatus::Off)
        } else {
            Err(ParseEngineStatusError(s.to_owned()))
        }
    }
}

/// A telemetry observation that has passed validation: trimmed id,
/// in-range coordinates and fuel, canonical timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub vehicle_id: VehicleId,
    pub lat: f64,
    pub lng: f64,
    pub timestamp: jiff::Timestamp,
    pub fuel_level: f64,
    pub engine_status: EngineStatus,
}

/// Latest known state of a vehicle, as held by the cache and pushed to
/// live subscribers. `speed_kmh` is derived on ingest; `last_seen` is the
/// server-side ingestion instant and is monotonic per vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedVehicle {
    pub vehicle_id: VehicleId,
    pub lat: f64,
    pub lng: f64,
    pub recorded_at: jiff::Timestamp,
    pub fuel_level: f64,
    pub engine_status: EngineStatus,
    pub speed_kmh: f64,
    pub last_seen: jiff::Timestamp,
}

impl EnrichedVehicle {
    /// Enrich a validated record against the previous observation of the
    /// same vehicle. Speed is the great-circle distance over the elapsed
    /// message time; a first observation or a non-increasing timestamp
    /// derives speed 0.
    pub fn derive(prev: Option<&EnrichedVehicle>, record: &TelemetryRecord, now: jiff::Timestamp) -> Self {
        let speed_kmh = match prev {
            Some(p) if p.recorded_at < record.timestamp => {
                let km = geo::haversine_km(p.lat, p.lng, record.lat, record.lng);
                let dt_ms = record.timestamp.as_millisecond() - p.recorded_at.as_millisecond();
                let hours = dt_ms as f64 / 3_600_000.0;
                km / hours
            }
            _ => 0.0,
        };

        Self {
            vehicle_id: record.vehicle_id.clone(),
            lat: record.lat,
            lng: record.lng,
            recorded_at: record.timestamp,
            fuel_level: record.fuel_level,
            engine_status: record.engine_status,
            speed_kmh,
            last_seen: now,
        }
    }
}

/// One persisted telemetry event. Append-only; `distance_km` is the
/// great-circle delta since the previous event of the same vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    pub event_id: EventId,
    pub vehicle_id: VehicleId,
    pub recorded_at: jiff::Timestamp,
    pub ingest_at: jiff::Timestamp,
    pub lat: f64,
    pub lng: f64,
    pub speed_kmh: f64,
    pub fuel_level: f64,
    pub engine_status: EngineStatus,
    pub distance_km: f64,
}

/// Precomputed aggregate over a time bucket, keyed by
/// (bucket_start, bucket_end, vehicle_id). Bucket bounds are epoch seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupBucket {
    pub bucket_start: i64,
    pub bucket_end: i64,
    pub vehicle_id: VehicleId,
    pub avg_speed: f64,
    pub max_speed: f64,
    pub min_fuel: f64,
    pub total_distance: f64,
    pub sample_count: i64,
}

/// Operational counters exposed on `/stats` and the snapshot RPC.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetMetrics {
    pub total_messages: u64,
    pub invalid_messages: u64,
    pub vehicles_tracked: u64,
    pub connected_clients: u64,
    pub message_rate_per_second: f64,
    pub window_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_status_parses_case_insensitively() {
        assert_eq!("RUNNING".parse::<EngineStatus>().unwrap(), EngineStatus::Running);
        assert_eq!("Idle".parse::<EngineStatus>().unwrap(), EngineStatus::Idle);
        assert_eq!("off".parse::<EngineStatus>().unwrap(), EngineStatus::Off);
        assert!("parked".parse::<EngineStatus>().is_err());
    }

    #[test]
    fn first_observation_has_zero_speed() {
        let record = TelemetryRecord {
            vehicle_id: VehicleId::new("veh-1"),
            lat: 48.8566,
            lng: 2.3522,
            timestamp: "2024-01-01T00:00:00Z".parse().unwrap(),
            fuel_level: 82.5,
            engine_status: EngineStatus::Running,
        };
        let enriched = EnrichedVehicle::derive(None, &record, jiff::Timestamp::now());
        assert_eq!(enriched.speed_kmh, 0.0);
    }

    #[test]
    fn speed_derives_from_distance_over_elapsed_time() {
        let now = jiff::Timestamp::now();
        let first = TelemetryRecord {
            vehicle_id: VehicleId::new("veh-1"),
            lat: 48.8566,
            lng: 2.3522,
            timestamp: "2024-01-01T00:00:00Z".parse().unwrap(),
            fuel_level: 82.5,
            engine_status: EngineStatus::Running,
        };
        let prev = EnrichedVehicle::derive(None, &first, now);

        let second = TelemetryRecord {
            lat: 48.8666,
            lng: 2.3622,
            timestamp: "2024-01-01T00:05:00Z".parse().unwrap(),
            fuel_level: 54.4,
            ..first.clone()
        };
        let enriched = EnrichedVehicle::derive(Some(&prev), &second, now);

        let km = geo::haversine_km(48.8566, 2.3522, 48.8666, 2.3622);
        let expected = km / (5.0 / 60.0);
        assert!((enriched.speed_kmh - expected).abs() / expected < 1e-9);
    }

    #[test]
    fn non_increasing_timestamp_derives_zero_speed() {
        let now = jiff::Timestamp::now();
        let first = TelemetryRecord {
            vehicle_id: VehicleId::new("veh-1"),
            lat: 10.0,
            lng: 10.0,
            timestamp: "2024-01-01T00:05:00Z".parse().unwrap(),
            fuel_level: 50.0,
            engine_status: EngineStatus::Idle,
        };
        let prev = EnrichedVehicle::derive(None, &first, now);

        // Same timestamp, then an earlier one.
        let same = TelemetryRecord { lat: 11.0, ..first.clone() };
        assert_eq!(EnrichedVehicle::derive(Some(&prev), &same, now).speed_kmh, 0.0);

        let earlier = TelemetryRecord {
            lat: 12.0,
            timestamp: "2024-01-01T00:00:00Z".parse().unwrap(),
            ..first.clone()
        };
        assert_eq!(EnrichedVehicle::derive(Some(&prev), &earlier, now).speed_kmh, 0.0);
    }
}
