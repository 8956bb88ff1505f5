use serde::{Deserialize, Serialize};
use ulid::Ulid;

use fleetd_core::{EnrichedVehicle, FleetMetrics, RollupBucket, TelemetryEvent, VehicleId};

/// Correlation id of a wire envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Ulid);

impl MessageId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

/// One frame on the wire. Replies carry the id of the message they answer;
/// every message of a server stream replies to the request that opened it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_id: MessageId,
    pub reply_to: Option<MessageId>,
    pub payload: WireMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    Ping,
    Pong,

    SnapshotRequest(SnapshotParams),
    SnapshotResponse(FleetSnapshot),

    AggregatesRequest(AggregateParams),
    AggregatesResponse(AggregatesPage),

    /// Opens a history stream: StreamMeta, then HistoryEvent*, then StreamEnd.
    HistoryRequest(HistoryParams),
    /// Opens a live stream: StreamMeta, then LiveUpdate* until cancelled.
    LiveRequest(LiveParams),

    StreamMeta(StreamMeta),
    HistoryEvent(TelemetryEvent),
    LiveUpdate(EnrichedVehicle),
    StreamEnd,

    Error(ErrorBody),
}

impl WireMessage {
    /// True for the payloads that terminate a server stream.
    pub fn ends_stream(&self) -> bool {
        matches!(self, WireMessage::StreamEnd | WireMessage::Error(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidArgument,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {detail}")]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub detail: String,
}

impl ErrorBody {
    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        Self { kind: ErrorKind::InvalidArgument, detail: detail.into() }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Internal, detail: detail.into() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotParams {
    /// Empty means all vehicles.
    pub vehicle_ids: Vec<VehicleId>,
    pub include_metrics: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub vehicles: Vec<EnrichedVehicle>,
    pub metrics: Option<FleetMetrics>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryParams {
    pub vehicle_ids: Vec<VehicleId>,
    pub start: Option<jiff::Timestamp>,
    pub end: Option<jiff::Timestamp>,
    pub limit: u32,
    /// Resume after this event id.
    pub page_token: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateKind {
    AvgSpeed,
    MaxSpeed,
    MinFuel,
    TotalDistance,
    SampleCount,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateParams {
    pub vehicle_ids: Vec<VehicleId>,
    pub start: Option<jiff::Timestamp>,
    pub end: Option<jiff::Timestamp>,
    pub window_seconds: u32,
    /// Empty means all metrics.
    pub aggregates: Vec<AggregateKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatesPage {
    /// The window actually served; raised to a materialised window when the
    /// requested one cannot be recombined.
    pub window_seconds: u32,
    pub buckets: Vec<AggregateRow>,
}

/// One aggregates-response row: the bucket key plus the selected metrics.
/// Metrics outside the request's selection are absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub bucket_start: i64,
    pub bucket_end: i64,
    pub vehicle_id: VehicleId,
    pub avg_speed: Option<f64>,
    pub max_speed: Option<f64>,
    pub min_fuel: Option<f64>,
    pub total_distance: Option<f64>,
    pub sample_count: Option<i64>,
}

impl AggregateRow {
    /// Keep the bucket key and the selected metrics; an empty selection
    /// keeps every metric.
    pub fn project(bucket: &RollupBucket, selection: &[AggregateKind]) -> Self {
        let keep = |kind: AggregateKind| selection.is_empty() || selection.contains(&kind);
        Self {
            bucket_start: bucket.bucket_start,
            bucket_end: bucket.bucket_end,
            vehicle_id: bucket.vehicle_id.clone(),
            avg_speed: keep(AggregateKind::AvgSpeed).then_some(bucket.avg_speed),
            max_speed: keep(AggregateKind::MaxSpeed).then_some(bucket.max_speed),
            min_fuel: keep(AggregateKind::MinFuel).then_some(bucket.min_fuel),
            total_distance: keep(AggregateKind::TotalDistance).then_some(bucket.total_distance),
            sample_count: keep(AggregateKind::SampleCount).then_some(bucket.sample_count),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiveParams {
    /// Empty means all vehicles.
    pub vehicle_ids: Vec<VehicleId>,
}

/// Out-of-band stream metadata, sent before the first item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamMeta {
    pub active_stream_count: u64,
    /// Present when a history page was truncated at `limit`.
    pub next_page_token: Option<i64>,
}
