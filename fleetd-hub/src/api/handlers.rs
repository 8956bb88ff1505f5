use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use fleetd_core::{FleetMetrics, RollupBucket};

use super::error::ApiError;
use super::params::{aggregate_selection, AggregateField, QueryParams};
use super::ApiState;
use crate::store::{AggregateQuery, HistoryQuery};

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /readyz — gated on broker connectivity.
pub async fn readyz(State(state): State<ApiState>) -> impl IntoResponse {
    if state.hub.broker_connected() {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "not_ready" })))
    }
}

/// GET /stats
pub async fn stats(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.metrics())
}

impl ApiState {
    pub fn metrics(&self) -> FleetMetrics {
        let now_ms = jiff::Timestamp::now().as_millisecond();
        FleetMetrics {
            total_messages: self.hub.total_messages(),
            invalid_messages: self.hub.invalid_messages(),
            vehicles_tracked: self.cache.len() as u64,
            connected_clients: self.fanout.connected_count() as u64,
            message_rate_per_second: self.hub.message_rate_per_second(now_ms),
            window_seconds: self.hub.window_seconds(),
        }
    }
}

/// GET /telemetry/summary — windowed aggregates over the rollup table.
pub async fn telemetry_summary(
    State(state): State<ApiState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<impl IntoResponse, ApiError> {
    let params = QueryParams::new(pairs);
    let (start, end) = params.time_range()?;
    let selection = aggregate_selection(&params)?;
    let window_seconds = params.parse_u32("windowSeconds")?.unwrap_or(0);

    let query = AggregateQuery {
        vehicle_ids: params.vehicle_ids(),
        start,
        end,
        window_seconds,
    };

    let (effective_window, buckets) = state
        .store
        .aggregates(&query)
        .await
        .map_err(ApiError::internal)?;

    let buckets: Vec<serde_json::Value> = buckets
        .iter()
        .map(|bucket| project_bucket(bucket, &selection))
        .collect();

    Ok(Json(json!({
        "windowSeconds": effective_window,
        "buckets": buckets,
    })))
}

fn project_bucket(bucket: &RollupBucket, selection: &[AggregateField]) -> serde_json::Value {
    let mut out = serde_json::Map::new();
    out.insert("bucketStart".to_owned(), json!(bucket.bucket_start));
    out.insert("bucketEnd".to_owned(), json!(bucket.bucket_end));
    out.insert("vehicleId".to_owned(), json!(bucket.vehicle_id));

    for field in selection {
        let value = match field {
            AggregateField::AvgSpeed => json!(bucket.avg_speed),
            AggregateField::MaxSpeed => json!(bucket.max_speed),
            AggregateField::MinFuel => json!(bucket.min_fuel),
            AggregateField::TotalDistance => json!(bucket.total_distance),
            AggregateField::SampleCount => json!(bucket.sample_count),
        };
        out.insert(field.key().to_owned(), value);
    }

    serde_json::Value::Object(out)
}

/// GET /telemetry/history — ascending pages with an opaque continuation
/// token.
pub async fn telemetry_history(
    State(state): State<ApiState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<impl IntoResponse, ApiError> {
    let params = QueryParams::new(pairs);
    let (start, end) = params.time_range()?;

    let query = HistoryQuery {
        vehicle_ids: params.vehicle_ids(),
        start,
        end,
        limit: params.parse_u32("limit")?.unwrap_or(0),
        page_token: params.parse_i64("pageToken")?,
    };

    let page = state
        .store
        .history(&query)
        .await
        .map_err(ApiError::internal)?;

    let mut body = serde_json::Map::new();
    body.insert("events".to_owned(), json!(page.events));
    if let Some(token) = page.next_page_token {
        body.insert("nextPageToken".to_owned(), json!(token.to_string()));
    }

    Ok(Json(serde_json::Value::Object(body)))
}
