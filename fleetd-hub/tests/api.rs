use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use fleetd_core::{EngineStatus, EnrichedVehicle, VehicleId};
use fleetd_hub::api::{self, ApiState};
use fleetd_hub::cache::VehicleCache;
use fleetd_hub::fanout::{LiveFanout, DEFAULT_BUFFER_THRESHOLD};
use fleetd_hub::state::HubState;
use fleetd_hub::store::rollup::RollupJob;
use fleetd_hub::store::TelemetryStore;

async fn harness() -> (Router, ApiState) {
    let state = ApiState {
        cache: VehicleCache::new(1000, 0),
        hub: HubState::new(60_000),
        store: TelemetryStore::open(":memory:", vec![300]).await.unwrap(),
        fanout: LiveFanout::new(1, DEFAULT_BUFFER_THRESHOLD),
    };
    (api::router(state.clone(), "/stream"), state)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn observation(id: &str, recorded_at: &str) -> EnrichedVehicle {
    let at: jiff::Timestamp = recorded_at.parse().unwrap();
    EnrichedVehicle {
        vehicle_id: VehicleId::new(id),
        lat: 48.85,
        lng: 2.35,
        recorded_at: at,
        fuel_level: 60.0,
        engine_status: EngineStatus::Running,
        speed_kmh: 42.0,
        last_seen: at,
    }
}

#[tokio::test]
async fn healthz_reports_ok() {
    let (app, _) = harness().await;
    let (status, body) = get(&app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn readyz_is_gated_on_broker_connectivity() {
    let (app, state) = harness().await;

    let (status, body) = get(&app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "not_ready");

    state.hub.set_broker_connected(true);
    let (status, body) = get(&app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn stats_fields_are_present_and_non_negative() {
    let (app, state) = harness().await;
    state.cache.insert(observation("veh-1", "2024-01-01T00:00:00Z"));
    state.hub.record_valid_message(jiff::Timestamp::now().as_millisecond());
    state.hub.record_invalid_message();

    let (status, body) = get(&app, "/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalMessages"], 1);
    assert_eq!(body["invalidMessages"], 1);
    assert_eq!(body["vehiclesTracked"], 1);
    assert_eq!(body["connectedClients"], 0);
    assert_eq!(body["windowSeconds"], 60);
    assert!(body["messageRatePerSecond"].as_f64().unwrap() >= 0.0);
}

#[tokio::test]
async fn non_get_methods_are_rejected() {
    let (app, _) = harness().await;
    for uri in ["/healthz", "/readyz", "/stats", "/telemetry/summary", "/telemetry/history"] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED, "{uri}");
    }
}

#[tokio::test]
async fn history_returns_events_and_a_token_only_when_truncated() {
    let (app, state) = harness().await;
    for i in 0..3 {
        state
            .store
            .record_telemetry(&observation("veh-1", &format!("2024-01-01T00:0{i}:00Z")))
            .await
            .unwrap();
    }

    let (status, body) = get(&app, "/telemetry/history?vehicleId=veh-1&limit=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["events"].as_array().unwrap().len(), 2);
    let token = body["nextPageToken"].as_str().unwrap().to_owned();

    let (status, body) =
        get(&app, &format!("/telemetry/history?vehicleId=veh-1&limit=2&pageToken={token}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["events"].as_array().unwrap().len(), 1);
    assert!(body.get("nextPageToken").is_none());
}

#[tokio::test]
async fn invalid_ranges_are_rejected_as_bad_requests() {
    let (app, _) = harness().await;

    let (status, body) = get(
        &app,
        "/telemetry/history?start=2024-01-02T00:00:00Z&end=2024-01-01T00:00:00Z",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_argument");

    let (status, _) = get(&app, "/telemetry/summary?start=whenever").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get(&app, "/telemetry/history?limit=minus-four").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn summary_projects_the_requested_aggregates() {
    let (app, state) = harness().await;
    state
        .store
        .record_telemetry(&observation("veh-1", "2024-01-01T00:00:30Z"))
        .await
        .unwrap();
    state
        .store
        .record_telemetry(&observation("veh-1", "2024-01-01T00:01:30Z"))
        .await
        .unwrap();
    let job = RollupJob { window_seconds: 300, catch_up_windows: 1, force: true };
    state.store.run_rollup(job, jiff::Timestamp::now()).await.unwrap();

    let (status, body) = get(&app, "/telemetry/summary?aggregate=avgSpeed,sampleCount").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["windowSeconds"], 300);

    let buckets = body["buckets"].as_array().unwrap();
    assert_eq!(buckets.len(), 1);
    let bucket = &buckets[0];
    assert_eq!(bucket["vehicleId"], "veh-1");
    assert_eq!(bucket["sampleCount"], 2);
    assert_eq!(bucket["avgSpeed"], 42.0);
    assert!(bucket.get("maxSpeed").is_none());
    assert!(bucket.get("minFuel").is_none());
}
