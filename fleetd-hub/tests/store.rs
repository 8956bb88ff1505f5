use fleetd_core::{geo, EngineStatus, EnrichedVehicle, VehicleId};
use fleetd_hub::store::rollup::RollupJob;
use fleetd_hub::store::{AggregateQuery, HistoryQuery, TelemetryStore};

fn ts(s: &str) -> jiff::Timestamp {
    s.parse().unwrap()
}

fn observation(
    id: &str,
    lat: f64,
    lng: f64,
    recorded_at: &str,
    speed_kmh: f64,
    fuel: f64,
) -> EnrichedVehicle {
    EnrichedVehicle {
        vehicle_id: VehicleId::new(id),
        lat,
        lng,
        recorded_at: ts(recorded_at),
        fuel_level: fuel,
        engine_status: EngineStatus::Running,
        speed_kmh,
        last_seen: ts(recorded_at),
    }
}

async fn memory_store() -> TelemetryStore {
    TelemetryStore::open(":memory:", vec![300]).await.unwrap()
}

#[tokio::test]
async fn migrations_apply_once_in_order() {
    let store = memory_store().await;
    let versions = store.schema_versions().await.unwrap();
    assert_eq!(versions, ["0001_telemetry_schema"]);

    let mut sorted = versions.clone();
    sorted.sort();
    assert_eq!(versions, sorted);
}

#[tokio::test]
async fn first_event_has_zero_distance() {
    let store = memory_store().await;
    let event = store
        .record_telemetry(&observation(
            "veh-1", 48.8566, 2.3522, "2024-01-01T00:00:00Z", 0.0, 82.5,
        ))
        .await
        .unwrap();

    assert_eq!(event.distance_km, 0.0);
    assert_eq!(store.event_count().await.unwrap(), 1);
    assert_eq!(store.vehicle_count().await.unwrap(), 1);

    let (last_event, cumulative) = store
        .distance_for(&VehicleId::new("veh-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last_event, event.event_id.0);
    assert_eq!(cumulative, 0.0);
}

#[tokio::test]
async fn second_event_accumulates_the_haversine_distance() {
    let store = memory_store().await;
    store
        .record_telemetry(&observation(
            "veh-1", 48.8566, 2.3522, "2024-01-01T00:00:00Z", 0.0, 82.5,
        ))
        .await
        .unwrap();
    let second = store
        .record_telemetry(&observation(
            "veh-1", 48.8666, 2.3622, "2024-01-01T00:05:00Z", 15.0, 54.4,
        ))
        .await
        .unwrap();

    let expected = geo::haversine_km(48.8566, 2.3522, 48.8666, 2.3622);
    assert!((second.distance_km - expected).abs() < 1e-9);

    let (_, cumulative) = store
        .distance_for(&VehicleId::new("veh-1"))
        .await
        .unwrap()
        .unwrap();
    assert!((cumulative - expected).abs() < 1e-9);
}

#[tokio::test]
async fn cumulative_distance_is_non_decreasing() {
    let store = memory_store().await;
    let positions = [
        (48.85, 2.35, "2024-01-01T00:00:00Z"),
        (48.86, 2.36, "2024-01-01T00:01:00Z"),
        (48.85, 2.35, "2024-01-01T00:02:00Z"),
        (48.85, 2.35, "2024-01-01T00:03:00Z"),
    ];

    let mut previous = 0.0;
    for (lat, lng, at) in positions {
        store
            .record_telemetry(&observation("veh-1", lat, lng, at, 10.0, 50.0))
            .await
            .unwrap();
        let (_, cumulative) = store
            .distance_for(&VehicleId::new("veh-1"))
            .await
            .unwrap()
            .unwrap();
        assert!(cumulative >= previous);
        previous = cumulative;
    }
}

#[tokio::test]
async fn distance_is_tracked_per_vehicle() {
    let store = memory_store().await;
    store
        .record_telemetry(&observation("a", 48.0, 2.0, "2024-01-01T00:00:00Z", 0.0, 80.0))
        .await
        .unwrap();
    store
        .record_telemetry(&observation("b", 10.0, 10.0, "2024-01-01T00:00:30Z", 0.0, 70.0))
        .await
        .unwrap();
    let second_a = store
        .record_telemetry(&observation("a", 48.1, 2.1, "2024-01-01T00:01:00Z", 20.0, 79.0))
        .await
        .unwrap();

    // b's position never contaminates a's delta.
    let expected = geo::haversine_km(48.0, 2.0, 48.1, 2.1);
    assert!((second_a.distance_km - expected).abs() < 1e-9);

    let (_, b_cumulative) = store.distance_for(&VehicleId::new("b")).await.unwrap().unwrap();
    assert_eq!(b_cumulative, 0.0);
}

#[tokio::test]
async fn history_pages_concatenate_to_the_full_result() {
    let store = memory_store().await;
    for i in 0..10 {
        store
            .record_telemetry(&observation(
                "veh-1",
                48.0 + i as f64 * 0.01,
                2.0,
                &format!("2024-01-01T00:0{i}:00Z"),
                10.0,
                80.0,
            ))
            .await
            .unwrap();
    }

    let full = store
        .history(&HistoryQuery { limit: 100, ..Default::default() })
        .await
        .unwrap();
    assert_eq!(full.events.len(), 10);
    assert!(full.next_page_token.is_none());

    let mut paged = Vec::new();
    let mut token = None;
    loop {
        let page = store
            .history(&HistoryQuery { limit: 3, page_token: token, ..Default::default() })
            .await
            .unwrap();
        let final_page = page.next_page_token.is_none();
        paged.extend(page.events);
        if final_page {
            break;
        }
        token = page.next_page_token;
    }

    assert_eq!(paged, full.events);
}

#[tokio::test]
async fn history_filters_by_vehicle_and_range() {
    let store = memory_store().await;
    store
        .record_telemetry(&observation("a", 48.0, 2.0, "2024-01-01T00:00:00Z", 0.0, 80.0))
        .await
        .unwrap();
    store
        .record_telemetry(&observation("b", 10.0, 10.0, "2024-01-01T00:05:00Z", 0.0, 70.0))
        .await
        .unwrap();
    store
        .record_telemetry(&observation("a", 48.1, 2.1, "2024-01-01T01:00:00Z", 10.0, 79.0))
        .await
        .unwrap();

    let page = store
        .history(&HistoryQuery {
            vehicle_ids: vec![VehicleId::new("a")],
            start: Some(ts("2024-01-01T00:00:00Z")),
            end: Some(ts("2024-01-01T00:30:00Z")),
            limit: 100,
            page_token: None,
        })
        .await
        .unwrap();

    assert_eq!(page.events.len(), 1);
    assert_eq!(page.events[0].vehicle_id.as_str(), "a");
    assert_eq!(page.events[0].recorded_at, ts("2024-01-01T00:00:00Z"));
}

#[tokio::test]
async fn rollup_recomputation_is_idempotent() {
    let store = memory_store().await;
    // Three events across ten minutes, all in the past.
    store
        .record_telemetry(&observation("veh-1", 48.85, 2.35, "2024-01-01T00:00:30Z", 0.0, 90.0))
        .await
        .unwrap();
    store
        .record_telemetry(&observation("veh-1", 48.86, 2.36, "2024-01-01T00:05:30Z", 17.0, 80.0))
        .await
        .unwrap();
    store
        .record_telemetry(&observation("veh-1", 48.87, 2.37, "2024-01-01T00:10:30Z", 16.0, 70.0))
        .await
        .unwrap();

    let job = RollupJob { window_seconds: 300, catch_up_windows: 1, force: true };
    let now = jiff::Timestamp::now();

    store.run_rollup(job, now).await.unwrap();
    let first = store.all_rollups(300).await.unwrap();

    store.run_rollup(job, now).await.unwrap();
    let second = store.all_rollups(300).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.len(), 3);
}

#[tokio::test]
async fn rollup_metrics_agree_with_direct_aggregation() {
    let store = memory_store().await;
    // Two events in one five-minute bucket.
    let a = store
        .record_telemetry(&observation("veh-1", 48.85, 2.35, "2024-01-01T00:00:10Z", 30.0, 90.0))
        .await
        .unwrap();
    let b = store
        .record_telemetry(&observation("veh-1", 48.86, 2.36, "2024-01-01T00:04:50Z", 50.0, 85.0))
        .await
        .unwrap();

    let job = RollupJob { window_seconds: 300, catch_up_windows: 1, force: true };
    store.run_rollup(job, jiff::Timestamp::now()).await.unwrap();

    let rollups = store.all_rollups(300).await.unwrap();
    assert_eq!(rollups.len(), 1);
    let bucket = &rollups[0];

    assert_eq!(bucket.bucket_start, ts("2024-01-01T00:00:00Z").as_second());
    assert_eq!(bucket.bucket_end, bucket.bucket_start + 300);
    assert_eq!(bucket.sample_count, 2);
    assert_eq!(bucket.avg_speed, 40.0);
    assert_eq!(bucket.max_speed, 50.0);
    assert_eq!(bucket.min_fuel, 85.0);
    let expected_distance = a.distance_km + b.distance_km;
    assert!((bucket.total_distance - expected_distance).abs() < 1e-9);
}

#[tokio::test]
async fn incremental_rollup_reprocesses_the_catch_up_range() {
    let store = memory_store().await;
    store
        .record_telemetry(&observation("veh-1", 48.85, 2.35, "2024-01-01T00:01:00Z", 10.0, 90.0))
        .await
        .unwrap();

    let job = RollupJob { window_seconds: 300, catch_up_windows: 1, force: false };
    store.run_rollup(job, jiff::Timestamp::now()).await.unwrap();
    assert_eq!(store.all_rollups(300).await.unwrap().len(), 1);

    // A late event lands in the already-processed bucket; the next
    // incremental pass picks it up through the catch-up bound.
    store
        .record_telemetry(&observation("veh-1", 48.86, 2.36, "2024-01-01T00:02:00Z", 20.0, 89.0))
        .await
        .unwrap();
    store.run_rollup(job, jiff::Timestamp::now()).await.unwrap();

    let rollups = store.all_rollups(300).await.unwrap();
    assert_eq!(rollups.len(), 1);
    assert_eq!(rollups[0].sample_count, 2);
    assert_eq!(rollups[0].avg_speed, 15.0);
}

#[tokio::test]
async fn aggregates_serve_materialised_windows_directly() {
    let store = TelemetryStore::open(":memory:", vec![60, 300]).await.unwrap();
    store
        .record_telemetry(&observation("veh-1", 48.85, 2.35, "2024-01-01T00:00:10Z", 30.0, 90.0))
        .await
        .unwrap();
    store
        .record_telemetry(&observation("veh-1", 48.86, 2.36, "2024-01-01T00:01:10Z", 50.0, 85.0))
        .await
        .unwrap();

    for window in [60, 300] {
        let job = RollupJob { window_seconds: window, catch_up_windows: 1, force: true };
        store.run_rollup(job, jiff::Timestamp::now()).await.unwrap();
    }

    let (window, buckets) = store
        .aggregates(&AggregateQuery { window_seconds: 60, ..Default::default() })
        .await
        .unwrap();
    assert_eq!(window, 60);
    assert_eq!(buckets.len(), 2);
}

#[tokio::test]
async fn aggregates_recombine_non_native_windows() {
    let store = TelemetryStore::open(":memory:", vec![60]).await.unwrap();
    store
        .record_telemetry(&observation("veh-1", 48.85, 2.35, "2024-01-01T00:00:10Z", 30.0, 90.0))
        .await
        .unwrap();
    store
        .record_telemetry(&observation("veh-1", 48.86, 2.36, "2024-01-01T00:01:10Z", 50.0, 85.0))
        .await
        .unwrap();

    let job = RollupJob { window_seconds: 60, catch_up_windows: 1, force: true };
    store.run_rollup(job, jiff::Timestamp::now()).await.unwrap();

    // 120s is not materialised but divides evenly into 60s rows.
    let (window, buckets) = store
        .aggregates(&AggregateQuery { window_seconds: 120, ..Default::default() })
        .await
        .unwrap();
    assert_eq!(window, 120);
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets[0].sample_count, 2);
    assert_eq!(buckets[0].avg_speed, 40.0);

    // 90s divides into nothing materialised: raised to the base window.
    let (window, buckets) = store
        .aggregates(&AggregateQuery { window_seconds: 90, ..Default::default() })
        .await
        .unwrap();
    assert_eq!(window, 60);
    assert_eq!(buckets.len(), 2);
}
