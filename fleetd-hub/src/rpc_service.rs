use std::collections::HashMap;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::debug;

use fleetd_core::{EnrichedVehicle, VehicleId};
use fleetd_rpc::{
    AggregateParams, AggregateRow, AggregatesPage, ErrorBody, FleetSnapshot, HistoryParams,
    LiveParams, Server, SnapshotParams, StreamMeta, StreamSink,
};

use crate::api::ApiState;
use crate::config::RpcConfig;
use crate::store::{AggregateQuery, HistoryQuery};

/// Wire the four query operations onto a fleetd-rpc server.
pub fn build_server(listener: TcpListener, state: ApiState, config: &RpcConfig) -> Server {
    let stream_interval = Duration::from_millis(config.stream_interval_ms.max(100));
    let stream_heartbeat = Duration::from_millis(config.stream_heartbeat_ms.max(1000));

    let snapshot_state = state.clone();
    let aggregates_state = state.clone();
    let history_state = state.clone();
    let live_state = state;

    Server::new(listener)
        .with_keepalive(
            Duration::from_millis(config.keepalive_time_ms.max(1000)),
            Duration::from_millis(config.keepalive_timeout_ms.max(500)),
        )
        .on_snapshot(move |params: SnapshotParams| {
            let state = snapshot_state.clone();
            async move {
                let vehicles = filter_vehicles(state.cache.values(), &params.vehicle_ids);
                let metrics = params.include_metrics.then(|| state.metrics());
                Ok(FleetSnapshot { vehicles, metrics })
            }
        })
        .on_aggregates(move |params: AggregateParams| {
            let state = aggregates_state.clone();
            async move {
                check_range(params.start, params.end)?;
                let query = AggregateQuery {
                    vehicle_ids: params.vehicle_ids,
                    start: params.start,
                    end: params.end,
                    window_seconds: params.window_seconds,
                };
                let (window_seconds, buckets) = state
                    .store
                    .aggregates(&query)
                    .await
                    .map_err(|e| ErrorBody::internal(e.to_string()))?;
                let buckets = buckets
                    .iter()
                    .map(|bucket| AggregateRow::project(bucket, &params.aggregates))
                    .collect();
                Ok(AggregatesPage { window_seconds, buckets })
            }
        })
        .on_history(move |params: HistoryParams, sink: StreamSink| {
            let state = history_state.clone();
            async move { serve_history(state, params, sink).await }
        })
        .on_live(move |params: LiveParams, sink: StreamSink| {
            let state = live_state.clone();
            async move { serve_live(state, params, sink, stream_interval, stream_heartbeat).await }
        })
}

fn check_range(
    start: Option<jiff::Timestamp>,
    end: Option<jiff::Timestamp>,
) -> Result<(), ErrorBody> {
    if let (Some(start), Some(end)) = (start, end) {
        if start >= end {
            return Err(ErrorBody::invalid_argument("start must be earlier than end"));
        }
    }
    Ok(())
}

/// One history page as a server stream: metadata first (with the
/// continuation token when truncated), then events in ascending order.
async fn serve_history(state: ApiState, params: HistoryParams, sink: StreamSink) {
    let _guard = state.hub.enter_stream();

    if let Err(body) = check_range(params.start, params.end) {
        let _ = sink.error(body).await;
        return;
    }

    let query = HistoryQuery {
        vehicle_ids: params.vehicle_ids,
        start: params.start,
        end: params.end,
        limit: params.limit,
        page_token: params.page_token,
    };

    let page = match state.store.history(&query).await {
        Ok(page) => page,
        Err(e) => {
            let _ = sink.error(ErrorBody::internal(e.to_string())).await;
            return;
        }
    };

    let meta = StreamMeta {
        active_stream_count: state.hub.active_streams(),
        next_page_token: page.next_page_token,
    };
    if sink.meta(meta).await.is_err() {
        return;
    }

    for event in page.events {
        if sink.cancelled().is_cancelled() {
            debug!("history stream cancelled mid-page");
            return;
        }
        if sink.history_event(event).await.is_err() {
            return;
        }
    }

    let _ = sink.end().await;
}

/// Live snapshot stream: the current fleet once, then changed-or-new
/// entries on every poll tick, detected by a change of `last_seen`. A
/// silent stream emits a metadata heartbeat.
async fn serve_live(
    state: ApiState,
    params: LiveParams,
    sink: StreamSink,
    interval: Duration,
    heartbeat: Duration,
) {
    let _guard = state.hub.enter_stream();

    let meta = StreamMeta {
        active_stream_count: state.hub.active_streams(),
        next_page_token: None,
    };
    if sink.meta(meta).await.is_err() {
        return;
    }

    let mut last_sent: HashMap<VehicleId, jiff::Timestamp> = HashMap::new();

    for vehicle in filter_vehicles(state.cache.values(), &params.vehicle_ids) {
        last_sent.insert(vehicle.vehicle_id.clone(), vehicle.last_seen);
        if sink.live_update(vehicle).await.is_err() {
            return;
        }
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_activity = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = sink.cancelled().cancelled() => {
                debug!("live stream cancelled");
                break;
            }
            _ = ticker.tick() => {
                let changed: Vec<EnrichedVehicle> =
                    filter_vehicles(state.cache.values(), &params.vehicle_ids)
                        .into_iter()
                        .filter(|v| last_sent.get(&v.vehicle_id) != Some(&v.last_seen))
                        .collect();

                for vehicle in changed {
                    last_sent.insert(vehicle.vehicle_id.clone(), vehicle.last_seen);
                    if sink.live_update(vehicle).await.is_err() {
                        return;
                    }
                    last_activity = tokio::time::Instant::now();
                }

                if last_activity.elapsed() >= heartbeat {
                    let meta = StreamMeta {
                        active_stream_count: state.hub.active_streams(),
                        next_page_token: None,
                    };
                    if sink.meta(meta).await.is_err() {
                        return;
                    }
                    last_activity = tokio::time::Instant::now();
                }
            }
        }
    }
}

fn filter_vehicles(all: Vec<EnrichedVehicle>, ids: &[VehicleId]) -> Vec<EnrichedVehicle> {
    if ids.is_empty() {
        return all;
    }
    all.into_iter()
        .filter(|v| ids.contains(&v.vehicle_id))
        .collect()
}
