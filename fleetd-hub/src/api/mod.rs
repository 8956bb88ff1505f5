pub mod error;
pub mod handlers;
pub mod params;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;

use crate::cache::VehicleCache;
use crate::fanout::LiveFanout;
use crate::state::HubState;
use crate::store::TelemetryStore;
use crate::ws;

/// Read-only dependencies of the HTTP surface.
#[derive(Clone)]
pub struct ApiState {
    pub cache: VehicleCache,
    pub hub: HubState,
    pub store: TelemetryStore,
    pub fanout: LiveFanout,
}

/// The full HTTP surface: health, readiness, stats, query endpoints, and
/// the live WebSocket path. Non-GET methods get 405 from the method
/// routers; CORS is permissive.
pub fn router(state: ApiState, ws_path: &str) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/stats", get(handlers::stats))
        .route("/telemetry/summary", get(handlers::telemetry_summary))
        .route("/telemetry/history", get(handlers::telemetry_history))
        .route(ws_path, get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
