use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fleetd_core::{validate::validate, EnrichedVehicle};

use crate::cache::VehicleCache;
use crate::fanout::LiveFanout;
use crate::ingest::{topic_matches, BrokerEvent};
use crate::state::HubState;
use crate::store::TelemetryStore;

/// Everything the ingest path touches. The pipeline is the only writer of
/// the cache and the rate window; persistence failures are logged and never
/// stop the fan-out.
#[derive(Clone)]
pub struct IngestContext {
    pub cache: VehicleCache,
    pub state: HubState,
    pub store: TelemetryStore,
    pub fanout: LiveFanout,
    pub topic_filter: String,
}

/// Drive the ingest loop until the broker channel closes or shutdown.
pub async fn run_ingest(
    mut rx: mpsc::Receiver<BrokerEvent>,
    ctx: IngestContext,
    cancel: CancellationToken,
) {
    info!(topic = %ctx.topic_filter, "ingest pipeline started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("ingest pipeline shutting down");
                break;
            }
            event = rx.recv() => match event {
                Some(BrokerEvent::Connected) => {
                    ctx.state.set_broker_connected(true);
                }
                Some(BrokerEvent::Disconnected) => {
                    ctx.state.set_broker_connected(false);
                }
                Some(BrokerEvent::Message { topic, payload }) => {
                    if !topic_matches(&ctx.topic_filter, &topic) {
                        debug!(%topic, "ignoring message outside subscription filter");
                        continue;
                    }
                    ctx.process_message(&payload).await;
                }
                None => {
                    warn!("broker channel closed");
                    ctx.state.set_broker_connected(false);
                    break;
                }
            }
        }
    }
}

impl IngestContext {
    /// One message through the full path: decode, validate, enrich, cache,
    /// persist, fan out. Every message bumps exactly one of the two
    /// counters.
    pub async fn process_message(&self, payload: &[u8]) {
        let value: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "undecodable broker payload");
                self.state.record_invalid_message();
                return;
            }
        };

        let record = match validate(&value) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "rejected telemetry message");
                self.state.record_invalid_message();
                return;
            }
        };

        let now = jiff::Timestamp::now();
        let prev = self.cache.get(&record.vehicle_id);
        let enriched = EnrichedVehicle::derive(prev.as_ref(), &record, now);

        self.cache.insert(enriched.clone());
        self.state.record_valid_message(now.as_millisecond());

        if let Err(e) = self.store.record_telemetry(&enriched).await {
            error!(
                vehicle_id = %enriched.vehicle_id,
                error = %e,
                "failed to persist telemetry event"
            );
        }

        self.fanout.broadcast_update(&enriched);
    }
}
