use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use ulid::Ulid;

use fleetd_core::{EnrichedVehicle, VehicleId};

/// Default per-subscriber outbound buffer threshold: 512 KiB.
pub const DEFAULT_BUFFER_THRESHOLD: usize = 512 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub Ulid);

/// Read-only view of the cache, injected so the fan-out never owns it.
pub type SnapshotFn = Box<dyn Fn() -> Vec<EnrichedVehicle> + Send + Sync>;

/// Wire frames pushed to live subscribers. Numeric fields serialise as
/// numbers when finite, null otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StreamMessage {
    VehicleUpdate {
        version: u32,
        vehicle_id: String,
        position: Position,
        telemetry: TelemetryBody,
        filters: Filters,
        last_seen: String,
    },
    VehicleRemove { version: u32, vehicle_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryBody {
    pub timestamp: String,
    pub speed: Option<f64>,
    pub fuel_level: Option<f64>,
    pub engine_status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filters {
    pub engine_status: String,
    pub fuel_level: Option<f64>,
}

fn finite(n: f64) -> Option<f64> {
    n.is_finite().then_some(n)
}

impl StreamMessage {
    pub fn update(version: u32, vehicle: &EnrichedVehicle) -> Self {
        StreamMessage::VehicleUpdate {
            version,
            vehicle_id: vehicle.vehicle_id.to_string(),
            position: Position { lat: finite(vehicle.lat), lng: finite(vehicle.lng) },
            telemetry: TelemetryBody {
                timestamp: vehicle.recorded_at.to_string(),
                speed: finite(vehicle.speed_kmh),
                fuel_level: finite(vehicle.fuel_level),
                engine_status: vehicle.engine_status.to_string(),
            },
            filters: Filters {
                engine_status: vehicle.engine_status.to_string(),
                fuel_level: finite(vehicle.fuel_level),
            },
            last_seen: vehicle.last_seen.to_string(),
        }
    }

    pub fn remove(version: u32, vehicle_id: &VehicleId) -> Self {
        StreamMessage::VehicleRemove { version, vehicle_id: vehicle_id.to_string() }
    }
}

struct Subscriber {
    tx: mpsc::UnboundedSender<String>,
    queued_bytes: Arc<AtomicUsize>,
    open: Arc<AtomicBool>,
}

/// A live connection as seen by its transport task: drain `rx`, subtract
/// each frame's length from `queued_bytes` once written, and stop when
/// `open` clears.
pub struct Subscription {
    pub id: SubscriberId,
    pub rx: mpsc::UnboundedReceiver<String>,
    pub queued_bytes: Arc<AtomicUsize>,
    pub open: Arc<AtomicBool>,
}

/// Push channel to all live subscribers. On attach, a subscriber receives
/// one snapshot frame per cached vehicle before any subsequent broadcast;
/// a subscriber whose outbound buffer exceeds the threshold is dropped.
pub struct LiveFanout {
    inner: Arc<Inner>,
}

struct Inner {
    subscribers: Mutex<HashMap<SubscriberId, Subscriber>>,
    snapshot: Mutex<Option<SnapshotFn>>,
    threshold_bytes: usize,
    payload_version: u32,
}

impl LiveFanout {
    pub fn new(payload_version: u32, threshold_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(HashMap::new()),
                snapshot: Mutex::new(None),
                threshold_bytes,
                payload_version,
            }),
        }
    }

    /// Wire the cache snapshot source after both components exist.
    pub fn set_snapshot_source(&self, snapshot: SnapshotFn) {
        *self.lock_snapshot() = Some(snapshot);
    }

    /// Attach a new subscriber: its queue is pre-loaded with one update
    /// frame per cached vehicle, in cache iteration order, before it joins
    /// the broadcast set.
    pub fn subscribe(&self) -> Subscription {
        let id = SubscriberId(Ulid::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let queued_bytes = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicBool::new(true));

        let subscriber = Subscriber {
            tx,
            queued_bytes: queued_bytes.clone(),
            open: open.clone(),
        };

        // Held across the snapshot so no broadcast can interleave between
        // the snapshot frames and attachment.
        let mut subscribers = self.lock_subscribers();

        let vehicles = {
            let snapshot = self.lock_snapshot();
            snapshot.as_ref().map(|f| f()).unwrap_or_default()
        };
        for vehicle in &vehicles {
            let frame = encode(&StreamMessage::update(self.inner.payload_version, vehicle));
            subscriber.queued_bytes.fetch_add(frame.len(), Ordering::Relaxed);
            let _ = subscriber.tx.send(frame);
        }

        subscribers.insert(id, subscriber);
        debug!(subscriber_id = ?id.0, vehicles = vehicles.len(), "subscriber attached");

        Subscription { id, rx, queued_bytes, open }
    }

    pub fn broadcast_update(&self, vehicle: &EnrichedVehicle) {
        let frame = encode(&StreamMessage::update(self.inner.payload_version, vehicle));
        self.broadcast_frame(frame);
    }

    pub fn broadcast_remove(&self, vehicle_id: &VehicleId) {
        let frame = encode(&StreamMessage::remove(self.inner.payload_version, vehicle_id));
        self.broadcast_frame(frame);
    }

    fn broadcast_frame(&self, frame: String) {
        let mut subscribers = self.lock_subscribers();
        let mut dropped: Vec<SubscriberId> = Vec::new();

        for (id, subscriber) in subscribers.iter() {
            if !subscriber.open.load(Ordering::Relaxed) {
                dropped.push(*id);
                continue;
            }

            if subscriber.queued_bytes.load(Ordering::Relaxed) > self.inner.threshold_bytes {
                warn!(
                    subscriber_id = ?id.0,
                    threshold = self.inner.threshold_bytes,
                    "subscriber over buffer threshold, dropping"
                );
                subscriber.open.store(false, Ordering::Relaxed);
                dropped.push(*id);
                continue;
            }

            subscriber.queued_bytes.fetch_add(frame.len(), Ordering::Relaxed);
            if subscriber.tx.send(frame.clone()).is_err() {
                warn!(subscriber_id = ?id.0, "send to subscriber failed, dropping");
                subscriber.open.store(false, Ordering::Relaxed);
                dropped.push(*id);
            }
        }

        for id in dropped {
            subscribers.remove(&id);
        }
    }

    /// Detach a subscriber whose transport has gone away.
    pub fn detach(&self, id: SubscriberId) {
        if let Some(subscriber) = self.lock_subscribers().remove(&id) {
            subscriber.open.store(false, Ordering::Relaxed);
            debug!(subscriber_id = ?id.0, "subscriber detached");
        }
    }

    pub fn connected_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    /// Close every subscriber; part of shutdown.
    pub fn close_all(&self) {
        let mut subscribers = self.lock_subscribers();
        for subscriber in subscribers.values() {
            subscriber.open.store(false, Ordering::Relaxed);
        }
        subscribers.clear();
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriberId, Subscriber>> {
        self.inner.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_snapshot(&self) -> std::sync::MutexGuard<'_, Option<SnapshotFn>> {
        self.inner.snapshot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clone for LiveFanout {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

fn encode(message: &StreamMessage) -> String {
    serde_json::to_string(message).unwrap_or_else(|e| {
        warn!(error = %e, "failed to encode stream message");
        String::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetd_core::EngineStatus;

    fn vehicle(id: &str) -> EnrichedVehicle {
        let now = jiff::Timestamp::now();
        EnrichedVehicle {
            vehicle_id: VehicleId::new(id),
            lat: 48.8566,
            lng: 2.3522,
            recorded_at: now,
            fuel_level: 82.5,
            engine_status: EngineStatus::Running,
            speed_kmh: 0.0,
            last_seen: now,
        }
    }

    fn decode(frame: &str) -> StreamMessage {
        serde_json::from_str(frame).unwrap()
    }

    #[test]
    fn subscriber_receives_the_snapshot_before_updates() {
        let fanout = LiveFanout::new(1, DEFAULT_BUFFER_THRESHOLD);
        let snapshot = vec![vehicle("veh-1")];
        fanout.set_snapshot_source(Box::new(move || snapshot.clone()));

        let mut subscription = fanout.subscribe();
        fanout.broadcast_update(&vehicle("veh-2"));

        let first = decode(&subscription.rx.try_recv().unwrap());
        match first {
            StreamMessage::VehicleUpdate { vehicle_id, version, position, .. } => {
                assert_eq!(vehicle_id, "veh-1");
                assert_eq!(version, 1);
                assert_eq!(position.lat, Some(48.8566));
            }
            other => panic!("unexpected first frame: {other:?}"),
        }

        let second = decode(&subscription.rx.try_recv().unwrap());
        assert!(matches!(
            second,
            StreamMessage::VehicleUpdate { vehicle_id, .. } if vehicle_id == "veh-2"
        ));
    }

    #[test]
    fn remove_frames_carry_only_id_and_version() {
        let fanout = LiveFanout::new(1, DEFAULT_BUFFER_THRESHOLD);
        let mut subscription = fanout.subscribe();
        fanout.broadcast_remove(&VehicleId::new("veh-9"));

        let frame = subscription.rx.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "vehicle_remove");
        assert_eq!(value["vehicleId"], "veh-9");
        assert_eq!(value["version"], 1);
    }

    #[test]
    fn over_threshold_subscriber_is_dropped_within_one_broadcast() {
        let fanout = LiveFanout::new(1, 64);
        let subscription = fanout.subscribe();
        assert_eq!(fanout.connected_count(), 1);

        // Nothing drains the queue, so bytes pile past the threshold.
        fanout.broadcast_update(&vehicle("veh-1"));
        assert_eq!(fanout.connected_count(), 1);

        fanout.broadcast_update(&vehicle("veh-1"));
        assert_eq!(fanout.connected_count(), 0);
        assert!(!subscription.open.load(Ordering::Relaxed));

        // The dropped subscriber saw only the first frame.
        drop(fanout);
        let mut rx = subscription.rx;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_transport_is_skipped_and_removed() {
        let fanout = LiveFanout::new(1, DEFAULT_BUFFER_THRESHOLD);
        let subscription = fanout.subscribe();
        subscription.open.store(false, Ordering::Relaxed);

        fanout.broadcast_update(&vehicle("veh-1"));
        assert_eq!(fanout.connected_count(), 0);
    }

    #[test]
    fn non_finite_numbers_serialise_as_null() {
        let mut v = vehicle("veh-1");
        v.speed_kmh = f64::NAN;
        let frame = encode(&StreamMessage::update(1, &v));
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert!(value["telemetry"]["speed"].is_null());
        assert_eq!(value["telemetry"]["fuelLevel"], 82.5);
    }
}
