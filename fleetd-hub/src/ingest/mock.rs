use std::convert::Infallible;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{BrokerEvent, BrokerReceiver};
use fleetd_core::geo;

/// Synthetic broker source for development and tests: a handful of
/// vehicles random-walking around a depot, publishing on
/// `fleet/<id>/telemetry` at a fixed interval.
pub struct MockBrokerReceiver {
    vehicle_count: usize,
    interval: Duration,
}

struct MockVehicle {
    id: String,
    lat: f64,
    lng: f64,
    heading: f64,
    fuel: f64,
    speed_kmh: f64,
}

// Lyon, roughly.
const DEPOT_LAT: f64 = 45.7640;
const DEPOT_LNG: f64 = 4.8357;

impl MockBrokerReceiver {
    pub fn new(vehicle_count: usize, interval_ms: u64) -> Self {
        Self {
            vehicle_count: vehicle_count.max(1),
            interval: Duration::from_millis(interval_ms.max(100)),
        }
    }
}

#[async_trait]
impl BrokerReceiver for MockBrokerReceiver {
    type Error = Infallible;

    async fn start(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<BrokerEvent>, Self::Error> {
        let (tx, rx) = mpsc::channel(256);
        let interval = self.interval;

        let mut vehicles: Vec<MockVehicle> = {
            let mut rng = rand::rng();
            (0..self.vehicle_count)
                .map(|i| MockVehicle {
                    id: format!("veh-{:03}", i + 1),
                    lat: DEPOT_LAT + rng.random_range(-0.05..0.05),
                    lng: DEPOT_LNG + rng.random_range(-0.05..0.05),
                    heading: rng.random_range(0.0..360.0),
                    fuel: rng.random_range(40.0..100.0),
                    speed_kmh: rng.random_range(20.0..80.0),
                })
                .collect()
        };

        tokio::spawn(async move {
            info!(vehicles = vehicles.len(), "mock broker receiver started");
            if tx.send(BrokerEvent::Connected).await.is_err() {
                return;
            }

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("mock broker receiver stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let events: Vec<BrokerEvent> = {
                            let mut rng = rand::rng();
                            vehicles.iter_mut().map(|v| v.advance(&mut rng, interval)).collect()
                        };
                        for event in events {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

impl MockVehicle {
    fn advance(&mut self, rng: &mut impl Rng, elapsed: Duration) -> BrokerEvent {
        self.heading = (self.heading + rng.random_range(-25.0..25.0)).rem_euclid(360.0);
        self.speed_kmh = (self.speed_kmh + rng.random_range(-8.0..8.0)).clamp(0.0, 110.0);
        self.fuel = (self.fuel - rng.random_range(0.0..0.4)).max(0.0);

        let km = self.speed_kmh * elapsed.as_secs_f64() / 3600.0;
        let (lat, lng) = geo::translate(self.lat, self.lng, self.heading, km);
        self.lat = lat;
        self.lng = lng;

        let engine_status = if self.speed_kmh < 1.0 {
            if rng.random_bool(0.2) { "off" } else { "idle" }
        } else {
            "running"
        };

        let payload = serde_json::json!({
            "vehicleId": self.id,
            "lat": self.lat,
            "lng": self.lng,
            "timestamp": jiff::Timestamp::now().to_string(),
            "fuelLevel": self.fuel,
            "engineStatus": engine_status,
        });

        BrokerEvent::Message {
            topic: format!("fleet/{}/telemetry", self.id),
            payload: payload.to_string().into_bytes(),
        }
    }
}
