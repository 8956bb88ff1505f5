//! Rollup bucket math and the periodic rollup scheduler.

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use fleetd_core::{RollupBucket, VehicleId};

use super::TelemetryStore;

/// Epoch-aligned start of the bucket containing `epoch_sec`.
pub fn bucket_start(epoch_sec: i64, window_seconds: u32) -> i64 {
    let window = window_seconds as i64;
    epoch_sec.div_euclid(window) * window
}

/// One event's contribution to a rollup bucket.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub recorded_at_ms: i64,
    pub speed_kmh: f64,
    pub fuel_level: f64,
    pub distance_km: f64,
}

#[derive(Debug, Default)]
struct Accumulator {
    speed_sum: f64,
    max_speed: f64,
    min_fuel: f64,
    total_distance: f64,
    count: i64,
}

impl Accumulator {
    fn fold(&mut self, sample: &Sample) {
        if self.count == 0 {
            self.max_speed = sample.speed_kmh;
            self.min_fuel = sample.fuel_level;
        } else {
            self.max_speed = self.max_speed.max(sample.speed_kmh);
            self.min_fuel = self.min_fuel.min(sample.fuel_level);
        }
        self.speed_sum += sample.speed_kmh;
        self.total_distance += sample.distance_km;
        self.count += 1;
    }
}

/// Deterministically aggregate samples into buckets of `window_seconds`,
/// keyed by (bucket_start, vehicle_id). Output order is stable.
pub fn aggregate(
    samples: &[(VehicleId, Sample)],
    window_seconds: u32,
) -> Vec<RollupBucket> {
    let mut acc: HashMap<(i64, VehicleId), Accumulator> = HashMap::new();

    for (vehicle_id, sample) in samples {
        let start = bucket_start(sample.recorded_at_ms.div_euclid(1000), window_seconds);
        acc.entry((start, vehicle_id.clone()))
            .or_default()
            .fold(sample);
    }

    let mut buckets: Vec<RollupBucket> = acc
        .into_iter()
        .map(|((start, vehicle_id), a)| RollupBucket {
            bucket_start: start,
            bucket_end: start + window_seconds as i64,
            vehicle_id,
            avg_speed: a.speed_sum / a.count as f64,
            max_speed: a.max_speed,
            min_fuel: a.min_fuel,
            total_distance: a.total_distance,
            sample_count: a.count,
        })
        .collect();

    buckets.sort_by(|a, b| {
        (a.bucket_start, &a.vehicle_id).cmp(&(b.bucket_start, &b.vehicle_id))
    });
    buckets
}

/// Recombine buckets of a finer materialised window into `target_seconds`
/// groups: averages weighted by sample count, straight min/max/sum.
pub fn recombine(buckets: &[RollupBucket], target_seconds: u32) -> Vec<RollupBucket> {
    let mut acc: HashMap<(i64, VehicleId), Accumulator> = HashMap::new();

    for bucket in buckets {
        let start = bucket_start(bucket.bucket_start, target_seconds);
        let entry = acc.entry((start, bucket.vehicle_id.clone())).or_default();
        if entry.count == 0 {
            entry.max_speed = bucket.max_speed;
            entry.min_fuel = bucket.min_fuel;
        } else {
            entry.max_speed = entry.max_speed.max(bucket.max_speed);
            entry.min_fuel = entry.min_fuel.min(bucket.min_fuel);
        }
        entry.speed_sum += bucket.avg_speed * bucket.sample_count as f64;
        entry.total_distance += bucket.total_distance;
        entry.count += bucket.sample_count;
    }

    let mut out: Vec<RollupBucket> = acc
        .into_iter()
        .map(|((start, vehicle_id), a)| RollupBucket {
            bucket_start: start,
            bucket_end: start + target_seconds as i64,
            vehicle_id,
            avg_speed: a.speed_sum / a.count as f64,
            max_speed: a.max_speed,
            min_fuel: a.min_fuel,
            total_distance: a.total_distance,
            sample_count: a.count,
        })
        .collect();

    out.sort_by(|a, b| (a.bucket_start, &a.vehicle_id).cmp(&(b.bucket_start, &b.vehicle_id)));
    out
}

/// Options for one rollup pass.
#[derive(Debug, Clone, Copy)]
pub struct RollupJob {
    pub window_seconds: u32,
    /// Windows re-processed behind the last processed end on every pass.
    pub catch_up_windows: u32,
    /// Recompute from the oldest event, ignoring the catch-up bound.
    pub force: bool,
}

/// Periodically run rollups for every configured window until cancelled.
/// A failing pass is logged and retried on the next tick; it never
/// propagates.
pub fn spawn_scheduler(
    store: TelemetryStore,
    windows: Vec<u32>,
    catch_up_windows: u32,
    interval_ms: u64,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1000)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        info!(?windows, interval_ms, "rollup scheduler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("rollup scheduler stopped");
                    break;
                }
                _ = ticker.tick() => {
                    for &window_seconds in &windows {
                        let job = RollupJob {
                            window_seconds,
                            catch_up_windows,
                            force: false,
                        };
                        match store.run_rollup(job, jiff::Timestamp::now()).await {
                            Ok(rows) if rows > 0 => {
                                debug!(window_seconds, rows, "rollup pass complete");
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!(window_seconds, error = %e, "rollup pass failed");
                            }
                        }
                    }
                }
            }
        }
    })
}
