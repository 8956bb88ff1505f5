use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleetd_core::{EnrichedVehicle, VehicleId};

/// Invoked for every entry removed by the expiry sweep, outside the cache
/// lock. Capacity evictions do not fire it.
pub type RemovalCallback = Arc<dyn Fn(&VehicleId, &EnrichedVehicle) + Send + Sync>;

/// Bounded latest-state map, insertion-ordered by write recency. Writes
/// touch; overflow evicts the least-recently-written entry; entries idle
/// past the ttl are removed by the periodic sweep. Cheap to clone, all
/// clones share one map.
pub struct VehicleCache {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    capacity: usize,
    ttl_ms: u64,
    seq: u64,
    by_id: HashMap<VehicleId, Slot>,
    /// Recency index: ascending sequence = oldest write first.
    order: BTreeMap<u64, VehicleId>,
    on_expire: Option<RemovalCallback>,
}

struct Slot {
    entry: EnrichedVehicle,
    seq: u64,
}

impl VehicleCache {
    pub fn new(capacity: usize, ttl_ms: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                capacity: capacity.max(1),
                ttl_ms,
                seq: 0,
                by_id: HashMap::new(),
                order: BTreeMap::new(),
                on_expire: None,
            })),
        }
    }

    /// Wire the expiry callback after construction; the cache never owns
    /// its consumer.
    pub fn set_expiry_callback(&self, callback: RemovalCallback) {
        self.lock().on_expire = Some(callback);
    }

    pub fn get(&self, id: &VehicleId) -> Option<EnrichedVehicle> {
        self.lock().by_id.get(id).map(|slot| slot.entry.clone())
    }

    /// Insert or refresh the entry for its vehicle id, making it the most
    /// recent. Evicts the least-recently-written entry on overflow.
    pub fn insert(&self, entry: EnrichedVehicle) {
        let evicted = {
            let mut inner = self.lock();
            let id = entry.vehicle_id.clone();

            if let Some(old) = inner.by_id.remove(&id) {
                inner.order.remove(&old.seq);
            }

            inner.seq += 1;
            let seq = inner.seq;
            inner.order.insert(seq, id.clone());
            inner.by_id.insert(id, Slot { entry, seq });

            if inner.by_id.len() > inner.capacity {
                inner.pop_oldest()
            } else {
                None
            }
        };

        if let Some((id, _)) = evicted {
            info!(vehicle_id = %id, "cache capacity reached, evicted oldest vehicle");
        }
    }

    pub fn remove(&self, id: &VehicleId) -> Option<EnrichedVehicle> {
        let mut inner = self.lock();
        let slot = inner.by_id.remove(id)?;
        inner.order.remove(&slot.seq);
        Some(slot.entry)
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().by_id.is_empty()
    }

    pub fn contains(&self, id: &VehicleId) -> bool {
        self.lock().by_id.contains_key(id)
    }

    /// Snapshot of all entries, oldest write first.
    pub fn values(&self) -> Vec<EnrichedVehicle> {
        let inner = self.lock();
        inner
            .order
            .values()
            .filter_map(|id| inner.by_id.get(id).map(|slot| slot.entry.clone()))
            .collect()
    }

    /// Snapshot of (id, entry) pairs, oldest write first.
    pub fn entries(&self) -> Vec<(VehicleId, EnrichedVehicle)> {
        let inner = self.lock();
        inner
            .order
            .values()
            .filter_map(|id| {
                inner
                    .by_id
                    .get(id)
                    .map(|slot| (id.clone(), slot.entry.clone()))
            })
            .collect()
    }

    /// Remove every entry whose `last_seen` is older than `now - ttl` and
    /// invoke the removal callback once per entry. Disabled when ttl is 0.
    pub fn expiry_sweep(&self, now: jiff::Timestamp) {
        let (expired, callback) = {
            let mut inner = self.lock();
            if inner.ttl_ms == 0 {
                return;
            }
            let cutoff = now.as_millisecond() - inner.ttl_ms as i64;

            let stale: Vec<VehicleId> = inner
                .order
                .values()
                .filter(|id| {
                    inner
                        .by_id
                        .get(*id)
                        .is_some_and(|slot| slot.entry.last_seen.as_millisecond() <= cutoff)
                })
                .cloned()
                .collect();

            let mut expired = Vec::with_capacity(stale.len());
            for id in stale {
                if let Some(slot) = inner.by_id.remove(&id) {
                    inner.order.remove(&slot.seq);
                    expired.push((id, slot.entry));
                }
            }
            (expired, inner.on_expire.clone())
        };

        for (id, entry) in &expired {
            debug!(vehicle_id = %id, "vehicle expired from cache");
            if let Some(callback) = &callback {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback(id, entry)
                }));
                if result.is_err() {
                    warn!(vehicle_id = %id, "expiry callback panicked");
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clone for VehicleCache {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl Inner {
    fn pop_oldest(&mut self) -> Option<(VehicleId, EnrichedVehicle)> {
        let (&seq, _) = self.order.iter().next()?;
        let id = self.order.remove(&seq)?;
        let slot = self.by_id.remove(&id)?;
        Some((id, slot.entry))
    }
}

/// Run the expiry sweep on a timer of `clamp(ttl, 1s, 15s)` until
/// cancelled. Returns `None` when ttl is 0 (expiry disabled).
pub fn spawn_sweeper(cache: VehicleCache, cancel: CancellationToken) -> Option<JoinHandle<()>> {
    let ttl_ms = cache.lock().ttl_ms;
    if ttl_ms == 0 {
        return None;
    }

    let period = Duration::from_millis(ttl_ms.clamp(1000, 15_000));
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("cache sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    cache.expiry_sweep(jiff::Timestamp::now());
                }
            }
        }
    }))
}
