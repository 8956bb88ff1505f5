pub mod migrations;
pub mod rollup;

use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use fleetd_core::{geo, EnrichedVehicle, EventId, TelemetryEvent, VehicleId};
use fleetd_core::RollupBucket;

use migrations::{MigrationError, Migrator};
use rollup::{RollupJob, Sample};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] MigrationError),
    #[error("corrupt row: {0}")]
    Decode(String),
}

/// Durable telemetry store: append-only event log, per-vehicle distance
/// cache, and multi-window rollup table, all in one SQLite database.
///
/// All mutation goes through [`TelemetryStore::record_telemetry`]; the
/// rollup job only derives rows from the event log.
#[derive(Clone)]
pub struct TelemetryStore {
    pool: SqlitePool,
    windows: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    /// Empty means all vehicles.
    pub vehicle_ids: Vec<VehicleId>,
    pub start: Option<jiff::Timestamp>,
    pub end: Option<jiff::Timestamp>,
    pub limit: u32,
    /// Resume after this event id.
    pub page_token: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub events: Vec<TelemetryEvent>,
    /// Present when the page was truncated at `limit`.
    pub next_page_token: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct AggregateQuery {
    pub vehicle_ids: Vec<VehicleId>,
    pub start: Option<jiff::Timestamp>,
    pub end: Option<jiff::Timestamp>,
    pub window_seconds: u32,
}

const DEFAULT_HISTORY_LIMIT: u32 = 500;
const MAX_HISTORY_LIMIT: u32 = 5000;

impl TelemetryStore {
    /// Open (or create) the database at `path` and bring the schema up to
    /// date. `windows` are the materialised rollup window sizes, base
    /// window first.
    pub async fn open(path: &str, windows: Vec<u32>) -> Result<Self, StoreError> {
        let pool = if path == ":memory:" {
            // An in-memory database exists per connection; keep exactly one.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect("sqlite::memory:")
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&format!("sqlite:{path}?mode=rwc"))
                .await?
        };

        sqlx::raw_sql(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )
        .execute(&pool)
        .await?;

        Migrator::run_migrations(&pool).await?;

        let mut windows = windows;
        windows.retain(|w| *w > 0);
        if windows.is_empty() {
            windows.push(300);
        }
        Ok(Self { pool, windows })
    }

    pub fn windows(&self) -> &[u32] {
        &self.windows
    }

    /// Record one enriched observation: upsert the vehicle row, append the
    /// event, and update the distance cache, atomically. The event's
    /// distance is the great-circle delta from the vehicle's previous
    /// persisted position; 0 for its first event.
    #[instrument(skip_all, fields(vehicle_id = %vehicle.vehicle_id))]
    pub async fn record_telemetry(
        &self,
        vehicle: &EnrichedVehicle,
    ) -> Result<TelemetryEvent, StoreError> {
        let mut tx = self.pool.begin().await?;

        let prev: Option<(f64, f64)> =
            sqlx::query_as("SELECT last_lat, last_lng FROM vehicles WHERE vehicle_id = ?")
                .bind(vehicle.vehicle_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;

        let distance_km = prev
            .map(|(lat, lng)| geo::haversine_km(lat, lng, vehicle.lat, vehicle.lng))
            .unwrap_or(0.0);

        let recorded_at_ms = vehicle.recorded_at.as_millisecond();
        let ingest_at_ms = vehicle.last_seen.as_millisecond();

        sqlx::query(
            "INSERT INTO vehicles
                (vehicle_id, first_seen_at, last_seen_at, last_lat, last_lng,
                 last_engine_status, last_fuel_level)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(vehicle_id) DO UPDATE SET
                last_seen_at = excluded.last_seen_at,
                last_lat = excluded.last_lat,
                last_lng = excluded.last_lng,
                last_engine_status = excluded.last_engine_status,
                last_fuel_level = excluded.last_fuel_level",
        )
        .bind(vehicle.vehicle_id.as_str())
        .bind(ingest_at_ms)
        .bind(ingest_at_ms)
        .bind(vehicle.lat)
        .bind(vehicle.lng)
        .bind(vehicle.engine_status.as_str())
        .bind(vehicle.fuel_level)
        .execute(&mut *tx)
        .await?;

        let inserted = sqlx::query(
            "INSERT INTO telemetry_events
                (vehicle_id, recorded_at, ingest_at, lat, lng, speed_kmh,
                 fuel_level, engine_status, distance_km)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(vehicle.vehicle_id.as_str())
        .bind(recorded_at_ms)
        .bind(ingest_at_ms)
        .bind(vehicle.lat)
        .bind(vehicle.lng)
        .bind(vehicle.speed_kmh)
        .bind(vehicle.fuel_level)
        .bind(vehicle.engine_status.as_str())
        .bind(distance_km)
        .execute(&mut *tx)
        .await?;
        let event_id = inserted.last_insert_rowid();

        sqlx::query(
            "INSERT INTO telemetry_distance_cache (vehicle_id, last_event_id, cumulative_km)
             VALUES (?, ?, ?)
             ON CONFLICT(vehicle_id) DO UPDATE SET
                last_event_id = excluded.last_event_id,
                cumulative_km = telemetry_distance_cache.cumulative_km
                    + excluded.cumulative_km",
        )
        .bind(vehicle.vehicle_id.as_str())
        .bind(event_id)
        .bind(distance_km)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(TelemetryEvent {
            event_id: EventId(event_id),
            vehicle_id: vehicle.vehicle_id.clone(),
            recorded_at: vehicle.recorded_at,
            ingest_at: vehicle.last_seen,
            lat: vehicle.lat,
            lng: vehicle.lng,
            speed_kmh: vehicle.speed_kmh,
            fuel_level: vehicle.fuel_level,
            engine_status: vehicle.engine_status,
            distance_km,
        })
    }

    /// Ascending page of events, ordered by event id (consistent with
    /// ingest order). The continuation token is the last event's id.
    pub async fn history(&self, query: &HistoryQuery) -> Result<HistoryPage, StoreError> {
        let limit = match query.limit {
            0 => DEFAULT_HISTORY_LIMIT,
            n => n.min(MAX_HISTORY_LIMIT),
        };

        let mut qb = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
            "SELECT event_id, vehicle_id, recorded_at, ingest_at, lat, lng,
                    speed_kmh, fuel_level, engine_status, distance_km
             FROM telemetry_events WHERE 1=1",
        );
        if !query.vehicle_ids.is_empty() {
            qb.push(" AND vehicle_id IN (");
            {
                let mut sep = qb.separated(", ");
                for id in &query.vehicle_ids {
                    sep.push_bind(id.as_str().to_owned());
                }
            }
            qb.push(")");
        }
        if let Some(start) = query.start {
            qb.push(" AND recorded_at >= ").push_bind(start.as_millisecond());
        }
        if let Some(end) = query.end {
            qb.push(" AND recorded_at < ").push_bind(end.as_millisecond());
        }
        if let Some(token) = query.page_token {
            qb.push(" AND event_id > ").push_bind(token);
        }
        qb.push(" ORDER BY event_id ASC LIMIT ").push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let events = rows
            .iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let next_page_token = if events.len() as u32 == limit {
            events.last().map(|e| e.event_id.0)
        } else {
            None
        };

        Ok(HistoryPage { events, next_page_token })
    }

    /// Bucketed metrics over a requested window. Serves a materialised
    /// window directly; otherwise recombines the smallest materialised
    /// window that divides the request; otherwise raises the request to
    /// the base window. Returns the window actually served.
    pub async fn aggregates(
        &self,
        query: &AggregateQuery,
    ) -> Result<(u32, Vec<RollupBucket>), StoreError> {
        let base = self.windows[0];
        let requested = if query.window_seconds == 0 { base } else { query.window_seconds };

        if self.windows.contains(&requested) {
            let buckets = self.fetch_rollups(requested, query).await?;
            return Ok((requested, buckets));
        }

        let source = self
            .windows
            .iter()
            .copied()
            .filter(|w| requested % w == 0)
            .min();

        match source {
            Some(source) => {
                let fine = self.fetch_rollups(source, query).await?;
                Ok((requested, rollup::recombine(&fine, requested)))
            }
            None => {
                let buckets = self.fetch_rollups(base, query).await?;
                Ok((base, buckets))
            }
        }
    }

    async fn fetch_rollups(
        &self,
        window_seconds: u32,
        query: &AggregateQuery,
    ) -> Result<Vec<RollupBucket>, StoreError> {
        let mut qb = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
            "SELECT bucket_start, bucket_end, vehicle_id, avg_speed, max_speed,
                    min_fuel, total_distance, sample_count
             FROM telemetry_rollups WHERE bucket_end - bucket_start = ",
        );
        qb.push_bind(window_seconds as i64);
        if !query.vehicle_ids.is_empty() {
            qb.push(" AND vehicle_id IN (");
            {
                let mut sep = qb.separated(", ");
                for id in &query.vehicle_ids {
                    sep.push_bind(id.as_str().to_owned());
                }
            }
            qb.push(")");
        }
        if let Some(start) = query.start {
            qb.push(" AND bucket_end > ").push_bind(start.as_millisecond().div_euclid(1000));
        }
        if let Some(end) = query.end {
            qb.push(" AND bucket_start < ").push_bind(end.as_millisecond().div_euclid(1000));
        }
        qb.push(" ORDER BY bucket_start ASC, vehicle_id ASC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(bucket_from_row).collect()
    }

    /// One incremental rollup pass for a single window size. Recomputes
    /// from `lastProcessedEnd - catchUp * S` (or the oldest event when
    /// forced or starting fresh) up to the last complete bucket; upserts
    /// are keyed so re-running a range yields identical rows.
    pub async fn run_rollup(
        &self,
        job: RollupJob,
        now: jiff::Timestamp,
    ) -> Result<usize, StoreError> {
        let window = job.window_seconds as i64;
        let aligned_end = rollup::bucket_start(
            now.as_millisecond().div_euclid(1000),
            job.window_seconds,
        );

        let oldest_ms: Option<i64> =
            sqlx::query_scalar("SELECT MIN(recorded_at) FROM telemetry_events")
                .fetch_one(&self.pool)
                .await?;
        let Some(oldest_ms) = oldest_ms else {
            return Ok(0);
        };
        let oldest_aligned = rollup::bucket_start(oldest_ms.div_euclid(1000), job.window_seconds);

        let last_end: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(bucket_end) FROM telemetry_rollups WHERE bucket_end - bucket_start = ?",
        )
        .bind(window)
        .fetch_one(&self.pool)
        .await?;

        let start = if job.force {
            oldest_aligned
        } else {
            match last_end {
                None => oldest_aligned,
                Some(end) => {
                    let lower = end - job.catch_up_windows as i64 * window;
                    rollup::bucket_start(lower, job.window_seconds).max(oldest_aligned)
                }
            }
        };

        if start >= aligned_end {
            return Ok(0);
        }

        let rows: Vec<(String, i64, f64, f64, f64)> = sqlx::query_as(
            "SELECT vehicle_id, recorded_at, speed_kmh, fuel_level, distance_km
             FROM telemetry_events
             WHERE recorded_at >= ? AND recorded_at < ?
             ORDER BY event_id ASC",
        )
        .bind(start * 1000)
        .bind(aligned_end * 1000)
        .fetch_all(&self.pool)
        .await?;

        let samples: Vec<(VehicleId, Sample)> = rows
            .into_iter()
            .map(|(vehicle_id, recorded_at_ms, speed_kmh, fuel_level, distance_km)| {
                (
                    VehicleId::new(vehicle_id),
                    Sample { recorded_at_ms, speed_kmh, fuel_level, distance_km },
                )
            })
            .collect();

        let buckets = rollup::aggregate(&samples, job.window_seconds);

        let mut tx = self.pool.begin().await?;
        for bucket in &buckets {
            sqlx::query(
                "INSERT INTO telemetry_rollups
                    (bucket_start, bucket_end, vehicle_id, avg_speed, max_speed,
                     min_fuel, total_distance, sample_count)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(bucket_start, bucket_end, vehicle_id) DO UPDATE SET
                    avg_speed = excluded.avg_speed,
                    max_speed = excluded.max_speed,
                    min_fuel = excluded.min_fuel,
                    total_distance = excluded.total_distance,
                    sample_count = excluded.sample_count",
            )
            .bind(bucket.bucket_start)
            .bind(bucket.bucket_end)
            .bind(bucket.vehicle_id.as_str())
            .bind(bucket.avg_speed)
            .bind(bucket.max_speed)
            .bind(bucket.min_fuel)
            .bind(bucket.total_distance)
            .bind(bucket.sample_count)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(buckets.len())
    }

    pub async fn event_count(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM telemetry_events")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn vehicle_count(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM vehicles")
            .fetch_one(&self.pool)
            .await?)
    }

    /// (last event id, cumulative km) for a vehicle, if it has any events.
    pub async fn distance_for(
        &self,
        vehicle_id: &VehicleId,
    ) -> Result<Option<(i64, f64)>, StoreError> {
        Ok(sqlx::query_as(
            "SELECT last_event_id, cumulative_km FROM telemetry_distance_cache
             WHERE vehicle_id = ?",
        )
        .bind(vehicle_id.as_str())
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Stored rollup rows for one window size, every vehicle, full range.
    pub async fn all_rollups(&self, window_seconds: u32) -> Result<Vec<RollupBucket>, StoreError> {
        self.fetch_rollups(window_seconds, &AggregateQuery::default())
            .await
    }

    /// Applied migration versions, in order.
    pub async fn schema_versions(&self) -> Result<Vec<String>, StoreError> {
        Ok(Migrator::applied_versions(&self.pool).await?)
    }

    /// Flush and close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn event_from_row(row: &SqliteRow) -> Result<TelemetryEvent, StoreError> {
    let engine_status: String = row.try_get("engine_status")?;
    let engine_status = engine_status
        .parse()
        .map_err(|e| StoreError::Decode(format!("engine_status: {e}")))?;

    let recorded_at_ms: i64 = row.try_get("recorded_at")?;
    let ingest_at_ms: i64 = row.try_get("ingest_at")?;

    Ok(TelemetryEvent {
        event_id: EventId(row.try_get("event_id")?),
        vehicle_id: VehicleId::new(row.try_get::<String, _>("vehicle_id")?),
        recorded_at: timestamp_from_ms(recorded_at_ms)?,
        ingest_at: timestamp_from_ms(ingest_at_ms)?,
        lat: row.try_get("lat")?,
        lng: row.try_get("lng")?,
        speed_kmh: row.try_get("speed_kmh")?,
        fuel_level: row.try_get("fuel_level")?,
        engine_status,
        distance_km: row.try_get("distance_km")?,
    })
}

fn bucket_from_row(row: &SqliteRow) -> Result<RollupBucket, StoreError> {
    Ok(RollupBucket {
        bucket_start: row.try_get("bucket_start")?,
        bucket_end: row.try_get("bucket_end")?,
        vehicle_id: VehicleId::new(row.try_get::<String, _>("vehicle_id")?),
        avg_speed: row.try_get("avg_speed")?,
        max_speed: row.try_get("max_speed")?,
        min_fuel: row.try_get("min_fuel")?,
        total_distance: row.try_get("total_distance")?,
        sample_count: row.try_get("sample_count")?,
    })
}

fn timestamp_from_ms(ms: i64) -> Result<jiff::Timestamp, StoreError> {
    jiff::Timestamp::from_millisecond(ms)
        .map_err(|e| StoreError::Decode(format!("timestamp {ms}: {e}")))
}
