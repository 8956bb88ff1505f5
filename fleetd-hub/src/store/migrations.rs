use sqlx::{Row, SqlitePool};

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),
}

struct Migration {
    /// Lexically ordered version tag, also the primary key of
    /// `schema_migrations`.
    version: &'static str,
    sql: &'static str,
}

pub struct Migrator;

impl Migrator {
    /// Apply every pending migration, each inside its own transaction, in
    /// lexical version order.
    pub async fn run_migrations(pool: &SqlitePool) -> Result<(), MigrationError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        let applied: Vec<String> = sqlx::query("SELECT version FROM schema_migrations")
            .fetch_all(pool)
            .await?
            .into_iter()
            .filter_map(|row| row.try_get("version").ok())
            .collect();

        for migration in MIGRATIONS {
            if applied.iter().any(|v| v == migration.version) {
                continue;
            }

            let mut tx = pool.begin().await?;
            sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
                .bind(migration.version)
                .bind(jiff::Timestamp::now().to_string())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            tracing::info!(version = migration.version, "applied migration");
        }

        Ok(())
    }

    pub async fn applied_versions(pool: &SqlitePool) -> Result<Vec<String>, MigrationError> {
        let rows = sqlx::query("SELECT version FROM schema_migrations ORDER BY version")
            .fetch_all(pool)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.try_get("version").ok())
            .collect())
    }
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: "0001_telemetry_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS vehicles (
            vehicle_id TEXT PRIMARY KEY,
            first_seen_at INTEGER NOT NULL,
            last_seen_at INTEGER NOT NULL,
            last_lat REAL NOT NULL,
            last_lng REAL NOT NULL,
            last_engine_status TEXT NOT NULL,
            last_fuel_level REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS telemetry_events (
            event_id INTEGER PRIMARY KEY AUTOINCREMENT,
            vehicle_id TEXT NOT NULL REFERENCES vehicles(vehicle_id),
            recorded_at INTEGER NOT NULL,
            ingest_at INTEGER NOT NULL,
            lat REAL NOT NULL,
            lng REAL NOT NULL,
            speed_kmh REAL NOT NULL,
            fuel_level REAL NOT NULL,
            engine_status TEXT NOT NULL,
            distance_km REAL NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_telemetry_events_vehicle_recorded
        ON telemetry_events(vehicle_id, recorded_at DESC);

        CREATE INDEX IF NOT EXISTS idx_telemetry_events_ingest_at
        ON telemetry_events(ingest_at);

        CREATE TABLE IF NOT EXISTS telemetry_distance_cache (
            vehicle_id TEXT PRIMARY KEY,
            last_event_id INTEGER NOT NULL,
            cumulative_km REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS telemetry_rollups (
            bucket_start INTEGER NOT NULL,
            bucket_end INTEGER NOT NULL,
            vehicle_id TEXT NOT NULL,
            avg_speed REAL NOT NULL,
            max_speed REAL NOT NULL,
            min_fuel REAL NOT NULL,
            total_distance REAL NOT NULL,
            sample_count INTEGER NOT NULL,
            PRIMARY KEY (bucket_start, bucket_end, vehicle_id)
        );

        CREATE INDEX IF NOT EXISTS idx_telemetry_rollups_vehicle
        ON telemetry_rollups(vehicle_id, bucket_start);
    "#,
}];
