use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS trip_positions (
        id TEXT PRIMARY KEY NOT NULL,
        run_id TEXT NOT NULL,
        service_day TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        planned_timestamp TEXT NOT NULL,
        delay INTEGER NOT NULL,
        line_name TEXT NOT NULL,
        trip_id TEXT NOT NULL,
        latitude REAL NOT NULL,
        longitude REAL NOT NULL,
        destination TEXT,
        UNIQUE (run_id, service_day)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_trip_positions_timestamp ON trip_positions (timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS today_delay_stats (
        id TEXT PRIMARY KEY NOT NULL,
        run_id TEXT NOT NULL,
        service_day TEXT NOT NULL,
        line_name TEXT NOT NULL,
        delay INTEGER NOT NULL,
        timestamp TEXT NOT NULL,
        UNIQUE (run_id, service_day)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS delay_stats (
        id TEXT PRIMARY KEY NOT NULL,
        run_id TEXT NOT NULL UNIQUE,
        line_name TEXT NOT NULL,
        total_trips INTEGER NOT NULL,
        delayed_trips INTEGER NOT NULL,
        avg_delay REAL NOT NULL,
        last_updated TEXT NOT NULL
    )
    "#,
];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
}

/// Open (creating if missing) the SQLite database and ensure the schema exists
pub async fn connect(database_url: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| StoreError::DatabaseError(e.to_string()))?
        .create_if_missing(true);

    // Single writer; one connection keeps `sqlite::memory:` coherent too
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

    init_schema(&pool).await?;
    info!(database_url = %database_url, "Database ready");

    Ok(pool)
}

pub async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
    }
    Ok(())
}

/// Number of stored trip positions
pub async fn count_positions(pool: &SqlitePool) -> Result<i64, StoreError> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM trip_positions")
        .fetch_one(pool)
        .await
        .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
    Ok(count)
}

/// Storage form of an instant: UTC, second precision, `Z` suffix.
/// Fixed width, so string order is time order.
pub fn format_timestamp<Tz: TimeZone>(time: &DateTime<Tz>) -> String {
    time.with_timezone(&Utc)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
pub async fn memory_pool() -> SqlitePool {
    connect("sqlite::memory:").await.unwrap()
}
