/// Per-run, per-day upsert of trip positions
///
/// A run has at most one row per service day in `trip_positions`. The first
/// observation of a run on a day inserts it; every later one overwrites the
/// mutable fields under the same id. The service day is the calendar date of
/// the departure's own timestamp (in its own offset), not of the poll.
use crate::db::{format_timestamp, StoreError};
use crate::models::{Departure, PositionFields};
use chrono::{DateTime, FixedOffset, Utc};
use sqlx::SqlitePool;
use std::fmt;
use tracing::info;
use uuid::Uuid;

/// What a reconciliation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Inserted { id: String },
    Updated { id: String },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InvalidTimestamp,
    InvalidScheduledTimestamp,
    NoPosition,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::InvalidTimestamp => write!(f, "invalid timestamp"),
            SkipReason::InvalidScheduledTimestamp => write!(f, "invalid scheduled timestamp"),
            SkipReason::NoPosition => write!(f, "no position"),
        }
    }
}

/// Validated timestamps of a departure: (authoritative, planned)
pub fn departure_times(
    departure: &Departure,
) -> Result<(DateTime<FixedOffset>, DateTime<FixedOffset>), SkipReason> {
    let when = departure
        .when
        .as_deref()
        .filter(|w| !w.is_empty())
        .and_then(|w| DateTime::parse_from_rfc3339(w).ok())
        .ok_or(SkipReason::InvalidTimestamp)?;

    let planned = departure
        .planned_when
        .as_deref()
        .and_then(|p| DateTime::parse_from_rfc3339(p).ok())
        .ok_or(SkipReason::InvalidScheduledTimestamp)?;

    Ok((when, planned))
}

/// Insert or update the position row of `run_id` on the fields' service day
pub async fn reconcile(
    pool: &SqlitePool,
    run_id: &str,
    fields: &PositionFields,
) -> Result<Outcome, StoreError> {
    let service_day = fields.service_day().to_string();

    let existing: Option<(String,)> =
        sqlx::query_as("SELECT id FROM trip_positions WHERE run_id = ? AND service_day = ?")
            .bind(run_id)
            .bind(&service_day)
            .fetch_optional(pool)
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

    match existing {
        None => {
            let id = Uuid::new_v4().to_string();
            sqlx::query(
                r#"
                INSERT INTO trip_positions
                    (id, run_id, service_day, timestamp, planned_timestamp, delay,
                     line_name, trip_id, latitude, longitude, destination)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(run_id)
            .bind(&service_day)
            .bind(format_timestamp(&fields.timestamp))
            .bind(format_timestamp(&fields.planned_timestamp))
            .bind(fields.delay_secs)
            .bind(&fields.line_name)
            .bind(&fields.trip_id)
            .bind(fields.position[1])
            .bind(fields.position[0])
            .bind(&fields.destination)
            .execute(pool)
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

            Ok(Outcome::Inserted { id })
        }
        Some((id,)) => {
            sqlx::query(
                r#"
                UPDATE trip_positions
                SET timestamp = ?,
                    planned_timestamp = ?,
                    delay = ?,
                    line_name = ?,
                    trip_id = ?,
                    latitude = ?,
                    longitude = ?,
                    destination = ?
                WHERE id = ?
                "#,
            )
            .bind(format_timestamp(&fields.timestamp))
            .bind(format_timestamp(&fields.planned_timestamp))
            .bind(fields.delay_secs)
            .bind(&fields.line_name)
            .bind(&fields.trip_id)
            .bind(fields.position[1])
            .bind(fields.position[0])
            .bind(&fields.destination)
            .bind(&id)
            .execute(pool)
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

            Ok(Outcome::Updated { id })
        }
    }
}

/// Retention sweep: remove positions whose timestamp is older than `cutoff`
pub async fn delete_older_than(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
    let result = sqlx::query("DELETE FROM trip_positions WHERE timestamp < ?")
        .bind(format_timestamp(&cutoff))
        .execute(pool)
        .await
        .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

    let deleted = result.rows_affected();
    info!(deleted, cutoff = %cutoff, "Deleted old trip positions");
    Ok(deleted)
}
