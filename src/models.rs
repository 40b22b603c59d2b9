use chrono::{DateTime, FixedOffset, NaiveDate};
use sqlx::FromRow;

/// A departure as reported by the station board, one per poll
#[derive(Debug, Clone, PartialEq)]
pub struct Departure {
    /// Run number, stable for one physical trip on one day
    pub run_id: String,
    /// Opaque handle for resolving trip detail
    pub trip_id: String,
    /// Line name (e.g., "ICE 123")
    pub line_name: String,
    /// Planned departure time (RFC 3339), as received
    pub planned_when: Option<String>,
    /// Actual or predicted departure time (RFC 3339), as received
    pub when: Option<String>,
    /// Delay in seconds, 0 when the API reports none
    pub delay_secs: i64,
    /// Position reported by the API, [lon, lat]
    pub reported_position: Option<[f64; 2]>,
    /// Destination name from the station board
    pub destination_name: Option<String>,
}

/// Trip detail resolved from a trip handle
#[derive(Debug, Clone, PartialEq)]
pub struct TripDetail {
    pub origin_name: String,
    /// Origin coordinates [lon, lat]
    pub origin: [f64; 2],
    pub destination_name: String,
    /// Destination coordinates [lon, lat]
    pub destination: [f64; 2],
    pub scheduled_departure: DateTime<FixedOffset>,
    pub scheduled_arrival: DateTime<FixedOffset>,
    /// Route geometry, ordered [lon, lat] points; may be empty
    pub route: Vec<[f64; 2]>,
}

/// Mutable fields written on every reconciliation of a run
#[derive(Debug, Clone, PartialEq)]
pub struct PositionFields {
    /// Authoritative timestamp; its calendar date is the service day
    pub timestamp: DateTime<FixedOffset>,
    pub planned_timestamp: DateTime<FixedOffset>,
    pub delay_secs: i64,
    pub line_name: String,
    pub trip_id: String,
    /// [lon, lat]
    pub position: [f64; 2],
    pub destination: Option<String>,
}

impl PositionFields {
    pub fn service_day(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

/// Stored position of a run on a service day
#[cfg(test)]
#[derive(Debug, Clone, FromRow)]
pub struct PositionRecord {
    pub id: String,
    pub run_id: String,
    /// YYYY-MM-DD
    pub service_day: String,
    /// UTC, RFC 3339
    pub timestamp: String,
    pub planned_timestamp: String,
    pub delay: i64,
    pub line_name: String,
    pub trip_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub destination: Option<String>,
}

/// Latest delay observed for a run today
#[derive(Debug, Clone, FromRow)]
pub struct DailySample {
    pub run_id: String,
    pub line_name: String,
    pub delay: i64,
    pub timestamp: String,
}

/// Cumulative delay statistics of a run across all rolled-up days
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct CumulativeStat {
    pub run_id: String,
    pub line_name: String,
    pub total_trips: i64,
    pub delayed_trips: i64,
    /// Average delay in seconds
    pub avg_delay: f64,
    pub last_updated: String,
}
