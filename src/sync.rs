use crate::config::Config;
use crate::db::{self, StoreError};
use crate::models::{Departure, PositionFields, TripDetail};
use crate::providers::transit::{DepartureQuery, TransitError, TransitSource};
use crate::services::position;
use crate::services::reconcile::{self, Outcome, SkipReason};
use crate::services::stats::{DelayStats, TransferSchedule};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// How often the daily rollup boundary is checked
const ROLLUP_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Totals of one poll cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub stations: usize,
    pub departures: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub deleted: u64,
}

struct CachedTrip {
    detail: TripDetail,
    fetched_at: Instant,
}

/// Polls the configured stations and keeps `trip_positions` current.
///
/// Everything runs on one task: stations in order, departures in list order,
/// then the retention sweep. Stats logging and the rollup check run between
/// cycles, never inside one.
pub struct Tracker {
    pool: SqlitePool,
    source: Box<dyn TransitSource>,
    stats: DelayStats,
    config: Config,
    trip_cache: HashMap<String, CachedTrip>,
}

impl Tracker {
    pub fn new(pool: SqlitePool, source: Box<dyn TransitSource>, config: Config) -> Self {
        let stats = DelayStats::new(pool.clone(), config.delay_threshold_secs);
        Self {
            pool,
            source,
            stats,
            config,
            trip_cache: HashMap::new(),
        }
    }

    /// Run until Ctrl-C
    pub async fn run(mut self) {
        let tz = self.config.tz();
        let mut schedule = TransferSchedule::starting(
            self.config.transfer_time_of_day(),
            Utc::now().with_timezone(&tz),
        );

        info!(
            stations = self.config.stations.len(),
            poll_interval_minutes = self.config.poll_interval_minutes,
            next_rollup = %schedule.next(),
            "Starting tracker"
        );

        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let stats_interval = self.config.stats_interval();
        let mut stats = tokio::time::interval_at(
            tokio::time::Instant::now() + stats_interval,
            stats_interval,
        );
        stats.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut rollup_check = tokio::time::interval(ROLLUP_CHECK_INTERVAL);
        rollup_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    self.run_cycle().await;
                }
                _ = stats.tick() => {
                    self.log_stats().await;
                }
                _ = rollup_check.tick() => {
                    schedule = self.check_rollup(schedule, Utc::now()).await;
                }
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping tracker");
                    break;
                }
            }
        }
    }

    /// One poll cycle: every station, then the retention sweep
    pub async fn run_cycle(&mut self) -> CycleSummary {
        info!("Starting poll cycle");

        let query = DepartureQuery {
            duration_minutes: self.config.duration_minutes,
            products: self.config.products,
        };
        let stations = self.config.stations.clone();
        let mut summary = CycleSummary::default();

        for station_id in &stations {
            let departures = match self.source.fetch_departures(station_id, &query).await {
                Ok(departures) => {
                    info!(station = %station_id, count = departures.len(), "Fetched departures");
                    departures
                }
                Err(e) => {
                    warn!(station = %station_id, error = %e, "Failed to fetch departures, skipping station");
                    Vec::new()
                }
            };
            tokio::time::sleep(self.config.request_delay()).await;

            summary.stations += 1;
            summary.departures += departures.len();

            for departure in &departures {
                match self.process_departure(departure).await {
                    Ok(Outcome::Inserted { id }) => {
                        debug!(id = %id, run = %departure.run_id, line = %departure.line_name, "Inserted position");
                        summary.inserted += 1;
                    }
                    Ok(Outcome::Updated { id }) => {
                        debug!(id = %id, run = %departure.run_id, line = %departure.line_name, "Updated position");
                        summary.updated += 1;
                    }
                    Ok(Outcome::Skipped(reason)) => {
                        warn!(run = %departure.run_id, trip = %departure.trip_id, %reason, "Skipped departure");
                        summary.skipped += 1;
                    }
                    Err(e) => {
                        error!(run = %departure.run_id, trip = %departure.trip_id, error = %e, "Failed to process departure");
                        summary.failed += 1;
                    }
                }
            }
        }

        let cutoff = Utc::now() - self.config.retention();
        match reconcile::delete_older_than(&self.pool, cutoff).await {
            Ok(deleted) => summary.deleted = deleted,
            Err(e) => error!(error = %e, "Failed to delete old trip positions"),
        }

        self.evict_expired_trips();

        info!(
            stations = summary.stations,
            departures = summary.departures,
            inserted = summary.inserted,
            updated = summary.updated,
            skipped = summary.skipped,
            failed = summary.failed,
            deleted = summary.deleted,
            "Completed poll cycle"
        );

        summary
    }

    /// Validate, locate and store one departure, then record its delay
    async fn process_departure(&mut self, departure: &Departure) -> Result<Outcome, DepartureError> {
        let (timestamp, planned_timestamp) = match reconcile::departure_times(departure) {
            Ok(times) => times,
            Err(reason) => return Ok(Outcome::Skipped(reason)),
        };

        let options = self.config.pipeline;
        let use_reported = options.prefer_reported_position && departure.reported_position.is_some();
        let needs_detail =
            options.resolve_trip_detail && (!use_reported || options.persist_destination);

        let detail = if needs_detail {
            Some(self.trip_detail(&departure.trip_id).await?)
        } else {
            None
        };

        let now = Utc::now();
        let position = match (&detail, departure.reported_position) {
            (_, Some(reported)) if use_reported => reported,
            (Some(detail), _) => position::estimate(detail, &now),
            (None, Some(reported)) => reported,
            (None, None) => return Ok(Outcome::Skipped(SkipReason::NoPosition)),
        };

        let destination = if options.persist_destination {
            detail
                .as_ref()
                .map(|d| d.destination_name.clone())
                .or_else(|| departure.destination_name.clone())
        } else {
            None
        };

        let fields = PositionFields {
            timestamp,
            planned_timestamp,
            delay_secs: departure.delay_secs,
            line_name: departure.line_name.clone(),
            trip_id: departure.trip_id.clone(),
            position,
            destination,
        };

        let outcome = reconcile::reconcile(&self.pool, &departure.run_id, &fields).await?;

        let today = now.with_timezone(&self.config.tz()).date_naive();
        if let Err(e) = self
            .stats
            .observe(&departure.run_id, &departure.line_name, departure.delay_secs, &timestamp, today)
            .await
        {
            warn!(run = %departure.run_id, error = %e, "Failed to record daily delay sample");
        }

        Ok(outcome)
    }

    /// Trip detail, served from the cache while fresh
    async fn trip_detail(&mut self, trip_id: &str) -> Result<TripDetail, TransitError> {
        let ttl = self.config.trip_cache_ttl();

        if let (Some(ttl), Some(cached)) = (ttl, self.trip_cache.get(trip_id)) {
            if cached.fetched_at.elapsed() < ttl {
                debug!(trip = %trip_id, "Using cached trip detail");
                return Ok(cached.detail.clone());
            }
        }

        tokio::time::sleep(self.config.request_delay()).await;
        let detail = self.source.resolve_trip(trip_id).await?;
        debug!(
            trip = %trip_id,
            origin = %detail.origin_name,
            destination = %detail.destination_name,
            route_points = detail.route.len(),
            "Resolved trip detail"
        );

        if ttl.is_some() {
            self.trip_cache.insert(
                trip_id.to_string(),
                CachedTrip {
                    detail: detail.clone(),
                    fetched_at: Instant::now(),
                },
            );
        }

        Ok(detail)
    }

    fn evict_expired_trips(&mut self) {
        match self.config.trip_cache_ttl() {
            Some(ttl) => self.trip_cache.retain(|_, cached| cached.fetched_at.elapsed() < ttl),
            None => self.trip_cache.clear(),
        }
    }

    /// Log the number of stored positions
    pub async fn log_stats(&self) {
        match db::count_positions(&self.pool).await {
            Ok(count) => info!(count, "Current trip positions in database"),
            Err(e) => error!(error = %e, "Failed to count trip positions"),
        }
    }

    /// Run the daily rollup if its boundary has passed; returns the schedule
    /// to use from now on
    pub async fn check_rollup(&self, schedule: TransferSchedule, now: DateTime<Utc>) -> TransferSchedule {
        if !schedule.is_due(now) {
            return schedule;
        }

        let today = now.with_timezone(&self.config.tz()).date_naive();
        if let Err(e) = self.stats.rollup(today, now).await {
            error!(error = %e, "Failed to roll up daily delay statistics");
        }

        let next = schedule.advance(now);
        info!(next_rollup = %next.next(), "Scheduled next rollup");
        next
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DepartureError {
    #[error("Trip detail unavailable: {0}")]
    Resolve(#[from] TransitError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
