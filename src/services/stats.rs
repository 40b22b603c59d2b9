/// Delay statistics per run
///
/// Two tables are involved:
/// - `today_delay_stats`: the latest delay seen for each run today, overwritten
///   on every observation.
/// - `delay_stats`: cumulative totals per run, folded in once per day at the
///   transfer time. The average is updated incrementally from the previous
///   average and count, never recomputed from history.
use crate::db::{format_timestamp, StoreError};
use crate::models::{CumulativeStat, DailySample};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use sqlx::SqlitePool;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DelayStats {
    pool: SqlitePool,
    /// Delays strictly above this many seconds count as delayed
    threshold_secs: i64,
}

/// Result of one rollup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollupSummary {
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    pub cleared: u64,
}

impl DelayStats {
    pub fn new(pool: SqlitePool, threshold_secs: i64) -> Self {
        Self { pool, threshold_secs }
    }

    /// Record the latest delay of a run, filed under `today`.
    ///
    /// `today` is the wall-clock date, not the observation's own date, so a
    /// late observation from yesterday still lands in today's buffer.
    pub async fn observe(
        &self,
        run_id: &str,
        line_name: &str,
        delay_secs: i64,
        timestamp: &DateTime<FixedOffset>,
        today: NaiveDate,
    ) -> Result<(), StoreError> {
        let service_day = today.to_string();

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM today_delay_stats WHERE run_id = ? AND service_day = ?",
        )
        .bind(run_id)
        .bind(&service_day)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        let result = match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO today_delay_stats (id, run_id, service_day, line_name, delay, timestamp)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(Uuid::new_v4().to_string())
                .bind(run_id)
                .bind(&service_day)
                .bind(line_name)
                .bind(delay_secs)
                .bind(format_timestamp(timestamp))
                .execute(&self.pool)
                .await
            }
            Some((id,)) => {
                sqlx::query(
                    "UPDATE today_delay_stats SET line_name = ?, delay = ?, timestamp = ? WHERE id = ?",
                )
                .bind(line_name)
                .bind(delay_secs)
                .bind(format_timestamp(timestamp))
                .bind(&id)
                .execute(&self.pool)
                .await
            }
        };
        result.map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// Fold today's samples into the cumulative statistics, then clear
    /// today's buffer. A sample that fails to fold is logged and dropped with
    /// the rest of the buffer.
    pub async fn rollup(&self, today: NaiveDate, now: DateTime<Utc>) -> Result<RollupSummary, StoreError> {
        let service_day = today.to_string();

        let samples: Vec<DailySample> = sqlx::query_as(
            "SELECT run_id, line_name, delay, timestamp FROM today_delay_stats WHERE service_day = ?",
        )
        .bind(&service_day)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        let mut summary = RollupSummary::default();

        for sample in &samples {
            match self.fold_into_cumulative(sample, now).await {
                Ok(true) => summary.created += 1,
                Ok(false) => summary.updated += 1,
                Err(e) => {
                    error!(run = %sample.run_id, error = %e, "Failed to fold daily delay sample");
                    summary.failed += 1;
                }
            }
        }

        let result = sqlx::query("DELETE FROM today_delay_stats WHERE service_day = ?")
            .bind(&service_day)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        summary.cleared = result.rows_affected();

        info!(
            day = %service_day,
            created = summary.created,
            updated = summary.updated,
            failed = summary.failed,
            cleared = summary.cleared,
            "Rolled up daily delay statistics"
        );

        Ok(summary)
    }

    /// Returns whether a new cumulative row was created
    async fn fold_into_cumulative(&self, sample: &DailySample, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let prior: Option<CumulativeStat> = sqlx::query_as(
            r#"
            SELECT run_id, line_name, total_trips, delayed_trips, avg_delay, last_updated
            FROM delay_stats
            WHERE run_id = ?
            "#,
        )
        .bind(&sample.run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        let created = prior.is_none();
        let next = fold_sample(prior.as_ref(), sample, self.threshold_secs, now);

        let result = if created {
            sqlx::query(
                r#"
                INSERT INTO delay_stats
                    (id, run_id, line_name, total_trips, delayed_trips, avg_delay, last_updated)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&next.run_id)
            .bind(&next.line_name)
            .bind(next.total_trips)
            .bind(next.delayed_trips)
            .bind(next.avg_delay)
            .bind(&next.last_updated)
            .execute(&self.pool)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE delay_stats
                SET line_name = ?, total_trips = ?, delayed_trips = ?, avg_delay = ?, last_updated = ?
                WHERE run_id = ?
                "#,
            )
            .bind(&next.line_name)
            .bind(next.total_trips)
            .bind(next.delayed_trips)
            .bind(next.avg_delay)
            .bind(&next.last_updated)
            .bind(&next.run_id)
            .execute(&self.pool)
            .await
        };
        result.map_err(|e| StoreError::DatabaseError(e.to_string()))?;

        Ok(created)
    }
}

/// Incorporate one day's sample into a run's cumulative statistics
pub fn fold_sample(
    prior: Option<&CumulativeStat>,
    sample: &DailySample,
    threshold_secs: i64,
    now: DateTime<Utc>,
) -> CumulativeStat {
    let delayed = i64::from(sample.delay > threshold_secs);
    let delay = sample.delay as f64;

    let (total_trips, delayed_trips, avg_delay) = match prior {
        None => (1, delayed, delay),
        Some(prior) => {
            let count = prior.total_trips as f64;
            (
                prior.total_trips + 1,
                prior.delayed_trips + delayed,
                (prior.avg_delay * count + delay) / (count + 1.0),
            )
        }
    };

    CumulativeStat {
        run_id: sample.run_id.clone(),
        line_name: sample.line_name.clone(),
        total_trips,
        delayed_trips,
        avg_delay,
        last_updated: format_timestamp(&now),
    }
}

/// The next daily rollup instant.
///
/// Level-triggered: the rollup is due once wall-clock time has passed `next`,
/// however late the check comes. Advancing moves to the same time of day on
/// the date after the firing, so a missed day is never backfilled.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSchedule {
    next: DateTime<Tz>,
    time_of_day: NaiveTime,
}

impl TransferSchedule {
    /// Schedule for `time_of_day` on the date of `now` (possibly already past)
    pub fn starting(time_of_day: NaiveTime, now: DateTime<Tz>) -> Self {
        let tz = now.timezone();
        Self {
            next: local_instant(&tz, now.date_naive(), time_of_day),
            time_of_day,
        }
    }

    pub fn next(&self) -> &DateTime<Tz> {
        &self.next
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now > self.next
    }

    /// Schedule after a rollup fired at `now`
    pub fn advance(&self, now: DateTime<Utc>) -> Self {
        let tz = self.next.timezone();
        let today = now.with_timezone(&tz).date_naive();
        let tomorrow = today.succ_opt().unwrap_or(today);
        Self {
            next: local_instant(&tz, tomorrow, self.time_of_day),
            time_of_day: self.time_of_day,
        }
    }
}

/// Local wall-clock instant; a time skipped by a DST change is read as UTC
fn local_instant(tz: &Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Tz> {
    let naive = date.and_time(time);
    tz.from_local_datetime(&naive)
        .earliest()
        .unwrap_or_else(|| tz.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use chrono_tz::Europe::Berlin;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 21, 5, 0).unwrap()
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn observed_at() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2026-10-19T10:07:00+02:00").unwrap()
    }

    fn sample(run_id: &str, delay: i64) -> DailySample {
        DailySample {
            run_id: run_id.to_string(),
            line_name: "ICE 123".to_string(),
            delay,
            timestamp: "2026-10-19T08:07:00Z".to_string(),
        }
    }

    async fn cumulative(pool: &SqlitePool, run_id: &str) -> Option<CumulativeStat> {
        sqlx::query_as(
            "SELECT run_id, line_name, total_trips, delayed_trips, avg_delay, last_updated FROM delay_stats WHERE run_id = ?",
        )
        .bind(run_id)
        .fetch_optional(pool)
        .await
        .unwrap()
    }

    async fn buffered(pool: &SqlitePool) -> i64 {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM today_delay_stats")
            .fetch_one(pool)
            .await
            .unwrap();
        count
    }

    #[test]
    fn test_fold_sample_weighted_average() {
        let first = fold_sample(None, &sample("ICE123", 120), 300, now());
        assert_eq!((first.total_trips, first.delayed_trips, first.avg_delay), (1, 0, 120.0));

        let second = fold_sample(Some(&first), &sample("ICE123", 600), 300, now());
        assert_eq!((second.total_trips, second.delayed_trips, second.avg_delay), (2, 1, 360.0));
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let at_threshold = fold_sample(None, &sample("1", 300), 300, now());
        assert_eq!(at_threshold.delayed_trips, 0);
        let above = fold_sample(None, &sample("1", 301), 300, now());
        assert_eq!(above.delayed_trips, 1);
    }

    #[tokio::test]
    async fn test_observe_overwrites_same_run() {
        let pool = memory_pool().await;
        let stats = DelayStats::new(pool.clone(), 300);

        stats.observe("123", "ICE 123", 60, &observed_at(), today()).await.unwrap();
        stats.observe("123", "ICE 123", 240, &observed_at(), today()).await.unwrap();
        stats.observe("456", "IC 456", 0, &observed_at(), today()).await.unwrap();

        assert_eq!(buffered(&pool).await, 2);
        let (delay,): (i64,) =
            sqlx::query_as("SELECT delay FROM today_delay_stats WHERE run_id = '123'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(delay, 240);
    }

    #[tokio::test]
    async fn test_rollup_across_two_days() {
        let pool = memory_pool().await;
        let stats = DelayStats::new(pool.clone(), 300);

        stats.observe("ICE123", "ICE 123", 120, &observed_at(), today()).await.unwrap();
        let summary = stats.rollup(today(), now()).await.unwrap();
        assert_eq!(summary, RollupSummary { created: 1, updated: 0, failed: 0, cleared: 1 });

        let row = cumulative(&pool, "ICE123").await.unwrap();
        assert_eq!((row.total_trips, row.delayed_trips, row.avg_delay), (1, 0, 120.0));
        assert_eq!(buffered(&pool).await, 0);

        let tomorrow = today().succ_opt().unwrap();
        stats.observe("ICE123", "ICE 123", 600, &observed_at(), tomorrow).await.unwrap();
        let summary = stats.rollup(tomorrow, now()).await.unwrap();
        assert_eq!(summary.updated, 1);

        let row = cumulative(&pool, "ICE123").await.unwrap();
        assert_eq!((row.total_trips, row.delayed_trips, row.avg_delay), (2, 1, 360.0));
    }

    #[tokio::test]
    async fn test_rollup_without_samples_creates_nothing() {
        let pool = memory_pool().await;
        let stats = DelayStats::new(pool.clone(), 300);

        let summary = stats.rollup(today(), now()).await.unwrap();
        assert_eq!(summary, RollupSummary::default());
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM delay_stats")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_rollup_only_touches_today() {
        let pool = memory_pool().await;
        let stats = DelayStats::new(pool.clone(), 300);
        let yesterday = today().pred_opt().unwrap();

        stats.observe("old", "RE 1", 100, &observed_at(), yesterday).await.unwrap();
        stats.observe("new", "RE 2", 100, &observed_at(), today()).await.unwrap();

        let summary = stats.rollup(today(), now()).await.unwrap();
        assert_eq!(summary.created, 1);
        assert!(cumulative(&pool, "old").await.is_none());
        assert_eq!(buffered(&pool).await, 1);
    }

    #[tokio::test]
    async fn test_rollup_clears_buffer_even_when_folding_fails() {
        let pool = memory_pool().await;
        let stats = DelayStats::new(pool.clone(), 300);
        stats.observe("ICE123", "ICE 123", 120, &observed_at(), today()).await.unwrap();

        sqlx::query("DROP TABLE delay_stats").execute(&pool).await.unwrap();

        let summary = stats.rollup(today(), now()).await.unwrap();
        assert_eq!(summary, RollupSummary { created: 0, updated: 0, failed: 1, cleared: 1 });
        assert_eq!(buffered(&pool).await, 0);
    }

    #[test]
    fn test_transfer_schedule_fires_once_per_day() {
        let time = NaiveTime::from_hms_opt(23, 0, 0).unwrap();
        // 20:00 in Berlin (CEST)
        let start = Utc.with_ymd_and_hms(2026, 10, 19, 18, 0, 0).unwrap();
        let schedule = TransferSchedule::starting(time, start.with_timezone(&Berlin));
        assert_eq!(schedule.next().to_rfc3339(), "2026-10-19T23:00:00+02:00");

        assert!(!schedule.is_due(start));
        let late = Utc.with_ymd_and_hms(2026, 10, 19, 21, 1, 0).unwrap();
        assert!(schedule.is_due(late));

        let schedule = schedule.advance(late);
        assert_eq!(schedule.next().to_rfc3339(), "2026-10-20T23:00:00+02:00");
        assert!(!schedule.is_due(late));
    }

    #[test]
    fn test_transfer_schedule_does_not_backfill() {
        let time = NaiveTime::from_hms_opt(23, 0, 0).unwrap();
        let start = Utc.with_ymd_and_hms(2026, 10, 19, 18, 0, 0).unwrap();
        let schedule = TransferSchedule::starting(time, start.with_timezone(&Berlin));

        // Idle for three days: one late firing, then the next evening
        let much_later = Utc.with_ymd_and_hms(2026, 10, 22, 9, 0, 0).unwrap();
        assert!(schedule.is_due(much_later));
        let schedule = schedule.advance(much_later);
        assert_eq!(schedule.next().to_rfc3339(), "2026-10-23T23:00:00+02:00");
    }

    #[test]
    fn test_transfer_schedule_across_dst_change() {
        let time = NaiveTime::from_hms_opt(23, 0, 0).unwrap();
        // Berlin leaves summer time on 2026-10-25
        let fired = Utc.with_ymd_and_hms(2026, 10, 24, 21, 0, 30).unwrap();
        let schedule = TransferSchedule::starting(time, fired.with_timezone(&Berlin)).advance(fired);
        assert_eq!(schedule.next().to_rfc3339(), "2026-10-25T23:00:00+01:00");
    }
}
