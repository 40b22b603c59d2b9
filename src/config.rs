use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

const DEFAULT_TRANSFER_TIME: &str = "23:00";
/// One day
const MAX_INTERVAL_MINUTES: u64 = 24 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    /// Base URL of the HAFAS-style REST API, without trailing slash
    pub api_base_url: String,
    /// Station IDs polled every cycle, in order
    pub stations: Vec<String>,
    /// Departure window requested per station, in minutes
    pub duration_minutes: u32,
    /// Position rows older than this are removed after each cycle
    pub retention_minutes: u32,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_minutes: u64,
    #[serde(default = "default_stats_interval")]
    pub stats_interval_minutes: u64,
    /// Time of day (HH:MM) at which same-day delay samples are rolled up
    #[serde(default = "default_transfer_time")]
    pub transfer_time: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Delays strictly above this count as delayed trips
    #[serde(default = "default_delay_threshold")]
    pub delay_threshold_secs: i64,
    /// Pause between consecutive upstream calls
    #[serde(default = "default_request_delay")]
    pub request_delay_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Trip detail cache lifetime; 0 re-resolves every poll
    #[serde(default)]
    pub trip_cache_ttl_secs: u64,
    #[serde(default)]
    pub products: Products,
    #[serde(default)]
    pub pipeline: PipelineOptions,
}

/// Vehicle modes included in departure queries
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Products {
    pub national_express: bool,
    pub national: bool,
    pub regional_express: bool,
    pub regional: bool,
    pub suburban: bool,
    pub bus: bool,
    pub ferry: bool,
    pub subway: bool,
    pub tram: bool,
    pub taxi: bool,
}

impl Default for Products {
    fn default() -> Self {
        Self {
            national_express: true,
            national: true,
            regional_express: true,
            regional: true,
            suburban: true,
            bus: false,
            ferry: false,
            subway: false,
            tram: false,
            taxi: false,
        }
    }
}

impl Products {
    /// Query parameter pairs in the API's naming
    pub fn as_query(&self) -> [(&'static str, bool); 10] {
        [
            ("nationalExpress", self.national_express),
            ("national", self.national),
            ("regionalExpress", self.regional_express),
            ("regional", self.regional),
            ("suburban", self.suburban),
            ("bus", self.bus),
            ("ferry", self.ferry),
            ("subway", self.subway),
            ("tram", self.tram),
            ("taxi", self.taxi),
        ]
    }
}

/// Switches selecting how a departure becomes a stored position
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineOptions {
    /// Resolve trip detail (route geometry, endpoints) for every departure
    pub resolve_trip_detail: bool,
    /// Trust a position reported with the departure over interpolation
    pub prefer_reported_position: bool,
    /// Store the destination name with each position
    pub persist_destination: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            resolve_trip_detail: true,
            prefer_reported_position: false,
            persist_destination: true,
        }
    }
}

fn default_poll_interval() -> u64 {
    1
}

fn default_stats_interval() -> u64 {
    5
}

fn default_transfer_time() -> String {
    DEFAULT_TRANSFER_TIME.to_string()
}

fn default_timezone() -> String {
    "Europe/Berlin".to_string()
}

fn default_delay_threshold() -> i64 {
    300
}

fn default_request_delay() -> u64 {
    1000
}

fn default_request_timeout() -> u64 {
    30
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        let mut config = Self::from_yaml(&content)?;

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }

        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        self.stations.retain(|s| !s.trim().is_empty());
        if self.stations.is_empty() {
            return Err(ConfigError::Invalid("stations must not be empty".to_string()));
        }
        if self.duration_minutes == 0 {
            return Err(ConfigError::Invalid("duration_minutes must be positive".to_string()));
        }
        if self.retention_minutes == 0 {
            return Err(ConfigError::Invalid("retention_minutes must be positive".to_string()));
        }
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::Invalid(format!("unknown timezone {}", self.timezone)))?;

        if self.poll_interval_minutes == 0 {
            warn!("poll_interval_minutes is 0, using 1 minute");
            self.poll_interval_minutes = default_poll_interval();
        }
        if self.stats_interval_minutes == 0 {
            warn!("stats_interval_minutes is 0, using 5 minutes");
            self.stats_interval_minutes = default_stats_interval();
        }
        if self.poll_interval_minutes > MAX_INTERVAL_MINUTES
            || self.stats_interval_minutes > MAX_INTERVAL_MINUTES
        {
            return Err(ConfigError::Invalid(format!(
                "poll and stats intervals must be at most {MAX_INTERVAL_MINUTES} minutes"
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request_timeout_secs must be positive".to_string()));
        }
        if NaiveTime::parse_from_str(&self.transfer_time, "%H:%M").is_err() {
            warn!(transfer_time = %self.transfer_time, "Invalid transfer_time, using 23:00");
            self.transfer_time = default_transfer_time();
        }

        Ok(())
    }

    pub fn tz(&self) -> Tz {
        // Checked in validate()
        self.timezone.parse().unwrap_or(chrono_tz::Europe::Berlin)
    }

    pub fn transfer_time_of_day(&self) -> NaiveTime {
        NaiveTime::parse_from_str(&self.transfer_time, "%H:%M")
            .unwrap_or_else(|_| NaiveTime::from_hms_opt(23, 0, 0).unwrap_or_default())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_minutes.saturating_mul(60))
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_minutes.saturating_mul(60))
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.retention_minutes))
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn trip_cache_ttl(&self) -> Option<Duration> {
        (self.trip_cache_ttl_secs > 0).then(|| Duration::from_secs(self.trip_cache_ttl_secs))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}
