//! Runtime configuration, loaded from `VACANCY_*` environment variables.
//!
//! Every tunable the pipeline depends on lives here with a documented
//! default; nothing policy-shaped is hardcoded at the point of use.

use std::env;
use std::str::FromStr;

/// Pipeline and server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port (`VACANCY_PORT`).
    pub port: u16,
    /// SQLite connection string (`VACANCY_DATABASE_URL`).
    pub database_url: String,

    /// Width of an aggregate bucket in seconds (`VACANCY_BUCKET_WIDTH_SECS`).
    pub bucket_width_secs: i64,
    /// No observation within this window reads as offline
    /// (`VACANCY_LIVENESS_WINDOW_SECS`).
    pub liveness_window_secs: i64,
    /// Minimum dwell time before a reversal counts as a real transition;
    /// 0 disables debouncing (`VACANCY_MIN_DWELL_SECS`).
    pub min_dwell_secs: i64,
    /// Bounded retries for the per-unit conditional write
    /// (`VACANCY_WRITE_RETRY_ATTEMPTS`).
    pub write_retry_attempts: u32,

    /// Lifetime of a new alert subscription (`VACANCY_SUBSCRIPTION_TTL_SECS`).
    pub subscription_ttl_secs: i64,
    /// Minimum interval between fires of one subscription
    /// (`VACANCY_ALERT_COOLDOWN_SECS`).
    pub alert_cooldown_secs: i64,
    /// Offset of site-local time from UTC, in minutes, used for quiet hours
    /// (`VACANCY_LOCAL_OFFSET_MINUTES`).
    pub local_offset_minutes: i64,

    /// Mean occupancy ratio below which a unit is forecast "likely free"
    /// (`VACANCY_FORECAST_FREE_THRESHOLD`).
    pub forecast_free_threshold: f64,
    /// Weeks of matching-bucket history the forecast averages over
    /// (`VACANCY_FORECAST_LOOKBACK_WEEKS`).
    pub forecast_lookback_weeks: u32,
    /// Below this many historical samples the forecast reports low confidence
    /// and falls back to the most recent bucket
    /// (`VACANCY_FORECAST_MIN_SAMPLES`).
    pub forecast_min_samples: u32,

    /// Event-log retention window in days (`VACANCY_TRANSITION_RETENTION_DAYS`).
    pub transition_retention_days: i64,
    /// Rolling horizon for bucket data in days (`VACANCY_BUCKET_HORIZON_DAYS`).
    pub bucket_horizon_days: i64,
    /// Seconds between background retention purges
    /// (`VACANCY_PURGE_INTERVAL_SECS`).
    pub purge_interval_secs: u64,

    /// Downstream webhook for fired alerts (`VACANCY_WEBHOOK_URL`);
    /// unset means fires are logged only.
    pub webhook_url: Option<String>,
    /// Per-attempt delivery timeout (`VACANCY_DELIVERY_TIMEOUT_SECS`).
    pub delivery_timeout_secs: u64,
    /// Bounded delivery retries before a fire is dropped as failed
    /// (`VACANCY_DELIVERY_RETRY_ATTEMPTS`).
    pub delivery_retry_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            database_url: "sqlite:vacancy.db?mode=rwc".to_string(),
            bucket_width_secs: 900,
            liveness_window_secs: 180,
            min_dwell_secs: 0,
            write_retry_attempts: 3,
            subscription_ttl_secs: 7200,
            alert_cooldown_secs: 600,
            local_offset_minutes: 0,
            forecast_free_threshold: 0.5,
            forecast_lookback_weeks: 4,
            forecast_min_samples: 3,
            transition_retention_days: 14,
            bucket_horizon_days: 90,
            purge_interval_secs: 3600,
            webhook_url: None,
            delivery_timeout_secs: 5,
            delivery_retry_attempts: 3,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from the environment, falling back to defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let d = Config::default();
        Self {
            port: env_parse("VACANCY_PORT", d.port),
            database_url: env::var("VACANCY_DATABASE_URL").unwrap_or(d.database_url),
            bucket_width_secs: env_parse("VACANCY_BUCKET_WIDTH_SECS", d.bucket_width_secs),
            liveness_window_secs: env_parse(
                "VACANCY_LIVENESS_WINDOW_SECS",
                d.liveness_window_secs,
            ),
            min_dwell_secs: env_parse("VACANCY_MIN_DWELL_SECS", d.min_dwell_secs),
            write_retry_attempts: env_parse(
                "VACANCY_WRITE_RETRY_ATTEMPTS",
                d.write_retry_attempts,
            ),
            subscription_ttl_secs: env_parse(
                "VACANCY_SUBSCRIPTION_TTL_SECS",
                d.subscription_ttl_secs,
            ),
            alert_cooldown_secs: env_parse("VACANCY_ALERT_COOLDOWN_SECS", d.alert_cooldown_secs),
            local_offset_minutes: env_parse(
                "VACANCY_LOCAL_OFFSET_MINUTES",
                d.local_offset_minutes,
            ),
            forecast_free_threshold: env_parse(
                "VACANCY_FORECAST_FREE_THRESHOLD",
                d.forecast_free_threshold,
            ),
            forecast_lookback_weeks: env_parse(
                "VACANCY_FORECAST_LOOKBACK_WEEKS",
                d.forecast_lookback_weeks,
            ),
            forecast_min_samples: env_parse(
                "VACANCY_FORECAST_MIN_SAMPLES",
                d.forecast_min_samples,
            ),
            transition_retention_days: env_parse(
                "VACANCY_TRANSITION_RETENTION_DAYS",
                d.transition_retention_days,
            ),
            bucket_horizon_days: env_parse("VACANCY_BUCKET_HORIZON_DAYS", d.bucket_horizon_days),
            purge_interval_secs: env_parse("VACANCY_PURGE_INTERVAL_SECS", d.purge_interval_secs),
            webhook_url: env::var("VACANCY_WEBHOOK_URL").ok(),
            delivery_timeout_secs: env_parse(
                "VACANCY_DELIVERY_TIMEOUT_SECS",
                d.delivery_timeout_secs,
            ),
            delivery_retry_attempts: env_parse(
                "VACANCY_DELIVERY_RETRY_ATTEMPTS",
                d.delivery_retry_attempts,
            ),
        }
    }
}
