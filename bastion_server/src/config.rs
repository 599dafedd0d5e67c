//! Server configuration loaded from environment variables

use bastion_common::constants;
use chrono::Duration as ChronoDuration;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Host to bind to
    pub host: String,

    /// Public port for HTTP traffic
    pub port: u16,

    /// PostgreSQL connection string (in-memory registry when unset)
    pub database_url: Option<String>,

    /// Bearer token for the admin API (admin API disabled when empty)
    pub admin_token: String,

    /// Bearer token collaborator services use to report events
    pub service_token: String,

    pub gate: GateConfig,

    pub sweeper: SweeperConfig,

    pub scoring: ScoringConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            database_url: None,
            admin_token: String::new(),
            service_token: String::new(),
            gate: GateConfig::default(),
            sweeper: SweeperConfig::default(),
            scoring: ScoringConfig::default(),
        }
    }
}

/// Request gate settings
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Client IP header set by the trusted reverse proxy
    pub trusted_proxy_header: String,

    /// Upper bound on the block-status lookup before failing open
    pub lookup_timeout: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            trusted_proxy_header: constants::TRUSTED_PROXY_HEADER.to_string(),
            lookup_timeout: Duration::from_millis(250),
        }
    }
}

/// Cadences for the periodic sweep jobs
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub expiry_interval: Duration,
    pub tracking_gc_interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            expiry_interval: Duration::from_secs(60 * 60),
            tracking_gc_interval: Duration::from_secs(4 * 60 * 60),
        }
    }
}

/// Thresholds for the fraud heuristics
#[derive(Debug, Clone)]
pub struct ScoringConfig {
    /// Failed logins inside `failed_login_window` that trigger a block
    pub max_failed_logins: usize,
    pub failed_login_window: ChronoDuration,
    pub failed_login_block: ChronoDuration,

    /// Requests per `request_burst_window` above which a request is suspicious
    pub max_requests_per_burst: usize,
    pub request_burst_window: ChronoDuration,

    /// Uploads per retention horizon above which an upload is suspicious
    pub max_uploads_per_hour: usize,
    pub max_upload_bytes: u64,

    /// Suspicious-activity entries that trigger a block
    pub suspicious_threshold: usize,
    pub suspicious_block: ChronoDuration,

    pub spam_threshold: u32,

    /// None blocks permanently
    pub upload_block: Option<ChronoDuration>,
    pub spam_block: Option<ChronoDuration>,

    /// Horizon timestamps are kept for
    pub retention: ChronoDuration,

    /// Entries idle this long are dropped by the tracking GC
    pub idle_ttl: ChronoDuration,

    /// Cap on each identity's suspicious-activity log
    pub max_activity_log: usize,

    /// Cap on each identity's failed-login, request and upload timestamps
    pub max_events_per_list: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            max_failed_logins: 5,
            failed_login_window: ChronoDuration::minutes(15),
            failed_login_block: ChronoDuration::hours(24),
            max_requests_per_burst: 100,
            request_burst_window: ChronoDuration::seconds(60),
            max_uploads_per_hour: 20,
            max_upload_bytes: 50 * 1024 * 1024,
            suspicious_threshold: 3,
            suspicious_block: ChronoDuration::hours(24),
            spam_threshold: 3,
            upload_block: None,
            spam_block: None,
            retention: ChronoDuration::hours(1),
            idle_ttl: ChronoDuration::hours(24),
            max_activity_log: 100,
            max_events_per_list: 10_000,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let gate = GateConfig {
            trusted_proxy_header: env::var("TRUSTED_PROXY_HEADER")
                .unwrap_or_else(|_| constants::TRUSTED_PROXY_HEADER.to_string()),
            lookup_timeout: Duration::from_millis(parse_var("GATE_TIMEOUT_MS", 250)?),
        };

        let sweeper = SweeperConfig {
            expiry_interval: Duration::from_secs(parse_var("EXPIRY_SWEEP_INTERVAL_SECS", 3600)?),
            tracking_gc_interval: Duration::from_secs(parse_var(
                "TRACKING_GC_INTERVAL_SECS",
                4 * 3600,
            )?),
        };
        if sweeper.expiry_interval.is_zero() || sweeper.tracking_gc_interval.is_zero() {
            return Err(ConfigError::InvalidValue("sweep intervals must be positive"));
        }

        let scoring = ScoringConfig {
            upload_block: optional_hours("UPLOAD_BLOCK_HOURS")?,
            spam_block: optional_hours("SPAM_BLOCK_HOURS")?,
            ..ScoringConfig::default()
        };

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidPort)?,
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            admin_token: env::var("ADMIN_TOKEN").unwrap_or_default(),
            service_token: env::var("SERVICE_TOKEN").unwrap_or_default(),
            gate,
            sweeper,
            scoring,
        })
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidNumber(name)),
        Err(_) => Ok(default),
    }
}

fn optional_hours(name: &'static str) -> Result<Option<ChronoDuration>, ConfigError> {
    match env::var(name) {
        Ok(value) => {
            let hours: i64 = value.parse().map_err(|_| ConfigError::InvalidNumber(name))?;
            Ok((hours > 0).then(|| ChronoDuration::hours(hours)))
        }
        Err(_) => Ok(None),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid port number")]
    InvalidPort,

    #[error("Invalid numeric value for {0}")]
    InvalidNumber(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoring_defaults() {
        let scoring = ScoringConfig::default();
        assert_eq!(scoring.max_failed_logins, 5);
        assert_eq!(scoring.failed_login_window, ChronoDuration::minutes(15));
        assert_eq!(scoring.suspicious_threshold, 3);
        assert_eq!(scoring.max_upload_bytes, 52_428_800);
        assert!(scoring.upload_block.is_none());
    }

    #[test]
    fn test_sweeper_defaults() {
        let sweeper = SweeperConfig::default();
        assert_eq!(sweeper.expiry_interval.as_secs(), 3600);
        assert_eq!(sweeper.tracking_gc_interval.as_secs(), 14400);
    }
}
