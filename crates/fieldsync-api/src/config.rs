use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use fieldsync_core::config::{AnalysisClientConfig, QueueConfig};
use thiserror::Error;

const MIN_JWT_SECRET_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_path: String,
    pub jwt_secret: String,
    pub auth_clock_skew: Duration,
    /// `None` disables the analysis worker; entries stay queued.
    pub analysis: Option<AnalysisClientConfig>,
    pub queue: QueueConfig,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_path", &self.database_path)
            .field("jwt_secret", &"[REDACTED]")
            .field("auth_clock_skew", &self.auth_clock_skew)
            .field("analysis", &self.analysis)
            .field("queue", &self.queue)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "FIELDSYNC_BIND_ADDR", "127.0.0.1:8080");
        let database_path = value_or_default(&lookup, "FIELDSYNC_DATABASE_PATH", "fieldsync.db");

        let jwt_secret = required_trimmed(&lookup, "FIELDSYNC_JWT_SECRET")?;
        if jwt_secret.len() < MIN_JWT_SECRET_BYTES {
            return Err(ConfigError::Invalid(format!(
                "FIELDSYNC_JWT_SECRET must be at least {MIN_JWT_SECRET_BYTES} bytes"
            )));
        }

        let auth_clock_skew_secs =
            ranged(&lookup, "FIELDSYNC_AUTH_CLOCK_SKEW_SECS", "60", 0..=300)?;

        let analysis_timeout_secs = ranged(&lookup, "ANALYSIS_TIMEOUT_SECS", "300", 1..=900)?;
        let analysis = optional_trimmed(&lookup, "ANALYSIS_SERVICE_URL")
            .map(|url| {
                AnalysisClientConfig::new(url)
                    .map(|config| config.with_timeout(Duration::from_secs(analysis_timeout_secs)))
                    .map_err(|message| ConfigError::Invalid(format!("ANALYSIS_SERVICE_URL: {message}")))
            })
            .transpose()?;

        let max_attempts = ranged(&lookup, "ANALYSIS_MAX_ATTEMPTS", "3", 1..=10)?;
        let backoff_base_secs = ranged(&lookup, "ANALYSIS_BACKOFF_BASE_SECS", "60", 1..=3_600)?;
        let concurrency = ranged(&lookup, "ANALYSIS_WORKER_CONCURRENCY", "4", 1..=64)?;
        let poll_interval_ms = ranged(&lookup, "ANALYSIS_POLL_INTERVAL_MS", "1000", 50..=60_000)?;

        // A lease must outlive the longest possible call.
        let lease_timeout = Duration::from_secs(analysis_timeout_secs + 30);
        let queue = QueueConfig::default()
            .with_max_attempts(u32::try_from(max_attempts).unwrap_or(u32::MAX))
            .with_backoff_base(Duration::from_secs(backoff_base_secs))
            .with_concurrency(usize::try_from(concurrency).unwrap_or(1))
            .with_poll_interval(Duration::from_millis(poll_interval_ms))
            .with_lease_timeout(lease_timeout);

        Ok(Self {
            bind_addr,
            database_path,
            jwt_secret,
            auth_clock_skew: Duration::from_secs(auth_clock_skew_secs),
            analysis,
            queue,
        })
    }
}

/// Parse an integer variable (or its default) and check it lies in `range`.
fn ranged(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: &str,
    range: std::ops::RangeInclusive<u64>,
) -> Result<u64, ConfigError> {
    let invalid = || {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    };
    let value = value_or_default(lookup, name, default)
        .parse::<u64>()
        .map_err(|_| invalid())?;
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(invalid())
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
