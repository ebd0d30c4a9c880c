//! Tuning for the analysis dispatch queue and its HTTP client.

use std::time::Duration;

use crate::util::{is_http_url, normalize_text_option};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_BASE_SECS: u64 = 60;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_ANALYSIS_TIMEOUT_SECS: u64 = 300;
/// Request timeout plus headroom, so a live call never looks abandoned.
const DEFAULT_LEASE_TIMEOUT_SECS: u64 = DEFAULT_ANALYSIS_TIMEOUT_SECS + 30;

/// Retry and scheduling policy for analysis dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Attempts before an entry is failed permanently
    pub max_attempts: u32,
    /// Retry delay is `backoff_base * 2^attempts`
    pub backoff_base: Duration,
    pub poll_interval: Duration,
    /// Dispatches running at once, across distinct entities
    pub concurrency: usize,
    /// How long a `processing` lease may be held before recovery reclaims it
    pub lease_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: Duration::from_secs(DEFAULT_BACKOFF_BASE_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            concurrency: DEFAULT_CONCURRENCY,
            lease_timeout: Duration::from_secs(DEFAULT_LEASE_TIMEOUT_SECS),
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub const fn with_backoff_base(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    #[must_use]
    pub const fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    /// Delay before retrying after the attempt numbered `attempts` failed.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor)
    }
}

/// Connection settings for the external analysis service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisClientConfig {
    pub endpoint: String,
    pub timeout: Duration,
}

impl AnalysisClientConfig {
    /// Validate and normalize an endpoint URL.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, String> {
        let endpoint = normalize_text_option(Some(endpoint.into()))
            .ok_or_else(|| "analysis endpoint must not be empty".to_string())?;
        if !is_http_url(&endpoint) {
            return Err("analysis endpoint must include http:// or https://".to_string());
        }
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(DEFAULT_ANALYSIS_TIMEOUT_SECS),
        })
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
