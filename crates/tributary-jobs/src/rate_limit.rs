//! Per-domain request spacing shared by every worker process.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Url;
use tokio::time::Instant;
use tracing::{instrument, trace, warn};

use tributary_core::{defaults, CoordinationStore, Result};

/// Fallback sleep when a marker exists but reports no TTL.
const MARKER_POLL: Duration = Duration::from_millis(10);

/// Configuration for [`DomainRateLimiter`].
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Minimum spacing between two requests to the same domain.
    pub min_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(defaults::RATE_LIMIT_MIN_INTERVAL_MS),
        }
    }
}

impl RateLimitConfig {
    /// Reads `RATE_LIMIT_MIN_INTERVAL_MS` (default `1000`).
    pub fn from_env() -> Self {
        let ms = std::env::var("RATE_LIMIT_MIN_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::RATE_LIMIT_MIN_INTERVAL_MS);
        Self {
            min_interval: Duration::from_millis(ms.max(1)),
        }
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }
}

/// Enforces a floor on request spacing per domain.
///
/// A marker `ratelimit:{domain}` with TTL = `min_interval` is written with
/// set-if-absent before every request. While the marker exists the caller
/// sleeps for its remaining lifetime and tries again, so the floor holds
/// across processes, not only within one.
#[derive(Clone)]
pub struct DomainRateLimiter {
    store: Arc<dyn CoordinationStore>,
    config: RateLimitConfig,
}

impl DomainRateLimiter {
    pub fn new(store: Arc<dyn CoordinationStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn min_interval(&self) -> Duration {
        self.config.min_interval
    }

    /// Bucket for `url`: its lowercased host, or the global bucket when the
    /// URL cannot be parsed.
    pub fn domain_of(url: &str) -> String {
        match Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_lowercase)) {
            Some(host) => host,
            None => {
                warn!(
                    subsystem = "jobs",
                    component = "rate_limiter",
                    url,
                    "Cannot determine domain, using global bucket"
                );
                defaults::RATE_LIMIT_GLOBAL_BUCKET.to_string()
            }
        }
    }

    /// Wait until a request to `url`'s domain is allowed, then record it.
    /// Returns how long the caller waited.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "rate_limiter", op = "wait_for_domain"))]
    pub async fn wait_for_domain(&self, url: &str) -> Result<Duration> {
        let domain = Self::domain_of(url);
        let key = format!("{}{domain}", defaults::RATE_LIMIT_KEY_PREFIX);
        let start = Instant::now();

        loop {
            let marker = Utc::now().timestamp_millis().to_string();
            if self
                .store
                .set_if_absent(&key, &marker, self.config.min_interval)
                .await?
            {
                let waited = start.elapsed();
                trace!(%domain, duration_ms = waited.as_millis() as u64, "Request slot granted");
                return Ok(waited);
            }

            let remaining = self
                .store
                .time_to_live(&key)
                .await?
                .filter(|d| !d.is_zero())
                .unwrap_or(MARKER_POLL);
            trace!(%domain, duration_ms = remaining.as_millis() as u64, "Domain busy, waiting");
            tokio::time::sleep(remaining).await;
        }
    }
}
