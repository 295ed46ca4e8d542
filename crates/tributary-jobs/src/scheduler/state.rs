//! Source state machine, independent of the queue.
//!
//! `ACTIVE --success--> ACTIVE`, `ACTIVE --failure (n < threshold)--> ACTIVE`
//! with `next_fetch_at` pushed out, `ACTIVE --failure (n >= threshold)-->
//! ERROR`. An `ERROR` source only runs again when forced; a success then
//! returns it to `ACTIVE`.

use std::time::Duration;

use chrono::{DateTime, Utc};

use tributary_core::{
    defaults, CacheValidators, FetchStatus, Source, SourceStatus, SourceUpdate,
};

/// Backoff and disablement parameters of the refresh scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay after the first consecutive failure.
    pub base_retry: Duration,
    /// Upper bound on the failure delay.
    pub max_backoff: Duration,
    /// Consecutive failures after which a source moves to `ERROR`.
    pub disable_threshold: i32,
    /// TTL of the `feed:{id}` task lock. Must exceed the task time limit.
    pub lock_ttl: Duration,
    /// Sources re-enqueued per sweep.
    pub sweep_limit: i64,
    /// Interval between due-source sweeps (used by the beat).
    pub sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_retry: Duration::from_secs(defaults::SOURCE_BASE_RETRY_MINUTES as u64 * 60),
            max_backoff: Duration::from_secs(defaults::SOURCE_MAX_BACKOFF_MINUTES as u64 * 60),
            disable_threshold: defaults::SOURCE_DISABLE_THRESHOLD,
            lock_ttl: Duration::from_secs(defaults::LOCK_TTL_SECS),
            sweep_limit: defaults::SOURCE_SWEEP_LIMIT,
            sweep_interval: Duration::from_secs(defaults::SOURCE_SWEEP_INTERVAL_SECS),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

impl SchedulerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `SOURCE_BASE_RETRY_MINUTES` | `15` |
    /// | `SOURCE_MAX_BACKOFF_MINUTES` | `60` |
    /// | `SOURCE_DISABLE_THRESHOLD` | `10` |
    /// | `SOURCE_LOCK_TTL_SECS` | `180` |
    /// | `SOURCE_SWEEP_LIMIT` | `100` |
    /// | `SOURCE_SWEEP_INTERVAL_SECS` | `300` |
    pub fn from_env() -> Self {
        let d = Self::default();
        let minutes = |name: &str, default: Duration| {
            env_parse::<u64>(name)
                .map(|m| Duration::from_secs(m.max(1) * 60))
                .unwrap_or(default)
        };
        Self {
            base_retry: minutes("SOURCE_BASE_RETRY_MINUTES", d.base_retry),
            max_backoff: minutes("SOURCE_MAX_BACKOFF_MINUTES", d.max_backoff),
            disable_threshold: env_parse("SOURCE_DISABLE_THRESHOLD")
                .unwrap_or(d.disable_threshold)
                .max(1),
            lock_ttl: env_parse::<u64>("SOURCE_LOCK_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.lock_ttl),
            sweep_limit: env_parse("SOURCE_SWEEP_LIMIT").unwrap_or(d.sweep_limit),
            sweep_interval: env_parse::<u64>("SOURCE_SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.sweep_interval),
        }
    }

    pub fn with_backoff(mut self, base_retry: Duration, max_backoff: Duration) -> Self {
        self.base_retry = base_retry;
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_disable_threshold(mut self, threshold: i32) -> Self {
        self.disable_threshold = threshold;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }
}

/// Delay before the next attempt after `consecutive_failures` failures:
/// `min(max_backoff, base_retry * 2^(n-1))`.
pub fn retry_delay(consecutive_failures: i32, config: &SchedulerConfig) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).clamp(0, 30) as u32;
    config
        .base_retry
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(config.max_backoff)
}

/// What one refresh attempt observed.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// New content was fetched; `new_items` of it were not seen before.
    Fetched {
        new_items: usize,
        validators: CacheValidators,
    },
    /// The server confirmed the stored copy is current.
    NotModified,
    /// The fetch failed.
    Failed { error: String },
}

impl RefreshOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, RefreshOutcome::Failed { .. })
    }
}

/// Result of applying an outcome to a source.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Columns to persist.
    pub update: SourceUpdate,
    /// Delay of the successor run; `None` stops the chain.
    pub next_delay: Option<Duration>,
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Apply `outcome` to `source` at `now`.
pub fn transition(
    source: &Source,
    outcome: &RefreshOutcome,
    config: &SchedulerConfig,
    now: DateTime<Utc>,
) -> Transition {
    match outcome {
        RefreshOutcome::Fetched { .. } | RefreshOutcome::NotModified => {
            let delay = source.refresh_interval();
            let (last_fetch_status, validators) = match outcome {
                RefreshOutcome::Fetched { validators, .. } => {
                    (FetchStatus::Success, Some(validators.clone()))
                }
                _ => (FetchStatus::NotModified, None),
            };
            Transition {
                update: SourceUpdate {
                    status: SourceStatus::Active,
                    error_count: 0,
                    last_fetch_status,
                    last_fetch_error: None,
                    last_fetched_at: now,
                    next_fetch_at: Some(after(now, delay)),
                    validators,
                },
                next_delay: Some(delay),
            }
        }
        RefreshOutcome::Failed { error } => {
            let failures = source.error_count.saturating_add(1);
            let delay = retry_delay(failures, config);
            let disabled = failures >= config.disable_threshold;
            Transition {
                update: SourceUpdate {
                    status: if disabled {
                        SourceStatus::Error
                    } else {
                        SourceStatus::Active
                    },
                    error_count: failures,
                    last_fetch_status: FetchStatus::Failed,
                    last_fetch_error: Some(error.clone()),
                    last_fetched_at: now,
                    next_fetch_at: Some(after(now, delay)),
                    validators: None,
                },
                next_delay: (!disabled).then_some(delay),
            }
        }
    }
}
