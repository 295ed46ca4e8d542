//! Centralized default constants for tributary.
//!
//! **This module is the single source of truth** for shared default values.
//! Config structs in the other crates build their `Default` impls from
//! these constants and let environment variables override them.
//!
//! Organized by component. When adding new constants, place them in the
//! appropriate section.

// =============================================================================
// SOURCE REFRESH SCHEDULER
// =============================================================================

/// Retry delay after the first consecutive failure, in minutes.
pub const SOURCE_BASE_RETRY_MINUTES: i64 = 15;

/// Upper bound on the retry delay, in minutes.
pub const SOURCE_MAX_BACKOFF_MINUTES: i64 = 60;

/// Consecutive failures after which a source is moved to `ERROR`.
pub const SOURCE_DISABLE_THRESHOLD: i32 = 10;

/// Refresh interval assigned to sources that do not carry their own.
pub const SOURCE_REFRESH_INTERVAL_MINUTES: i32 = 60;

/// Maximum sources re-enqueued by one due-source sweep.
pub const SOURCE_SWEEP_LIMIT: i64 = 100;

/// Interval between due-source sweeps, in seconds.
pub const SOURCE_SWEEP_INTERVAL_SECS: u64 = 300;

/// Floor for a schedule lock TTL when the computed delay is zero.
pub const SCHEDULE_LOCK_MIN_TTL_SECS: u64 = 5;

// =============================================================================
// LOCKS
// =============================================================================

/// TTL of a task lock in seconds. Must exceed [`TASK_TIMEOUT_SECS`].
pub const LOCK_TTL_SECS: u64 = 180;

/// Key prefix for every lock written to the coordination store.
pub const LOCK_KEY_PREFIX: &str = "lock:";

// =============================================================================
// RATE LIMITING
// =============================================================================

/// Minimum spacing between requests to the same domain, in milliseconds.
pub const RATE_LIMIT_MIN_INTERVAL_MS: u64 = 1000;

/// Key prefix for per-domain rate limit markers.
pub const RATE_LIMIT_KEY_PREFIX: &str = "ratelimit:";

/// Bucket used for URLs whose domain cannot be determined.
pub const RATE_LIMIT_GLOBAL_BUCKET: &str = "_global";

// =============================================================================
// TASK QUEUE / WORKER
// =============================================================================

/// Hard execution time limit for a single task, in seconds.
pub const TASK_TIMEOUT_SECS: u64 = 120;

/// Maximum queue-level retries before a task is dead-lettered.
pub const TASK_MAX_RETRIES: i32 = 3;

/// First queue-level retry delay, in seconds.
pub const TASK_RETRY_BASE_SECS: u64 = 30;

/// Upper bound on the queue-level retry delay, in seconds.
pub const TASK_RETRY_MAX_SECS: u64 = 3600;

/// Fraction of the retry delay used as random jitter.
pub const TASK_RETRY_JITTER: f64 = 0.1;

/// Default polling interval when the queue is empty, in milliseconds.
pub const TASK_POLL_INTERVAL_MS: u64 = 1000;

/// Default maximum concurrent tasks per worker.
pub const TASK_MAX_CONCURRENT: usize = 4;

/// A running task older than this is assumed orphaned and requeued.
pub const TASK_STALE_AFTER_SECS: u64 = 600;

/// Broadcast channel capacity for worker events.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Default page size for dead-letter listings.
pub const DEAD_LETTER_PAGE_LIMIT: i64 = 50;

// =============================================================================
// PIPELINE
// =============================================================================

/// Minimum age of a failed stage before the sweep retries it, in minutes.
pub const PIPELINE_RETRY_COOLDOWN_MINUTES: i64 = 30;

/// Minutes an unset stage may wait on its queued task before the sweep
/// treats the enqueue as lost.
pub const PIPELINE_UNSET_GRACE_MINUTES: i64 = 10;

/// Stage attempts after which a failed stage is left alone.
pub const PIPELINE_MAX_STAGE_ATTEMPTS: i32 = 3;

/// Maximum items re-enqueued per stage by one sweep.
pub const PIPELINE_SWEEP_LIMIT: i64 = 200;

/// Interval between compensatory pipeline sweeps, in seconds.
pub const PIPELINE_SWEEP_INTERVAL_SECS: u64 = 600;

/// Maximum images captioned per article.
pub const PIPELINE_MAX_IMAGES: usize = 8;

// =============================================================================
// CHUNKING
// =============================================================================

/// Maximum characters per chunk for text splitting.
pub const CHUNK_SIZE: usize = 1000;

/// Overlap characters between adjacent chunks.
pub const CHUNK_OVERLAP: usize = 100;

// =============================================================================
// BATCH SYNC
// =============================================================================

/// Lifetime of batch bookkeeping keys, in seconds.
pub const BATCH_STATE_TTL_SECS: u64 = 86_400;

// =============================================================================
// INFERENCE
// =============================================================================

/// Default Ollama endpoint.
pub const OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// Default embedding model name (Ollama).
pub const EMBED_MODEL: &str = "nomic-embed-text";

/// Default embedding vector dimension for nomic-embed-text.
pub const EMBED_DIMENSION: usize = 768;

/// Default generation model used for repository analysis.
pub const GEN_MODEL: &str = "qwen3:8b";

/// Timeout for embedding requests (seconds).
pub const EMBED_TIMEOUT_SECS: u64 = 30;

/// Timeout for generation requests (seconds).
pub const GEN_TIMEOUT_SECS: u64 = 90;

/// Timeout for vision requests (seconds).
pub const VISION_TIMEOUT_SECS: u64 = 90;

/// Environment variable naming the vision model. Unset disables captioning.
pub const ENV_OLLAMA_VISION_MODEL: &str = "OLLAMA_VISION_MODEL";

// =============================================================================
// HTTP
// =============================================================================

/// Timeout for feed and asset downloads (seconds).
pub const FETCH_TIMEOUT_SECS: u64 = 30;

/// User agent sent with every outbound request.
pub const USER_AGENT: &str = concat!("tributary/", env!("CARGO_PKG_VERSION"));

/// Default GitHub REST API base URL.
pub const GITHUB_API_URL: &str = "https://api.github.com";

/// Page size used when listing starred repositories.
pub const GITHUB_PAGE_SIZE: usize = 100;

/// README text kept per repository (bytes).
pub const GITHUB_README_MAX_BYTES: usize = 8000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_ttl_exceeds_task_timeout() {
        assert!(LOCK_TTL_SECS > TASK_TIMEOUT_SECS);
    }

    #[test]
    fn backoff_cap_is_above_base() {
        assert!(SOURCE_MAX_BACKOFF_MINUTES >= SOURCE_BASE_RETRY_MINUTES);
        assert!(TASK_RETRY_MAX_SECS >= TASK_RETRY_BASE_SECS);
    }

    #[test]
    fn chunk_overlap_smaller_than_chunk() {
        assert!(CHUNK_OVERLAP < CHUNK_SIZE);
    }
}
