//! Structured logging schema and field name constants for tributary.
//!
//! All crates use these names for structured `tracing` fields so that log
//! aggregation can query a task, source or item across every component.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Requires operator attention (dead-lettered task, lost bookkeeping) |
//! | WARN  | Recoverable issue (retry scheduled, fallback bucket used) |
//! | INFO  | Lifecycle events, task and stage completions |
//! | DEBUG | Decision points (lock busy, precondition unmet, skip reasons) |
//! | TRACE | Per-item iteration (individual images, chunks, members) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "db", "inference", "jobs", "worker"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "scheduler", "pipeline", "batch", "rate_limiter", "lock"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "refresh", "claim_next", "acquire", "sweep"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Task envelope UUID.
pub const TASK_ID: &str = "task_id";

/// Task name (`TaskKind` in snake_case).
pub const TASK_KIND: &str = "task_kind";

/// Queue lane ("high" or "default").
pub const LANE: &str = "lane";

/// Source UUID.
pub const SOURCE_ID: &str = "source_id";

/// Work item UUID.
pub const ITEM_ID: &str = "item_id";

/// Pipeline stage name.
pub const STAGE: &str = "stage";

/// Batch UUID.
pub const BATCH_ID: &str = "batch_id";

/// Coordination store key being operated on.
pub const LOCK_KEY: &str = "lock_key";

/// Rate limiter domain bucket.
pub const DOMAIN: &str = "domain";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Delay until the next run, in seconds.
pub const DELAY_SECS: &str = "delay_secs";

/// Attempt counter (queue retries or stage attempts).
pub const ATTEMPT: &str = "attempt";

/// Consecutive failure counter on a source.
pub const ERROR_COUNT: &str = "error_count";

/// Number of entities produced or touched.
pub const RESULT_COUNT: &str = "result_count";

/// Number of input texts sent to an embedding model.
pub const INPUT_COUNT: &str = "input_count";

// ─── Inference fields ──────────────────────────────────────────────────────

/// Model name used for inference.
pub const MODEL: &str = "model";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

/// Slow operation threshold exceeded.
pub const SLOW: &str = "slow";
