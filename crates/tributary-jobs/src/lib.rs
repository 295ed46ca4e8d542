//! # tributary-jobs
//!
//! Scheduling core for tributary.
//!
//! This crate provides:
//! - A task worker with bounded concurrency, hard timeouts and retry backoff
//! - Distributed locks and schedule guards over a coordination store
//! - Per-domain rate limiting of outbound requests
//! - The self-rescheduling source refresh state machine
//! - The item processing pipeline with a compensatory sweep
//! - Batch fan-out with an exactly-once fan-in callback
//! - A periodic beat for the sweeps
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tributary_jobs::{Beat, DistributedLock, TaskKind, WorkerBuilder, WorkerConfig};
//!
//! let worker = WorkerBuilder::new(queue.clone())
//!     .with_config(WorkerConfig::from_env())
//!     .with_handler(RefreshSourceHandler::new(scheduler.clone()))
//!     .with_handler(SweepDueSourcesHandler::new(scheduler.clone()))
//!     .build()
//!     .await;
//!
//! let handle = worker.start();
//! let beat = Beat::new(queue, DistributedLock::new(store))
//!     .every(Duration::from_secs(300), TaskKind::SweepDueSources)
//!     .start();
//!
//! tokio::signal::ctrl_c().await?;
//! beat.shutdown().await;
//! handle.shutdown().await?;
//! ```

pub mod batch;
pub mod beat;
pub mod fetch;
pub mod github;
pub mod handler;
pub mod lock;
pub mod pipeline;
pub mod rate_limit;
pub mod repo_sync;
pub mod scheduler;
pub mod worker;

// Re-export core types
pub use tributary_core::*;

pub use batch::{BatchConfig, BatchMember, BatchOrchestrator, MemberAck};
pub use beat::{Beat, BeatEntry, BeatHandle};
pub use fetch::{FeedParser, HttpFetcher, JsonFeedParser};
pub use github::GithubCatalog;
pub use handler::{holder_id, NoOpHandler, TaskContext, TaskHandler, TaskResult};
pub use lock::DistributedLock;
pub use pipeline::{
    enqueue_stage, start_items, ImageStage, PipelineConfig, PipelineCoordinator, RagStage,
    RepoEmbeddingStage, RepoLinkStage, StageExecutor, StageOutput, StageRun, StageTaskHandler,
    SweepStalledStagesHandler,
};
pub use rate_limit::{DomainRateLimiter, RateLimitConfig};
pub use repo_sync::{
    start_repo_sync, FinishRepoSyncHandler, SyncRepositoryHandler, SyncStarredReposHandler,
};
pub use scheduler::{
    RefreshOutcome, RefreshReport, RefreshSourceHandler, ScheduleReceipt, ScheduleStatus,
    SchedulerConfig, SourceScheduler, SweepDueSourcesHandler,
};
pub use worker::{RetryPolicy, Worker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};

/// Default maximum queue-level retries for failed tasks.
pub const DEFAULT_MAX_RETRIES: i32 = tributary_core::defaults::TASK_MAX_RETRIES;

/// Default polling interval for task processing (milliseconds).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = tributary_core::defaults::TASK_POLL_INTERVAL_MS;
