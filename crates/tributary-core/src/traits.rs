//! Core traits for tributary abstractions.
//!
//! Every external collaborator of the scheduling core sits behind one of
//! these traits: persistence, the task queue, the coordination store,
//! content fetching, AI capabilities and the repository catalog.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// COORDINATION STORE
// =============================================================================

/// Shared key-value store with atomic set-if-absent and TTLs.
///
/// Locks, rate limit markers and batch counters all live here. Every
/// operation must be atomic on the backing store; implementations never
/// read-then-write from the client side.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Set `key` to `value` only if it does not exist. Returns whether the
    /// key was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Read a key.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Unconditionally write a key, optionally with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete `key` only if its current value equals `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;

    /// Remaining lifetime of a key. `None` if absent or without expiry.
    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>>;

    /// Atomically add `delta` to an integer key (created at 0) and return
    /// the new value.
    async fn increment(&self, key: &str, delta: i64) -> Result<i64>;

    /// Set a TTL on an existing key. Returns whether the key existed.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;
}

// =============================================================================
// TASK QUEUE
// =============================================================================

/// Durable at-least-once task queue with delayed delivery and two lanes.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a task.
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Uuid>;

    /// Enqueue unless a pending or running task already carries the same
    /// `dedup_key`. Requests without a key are always enqueued.
    async fn enqueue_unique(&self, request: EnqueueRequest) -> Result<Option<Uuid>>;

    /// Claim the next claimable task of one of `kinds` (empty = any):
    /// ETA reached, high lane first, then oldest ETA.
    async fn claim_next(&self, kinds: &[TaskKind]) -> Result<Option<TaskEnvelope>>;

    /// Mark a task completed.
    async fn complete(&self, id: Uuid, result: Option<JsonValue>) -> Result<()>;

    /// Mark a task rejected. Rejected tasks are not retried.
    async fn reject(&self, id: Uuid, reason: &str) -> Result<()>;

    /// Put a failed task back with `delay`, or dead-letter it when its
    /// retries are exhausted. Returns the resulting status.
    async fn retry_or_dead(&self, id: Uuid, error: &str, delay: Duration) -> Result<TaskStatus>;

    /// Dead-letter a task immediately.
    async fn dead_letter(&self, id: Uuid, error: &str) -> Result<()>;

    /// Return running tasks older than `older_than` to pending (or dead when
    /// out of retries). Returns the number of tasks touched.
    async fn requeue_stale(&self, older_than: Duration) -> Result<u64>;

    /// Inspect a task by id.
    async fn get(&self, id: Uuid) -> Result<Option<TaskEnvelope>>;

    /// Most recently dead-lettered tasks.
    async fn list_dead(&self, limit: i64) -> Result<Vec<TaskEnvelope>>;

    /// Counts per status.
    async fn stats(&self) -> Result<QueueStats>;

    /// Notified whenever a task is enqueued, so idle workers can wake early.
    fn wake_signal(&self) -> Arc<Notify>;
}

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Storage for sources and their scheduling columns.
#[async_trait]
pub trait SourceRepository: Send + Sync {
    /// Register a new active source, due immediately.
    async fn create(&self, request: CreateSourceRequest) -> Result<Uuid>;

    async fn get(&self, id: Uuid) -> Result<Option<Source>>;

    /// Persist the outcome of one refresh attempt.
    async fn record_attempt(&self, id: Uuid, update: &SourceUpdate) -> Result<()>;

    /// Active sources whose `next_fetch_at` is unset or not after `now`,
    /// oldest first.
    async fn due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Source>>;

    /// Manual status change. Moving to `Active` clears the error counter.
    async fn set_status(&self, id: Uuid, status: SourceStatus) -> Result<()>;
}

/// Storage for work items, stage flags and derived data.
#[async_trait]
pub trait ItemRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<WorkItem>>;

    /// Insert items not yet known for `source_id` (by external id).
    /// Returns the ids of the inserted items only.
    async fn insert_new_items(&self, source_id: Uuid, items: &[IncomingItem])
        -> Result<Vec<Uuid>>;

    /// Record an attempt of `stage`: sets the flag, the attempt time, bumps
    /// the attempt counter and stores the error (cleared on success).
    async fn record_stage(
        &self,
        id: Uuid,
        stage: Stage,
        status: TriState,
        error: Option<&str>,
    ) -> Result<()>;

    /// Return a stage to `Unset` with a fresh attempt counter.
    async fn reset_stage(&self, id: Uuid, stage: Stage) -> Result<()>;

    /// Items of `stage.kind()` that need `stage` re-run: unset with the
    /// prerequisite satisfied before `unset_before` (item creation for a
    /// stage without prerequisite), or failed before `failed_before` with
    /// fewer than `max_attempts` attempts.
    async fn find_stalled(
        &self,
        stage: Stage,
        unset_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<Uuid>>;

    async fn image_captions(&self, id: Uuid) -> Result<Vec<ImageCaption>>;

    /// Replace the stored captions of an item.
    async fn store_image_captions(&self, id: Uuid, captions: &[ImageCaption]) -> Result<()>;

    /// Replace the stored chunks of an item.
    async fn replace_chunks(&self, id: Uuid, chunks: Vec<EmbeddedChunk>) -> Result<()>;

    /// Store the whole-document embedding of an item.
    async fn store_item_embedding(&self, id: Uuid, embedding: Vector) -> Result<()>;

    /// Find or create the repository item for `repo`. Returns its id and
    /// whether it was created.
    async fn upsert_repository(&self, repo: &RepoRef) -> Result<(Uuid, bool)>;

    /// Link an article to repositories, creating missing ones. Returns the
    /// ids of newly created repository items.
    async fn link_repositories(&self, article_id: Uuid, repos: &[RepoRef]) -> Result<Vec<Uuid>>;

    /// Store fetched details and analysis on a repository item and reset
    /// its embedding stage so it is embedded again.
    async fn store_repository_details(
        &self,
        id: Uuid,
        details: &RepoDetails,
        analysis: Option<&Analysis>,
    ) -> Result<()>;
}

// =============================================================================
// FETCHING
// =============================================================================

/// Retrieves source documents and binary assets.
///
/// Failures surface as [`crate::Error::Fetch`] so callers can tell transport
/// problems from unparseable content.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Conditional fetch using the stored validators.
    async fn fetch(&self, url: &str, validators: &CacheValidators) -> Result<FetchOutcome>;

    /// Download a binary resource.
    async fn fetch_asset(&self, url: &str) -> Result<Asset>;
}

/// Lists and describes code repositories on a hosting service.
#[async_trait]
pub trait RepoCatalog: Send + Sync {
    /// Repositories starred by `account`.
    async fn list_starred(&self, account: &str) -> Result<Vec<RepoRef>>;

    /// Description, topics and README of one repository.
    async fn fetch_details(&self, repo: &RepoRef) -> Result<RepoDetails>;
}

// =============================================================================
// AI CAPABILITIES
// =============================================================================

/// Backend for generating text embeddings.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed texts, one vector per input, in order.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>>;

    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;
}

/// Backend for describing images.
#[async_trait]
pub trait Captioner: Send + Sync {
    async fn caption(&self, image: &[u8], mime_type: &str) -> Result<String>;

    fn model_name(&self) -> &str;
}

/// Backend for structured analysis of free text.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, text: &str) -> Result<Analysis>;

    fn model_name(&self) -> &str;
}
