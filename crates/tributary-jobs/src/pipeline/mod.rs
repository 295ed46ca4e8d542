//! Pipeline coordinator: per-item stage chaining with a compensatory sweep.
//!
//! Every work item moves through the stages of its kind
//! (`images -> rag -> repo_links` for articles, `repo_embedding` for
//! repositories). A stage runs only when its prerequisite flag is
//! `success`, writes `success` or `failed` back to its own flag, and on
//! success enqueues the next stage for the same item. Items proceed
//! independently; there is no batch-wide barrier.
//!
//! Chained enqueues can be lost (crash between the flag write and the
//! enqueue). [`PipelineCoordinator::sweep`] recovers them by querying for
//! items whose next stage is still `unset` behind a satisfied prerequisite,
//! or `failed` and older than the retry cooldown with attempts left.

pub mod chunking;
pub mod executors;
pub mod handlers;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use tributary_core::{
    defaults, EnqueueRequest, Error, ItemKind, ItemRepository, Result, Stage, TaskQueue, TriState,
    WorkItem,
};

use crate::lock::DistributedLock;
use chunking::ChunkerConfig;

pub use executors::{ImageStage, RagStage, RepoEmbeddingStage, RepoLinkStage};
pub use handlers::{StageTaskHandler, SweepStalledStagesHandler};

/// Configuration for the pipeline coordinator and its executors.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Minimum age of a failed stage before the sweep retries it.
    pub retry_cooldown: Duration,
    /// Time an unset stage is left to its queued task before the sweep
    /// re-enqueues it.
    pub unset_grace: Duration,
    /// Stage attempts after which a failed stage is left for manual action.
    pub max_stage_attempts: i32,
    /// TTL of the per-item task lock. Must exceed the task time limit.
    pub lock_ttl: Duration,
    /// Items re-enqueued per stage and sweep.
    pub sweep_limit: i64,
    /// Interval between sweeps (used by the beat).
    pub sweep_interval: Duration,
    pub chunker: ChunkerConfig,
    /// Images captioned per article.
    pub max_images: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_cooldown: Duration::from_secs(defaults::PIPELINE_RETRY_COOLDOWN_MINUTES as u64 * 60),
            unset_grace: Duration::from_secs(defaults::PIPELINE_UNSET_GRACE_MINUTES as u64 * 60),
            max_stage_attempts: defaults::PIPELINE_MAX_STAGE_ATTEMPTS,
            lock_ttl: Duration::from_secs(defaults::LOCK_TTL_SECS),
            sweep_limit: defaults::PIPELINE_SWEEP_LIMIT,
            sweep_interval: Duration::from_secs(defaults::PIPELINE_SWEEP_INTERVAL_SECS),
            chunker: ChunkerConfig::default(),
            max_images: defaults::PIPELINE_MAX_IMAGES,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

impl PipelineConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `PIPELINE_RETRY_COOLDOWN_MINUTES` | `30` |
    /// | `PIPELINE_UNSET_GRACE_MINUTES` | `10` |
    /// | `PIPELINE_MAX_STAGE_ATTEMPTS` | `3` |
    /// | `PIPELINE_LOCK_TTL_SECS` | `180` |
    /// | `PIPELINE_SWEEP_LIMIT` | `200` |
    /// | `PIPELINE_SWEEP_INTERVAL_SECS` | `600` |
    /// | `CHUNK_SIZE` | `1000` |
    /// | `CHUNK_OVERLAP` | `100` |
    pub fn from_env() -> Self {
        let d = Self::default();
        let max_chunk_size = env_parse("CHUNK_SIZE").unwrap_or(d.chunker.max_chunk_size).max(1);
        Self {
            retry_cooldown: env_parse::<u64>("PIPELINE_RETRY_COOLDOWN_MINUTES")
                .map(|m| Duration::from_secs(m * 60))
                .unwrap_or(d.retry_cooldown),
            unset_grace: env_parse::<u64>("PIPELINE_UNSET_GRACE_MINUTES")
                .map(|m| Duration::from_secs(m * 60))
                .unwrap_or(d.unset_grace),
            max_stage_attempts: env_parse("PIPELINE_MAX_STAGE_ATTEMPTS")
                .unwrap_or(d.max_stage_attempts)
                .max(1),
            lock_ttl: env_parse::<u64>("PIPELINE_LOCK_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.lock_ttl),
            sweep_limit: env_parse("PIPELINE_SWEEP_LIMIT").unwrap_or(d.sweep_limit),
            sweep_interval: env_parse::<u64>("PIPELINE_SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.sweep_interval),
            chunker: ChunkerConfig {
                max_chunk_size,
                overlap: env_parse("CHUNK_OVERLAP")
                    .unwrap_or(d.chunker.overlap)
                    .min(max_chunk_size - 1),
            },
            max_images: d.max_images,
        }
    }

    pub fn with_retry_cooldown(mut self, cooldown: Duration) -> Self {
        self.retry_cooldown = cooldown;
        self
    }

    pub fn with_unset_grace(mut self, grace: Duration) -> Self {
        self.unset_grace = grace;
        self
    }

    pub fn with_max_stage_attempts(mut self, attempts: i32) -> Self {
        self.max_stage_attempts = attempts;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_chunker(mut self, chunker: ChunkerConfig) -> Self {
        self.chunker = chunker;
        self
    }
}

/// Enqueue `stage` for `item_id` unless one is already pending or running.
/// Returns the task id when a task was created.
pub async fn enqueue_stage(
    queue: &dyn TaskQueue,
    stage: Stage,
    item_id: Uuid,
    delay: Duration,
) -> Result<Option<Uuid>> {
    let request = EnqueueRequest::new(stage.task_kind(), json!({ "item_id": item_id }))
        .with_delay(delay)
        .with_dedup_key(stage.dedup_key(item_id));
    queue.enqueue_unique(request).await
}

/// Start the pipeline for freshly created items of `kind`.
pub async fn start_items(queue: &dyn TaskQueue, kind: ItemKind, item_ids: &[Uuid]) -> Result<usize> {
    let first = Stage::first_for(kind);
    let mut started = 0;
    for &id in item_ids {
        if enqueue_stage(queue, first, id, Duration::ZERO).await?.is_some() {
            started += 1;
        }
    }
    Ok(started)
}

/// What a successful stage produced.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    /// Summary stored as the task result.
    pub detail: JsonValue,
    /// Stages to start on other items (e.g. repositories found in an article).
    pub follow_ups: Vec<(Stage, Uuid)>,
}

impl StageOutput {
    pub fn new(detail: JsonValue) -> Self {
        Self {
            detail,
            follow_ups: Vec::new(),
        }
    }
}

/// The work of one stage.
///
/// Executors do not touch the stage flags; the coordinator records the
/// outcome. Any error returned here marks the stage `failed`.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn stage(&self) -> Stage;

    async fn run(&self, item: &WorkItem) -> Result<StageOutput>;
}

/// Outcome of [`PipelineCoordinator::run_stage`].
#[derive(Debug, Clone, PartialEq)]
pub enum StageRun {
    /// Another delivery holds the item lock.
    Locked,
    /// Preconditions not met; nothing was run.
    Skipped(String),
    /// The stage ran and its flag is `success`.
    Succeeded { detail: JsonValue, follow_ups: usize },
    /// The stage ran and its flag is `failed`.
    Failed(String),
}

/// Runs stages under the item lock and chains successors.
pub struct PipelineCoordinator {
    items: Arc<dyn ItemRepository>,
    queue: Arc<dyn TaskQueue>,
    lock: DistributedLock,
    executors: HashMap<Stage, Arc<dyn StageExecutor>>,
    config: PipelineConfig,
}

impl PipelineCoordinator {
    pub fn new(
        items: Arc<dyn ItemRepository>,
        queue: Arc<dyn TaskQueue>,
        lock: DistributedLock,
        config: PipelineConfig,
    ) -> Self {
        Self {
            items,
            queue,
            lock,
            executors: HashMap::new(),
            config,
        }
    }

    /// Register the executor for its stage.
    pub fn with_executor<E: StageExecutor + 'static>(mut self, executor: E) -> Self {
        self.executors.insert(executor.stage(), Arc::new(executor));
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Stages with a registered executor.
    pub fn stages(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|s| self.executors.contains_key(s))
            .collect()
    }

    /// Run `stage` for `item_id` under the item lock.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "pipeline", op = "run_stage"))]
    pub async fn run_stage(&self, stage: Stage, item_id: Uuid, holder: &str) -> Result<StageRun> {
        let resource = WorkItem::resource_key(item_id);
        if !self
            .lock
            .acquire(&resource, self.config.lock_ttl, holder)
            .await?
        {
            return Ok(StageRun::Locked);
        }

        let result = self.run_locked(stage, item_id).await;

        if let Err(e) = self.lock.release(&resource, holder).await {
            warn!(error = %e, "Failed to release item lock, it will expire");
        }
        result
    }

    async fn run_locked(&self, stage: Stage, item_id: Uuid) -> Result<StageRun> {
        let Some(item) = self.items.get(item_id).await? else {
            return Ok(StageRun::Skipped("item not found".into()));
        };
        if item.kind != stage.kind() {
            return Ok(StageRun::Skipped(format!(
                "stage {stage} does not apply to {} items",
                item.kind.as_str()
            )));
        }

        let state = item.stage(stage);
        if state.status == TriState::Success {
            return Ok(StageRun::Skipped("already succeeded".into()));
        }
        if let Some(prerequisite) = stage.prerequisite() {
            if item.stage(prerequisite).status != TriState::Success {
                debug!(%prerequisite, "Prerequisite not satisfied");
                return Ok(StageRun::Skipped(format!(
                    "prerequisite {prerequisite} not satisfied"
                )));
            }
        }
        if state.status == TriState::Failed && state.attempts >= self.config.max_stage_attempts {
            return Ok(StageRun::Skipped(format!(
                "attempts exhausted ({})",
                state.attempts
            )));
        }

        let executor = self
            .executors
            .get(&stage)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no executor registered for stage {stage}")))?;

        match executor.run(&item).await {
            Ok(output) => {
                self.items
                    .record_stage(item_id, stage, TriState::Success, None)
                    .await?;

                let follow_ups = output.follow_ups.len();
                for (follow_stage, follow_id) in output.follow_ups {
                    enqueue_stage(self.queue.as_ref(), follow_stage, follow_id, Duration::ZERO)
                        .await?;
                }
                if let Some(next) = stage.next() {
                    enqueue_stage(self.queue.as_ref(), next, item_id, Duration::ZERO).await?;
                }

                info!(follow_ups, "Stage succeeded");
                Ok(StageRun::Succeeded {
                    detail: output.detail,
                    follow_ups,
                })
            }
            Err(e) => {
                let message = e.to_string();
                warn!(attempt = state.attempts + 1, error = %message, "Stage failed");
                self.items
                    .record_stage(item_id, stage, TriState::Failed, Some(&message))
                    .await?;
                Ok(StageRun::Failed(message))
            }
        }
    }

    /// Record a stage run that was cancelled by the task time limit and
    /// free the lock the cancelled run still held. A run whose lock already
    /// expired or changed hands records nothing.
    pub async fn record_timeout(&self, stage: Stage, item_id: Uuid, holder: &str) -> Result<()> {
        let resource = WorkItem::resource_key(item_id);
        if !self.lock.is_held_by(&resource, holder).await? {
            debug!(%stage, %item_id, "Timed-out run no longer owns the item");
            return Ok(());
        }
        warn!(%stage, %item_id, "Stage timed out, marking failed");
        let recorded = self
            .items
            .record_stage(item_id, stage, TriState::Failed, Some("stage timed out"))
            .await;
        self.lock.release(&resource, holder).await?;
        match recorded {
            Err(Error::ItemNotFound(_)) => Ok(()),
            other => other,
        }
    }

    /// Re-enqueue stalled and retryable stages. Returns the number of
    /// tasks created.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "pipeline", op = "sweep"))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let cooldown = chrono::Duration::from_std(self.config.retry_cooldown)
            .map_err(|e| Error::Config(format!("invalid retry cooldown: {e}")))?;
        let failed_before = now - cooldown;
        let grace = chrono::Duration::from_std(self.config.unset_grace)
            .map_err(|e| Error::Config(format!("invalid unset grace: {e}")))?;
        let unset_before = now - grace;

        let mut enqueued = 0;
        for stage in self.stages() {
            let stalled = self
                .items
                .find_stalled(
                    stage,
                    unset_before,
                    failed_before,
                    self.config.max_stage_attempts,
                    self.config.sweep_limit,
                )
                .await?;
            let mut stage_enqueued = 0;
            for id in stalled {
                if enqueue_stage(self.queue.as_ref(), stage, id, Duration::ZERO)
                    .await?
                    .is_some()
                {
                    stage_enqueued += 1;
                }
            }
            if stage_enqueued > 0 {
                info!(%stage, result_count = stage_enqueued, "Re-enqueued stalled stages");
            }
            enqueued += stage_enqueued;
        }
        Ok(enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tributary_core::memory::{MemoryItemRepository, MemoryStore, MemoryTaskQueue};
    use tributary_core::{StageState, TaskKind};

    struct CountingExecutor {
        stage: Stage,
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StageExecutor for CountingExecutor {
        fn stage(&self) -> Stage {
            self.stage
        }

        async fn run(&self, _item: &WorkItem) -> Result<StageOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::Embedding("embedder unavailable".into()))
            } else {
                Ok(StageOutput::new(json!({ "ok": true })))
            }
        }
    }

    struct Fixture {
        items: Arc<MemoryItemRepository>,
        queue: Arc<MemoryTaskQueue>,
        store: Arc<MemoryStore>,
        calls: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        Fixture {
            items: Arc::new(MemoryItemRepository::new()),
            queue: Arc::new(MemoryTaskQueue::new()),
            store: Arc::new(MemoryStore::new()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn coordinator(f: &Fixture, stage: Stage, fail: bool) -> PipelineCoordinator {
        PipelineCoordinator::new(
            f.items.clone(),
            f.queue.clone(),
            DistributedLock::new(f.store.clone()),
            PipelineConfig::default(),
        )
        .with_executor(CountingExecutor {
            stage,
            fail,
            calls: f.calls.clone(),
        })
    }

    fn article(f: &Fixture, stages: &[(Stage, TriState)]) -> Uuid {
        let mut item = MemoryItemRepository::new_item(ItemKind::Article, None, "a");
        for (stage, status) in stages {
            item.stages.insert(
                *stage,
                StageState {
                    status: *status,
                    attempted_at: Some(Utc::now()),
                    attempts: 1,
                    error: None,
                },
            );
        }
        let id = item.id;
        f.items.insert(item);
        id
    }

    #[tokio::test]
    async fn test_success_records_flag_and_chains_next_stage() {
        let f = fixture();
        let id = article(&f, &[(Stage::Images, TriState::Success)]);
        let coordinator = coordinator(&f, Stage::Rag, false);

        let run = coordinator.run_stage(Stage::Rag, id, "h").await.unwrap();
        assert!(matches!(run, StageRun::Succeeded { .. }));

        let item = f.items.get(id).await.unwrap().unwrap();
        assert_eq!(item.stage(Stage::Rag).status, TriState::Success);
        let next = f.queue.pending_of(TaskKind::ExtractRepoLinks);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].dedup_key, Some(Stage::RepoLinks.dedup_key(id)));
        assert!(!coordinator.lock.is_locked(&WorkItem::resource_key(id)).await.unwrap());
    }

    #[tokio::test]
    async fn test_unmet_prerequisite_never_invokes_executor() {
        let f = fixture();
        let id = article(&f, &[]);
        let coordinator = coordinator(&f, Stage::Rag, false);

        let run = coordinator.run_stage(Stage::Rag, id, "h").await.unwrap();
        assert!(matches!(run, StageRun::Skipped(_)));
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            f.items.get(id).await.unwrap().unwrap().stage(Stage::Rag).status,
            TriState::Unset
        );
    }

    #[tokio::test]
    async fn test_failure_writes_failed_flag_without_chaining() {
        let f = fixture();
        let id = article(&f, &[(Stage::Images, TriState::Success)]);
        let coordinator = coordinator(&f, Stage::Rag, true);

        let run = coordinator.run_stage(Stage::Rag, id, "h").await.unwrap();
        assert!(matches!(run, StageRun::Failed(ref m) if m.contains("embedder unavailable")));

        let state = f.items.get(id).await.unwrap().unwrap().stage(Stage::Rag);
        assert_eq!(state.status, TriState::Failed);
        assert_eq!(state.attempts, 1);
        assert!(f.queue.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_attempts_are_left_alone() {
        let f = fixture();
        let id = article(&f, &[(Stage::Images, TriState::Success)]);
        let coordinator = coordinator(&f, Stage::Rag, true);

        for _ in 0..3 {
            coordinator.run_stage(Stage::Rag, id, "h").await.unwrap();
        }
        let run = coordinator.run_stage(Stage::Rag, id, "h").await.unwrap();
        assert!(matches!(run, StageRun::Skipped(ref m) if m.contains("exhausted")));
        assert_eq!(f.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_busy_lock_rejects_second_delivery() {
        let f = fixture();
        let id = article(&f, &[(Stage::Images, TriState::Success)]);
        let coordinator = coordinator(&f, Stage::Rag, false);

        let lock = DistributedLock::new(f.store.clone());
        lock.acquire(&WorkItem::resource_key(id), Duration::from_secs(60), "first")
            .await
            .unwrap();

        let run = coordinator.run_stage(Stage::Rag, id, "second").await.unwrap();
        assert_eq!(run, StageRun::Locked);
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sweep_recovers_lost_enqueue_and_dedups() {
        let f = fixture();
        let id = article(&f, &[(Stage::Images, TriState::Success)]);
        let coordinator = coordinator(&f, Stage::Rag, false);

        let later = Utc::now() + chrono::Duration::minutes(11);
        assert_eq!(coordinator.sweep(later).await.unwrap(), 1);
        assert_eq!(coordinator.sweep(later).await.unwrap(), 0);

        let pending = f.queue.pending_of(TaskKind::ProcessRag);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kwargs["item_id"], json!(id));
    }

    #[tokio::test]
    async fn test_sweep_leaves_freshly_ready_stage_to_its_task() {
        let f = fixture();
        article(&f, &[(Stage::Images, TriState::Success)]);
        let coordinator = coordinator(&f, Stage::Rag, false);

        assert_eq!(coordinator.sweep(Utc::now()).await.unwrap(), 0);
        assert!(f.queue.pending_of(TaskKind::ProcessRag).is_empty());

        let later = Utc::now() + chrono::Duration::minutes(11);
        assert_eq!(coordinator.sweep(later).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sweep_waits_for_cooldown_on_failed_stage() {
        let f = fixture();
        article(
            &f,
            &[(Stage::Images, TriState::Success), (Stage::Rag, TriState::Failed)],
        );
        let coordinator = coordinator(&f, Stage::Rag, false);

        assert_eq!(coordinator.sweep(Utc::now()).await.unwrap(), 0);
        let later = Utc::now() + chrono::Duration::minutes(31);
        assert_eq!(coordinator.sweep(later).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_record_timeout_marks_failed_and_releases_lock() {
        let f = fixture();
        let id = article(&f, &[(Stage::Images, TriState::Success)]);
        let coordinator = coordinator(&f, Stage::Rag, false);
        let resource = WorkItem::resource_key(id);
        coordinator
            .lock
            .acquire(&resource, Duration::from_secs(60), "h")
            .await
            .unwrap();

        coordinator.record_timeout(Stage::Rag, id, "h").await.unwrap();

        let state = f.items.get(id).await.unwrap().unwrap().stage(Stage::Rag);
        assert_eq!(state.status, TriState::Failed);
        assert_eq!(state.error.as_deref(), Some("stage timed out"));
        assert!(!coordinator.lock.is_locked(&resource).await.unwrap());
    }

    #[tokio::test]
    async fn test_record_timeout_ignores_lost_lock() {
        let f = fixture();
        let id = article(&f, &[(Stage::Images, TriState::Success)]);
        let coordinator = coordinator(&f, Stage::Rag, false);
        let resource = WorkItem::resource_key(id);
        coordinator
            .lock
            .acquire(&resource, Duration::from_secs(60), "redelivery")
            .await
            .unwrap();

        coordinator.record_timeout(Stage::Rag, id, "h").await.unwrap();

        let state = f.items.get(id).await.unwrap().unwrap().stage(Stage::Rag);
        assert_eq!(state.status, TriState::Unset);
        assert!(coordinator.lock.is_held_by(&resource, "redelivery").await.unwrap());
    }

    #[test]
    fn test_pipeline_config_default() {
        let config = PipelineConfig::default();
        assert_eq!(config.retry_cooldown, Duration::from_secs(30 * 60));
        assert_eq!(config.unset_grace, Duration::from_secs(10 * 60));
        assert_eq!(config.max_stage_attempts, 3);
        assert!(config.lock_ttl > Duration::from_secs(defaults::TASK_TIMEOUT_SECS));
    }
}
