//! Starred-repository sync: a batch of per-repository analyses.
//!
//! `sync_starred_repos` lists an account's stars and fans out one
//! `sync_repository` member per repository. Each member fetches details,
//! analyzes them and acknowledges the batch; the last acknowledgement fires
//! `finish_repo_sync`, which queues the repositories for embedding.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use tributary_core::{
    defaults, Analyzer, BatchPhase, EnqueueRequest, ItemRepository, Lane, RepoCatalog, RepoRef,
    Result, Stage, TaskEnvelope, TaskKind, TaskQueue,
};

use crate::batch::{BatchMember, BatchOrchestrator};
use crate::handler::{holder_id, TaskContext, TaskHandler, TaskResult};
use crate::lock::DistributedLock;
use crate::pipeline::enqueue_stage;
use crate::rate_limit::DomainRateLimiter;

/// Open a sync batch for `account` and queue its listing on the high lane.
/// Returns the batch id (for progress polling) and the task id.
pub async fn start_repo_sync(
    batches: &BatchOrchestrator,
    queue: &dyn TaskQueue,
    account: &str,
) -> Result<(Uuid, Uuid)> {
    let batch_id = batches.open().await?;
    let task_id = queue
        .enqueue(
            EnqueueRequest::new(
                TaskKind::SyncStarredRepos,
                json!({ "account": account, "batch_id": batch_id }),
            )
            .with_lane(Lane::High),
        )
        .await?;
    info!(subsystem = "jobs", component = "repo_sync", %batch_id, %task_id, account, "Repository sync started");
    Ok((batch_id, task_id))
}

#[derive(Debug, Deserialize)]
struct SyncStarredKwargs {
    account: String,
    batch_id: Uuid,
}

/// Handler for `sync_starred_repos` (batch phase `fetching`).
pub struct SyncStarredReposHandler {
    catalog: Arc<dyn RepoCatalog>,
    items: Arc<dyn ItemRepository>,
    batches: BatchOrchestrator,
}

impl SyncStarredReposHandler {
    pub fn new(
        catalog: Arc<dyn RepoCatalog>,
        items: Arc<dyn ItemRepository>,
        batches: BatchOrchestrator,
    ) -> Self {
        Self {
            catalog,
            items,
            batches,
        }
    }

    async fn run(&self, kwargs: &SyncStarredKwargs) -> Result<TaskResult> {
        match self.batches.progress(kwargs.batch_id).await? {
            Some(progress) if progress.phase == BatchPhase::Fetching => {}
            Some(progress) => {
                return Ok(TaskResult::Rejected(format!(
                    "batch {} already in phase {}",
                    kwargs.batch_id,
                    progress.phase.as_str()
                )))
            }
            None => {
                return Ok(TaskResult::Rejected(format!(
                    "batch {} expired",
                    kwargs.batch_id
                )))
            }
        }

        let starred = self.catalog.list_starred(&kwargs.account).await?;
        let mut repository_ids = Vec::with_capacity(starred.len());
        let mut members = Vec::with_capacity(starred.len());
        for repo in &starred {
            let (id, created) = self.items.upsert_repository(repo).await?;
            debug!(repository = %repo.full_name(), created, "Upserted repository");
            repository_ids.push(id);
            members.push(EnqueueRequest::new(
                TaskKind::SyncRepository,
                json!({ "repository_id": id, "full_name": repo.full_name() }),
            ));
        }

        let callback = EnqueueRequest::new(
            TaskKind::FinishRepoSync,
            json!({ "batch_id": kwargs.batch_id, "repository_ids": repository_ids }),
        );
        self.batches
            .fan_out(kwargs.batch_id, members, callback)
            .await?;

        Ok(TaskResult::Success(Some(json!({
            "batch_id": kwargs.batch_id,
            "starred": starred.len(),
        }))))
    }
}

#[async_trait]
impl TaskHandler for SyncStarredReposHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::SyncStarredRepos
    }

    #[instrument(
        skip(self, ctx),
        fields(subsystem = "jobs", component = "repo_sync", op = "sync_starred", task_id = %ctx.task_id())
    )]
    async fn execute(&self, ctx: TaskContext) -> TaskResult {
        let kwargs: SyncStarredKwargs = match ctx.kwargs() {
            Ok(k) => k,
            Err(e) => return TaskResult::Failed(e.to_string()),
        };

        match self.run(&kwargs).await {
            Ok(result) => result,
            Err(e) if e.is_transient() && ctx.task.can_retry() => TaskResult::Retry(e.to_string()),
            Err(e) => {
                // Nobody will fan out this batch; end it so pollers stop.
                if let Err(finish) = self.batches.finish(kwargs.batch_id).await {
                    warn!(batch_id = %kwargs.batch_id, error = %finish, "Failed to close batch");
                }
                TaskResult::Failed(e.to_string())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct SyncRepositoryKwargs {
    repository_id: Uuid,
    full_name: String,
}

/// Handler for `sync_repository` batch members (phase `analyzing`).
///
/// A member acknowledges the batch exactly when it will not run again:
/// after success, after a permanent failure, or once its retries are spent
/// on failures, lock contention or timeouts.
pub struct SyncRepositoryHandler {
    catalog: Arc<dyn RepoCatalog>,
    items: Arc<dyn ItemRepository>,
    analyzer: Option<Arc<dyn Analyzer>>,
    lock: DistributedLock,
    limiter: DomainRateLimiter,
    batches: BatchOrchestrator,
    lock_ttl: Duration,
}

impl SyncRepositoryHandler {
    pub fn new(
        catalog: Arc<dyn RepoCatalog>,
        items: Arc<dyn ItemRepository>,
        analyzer: Option<Arc<dyn Analyzer>>,
        lock: DistributedLock,
        limiter: DomainRateLimiter,
        batches: BatchOrchestrator,
    ) -> Self {
        Self {
            catalog,
            items,
            analyzer,
            lock,
            limiter,
            batches,
            lock_ttl: Duration::from_secs(defaults::LOCK_TTL_SECS),
        }
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Lock resource for one repository's sync.
    ///
    /// Distinct from [`tributary_core::WorkItem::resource_key`]: pipeline
    /// stages on the same repository never contend with a batch member.
    pub fn resource_key(repository_id: Uuid) -> String {
        format!("repo_sync:{repository_id}")
    }

    /// Acknowledge the member, then report `result`.
    async fn finish_member(
        &self,
        member: &BatchMember,
        succeeded: bool,
        result: TaskResult,
    ) -> TaskResult {
        match self
            .batches
            .member_finished(member.batch_id, member.batch_index, succeeded)
            .await
        {
            Ok(_) => result,
            Err(e) => TaskResult::from_error(&e),
        }
    }

    async fn sync(&self, repository_id: Uuid, repo: &RepoRef) -> Result<bool> {
        self.limiter.wait_for_domain(&repo.html_url()).await?;
        let details = self.catalog.fetch_details(repo).await?;

        let analysis = match &self.analyzer {
            Some(analyzer) => match analyzer.analyze(&details.document()).await {
                Ok(analysis) => Some(analysis),
                Err(e) => {
                    warn!(repository = %repo.full_name(), error = %e, "Analysis failed, storing details only");
                    None
                }
            },
            None => None,
        };

        self.items
            .store_repository_details(repository_id, &details, analysis.as_ref())
            .await?;
        Ok(analysis.is_some())
    }
}

#[async_trait]
impl TaskHandler for SyncRepositoryHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::SyncRepository
    }

    #[instrument(
        skip(self, ctx),
        fields(subsystem = "jobs", component = "repo_sync", op = "sync_repository", task_id = %ctx.task_id())
    )]
    async fn execute(&self, ctx: TaskContext) -> TaskResult {
        let start = Instant::now();
        let (kwargs, member) = match (
            ctx.kwargs::<SyncRepositoryKwargs>(),
            BatchMember::of(&ctx.task),
        ) {
            (Ok(k), Ok(m)) => (k, m),
            (Err(e), _) | (_, Err(e)) => return TaskResult::Failed(e.to_string()),
        };
        let Some(repo) = RepoRef::parse(&kwargs.full_name) else {
            let reason = format!("invalid repository name {}", kwargs.full_name);
            return self
                .finish_member(&member, false, TaskResult::Failed(reason))
                .await;
        };

        let resource = Self::resource_key(kwargs.repository_id);
        let holder = ctx.holder_id();
        match self.lock.acquire(&resource, self.lock_ttl, &holder).await {
            Ok(true) => {}
            Ok(false) => {
                // Held by another delivery of this member, possibly a dead
                // attempt whose lock has not expired. Only an ack ends a member.
                let reason = format!("repository {} is locked", repo.full_name());
                if ctx.task.can_retry() {
                    return TaskResult::Retry(reason);
                }
                return self
                    .finish_member(&member, false, TaskResult::Failed(reason))
                    .await;
            }
            Err(e) => return TaskResult::from_error(&e),
        }

        let synced = self.sync(kwargs.repository_id, &repo).await;
        if let Err(e) = self.lock.release(&resource, &holder).await {
            warn!(error = %e, "Failed to release repository lock, it will expire");
        }

        if let Err(e) = &synced {
            if e.is_transient() && ctx.task.can_retry() {
                return TaskResult::Retry(e.to_string());
            }
        }

        let result = match &synced {
            Ok(analyzed) => {
                info!(
                    repository = %repo.full_name(),
                    analyzed,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Repository synced"
                );
                TaskResult::Success(Some(json!({
                    "repository": repo.full_name(),
                    "analyzed": analyzed,
                })))
            }
            Err(e) => TaskResult::Failed(e.to_string()),
        };
        self.finish_member(&member, synced.is_ok(), result).await
    }

    async fn on_timeout(&self, task: &TaskEnvelope) -> TaskResult {
        let (kwargs, member) = match (
            task.kwargs::<SyncRepositoryKwargs>(),
            BatchMember::of(task),
        ) {
            (Ok(k), Ok(m)) => (k, m),
            (Err(e), _) | (_, Err(e)) => return TaskResult::Failed(e.to_string()),
        };

        // The killed attempt never reached its release.
        let resource = Self::resource_key(kwargs.repository_id);
        if let Err(e) = self.lock.release(&resource, &holder_id(task)).await {
            warn!(repository = %kwargs.full_name, error = %e, "Failed to release repository lock after timeout");
        }

        let reason = format!("sync of {} exceeded its time limit", kwargs.full_name);
        if task.can_retry() {
            return TaskResult::Retry(reason);
        }
        self.finish_member(&member, false, TaskResult::Failed(reason))
            .await
    }
}

#[derive(Debug, Deserialize)]
struct FinishRepoSyncKwargs {
    batch_id: Uuid,
    #[serde(default)]
    repository_ids: Vec<Uuid>,
}

/// Batch callback (phase `saving`): queue embeddings, then mark `done`.
pub struct FinishRepoSyncHandler {
    queue: Arc<dyn TaskQueue>,
    batches: BatchOrchestrator,
}

impl FinishRepoSyncHandler {
    pub fn new(queue: Arc<dyn TaskQueue>, batches: BatchOrchestrator) -> Self {
        Self { queue, batches }
    }

    async fn run(&self, kwargs: &FinishRepoSyncKwargs) -> Result<usize> {
        let mut enqueued = 0;
        for &id in &kwargs.repository_ids {
            if enqueue_stage(self.queue.as_ref(), Stage::RepoEmbedding, id, Duration::ZERO)
                .await?
                .is_some()
            {
                enqueued += 1;
            }
        }
        self.batches.finish(kwargs.batch_id).await?;
        Ok(enqueued)
    }
}

#[async_trait]
impl TaskHandler for FinishRepoSyncHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::FinishRepoSync
    }

    async fn execute(&self, ctx: TaskContext) -> TaskResult {
        let kwargs: FinishRepoSyncKwargs = match ctx.kwargs() {
            Ok(k) => k,
            Err(e) => return TaskResult::Failed(e.to_string()),
        };
        match self.run(&kwargs).await {
            Ok(enqueued) => {
                info!(
                    subsystem = "jobs",
                    component = "repo_sync",
                    batch_id = %kwargs.batch_id,
                    result_count = enqueued,
                    "Repository sync finished"
                );
                TaskResult::Success(Some(json!({ "embedding_enqueued": enqueued })))
            }
            Err(e) => TaskResult::from_error(&e),
        }
    }
}
