//! Infrastructure connections and collaborator wiring.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use tributary_core::memory::MemoryStore;
use tributary_core::{
    Analyzer, Captioner, CoordinationStore, ItemRepository, SourceRepository, TaskKind, TaskQueue,
};
use tributary_db::{log_pool_metrics, Database, RedisCoordinationStore};
use tributary_inference::{OllamaBackend, OllamaVisionBackend};
use tributary_jobs::{
    BatchConfig, BatchOrchestrator, Beat, DistributedLock, DomainRateLimiter, FinishRepoSyncHandler,
    GithubCatalog, HttpFetcher, ImageStage, PipelineConfig, PipelineCoordinator, RagStage,
    RateLimitConfig, RefreshSourceHandler, RepoCatalog, RepoEmbeddingStage, RepoLinkStage,
    RetryPolicy, SchedulerConfig, SourceScheduler, StageTaskHandler, SweepDueSourcesHandler,
    SweepStalledStagesHandler, SyncRepositoryHandler, SyncStarredReposHandler, Worker,
    WorkerBuilder, WorkerConfig,
};

const DEFAULT_DATABASE_URL: &str = "postgres://localhost/tributary";

/// Everything the worker and the operator commands run against.
pub struct Services {
    pub db: Database,
    pub queue: Arc<dyn TaskQueue>,
    pub lock: DistributedLock,
    pub scheduler: Arc<SourceScheduler>,
    pub pipeline: Arc<PipelineCoordinator>,
    pub batches: BatchOrchestrator,
    catalog: Arc<dyn RepoCatalog>,
    analyzer: Arc<dyn Analyzer>,
    limiter: DomainRateLimiter,
    worker_config: WorkerConfig,
    retry: RetryPolicy,
    scheduler_config: SchedulerConfig,
    pipeline_config: PipelineConfig,
}

async fn coordination_store() -> anyhow::Result<Arc<dyn CoordinationStore>> {
    let enabled = std::env::var("REDIS_ENABLED")
        .map(|v| v != "false" && v != "0")
        .unwrap_or(true);
    if enabled {
        return Ok(Arc::new(RedisCoordinationStore::from_env().await?));
    }
    warn!(
        subsystem = "coordination",
        component = "memory",
        "REDIS_ENABLED=false: locks and batch state are local to this process"
    );
    Ok(Arc::new(MemoryStore::new()))
}

/// Warn when a lock could expire while its task is still allowed to run.
fn check_lock_ttl(name: &str, lock_ttl: Duration, task_timeout: Duration) {
    if lock_ttl <= task_timeout {
        warn!(
            lock = name,
            lock_ttl_secs = lock_ttl.as_secs(),
            task_timeout_secs = task_timeout.as_secs(),
            "Lock TTL does not exceed the task time limit; a timed-out task may overlap its redelivery"
        );
    }
}

impl Services {
    /// Connect to Postgres (running migrations) and the coordination store,
    /// then wire collaborators from the environment.
    pub async fn connect() -> anyhow::Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        info!("Connecting to database...");
        let retry = RetryPolicy::from_env();
        let db = Database::connect(&database_url)
            .await?
            .with_task_max_retries(retry.max_retries);
        info!("Database connected");

        info!("Running database migrations...");
        db.migrate().await?;
        info!("Database migrations complete");
        log_pool_metrics(db.pool());

        let store = coordination_store().await?;
        let queue: Arc<dyn TaskQueue> = db.tasks.clone();
        let sources: Arc<dyn SourceRepository> = db.sources.clone();
        let items: Arc<dyn ItemRepository> = db.items.clone();

        let worker_config = WorkerConfig::from_env();
        let scheduler_config = SchedulerConfig::from_env();
        let pipeline_config = PipelineConfig::from_env();
        check_lock_ttl("source", scheduler_config.lock_ttl, worker_config.task_timeout);
        check_lock_ttl("item", pipeline_config.lock_ttl, worker_config.task_timeout);

        let lock = DistributedLock::new(store.clone());
        let limiter = DomainRateLimiter::new(store.clone(), RateLimitConfig::from_env());
        let fetcher = Arc::new(HttpFetcher::new());
        let batches = BatchOrchestrator::new(store, queue.clone(), BatchConfig::from_env());

        let ollama = Arc::new(OllamaBackend::from_env());
        let captioner: Option<Arc<dyn Captioner>> = match OllamaVisionBackend::from_env() {
            Some(vision) => Some(Arc::new(vision) as Arc<dyn Captioner>),
            None => {
                info!("OLLAMA_VISION_MODEL not set, image captioning disabled");
                None
            }
        };

        let scheduler = Arc::new(SourceScheduler::new(
            sources,
            items.clone(),
            queue.clone(),
            fetcher.clone(),
            lock.clone(),
            limiter.clone(),
            scheduler_config.clone(),
        ));

        let pipeline = Arc::new(
            PipelineCoordinator::new(
                items.clone(),
                queue.clone(),
                lock.clone(),
                pipeline_config.clone(),
            )
            .with_executor(ImageStage::new(
                items.clone(),
                fetcher,
                limiter.clone(),
                captioner,
                pipeline_config.max_images,
            ))
            .with_executor(RagStage::new(
                items.clone(),
                ollama.clone(),
                pipeline_config.chunker.clone(),
            ))
            .with_executor(RepoLinkStage::new(items.clone()))
            .with_executor(RepoEmbeddingStage::new(items, ollama.clone())),
        );

        Ok(Self {
            db,
            queue,
            lock,
            scheduler,
            pipeline,
            batches,
            catalog: Arc::new(GithubCatalog::from_env()),
            analyzer: ollama,
            limiter,
            worker_config,
            retry,
            scheduler_config,
            pipeline_config,
        })
    }

    /// Build the worker with a handler for every task kind.
    pub async fn worker(&self) -> Worker {
        let items: Arc<dyn ItemRepository> = self.db.items.clone();
        let mut builder = WorkerBuilder::new(self.queue.clone())
            .with_config(self.worker_config.clone())
            .with_retry_policy(self.retry.clone())
            .with_handler(RefreshSourceHandler::new(self.scheduler.clone()))
            .with_handler(SweepDueSourcesHandler::new(self.scheduler.clone()))
            .with_handler(SweepStalledStagesHandler::new(self.pipeline.clone()))
            .with_handler(SyncStarredReposHandler::new(
                self.catalog.clone(),
                items.clone(),
                self.batches.clone(),
            ))
            .with_handler(
                SyncRepositoryHandler::new(
                    self.catalog.clone(),
                    items,
                    Some(self.analyzer.clone()),
                    self.lock.clone(),
                    self.limiter.clone(),
                    self.batches.clone(),
                )
                .with_lock_ttl(self.pipeline_config.lock_ttl),
            )
            .with_handler(FinishRepoSyncHandler::new(
                self.queue.clone(),
                self.batches.clone(),
            ));
        for handler in StageTaskHandler::for_all(self.pipeline.clone()) {
            builder = builder.with_handler(handler);
        }
        builder.build().await
    }

    /// The periodic sweeps.
    pub fn beat(&self) -> Beat {
        Beat::new(self.queue.clone(), self.lock.clone())
            .every(self.scheduler_config.sweep_interval, TaskKind::SweepDueSources)
            .every(self.pipeline_config.sweep_interval, TaskKind::SweepStalledStages)
    }

    pub fn worker_enabled(&self) -> bool {
        self.worker_config.enabled
    }
}
