//! Task worker and runner for processing queued tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use tributary_core::{defaults, Error, Result, TaskEnvelope, TaskKind, TaskQueue, TaskStatus};

use crate::handler::{TaskContext, TaskHandler, TaskResult};

/// How often the worker loop returns orphaned running tasks to the queue.
const STALE_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for the task worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Polling interval in milliseconds when the queue is empty.
    pub poll_interval_ms: u64,
    /// Maximum number of concurrent tasks.
    pub max_concurrent_tasks: usize,
    /// Whether to enable task processing.
    pub enabled: bool,
    /// Hard execution time limit per task.
    pub task_timeout: Duration,
    /// Running tasks older than this are assumed orphaned.
    pub stale_after: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::TASK_POLL_INTERVAL_MS,
            max_concurrent_tasks: defaults::TASK_MAX_CONCURRENT,
            enabled: true,
            task_timeout: Duration::from_secs(defaults::TASK_TIMEOUT_SECS),
            stale_after: Duration::from_secs(defaults::TASK_STALE_AFTER_SECS),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `TASK_WORKER_ENABLED` | `true` | Enable/disable task processing |
    /// | `TASK_MAX_CONCURRENT` | `4` | Max concurrent tasks |
    /// | `TASK_POLL_INTERVAL_MS` | `1000` | Polling interval when queue is empty |
    /// | `TASK_TIMEOUT_SECS` | `120` | Hard time limit per task |
    /// | `TASK_STALE_AFTER_SECS` | `600` | Age after which a running task is requeued |
    pub fn from_env() -> Self {
        let enabled = std::env::var("TASK_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let max_concurrent_tasks = std::env::var("TASK_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::TASK_MAX_CONCURRENT)
            .max(1);

        let poll_interval_ms = std::env::var("TASK_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::TASK_POLL_INTERVAL_MS);

        let task_timeout = std::env::var("TASK_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::TASK_TIMEOUT_SECS);

        let stale_after = std::env::var("TASK_STALE_AFTER_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::TASK_STALE_AFTER_SECS);

        Self {
            poll_interval_ms,
            max_concurrent_tasks,
            enabled,
            task_timeout: Duration::from_secs(task_timeout.max(1)),
            stale_after: Duration::from_secs(stale_after),
        }
    }

    /// Create a new config with custom poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set maximum concurrent tasks.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    /// Enable or disable task processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the hard time limit per task.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}

/// Queue-level retry policy: exponential backoff with bounded jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay added or removed at random.
    pub jitter: f64,
    /// Retries before a task is dead-lettered.
    pub max_retries: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(defaults::TASK_RETRY_BASE_SECS),
            max: Duration::from_secs(defaults::TASK_RETRY_MAX_SECS),
            jitter: defaults::TASK_RETRY_JITTER,
            max_retries: defaults::TASK_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    /// Create policy from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `TASK_RETRY_BASE_SECS` | `30` |
    /// | `TASK_RETRY_MAX_SECS` | `3600` |
    /// | `TASK_MAX_RETRIES` | `3` |
    pub fn from_env() -> Self {
        let base = std::env::var("TASK_RETRY_BASE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::TASK_RETRY_BASE_SECS);
        let max = std::env::var("TASK_RETRY_MAX_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::TASK_RETRY_MAX_SECS)
            .max(base);
        let max_retries = std::env::var("TASK_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(defaults::TASK_MAX_RETRIES)
            .max(0);

        Self {
            base: Duration::from_secs(base),
            max: Duration::from_secs(max),
            jitter: defaults::TASK_RETRY_JITTER,
            max_retries,
        }
    }

    /// Disable jitter, for deterministic delays.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before retry number `attempt + 1`: `base * 2^attempt`, capped
    /// at `max`, then jittered by up to `jitter` in either direction.
    pub fn delay_for(&self, attempt: i32) -> Duration {
        let exponent = attempt.clamp(0, 30) as u32;
        let capped = self.base.saturating_mul(1u32 << exponent).min(self.max);
        if self.jitter <= 0.0 {
            return capped;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        capped.mul_f64(factor.max(0.0)).min(self.max)
    }
}

/// Event emitted by the task worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A task was started.
    TaskStarted { task_id: Uuid, kind: TaskKind },
    /// A task completed successfully.
    TaskCompleted { task_id: Uuid, kind: TaskKind },
    /// A task was rejected without running (lock busy, resource gone).
    TaskRejected {
        task_id: Uuid,
        kind: TaskKind,
        reason: String,
    },
    /// A task failed and was put back with a delay.
    TaskRetrying {
        task_id: Uuid,
        kind: TaskKind,
        error: String,
        delay: Duration,
    },
    /// A task failed for good and was dead-lettered.
    TaskDeadLettered {
        task_id: Uuid,
        kind: TaskKind,
        error: String,
    },
    /// Worker started.
    WorkerStarted,
    /// Worker stopped.
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }

    /// Wait until the worker loop has exited. In-flight tasks finish first.
    pub async fn join(self) -> Result<()> {
        self.join
            .await
            .map_err(|e| Error::Internal(format!("Worker loop panicked: {e}")))
    }
}

type HandlerMap = Arc<RwLock<HashMap<TaskKind, Arc<dyn TaskHandler>>>>;

/// Task worker that processes tasks from the queue.
pub struct Worker {
    queue: Arc<dyn TaskQueue>,
    config: WorkerConfig,
    retry: RetryPolicy,
    handlers: HandlerMap,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl Worker {
    /// Create a new task worker.
    pub fn new(queue: Arc<dyn TaskQueue>, config: WorkerConfig, retry: RetryPolicy) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            queue,
            config,
            retry,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
        }
    }

    /// Register a handler for a task kind.
    pub async fn register_handler<H: TaskHandler + 'static>(&self, handler: H) {
        self.register_shared(Arc::new(handler)).await;
    }

    /// Register a handler that is shared with other owners.
    pub async fn register_shared(&self, handler: Arc<dyn TaskHandler>) {
        let kind = handler.kind();
        let mut handlers = self.handlers.write().await;
        handlers.insert(kind, handler);
        debug!(task_kind = %kind, "Registered task handler");
    }

    /// Kinds with a registered handler.
    pub async fn kinds(&self) -> Vec<TaskKind> {
        let handlers = self.handlers.read().await;
        handlers.keys().copied().collect()
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let join = tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
            join,
        }
    }

    /// Run the worker loop with concurrent task processing.
    ///
    /// Claims up to `max_concurrent_tasks` at a time and processes them
    /// concurrently. Only sleeps when the queue is empty, and wakes early
    /// when the queue signals a new task.
    #[instrument(skip(self, shutdown_rx), fields(subsystem = "jobs", component = "worker"))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Task worker is disabled, not starting");
            return;
        }

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent = self.config.max_concurrent_tasks,
            task_timeout_secs = self.config.task_timeout.as_secs(),
            "Task worker started"
        );

        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let max_concurrent = self.config.max_concurrent_tasks.max(1);
        let wake = self.queue.wake_signal();
        let mut last_stale_check: Option<Instant> = None;

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Task worker received shutdown signal");
                break;
            }

            if last_stale_check.map_or(true, |t| t.elapsed() >= STALE_CHECK_INTERVAL) {
                self.requeue_stale().await;
                last_stale_check = Some(Instant::now());
            }

            // Registered before claiming so an enqueue racing the claim still wakes us
            let notified = wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut claimed = 0;
            let mut tasks = tokio::task::JoinSet::new();

            for _ in 0..max_concurrent {
                match self.claim_task().await {
                    Some(task) => {
                        claimed += 1;
                        let worker = self.clone_refs();
                        tasks.spawn(async move {
                            worker.execute_task(task).await;
                        });
                    }
                    None => break,
                }
            }

            if claimed == 0 {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Task worker received shutdown signal");
                        break;
                    }
                    _ = sleep(poll_interval) => {}
                    _ = &mut notified => {}
                }
            } else {
                debug!(claimed, "Processing concurrent task batch");
                while let Some(result) = tasks.join_next().await {
                    if let Err(e) = result {
                        error!(error = ?e, "Task panicked");
                    }
                }
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Task worker stopped");
    }

    /// Process claimable tasks one at a time until none is left. Returns the
    /// number of tasks processed. Tasks whose ETA lies in the future are not
    /// waited for.
    pub async fn run_until_idle(&self) -> usize {
        let mut processed = 0;
        while let Some(task) = self.claim_task().await {
            self.clone_refs().execute_task(task).await;
            processed += 1;
        }
        processed
    }

    /// Return orphaned running tasks to the queue.
    async fn requeue_stale(&self) {
        match self.queue.requeue_stale(self.config.stale_after).await {
            Ok(0) => {}
            Ok(count) => warn!(result_count = count, "Requeued stale running tasks"),
            Err(e) => error!(error = %e, "Failed to requeue stale tasks"),
        }
    }

    /// Claim the next available task without processing it.
    async fn claim_task(&self) -> Option<TaskEnvelope> {
        let kinds = self.kinds().await;
        if kinds.is_empty() {
            return None;
        }

        match self.queue.claim_next(&kinds).await {
            Ok(task) => task,
            Err(e) => {
                error!(error = %e, "Failed to claim task");
                None
            }
        }
    }

    /// Clone references needed for spawned task executions.
    fn clone_refs(&self) -> WorkerRef {
        WorkerRef {
            queue: self.queue.clone(),
            handlers: self.handlers.clone(),
            event_tx: self.event_tx.clone(),
            retry: self.retry.clone(),
            task_timeout: self.config.task_timeout,
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }
}

/// Lightweight reference bundle for executing a single task in a spawned task.
struct WorkerRef {
    queue: Arc<dyn TaskQueue>,
    handlers: HandlerMap,
    event_tx: broadcast::Sender<WorkerEvent>,
    retry: RetryPolicy,
    task_timeout: Duration,
}

impl WorkerRef {
    /// Execute a single claimed task and record its outcome on the queue.
    async fn execute_task(self, task: TaskEnvelope) {
        let start = Instant::now();
        let task_id = task.id;
        let kind = task.kind;

        info!(
            %task_id,
            task_kind = %kind,
            lane = task.lane.as_str(),
            attempt = task.attempts,
            "Processing task"
        );

        let _ = self
            .event_tx
            .send(WorkerEvent::TaskStarted { task_id, kind });

        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&kind).cloned()
        };

        let result = match handler {
            Some(handler) => {
                let ctx = TaskContext::new(task.clone());
                match tokio::time::timeout(self.task_timeout, handler.execute(ctx)).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            %task_id,
                            task_kind = %kind,
                            timeout_secs = self.task_timeout.as_secs(),
                            "Task exceeded its time limit"
                        );
                        handler.on_timeout(&task).await
                    }
                }
            }
            None => {
                warn!(task_kind = %kind, "No handler registered for task kind");
                TaskResult::Failed(format!("No handler for task kind: {kind}"))
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        if let Err(e) = self.record(&task, result, duration_ms).await {
            error!(%task_id, task_kind = %kind, error = %e, "Failed to record task outcome");
        }
    }

    async fn record(&self, task: &TaskEnvelope, result: TaskResult, duration_ms: u64) -> Result<()> {
        let task_id = task.id;
        let kind = task.kind;

        match result {
            TaskResult::Success(data) => {
                self.queue.complete(task_id, data).await?;
                info!(%task_id, task_kind = %kind, duration_ms, "Task completed");
                let _ = self
                    .event_tx
                    .send(WorkerEvent::TaskCompleted { task_id, kind });
            }
            TaskResult::Rejected(reason) => {
                self.queue.reject(task_id, &reason).await?;
                debug!(%task_id, task_kind = %kind, %reason, "Task rejected");
                let _ = self.event_tx.send(WorkerEvent::TaskRejected {
                    task_id,
                    kind,
                    reason,
                });
            }
            TaskResult::Retry(error) => {
                let delay = self.retry.delay_for(task.attempts);
                match self.queue.retry_or_dead(task_id, &error, delay).await? {
                    TaskStatus::Dead => {
                        error!(
                            %task_id,
                            task_kind = %kind,
                            attempt = task.attempts,
                            %error,
                            "Task retries exhausted, dead-lettered"
                        );
                        let _ = self.event_tx.send(WorkerEvent::TaskDeadLettered {
                            task_id,
                            kind,
                            error,
                        });
                    }
                    _ => {
                        warn!(
                            %task_id,
                            task_kind = %kind,
                            attempt = task.attempts,
                            delay_secs = delay.as_secs(),
                            %error,
                            "Task failed, retry scheduled"
                        );
                        let _ = self.event_tx.send(WorkerEvent::TaskRetrying {
                            task_id,
                            kind,
                            error,
                            delay,
                        });
                    }
                }
            }
            TaskResult::Failed(error) => {
                self.queue.dead_letter(task_id, &error).await?;
                error!(%task_id, task_kind = %kind, %error, duration_ms, "Task failed, dead-lettered");
                let _ = self.event_tx.send(WorkerEvent::TaskDeadLettered {
                    task_id,
                    kind,
                    error,
                });
            }
        }
        Ok(())
    }
}

/// Builder for creating a task worker with handlers.
pub struct WorkerBuilder {
    queue: Arc<dyn TaskQueue>,
    config: WorkerConfig,
    retry: RetryPolicy,
    handlers: Vec<Arc<dyn TaskHandler>>,
}

impl WorkerBuilder {
    /// Create a new worker builder.
    pub fn new(queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            queue,
            config: WorkerConfig::default(),
            retry: RetryPolicy::default(),
            handlers: Vec::new(),
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Add a handler.
    pub fn with_handler<H: TaskHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Add a handler that is shared with other owners.
    pub fn with_shared_handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Build and return the worker.
    pub async fn build(self) -> Worker {
        let worker = Worker::new(self.queue, self.config, self.retry);
        for handler in self.handlers {
            worker.register_shared(handler).await;
        }
        worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tributary_core::memory::MemoryTaskQueue;
    use tributary_core::EnqueueRequest;

    use crate::handler::NoOpHandler;

    struct ScriptedHandler {
        kind: TaskKind,
        result: TaskResult,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler for ScriptedHandler {
        fn kind(&self) -> TaskKind {
            self.kind
        }

        async fn execute(&self, _ctx: TaskContext) -> TaskResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl TaskHandler for SlowHandler {
        fn kind(&self) -> TaskKind {
            TaskKind::RefreshSource
        }

        async fn execute(&self, _ctx: TaskContext) -> TaskResult {
            sleep(Duration::from_secs(3600)).await;
            TaskResult::Success(None)
        }

        async fn on_timeout(&self, _task: &TaskEnvelope) -> TaskResult {
            TaskResult::Rejected("timed out, failure recorded".into())
        }
    }

    fn scripted(kind: TaskKind, result: TaskResult) -> Arc<ScriptedHandler> {
        Arc::new(ScriptedHandler {
            kind,
            result,
            calls: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval_ms, defaults::TASK_POLL_INTERVAL_MS);
        assert_eq!(config.max_concurrent_tasks, 4);
        assert!(config.enabled);
        assert_eq!(config.task_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_poll_interval(250)
            .with_max_concurrent(8)
            .with_enabled(false)
            .with_task_timeout(Duration::from_secs(5))
            .with_stale_after(Duration::from_secs(30));

        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.max_concurrent_tasks, 8);
        assert!(!config.enabled);
        assert_eq!(config.task_timeout, Duration::from_secs(5));
        assert_eq!(config.stale_after, Duration::from_secs(30));
    }

    #[test]
    fn test_retry_policy_backoff_is_capped() {
        let policy = RetryPolicy {
            base: Duration::from_secs(30),
            max: Duration::from_secs(100),
            jitter: 0.0,
            max_retries: 3,
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(30));
        assert_eq!(policy.delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(2), Duration::from_secs(100));
        assert_eq!(policy.delay_for(40), Duration::from_secs(100));
    }

    #[test]
    fn test_retry_policy_jitter_is_bounded() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_secs(54), "{delay:?}");
            assert!(delay <= Duration::from_secs(66), "{delay:?}");
        }
    }

    #[test]
    fn test_worker_event_clone() {
        let task_id = Uuid::new_v4();
        let event = WorkerEvent::TaskRetrying {
            task_id,
            kind: TaskKind::ProcessRag,
            error: "embedder down".into(),
            delay: Duration::from_secs(30),
        };
        let debug_str = format!("{:?}", event.clone());
        assert!(debug_str.contains("TaskRetrying"));
        assert!(debug_str.contains("ProcessRag"));
    }

    #[tokio::test]
    async fn test_success_completes_task() {
        let queue = Arc::new(MemoryTaskQueue::new());
        let id = queue
            .enqueue(EnqueueRequest::new(TaskKind::ProcessRag, json!({})))
            .await
            .unwrap();

        let worker = WorkerBuilder::new(queue.clone())
            .with_handler(NoOpHandler::new(TaskKind::ProcessRag))
            .build()
            .await;
        let mut events = worker.events();

        assert_eq!(worker.run_until_idle().await, 1);
        assert_eq!(
            queue.get(id).await.unwrap().unwrap().status,
            TaskStatus::Completed
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            WorkerEvent::TaskStarted { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            WorkerEvent::TaskCompleted { .. }
        ));
    }

    #[tokio::test]
    async fn test_retry_then_dead_letter() {
        let queue = Arc::new(MemoryTaskQueue::new().with_default_max_retries(1));
        let id = queue
            .enqueue(EnqueueRequest::new(TaskKind::ProcessRag, json!({})))
            .await
            .unwrap();

        let handler = scripted(TaskKind::ProcessRag, TaskResult::Retry("down".into()));
        let worker = WorkerBuilder::new(queue.clone())
            .with_retry_policy(RetryPolicy::default().without_jitter())
            .with_shared_handler(handler.clone())
            .build()
            .await;

        worker.run_until_idle().await;
        let task = queue.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 1);
        assert!(task.eta > chrono::Utc::now());

        queue.make_due(id).unwrap();
        worker.run_until_idle().await;
        let task = queue.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Dead);
        assert_eq!(task.last_error.as_deref(), Some("down"));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.list_dead(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_and_failed_are_terminal() {
        let queue = Arc::new(MemoryTaskQueue::new());
        let rejected = queue
            .enqueue(EnqueueRequest::new(TaskKind::RefreshSource, json!({})))
            .await
            .unwrap();
        let failed = queue
            .enqueue(EnqueueRequest::new(TaskKind::ProcessImages, json!({})))
            .await
            .unwrap();

        let worker = WorkerBuilder::new(queue.clone())
            .with_shared_handler(scripted(
                TaskKind::RefreshSource,
                TaskResult::Rejected("lock busy".into()),
            ))
            .with_shared_handler(scripted(
                TaskKind::ProcessImages,
                TaskResult::Failed("malformed".into()),
            ))
            .build()
            .await;

        assert_eq!(worker.run_until_idle().await, 2);
        assert_eq!(
            queue.get(rejected).await.unwrap().unwrap().status,
            TaskStatus::Rejected
        );
        assert_eq!(
            queue.get(failed).await.unwrap().unwrap().status,
            TaskStatus::Dead
        );
    }

    #[tokio::test]
    async fn test_unregistered_kinds_are_not_claimed() {
        let queue = Arc::new(MemoryTaskQueue::new());
        let id = queue
            .enqueue(EnqueueRequest::new(TaskKind::SyncRepository, json!({})))
            .await
            .unwrap();

        let worker = WorkerBuilder::new(queue.clone())
            .with_handler(NoOpHandler::new(TaskKind::ProcessRag))
            .build()
            .await;

        assert_eq!(worker.run_until_idle().await, 0);
        assert_eq!(
            queue.get(id).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_invokes_on_timeout_hook() {
        let queue = Arc::new(MemoryTaskQueue::new());
        let id = queue
            .enqueue(EnqueueRequest::new(TaskKind::RefreshSource, json!({})))
            .await
            .unwrap();

        let worker = WorkerBuilder::new(queue.clone())
            .with_config(WorkerConfig::default().with_task_timeout(Duration::from_secs(2)))
            .with_handler(SlowHandler)
            .build()
            .await;

        worker.run_until_idle().await;
        let task = queue.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Rejected);
        assert_eq!(task.last_error.as_deref(), Some("timed out, failure recorded"));
    }

    #[tokio::test]
    async fn test_started_worker_wakes_on_enqueue_and_shuts_down() {
        let queue = Arc::new(MemoryTaskQueue::new());
        let handler = scripted(TaskKind::ProcessRag, TaskResult::Success(None));
        let worker = WorkerBuilder::new(queue.clone())
            .with_config(WorkerConfig::default().with_poll_interval(60_000))
            .with_shared_handler(handler.clone())
            .build()
            .await;

        let handle = worker.start();
        let mut events = handle.events();
        assert!(matches!(
            events.recv().await.unwrap(),
            WorkerEvent::WorkerStarted
        ));

        queue
            .enqueue(EnqueueRequest::new(TaskKind::ProcessRag, json!({})))
            .await
            .unwrap();

        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("worker did not pick up the task")
                .unwrap()
            {
                WorkerEvent::TaskCompleted { .. } => break,
                _ => continue,
            }
        }

        handle.shutdown().await.unwrap();
        handle.join().await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }
}
