//! Task handlers driving the pipeline coordinator.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use tributary_core::{Stage, TaskEnvelope, TaskKind};

use super::{PipelineCoordinator, StageRun};
use crate::handler::{holder_id, TaskContext, TaskHandler, TaskResult};

#[derive(Debug, Deserialize)]
struct StageKwargs {
    item_id: Uuid,
}

/// Executes one stage for the item named in the task kwargs.
///
/// A busy item lock rejects the delivery: the holder is already doing the
/// work and a duplicate would only race it. Skips and stage failures
/// complete the task, since the outcome lives in the stage flag and the
/// sweep owns retries.
pub struct StageTaskHandler {
    stage: Stage,
    coordinator: Arc<PipelineCoordinator>,
}

impl StageTaskHandler {
    pub fn new(stage: Stage, coordinator: Arc<PipelineCoordinator>) -> Self {
        Self { stage, coordinator }
    }

    /// One handler per stage with a registered executor.
    pub fn for_all(coordinator: Arc<PipelineCoordinator>) -> Vec<Self> {
        coordinator
            .stages()
            .into_iter()
            .map(|stage| Self::new(stage, coordinator.clone()))
            .collect()
    }
}

#[async_trait]
impl TaskHandler for StageTaskHandler {
    fn kind(&self) -> TaskKind {
        self.stage.task_kind()
    }

    #[instrument(
        skip(self, ctx),
        fields(subsystem = "jobs", component = "pipeline", op = "execute", stage = %self.stage, task_id = %ctx.task_id())
    )]
    async fn execute(&self, ctx: TaskContext) -> TaskResult {
        let start = Instant::now();
        let kwargs: StageKwargs = match ctx.kwargs() {
            Ok(k) => k,
            Err(e) => return TaskResult::Failed(e.to_string()),
        };

        let run = match self
            .coordinator
            .run_stage(self.stage, kwargs.item_id, &ctx.holder_id())
            .await
        {
            Ok(run) => run,
            Err(e) => return TaskResult::from_error(&e),
        };

        match run {
            StageRun::Locked => {
                debug!(item_id = %kwargs.item_id, "Item locked by another delivery");
                TaskResult::Rejected(format!("item {} is locked", kwargs.item_id))
            }
            StageRun::Skipped(reason) => {
                debug!(item_id = %kwargs.item_id, %reason, "Stage skipped");
                TaskResult::Success(Some(json!({ "status": "skipped", "reason": reason })))
            }
            StageRun::Failed(error) => {
                TaskResult::Success(Some(json!({ "status": "failed", "error": error })))
            }
            StageRun::Succeeded { detail, follow_ups } => {
                info!(
                    item_id = %kwargs.item_id,
                    follow_ups,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Stage completed"
                );
                TaskResult::Success(Some(detail))
            }
        }
    }

    async fn on_timeout(&self, task: &TaskEnvelope) -> TaskResult {
        let Ok(kwargs) = task.kwargs::<StageKwargs>() else {
            return TaskResult::Failed("malformed kwargs".into());
        };
        if let Err(e) = self
            .coordinator
            .record_timeout(self.stage, kwargs.item_id, &holder_id(task))
            .await
        {
            warn!(item_id = %kwargs.item_id, stage = %self.stage, error = %e, "Failed to record stage timeout");
        }
        TaskResult::Rejected(format!("stage {} timed out", self.stage))
    }
}

/// Periodic compensatory sweep over all pipeline stages.
pub struct SweepStalledStagesHandler {
    coordinator: Arc<PipelineCoordinator>,
}

impl SweepStalledStagesHandler {
    pub fn new(coordinator: Arc<PipelineCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl TaskHandler for SweepStalledStagesHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::SweepStalledStages
    }

    async fn execute(&self, _ctx: TaskContext) -> TaskResult {
        match self.coordinator.sweep(Utc::now()).await {
            Ok(enqueued) => TaskResult::Success(Some(json!({ "enqueued": enqueued }))),
            Err(e) => TaskResult::from_error(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::DistributedLock;
    use crate::pipeline::{PipelineConfig, RepoEmbeddingStage};
    use tributary_core::memory::{MemoryItemRepository, MemoryStore, MemoryTaskQueue};
    use tributary_core::{EnqueueRequest, ItemKind, ItemRepository, TaskQueue, TriState, WorkItem};
    use tributary_inference::MockBackend;

    struct Fixture {
        items: Arc<MemoryItemRepository>,
        queue: Arc<MemoryTaskQueue>,
        lock: DistributedLock,
        coordinator: Arc<PipelineCoordinator>,
    }

    fn fixture() -> Fixture {
        let items = Arc::new(MemoryItemRepository::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let lock = DistributedLock::new(Arc::new(MemoryStore::new()));
        let coordinator = Arc::new(
            PipelineCoordinator::new(
                items.clone(),
                queue.clone(),
                lock.clone(),
                PipelineConfig::default(),
            )
            .with_executor(RepoEmbeddingStage::new(
                items.clone(),
                Arc::new(MockBackend::new()),
            )),
        );
        Fixture {
            items,
            queue,
            lock,
            coordinator,
        }
    }

    async fn stage_task(f: &Fixture, item_id: Uuid) -> TaskEnvelope {
        let id = f
            .queue
            .enqueue(EnqueueRequest::new(
                TaskKind::EmbedRepository,
                json!({ "item_id": item_id }),
            ))
            .await
            .unwrap();
        f.queue.get(id).await.unwrap().unwrap()
    }

    fn repository(f: &Fixture) -> Uuid {
        let mut item = MemoryItemRepository::new_item(ItemKind::Repository, None, "a/b");
        item.content = "a/b\n\nA crate".into();
        let id = item.id;
        f.items.insert(item);
        id
    }

    #[test]
    fn test_for_all_covers_registered_stages() {
        let f = fixture();
        let handlers = StageTaskHandler::for_all(f.coordinator.clone());
        assert_eq!(handlers.len(), 1);
        assert_eq!(handlers[0].kind(), TaskKind::EmbedRepository);
    }

    #[tokio::test]
    async fn test_execute_runs_stage() {
        let f = fixture();
        let id = repository(&f);
        let handler = StageTaskHandler::new(Stage::RepoEmbedding, f.coordinator.clone());

        let task = stage_task(&f, id).await;
        let result = handler.execute(TaskContext::new(task)).await;
        assert!(matches!(result, TaskResult::Success(Some(_))));
        assert!(f.items.has_embedding(id));
    }

    #[tokio::test]
    async fn test_locked_item_rejects_delivery() {
        let f = fixture();
        let id = repository(&f);
        f.lock
            .acquire(
                &WorkItem::resource_key(id),
                std::time::Duration::from_secs(60),
                "other",
            )
            .await
            .unwrap();
        let handler = StageTaskHandler::new(Stage::RepoEmbedding, f.coordinator.clone());

        let task = stage_task(&f, id).await;
        let result = handler.execute(TaskContext::new(task)).await;
        assert!(matches!(result, TaskResult::Rejected(_)));
        assert!(!f.items.has_embedding(id));
    }

    #[tokio::test]
    async fn test_malformed_kwargs_fail() {
        let f = fixture();
        let handler = StageTaskHandler::new(Stage::RepoEmbedding, f.coordinator.clone());
        let id = f
            .queue
            .enqueue(EnqueueRequest::new(TaskKind::EmbedRepository, json!({})))
            .await
            .unwrap();
        let task = f.queue.get(id).await.unwrap().unwrap();
        assert!(matches!(
            handler.execute(TaskContext::new(task)).await,
            TaskResult::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_timeout_marks_stage_failed_and_frees_lock() {
        let f = fixture();
        let id = repository(&f);
        let handler = StageTaskHandler::new(Stage::RepoEmbedding, f.coordinator.clone());
        let task = stage_task(&f, id).await;
        let resource = WorkItem::resource_key(id);
        f.lock
            .acquire(&resource, std::time::Duration::from_secs(60), &holder_id(&task))
            .await
            .unwrap();

        let result = handler.on_timeout(&task).await;
        assert!(matches!(result, TaskResult::Rejected(_)));

        let state = f.items.get(id).await.unwrap().unwrap().stage(Stage::RepoEmbedding);
        assert_eq!(state.status, TriState::Failed);
        assert_eq!(state.error.as_deref(), Some("stage timed out"));
        assert!(!f.lock.is_locked(&resource).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_handler_enqueues_unset_stages() {
        let f = fixture();
        let id = repository(&f);
        let handler = SweepStalledStagesHandler::new(f.coordinator.clone());
        let task = {
            let tid = f
                .queue
                .enqueue(EnqueueRequest::new(TaskKind::SweepStalledStages, json!({})))
                .await
                .unwrap();
            f.queue.get(tid).await.unwrap().unwrap()
        };

        let result = handler.execute(TaskContext::new(task)).await;
        assert_eq!(result, TaskResult::Success(Some(json!({ "enqueued": 1 }))));
        let pending = f.queue.pending_of(TaskKind::EmbedRepository);
        assert_eq!(pending[0].dedup_key, Some(Stage::RepoEmbedding.dedup_key(id)));
    }
}
