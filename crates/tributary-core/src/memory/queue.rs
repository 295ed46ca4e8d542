//! In-process task queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::defaults;
use crate::error::{Error, Result};
use crate::models::{EnqueueRequest, QueueStats, TaskEnvelope, TaskKind, TaskStatus};
use crate::traits::TaskQueue;

/// [`TaskQueue`] kept in memory. Same claim ordering and retry semantics as
/// the PostgreSQL queue, without durability.
pub struct MemoryTaskQueue {
    tasks: Mutex<HashMap<Uuid, TaskEnvelope>>,
    notify: Arc<Notify>,
    default_max_retries: i32,
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            notify: Arc::new(Notify::new()),
            default_max_retries: defaults::TASK_MAX_RETRIES,
        }
    }

    /// Override the retry budget applied when a request does not set one.
    pub fn with_default_max_retries(mut self, max_retries: i32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    fn with_tasks<T>(&self, f: impl FnOnce(&mut HashMap<Uuid, TaskEnvelope>) -> T) -> T {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut tasks)
    }

    fn build(&self, request: EnqueueRequest) -> TaskEnvelope {
        let now = Utc::now();
        TaskEnvelope {
            id: Uuid::now_v7(),
            kind: request.kind,
            eta: request.resolve_eta(now),
            kwargs: request.kwargs,
            lane: request.lane,
            status: TaskStatus::Pending,
            attempts: 0,
            max_retries: request.max_retries.unwrap_or(self.default_max_retries),
            dedup_key: request.dedup_key,
            result: None,
            last_error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    fn update(&self, id: Uuid, f: impl FnOnce(&mut TaskEnvelope)) -> Result<()> {
        self.with_tasks(|tasks| match tasks.get_mut(&id) {
            Some(task) => {
                f(task);
                Ok(())
            }
            None => Err(Error::Queue(format!("task {id} not found"))),
        })
    }

    /// All tasks, oldest first.
    pub fn tasks(&self) -> Vec<TaskEnvelope> {
        let mut all: Vec<_> = self.with_tasks(|tasks| tasks.values().cloned().collect());
        all.sort_by_key(|t| (t.created_at, t.id));
        all
    }

    /// Tasks of `kind` currently pending.
    pub fn pending_of(&self, kind: TaskKind) -> Vec<TaskEnvelope> {
        self.tasks()
            .into_iter()
            .filter(|t| t.kind == kind && t.status == TaskStatus::Pending)
            .collect()
    }

    /// Make a delayed task claimable now.
    pub fn make_due(&self, id: Uuid) -> Result<()> {
        self.update(id, |task| task.eta = Utc::now())
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Uuid> {
        let task = self.build(request);
        let id = task.id;
        self.with_tasks(|tasks| tasks.insert(id, task));
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn enqueue_unique(&self, request: EnqueueRequest) -> Result<Option<Uuid>> {
        let task = self.build(request);
        let id = task.id;
        let inserted = self.with_tasks(|tasks| {
            if let Some(key) = &task.dedup_key {
                let exists = tasks.values().any(|t| {
                    t.dedup_key.as_ref() == Some(key)
                        && matches!(t.status, TaskStatus::Pending | TaskStatus::Running)
                });
                if exists {
                    return false;
                }
            }
            tasks.insert(id, task);
            true
        });
        if inserted {
            self.notify.notify_waiters();
            Ok(Some(id))
        } else {
            Ok(None)
        }
    }

    async fn claim_next(&self, kinds: &[TaskKind]) -> Result<Option<TaskEnvelope>> {
        let now = Utc::now();
        Ok(self.with_tasks(|tasks| {
            let next = tasks
                .values_mut()
                .filter(|t| {
                    t.status == TaskStatus::Pending
                        && t.eta <= now
                        && (kinds.is_empty() || kinds.contains(&t.kind))
                })
                .min_by_key(|t| (t.lane.rank(), t.eta, t.created_at))?;
            next.status = TaskStatus::Running;
            next.started_at = Some(now);
            Some(next.clone())
        }))
    }

    async fn complete(&self, id: Uuid, result: Option<JsonValue>) -> Result<()> {
        self.update(id, |task| {
            task.status = TaskStatus::Completed;
            task.result = result;
            task.finished_at = Some(Utc::now());
        })
    }

    async fn reject(&self, id: Uuid, reason: &str) -> Result<()> {
        self.update(id, |task| {
            task.status = TaskStatus::Rejected;
            task.last_error = Some(reason.to_string());
            task.finished_at = Some(Utc::now());
        })
    }

    async fn retry_or_dead(&self, id: Uuid, error: &str, delay: Duration) -> Result<TaskStatus> {
        let mut status = TaskStatus::Pending;
        self.update(id, |task| {
            task.last_error = Some(error.to_string());
            if task.can_retry() {
                task.attempts += 1;
                task.status = TaskStatus::Pending;
                task.started_at = None;
                task.eta = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            } else {
                task.status = TaskStatus::Dead;
                task.finished_at = Some(Utc::now());
            }
            status = task.status;
        })?;
        if status == TaskStatus::Pending {
            self.notify.notify_waiters();
        }
        Ok(status)
    }

    async fn dead_letter(&self, id: Uuid, error: &str) -> Result<()> {
        self.update(id, |task| {
            task.status = TaskStatus::Dead;
            task.last_error = Some(error.to_string());
            task.finished_at = Some(Utc::now());
        })
    }

    async fn requeue_stale(&self, older_than: Duration) -> Result<u64> {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::zero());
        let touched = self.with_tasks(|tasks| {
            let mut touched = 0;
            for task in tasks.values_mut() {
                let stale = task.status == TaskStatus::Running
                    && task.started_at.map_or(false, |at| at <= cutoff);
                if !stale {
                    continue;
                }
                task.last_error = Some("worker lost while running".to_string());
                if task.can_retry() {
                    task.attempts += 1;
                    task.status = TaskStatus::Pending;
                    task.started_at = None;
                    task.eta = Utc::now();
                } else {
                    task.status = TaskStatus::Dead;
                    task.finished_at = Some(Utc::now());
                }
                touched += 1;
            }
            touched
        });
        if touched > 0 {
            self.notify.notify_waiters();
        }
        Ok(touched)
    }

    async fn get(&self, id: Uuid) -> Result<Option<TaskEnvelope>> {
        Ok(self.with_tasks(|tasks| tasks.get(&id).cloned()))
    }

    async fn list_dead(&self, limit: i64) -> Result<Vec<TaskEnvelope>> {
        let mut dead: Vec<_> = self.with_tasks(|tasks| {
            tasks
                .values()
                .filter(|t| t.status == TaskStatus::Dead)
                .cloned()
                .collect()
        });
        dead.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        dead.truncate(limit.max(0) as usize);
        Ok(dead)
    }

    async fn stats(&self) -> Result<QueueStats> {
        Ok(self.with_tasks(|tasks| {
            let mut stats = QueueStats::default();
            for task in tasks.values() {
                match task.status {
                    TaskStatus::Pending => {
                        stats.pending += 1;
                        if task.lane == crate::models::Lane::High {
                            stats.pending_high += 1;
                        }
                    }
                    TaskStatus::Running => stats.running += 1,
                    TaskStatus::Completed => stats.completed += 1,
                    TaskStatus::Rejected => stats.rejected += 1,
                    TaskStatus::Dead => stats.dead += 1,
                }
            }
            stats
        }))
    }

    fn wake_signal(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Lane;
    use serde_json::json;

    fn request(kind: TaskKind) -> EnqueueRequest {
        EnqueueRequest::new(kind, json!({}))
    }

    #[tokio::test]
    async fn claims_high_lane_before_default() {
        let queue = MemoryTaskQueue::new();
        let background = queue.enqueue(request(TaskKind::ProcessRag)).await.unwrap();
        let urgent = queue
            .enqueue(request(TaskKind::RefreshSource).with_lane(Lane::High))
            .await
            .unwrap();

        let first = queue.claim_next(&[]).await.unwrap().unwrap();
        assert_eq!(first.id, urgent);
        let second = queue.claim_next(&[]).await.unwrap().unwrap();
        assert_eq!(second.id, background);
        assert!(queue.claim_next(&[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delayed_tasks_are_not_claimable_early() {
        let queue = MemoryTaskQueue::new();
        let id = queue
            .enqueue(request(TaskKind::RefreshSource).with_delay(Duration::from_secs(600)))
            .await
            .unwrap();
        assert!(queue.claim_next(&[]).await.unwrap().is_none());

        queue.make_due(id).unwrap();
        assert_eq!(queue.claim_next(&[]).await.unwrap().unwrap().id, id);
    }

    #[tokio::test]
    async fn claim_filters_by_kind() {
        let queue = MemoryTaskQueue::new();
        queue.enqueue(request(TaskKind::ProcessRag)).await.unwrap();
        assert!(queue
            .claim_next(&[TaskKind::RefreshSource])
            .await
            .unwrap()
            .is_none());
        assert!(queue
            .claim_next(&[TaskKind::ProcessRag])
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn enqueue_unique_skips_live_duplicates() {
        let queue = MemoryTaskQueue::new();
        let req = request(TaskKind::RefreshSource).with_dedup_key("refresh:feed:1");
        let first = queue.enqueue_unique(req.clone()).await.unwrap();
        assert!(first.is_some());
        assert!(queue.enqueue_unique(req.clone()).await.unwrap().is_none());

        let claimed = queue.claim_next(&[]).await.unwrap().unwrap();
        assert!(queue.enqueue_unique(req.clone()).await.unwrap().is_none());

        queue.complete(claimed.id, None).await.unwrap();
        assert!(queue.enqueue_unique(req).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn retry_until_dead() {
        let queue = MemoryTaskQueue::new();
        let id = queue
            .enqueue(request(TaskKind::ProcessImages).with_max_retries(1))
            .await
            .unwrap();

        queue.claim_next(&[]).await.unwrap().unwrap();
        let status = queue
            .retry_or_dead(id, "boom", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Pending);
        let task = queue.get(id).await.unwrap().unwrap();
        assert_eq!(task.attempts, 1);
        assert!(task.eta > Utc::now());

        queue.make_due(id).unwrap();
        queue.claim_next(&[]).await.unwrap().unwrap();
        let status = queue
            .retry_or_dead(id, "boom again", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Dead);

        let dead = queue.list_dead(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error.as_deref(), Some("boom again"));
    }

    #[tokio::test]
    async fn requeue_stale_returns_running_tasks() {
        let queue = MemoryTaskQueue::new();
        let id = queue.enqueue(request(TaskKind::ProcessRag)).await.unwrap();
        queue.claim_next(&[]).await.unwrap().unwrap();

        assert_eq!(
            queue.requeue_stale(Duration::from_secs(3600)).await.unwrap(),
            0
        );
        assert_eq!(queue.requeue_stale(Duration::ZERO).await.unwrap(), 1);

        let task = queue.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 1);
    }

    #[tokio::test]
    async fn stats_count_each_status() {
        let queue = MemoryTaskQueue::new();
        let a = queue.enqueue(request(TaskKind::ProcessRag)).await.unwrap();
        queue
            .enqueue(request(TaskKind::RefreshSource).with_lane(Lane::High))
            .await
            .unwrap();
        queue.enqueue(request(TaskKind::ProcessRag)).await.unwrap();
        queue.reject(a, "lock busy").await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.pending_high, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.dead, 0);
    }
}
