//! Periodic enqueue of the compensating sweeps.
//!
//! Every worker process may run a beat. Each entry is guarded by a schedule
//! lock `schedule:periodic:{task}` that lives for one interval, so across
//! all processes at most one task is enqueued per entry and interval.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use tributary_core::{EnqueueRequest, Result, TaskKind, TaskQueue};

use crate::lock::DistributedLock;

/// How often the beat checks its entries.
const DEFAULT_TICK: Duration = Duration::from_secs(5);

const BEAT_HOLDER: &str = "beat";

/// A task enqueued every `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeatEntry {
    pub kind: TaskKind,
    pub interval: Duration,
}

/// Periodic task scheduler.
pub struct Beat {
    queue: Arc<dyn TaskQueue>,
    lock: DistributedLock,
    entries: Vec<BeatEntry>,
    tick: Duration,
}

/// Handle to a running [`Beat`].
pub struct BeatHandle {
    shutdown_tx: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl BeatHandle {
    /// Stop the beat and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.join.await {
            error!(error = ?e, "Beat task panicked");
        }
    }
}

fn periodic_key(kind: TaskKind) -> String {
    format!("periodic:{kind}")
}

impl Beat {
    pub fn new(queue: Arc<dyn TaskQueue>, lock: DistributedLock) -> Self {
        Self {
            queue,
            lock,
            entries: Vec::new(),
            tick: DEFAULT_TICK,
        }
    }

    pub fn every(mut self, interval: Duration, kind: TaskKind) -> Self {
        self.entries.push(BeatEntry { kind, interval });
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn entries(&self) -> &[BeatEntry] {
        &self.entries
    }

    /// Enqueue every entry whose interval window is open. Returns the ids
    /// of the tasks created.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "beat", op = "tick"))]
    pub async fn tick(&self) -> Result<Vec<Uuid>> {
        let mut created = Vec::new();
        for entry in &self.entries {
            let key = periodic_key(entry.kind);
            if !self
                .lock
                .try_schedule(&key, entry.interval, BEAT_HOLDER)
                .await?
            {
                continue;
            }
            let request = EnqueueRequest::new(entry.kind, json!({})).with_dedup_key(key.clone());
            match self.queue.enqueue_unique(request).await {
                Ok(Some(id)) => {
                    debug!(task_kind = %entry.kind, task_id = %id, "Periodic task enqueued");
                    created.push(id);
                }
                Ok(None) => debug!(task_kind = %entry.kind, "Periodic task still pending"),
                Err(e) => {
                    self.lock.clear_schedule(&key).await?;
                    return Err(e);
                }
            }
        }
        Ok(created)
    }

    /// Run the beat in the background until shut down.
    pub fn start(self) -> BeatHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let join = tokio::spawn(async move {
            info!(
                subsystem = "jobs",
                component = "beat",
                entries = self.entries.len(),
                tick_secs = self.tick.as_secs(),
                "Beat started"
            );
            let mut interval = tokio::time::interval(self.tick);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.tick().await {
                            error!(subsystem = "jobs", component = "beat", error = %e, "Beat tick failed");
                        }
                    }
                }
            }
            info!(subsystem = "jobs", component = "beat", "Beat stopped");
        });
        BeatHandle { shutdown_tx, join }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tributary_core::memory::{MemoryStore, MemoryTaskQueue};

    fn beat(queue: Arc<MemoryTaskQueue>, store: Arc<MemoryStore>) -> Beat {
        Beat::new(queue, DistributedLock::new(store))
            .every(Duration::from_secs(300), TaskKind::SweepDueSources)
            .every(Duration::from_secs(600), TaskKind::SweepStalledStages)
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_enqueues_once_per_interval() {
        let queue = Arc::new(MemoryTaskQueue::new());
        let store = Arc::new(MemoryStore::new());
        let beat = beat(queue.clone(), store);

        assert_eq!(beat.tick().await.unwrap().len(), 2);
        assert!(beat.tick().await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(301)).await;
        // Window reopened, but the first sweep is still pending.
        assert!(beat.tick().await.unwrap().is_empty());
        assert_eq!(queue.pending_of(TaskKind::SweepDueSources).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_processes_share_the_window() {
        let queue = Arc::new(MemoryTaskQueue::new());
        let store = Arc::new(MemoryStore::new());
        let a = beat(queue.clone(), store.clone());
        let b = beat(queue.clone(), store);

        a.tick().await.unwrap();
        b.tick().await.unwrap();
        assert_eq!(queue.tasks().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_beat_stops_on_shutdown() {
        let queue = Arc::new(MemoryTaskQueue::new());
        let handle = beat(queue.clone(), Arc::new(MemoryStore::new()))
            .with_tick(Duration::from_secs(1))
            .start();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.shutdown().await;
        assert_eq!(queue.tasks().len(), 2);
    }
}
