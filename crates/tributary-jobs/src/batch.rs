//! Fan-out/fan-in batches with progress reporting.
//!
//! Batch state lives in the coordination store under `batch:{id}:*`:
//!
//! | Key | Meaning |
//! |-----|---------|
//! | `phase` | [`BatchPhase`] shown to pollers |
//! | `total` | members fanned out |
//! | `completed` / `failed` | members finished, by outcome |
//! | `remaining` | countdown, atomically decremented |
//! | `callback` | serialized [`EnqueueRequest`] fired at zero |
//! | `ack:{index}` | per-member acknowledgement marker |
//! | `fired` | callback guard |
//!
//! Only the member whose decrement observes zero fires the callback; the
//! `fired` marker keeps a retried fire from enqueuing it twice.

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, instrument, trace};
use uuid::Uuid;

use tributary_core::{
    defaults, BatchPhase, BatchProgress, CoordinationStore, EnqueueRequest, Error, Result,
    TaskEnvelope, TaskQueue,
};

/// Configuration for [`BatchOrchestrator`].
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Lifetime of batch state in the coordination store.
    pub state_ttl: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            state_ttl: Duration::from_secs(defaults::BATCH_STATE_TTL_SECS),
        }
    }
}

impl BatchConfig {
    /// Reads `BATCH_STATE_TTL_SECS` (default `86400`).
    pub fn from_env() -> Self {
        let secs = std::env::var("BATCH_STATE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::BATCH_STATE_TTL_SECS);
        Self {
            state_ttl: Duration::from_secs(secs.max(1)),
        }
    }
}

/// Batch coordinates injected into every member's kwargs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMember {
    pub batch_id: Uuid,
    pub batch_index: usize,
}

impl BatchMember {
    /// Read the batch coordinates of a member task.
    pub fn of(task: &TaskEnvelope) -> Result<Self> {
        task.kwargs()
    }
}

/// What a member acknowledgement did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberAck {
    /// This member had already been counted (re-delivery).
    Duplicate,
    /// Counted; `remaining` members are still outstanding.
    Counted { remaining: i64 },
    /// Counted as the last member; the callback was enqueued.
    CallbackFired { task_id: Uuid },
}

/// Runs fan-out/fan-in batches over a coordination store and a queue.
#[derive(Clone)]
pub struct BatchOrchestrator {
    store: Arc<dyn CoordinationStore>,
    queue: Arc<dyn TaskQueue>,
    config: BatchConfig,
}

fn key(batch_id: Uuid, field: &str) -> String {
    format!("batch:{batch_id}:{field}")
}

impl BatchOrchestrator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        queue: Arc<dyn TaskQueue>,
        config: BatchConfig,
    ) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    async fn put(&self, batch_id: Uuid, field: &str, value: &str) -> Result<()> {
        self.store
            .set(&key(batch_id, field), value, Some(self.config.state_ttl))
            .await
    }

    async fn read_i64(&self, batch_id: Uuid, field: &str) -> Result<i64> {
        match self.store.get(&key(batch_id, field)).await? {
            Some(v) => v.parse().map_err(|_| {
                Error::Coordination(format!("batch {batch_id} {field} is not an integer: {v}"))
            }),
            None => Ok(0),
        }
    }

    /// Create a batch in phase `fetching`.
    pub async fn open(&self) -> Result<Uuid> {
        let batch_id = Uuid::now_v7();
        self.set_phase(batch_id, BatchPhase::Fetching).await?;
        for field in ["total", "completed", "failed", "remaining"] {
            self.put(batch_id, field, "0").await?;
        }
        debug!(subsystem = "jobs", component = "batch", %batch_id, "Batch opened");
        Ok(batch_id)
    }

    pub async fn set_phase(&self, batch_id: Uuid, phase: BatchPhase) -> Result<()> {
        self.put(batch_id, "phase", phase.as_str()).await
    }

    /// Enqueue `members` and arm `callback` to run once all of them have
    /// acknowledged. Counters and the callback are stored before the first
    /// member is enqueued, so a fast member never finds an unarmed batch.
    #[instrument(
        skip(self, members, callback),
        fields(subsystem = "jobs", component = "batch", op = "fan_out", result_count = members.len())
    )]
    pub async fn fan_out(
        &self,
        batch_id: Uuid,
        members: Vec<EnqueueRequest>,
        callback: EnqueueRequest,
    ) -> Result<Vec<Uuid>> {
        let total = members.len() as i64;
        let callback = serde_json::to_string(&callback)?;

        self.put(batch_id, "total", &total.to_string()).await?;
        self.put(batch_id, "completed", "0").await?;
        self.put(batch_id, "failed", "0").await?;
        self.put(batch_id, "remaining", &total.to_string()).await?;
        self.put(batch_id, "callback", &callback).await?;
        self.set_phase(batch_id, BatchPhase::Analyzing).await?;

        if members.is_empty() {
            self.fire_callback(batch_id).await?;
            return Ok(Vec::new());
        }

        let requests = members
            .into_iter()
            .enumerate()
            .map(|(index, request)| with_member(request, batch_id, index))
            .collect::<Result<Vec<_>>>()?;
        let ids = try_join_all(requests.into_iter().map(|r| self.queue.enqueue(r))).await?;

        info!(%batch_id, "Batch fanned out");
        Ok(ids)
    }

    /// Record that member `index` finished. Each member is counted once no
    /// matter how often it is delivered.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "batch", op = "member_finished"))]
    pub async fn member_finished(
        &self,
        batch_id: Uuid,
        index: usize,
        succeeded: bool,
    ) -> Result<MemberAck> {
        let outcome = if succeeded { "completed" } else { "failed" };
        let acked = self
            .store
            .set_if_absent(
                &key(batch_id, &format!("ack:{index}")),
                outcome,
                self.config.state_ttl,
            )
            .await?;

        if !acked {
            // A duplicate of the last member may still need to fire a
            // callback whose first enqueue failed.
            if self.read_i64(batch_id, "remaining").await? <= 0 {
                if let Some(task_id) = self.fire_callback(batch_id).await? {
                    return Ok(MemberAck::CallbackFired { task_id });
                }
            }
            debug!("Duplicate acknowledgement ignored");
            return Ok(MemberAck::Duplicate);
        }

        self.store.increment(&key(batch_id, outcome), 1).await?;
        let remaining = self.store.increment(&key(batch_id, "remaining"), -1).await?;
        trace!(remaining, "Member counted");

        if remaining < 0 {
            error!(remaining, "Batch countdown went negative, bookkeeping lost");
            return Ok(MemberAck::Counted { remaining });
        }
        if remaining == 0 {
            if let Some(task_id) = self.fire_callback(batch_id).await? {
                return Ok(MemberAck::CallbackFired { task_id });
            }
        }
        Ok(MemberAck::Counted { remaining })
    }

    /// Enqueue the callback unless it was already fired.
    async fn fire_callback(&self, batch_id: Uuid) -> Result<Option<Uuid>> {
        let fired = key(batch_id, "fired");
        if !self
            .store
            .set_if_absent(&fired, "1", self.config.state_ttl)
            .await?
        {
            return Ok(None);
        }

        let result: Result<Uuid> = async {
            let raw = self
                .store
                .get(&key(batch_id, "callback"))
                .await?
                .ok_or_else(|| Error::NotFound(format!("callback of batch {batch_id}")))?;
            let request: EnqueueRequest = serde_json::from_str(&raw)?;
            self.set_phase(batch_id, BatchPhase::Saving).await?;
            self.queue.enqueue(request).await
        }
        .await;

        match result {
            Ok(task_id) => {
                info!(subsystem = "jobs", component = "batch", %batch_id, %task_id, "Batch callback fired");
                Ok(Some(task_id))
            }
            Err(e) => {
                self.store.delete(&fired).await?;
                Err(e)
            }
        }
    }

    /// Mark the batch done.
    pub async fn finish(&self, batch_id: Uuid) -> Result<()> {
        self.set_phase(batch_id, BatchPhase::Done).await
    }

    /// Current progress, `None` for unknown or expired batches.
    pub async fn progress(&self, batch_id: Uuid) -> Result<Option<BatchProgress>> {
        let Some(phase) = self.store.get(&key(batch_id, "phase")).await? else {
            return Ok(None);
        };
        Ok(Some(BatchProgress {
            batch_id,
            phase: phase.parse()?,
            total: self.read_i64(batch_id, "total").await?,
            completed: self.read_i64(batch_id, "completed").await?,
            failed: self.read_i64(batch_id, "failed").await?,
            remaining: self.read_i64(batch_id, "remaining").await?,
        }))
    }
}

fn with_member(mut request: EnqueueRequest, batch_id: Uuid, index: usize) -> Result<EnqueueRequest> {
    let JsonValue::Object(kwargs) = &mut request.kwargs else {
        return Err(Error::InvalidInput(format!(
            "batch member {} kwargs must be an object",
            request.kind
        )));
    };
    kwargs.insert("batch_id".into(), JsonValue::String(batch_id.to_string()));
    kwargs.insert("batch_index".into(), JsonValue::from(index));
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tributary_core::memory::{MemoryStore, MemoryTaskQueue};
    use tributary_core::TaskKind;

    fn orchestrator() -> (BatchOrchestrator, Arc<MemoryTaskQueue>) {
        let queue = Arc::new(MemoryTaskQueue::new());
        let batches = BatchOrchestrator::new(
            Arc::new(MemoryStore::new()),
            queue.clone(),
            BatchConfig::default(),
        );
        (batches, queue)
    }

    fn members(n: usize) -> Vec<EnqueueRequest> {
        (0..n)
            .map(|i| EnqueueRequest::new(TaskKind::SyncRepository, json!({ "n": i })))
            .collect()
    }

    fn callback() -> EnqueueRequest {
        EnqueueRequest::new(TaskKind::FinishRepoSync, json!({ "done": true }))
    }

    #[tokio::test]
    async fn test_fan_out_tags_members_and_sets_counters() {
        let (batches, queue) = orchestrator();
        let batch_id = batches.open().await.unwrap();
        assert_eq!(
            batches.progress(batch_id).await.unwrap().unwrap().phase,
            BatchPhase::Fetching
        );

        let ids = batches.fan_out(batch_id, members(3), callback()).await.unwrap();
        assert_eq!(ids.len(), 3);

        let task = queue.get(ids[2]).await.unwrap().unwrap();
        let member = BatchMember::of(&task).unwrap();
        assert_eq!(member.batch_id, batch_id);
        assert_eq!(member.batch_index, 2);
        assert_eq!(task.kwargs["n"], 2);

        let progress = batches.progress(batch_id).await.unwrap().unwrap();
        assert_eq!(progress.phase, BatchPhase::Analyzing);
        assert_eq!((progress.total, progress.remaining, progress.completed), (3, 3, 0));
    }

    #[tokio::test]
    async fn test_last_member_fires_callback_once() {
        let (batches, queue) = orchestrator();
        let batch_id = batches.open().await.unwrap();
        batches.fan_out(batch_id, members(2), callback()).await.unwrap();

        assert_eq!(
            batches.member_finished(batch_id, 0, true).await.unwrap(),
            MemberAck::Counted { remaining: 1 }
        );
        let fired = batches.member_finished(batch_id, 1, false).await.unwrap();
        assert!(matches!(fired, MemberAck::CallbackFired { .. }));

        assert_eq!(
            batches.member_finished(batch_id, 1, false).await.unwrap(),
            MemberAck::Duplicate
        );
        assert_eq!(queue.pending_of(TaskKind::FinishRepoSync).len(), 1);

        let progress = batches.progress(batch_id).await.unwrap().unwrap();
        assert_eq!(progress.phase, BatchPhase::Saving);
        assert_eq!((progress.completed, progress.failed, progress.remaining), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_duplicate_ack_does_not_drive_countdown() {
        let (batches, queue) = orchestrator();
        let batch_id = batches.open().await.unwrap();
        batches.fan_out(batch_id, members(2), callback()).await.unwrap();

        batches.member_finished(batch_id, 0, true).await.unwrap();
        assert_eq!(
            batches.member_finished(batch_id, 0, true).await.unwrap(),
            MemberAck::Duplicate
        );
        assert!(queue.pending_of(TaskKind::FinishRepoSync).is_empty());
        assert_eq!(
            batches.progress(batch_id).await.unwrap().unwrap().remaining,
            1
        );
    }

    #[tokio::test]
    async fn test_empty_batch_fires_immediately() {
        let (batches, queue) = orchestrator();
        let batch_id = batches.open().await.unwrap();
        let ids = batches.fan_out(batch_id, Vec::new(), callback()).await.unwrap();
        assert!(ids.is_empty());
        assert_eq!(queue.pending_of(TaskKind::FinishRepoSync).len(), 1);

        batches.finish(batch_id).await.unwrap();
        assert!(batches.progress(batch_id).await.unwrap().unwrap().is_done());
    }

    #[tokio::test]
    async fn test_non_object_kwargs_are_rejected() {
        let (batches, _queue) = orchestrator();
        let batch_id = batches.open().await.unwrap();
        let members = vec![EnqueueRequest::new(TaskKind::SyncRepository, json!([1, 2]))];
        assert!(batches.fan_out(batch_id, members, callback()).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_batch_has_no_progress() {
        let (batches, _queue) = orchestrator();
        assert!(batches.progress(Uuid::now_v7()).await.unwrap().is_none());
    }
}
