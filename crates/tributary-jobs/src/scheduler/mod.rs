//! Source refresh scheduler.
//!
//! Each refresh run holds the `feed:{id}` task lock, waits for the rate
//! limiter, performs a conditional fetch, inserts the new items, applies
//! the state transition in [`state`] and, while the source stays active,
//! enqueues its own successor behind a `schedule:feed:{id}` lock. The
//! periodic [`SourceScheduler::sweep_due`] re-enqueues sources whose chain
//! was lost.

pub mod handlers;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use tributary_core::{
    ContentFetcher, EnqueueRequest, Error, FetchOutcome, ItemKind, ItemRepository, Lane, Result,
    Source, SourceRepository, SourceStatus, TaskKind, TaskQueue,
};

use crate::lock::DistributedLock;
use crate::pipeline::start_items;
use crate::rate_limit::DomainRateLimiter;

pub use handlers::{RefreshSourceHandler, SweepDueSourcesHandler};
pub use state::{retry_delay, transition, RefreshOutcome, SchedulerConfig, Transition};

/// Lock holder used when scheduling on behalf of a caller outside a task.
const TRIGGER_HOLDER: &str = "trigger";

/// Keyword arguments of a `refresh_source` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshKwargs {
    pub source_id: Uuid,
    /// User-requested run; allowed for sources in `ERROR`.
    #[serde(default)]
    pub force: bool,
}

/// Queue de-duplication key shared by successors, sweeps and triggers.
pub fn refresh_dedup_key(source_id: Uuid) -> String {
    format!("refresh:{}", Source::resource_key(source_id))
}

fn refresh_request(source_id: Uuid, force: bool) -> EnqueueRequest {
    EnqueueRequest::new(
        TaskKind::RefreshSource,
        json!({ "source_id": source_id, "force": force }),
    )
    .with_dedup_key(refresh_dedup_key(source_id))
}

/// Outcome of [`SourceScheduler::refresh`].
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshReport {
    /// Another delivery holds the source lock.
    Locked,
    /// Nothing was fetched (missing, disabled, or in `ERROR` without force).
    Skipped(String),
    /// A fetch attempt was made and recorded.
    Completed {
        outcome: RefreshOutcome,
        status: SourceStatus,
        next_delay: Option<Duration>,
        successor: Option<Uuid>,
    },
}

/// Whether a trigger created a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Queued,
    /// A run is already scheduled for this window.
    AlreadyScheduled,
}

/// Answer to [`SourceScheduler::schedule`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleReceipt {
    pub task_id: Option<Uuid>,
    pub status: ScheduleStatus,
    pub delay: Duration,
}

/// Drives refreshes of [`Source`]s.
pub struct SourceScheduler {
    sources: Arc<dyn SourceRepository>,
    items: Arc<dyn ItemRepository>,
    queue: Arc<dyn TaskQueue>,
    fetcher: Arc<dyn ContentFetcher>,
    lock: DistributedLock,
    limiter: DomainRateLimiter,
    config: SchedulerConfig,
}

impl SourceScheduler {
    pub fn new(
        sources: Arc<dyn SourceRepository>,
        items: Arc<dyn ItemRepository>,
        queue: Arc<dyn TaskQueue>,
        fetcher: Arc<dyn ContentFetcher>,
        lock: DistributedLock,
        limiter: DomainRateLimiter,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            sources,
            items,
            queue,
            fetcher,
            lock,
            limiter,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run one refresh of `source_id` on behalf of `holder`.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "scheduler", op = "refresh"))]
    pub async fn refresh(&self, source_id: Uuid, force: bool, holder: &str) -> Result<RefreshReport> {
        let resource = Source::resource_key(source_id);
        if !self
            .lock
            .acquire(&resource, self.config.lock_ttl, holder)
            .await?
        {
            return Ok(RefreshReport::Locked);
        }
        // A trigger's window closes once its run starts.
        if let Err(e) = self.lock.release_schedule(&resource, TRIGGER_HOLDER).await {
            warn!(error = %e, "Failed to release trigger schedule lock");
        }

        let attempt = self.refresh_locked(source_id, force).await;

        if let Err(e) = self.lock.release(&resource, holder).await {
            warn!(error = %e, "Failed to release source lock, it will expire");
        }

        let (outcome, transition) = match attempt? {
            Ok(done) => done,
            Err(reason) => {
                debug!(%reason, "Refresh skipped");
                return Ok(RefreshReport::Skipped(reason));
            }
        };

        let successor = match transition.next_delay {
            Some(delay) => self.schedule_successor(source_id, delay, holder).await?,
            None => None,
        };

        Ok(RefreshReport::Completed {
            outcome,
            status: transition.update.status,
            next_delay: transition.next_delay,
            successor,
        })
    }

    /// The locked part of a refresh. `Ok(Err(reason))` means nothing ran.
    async fn refresh_locked(
        &self,
        source_id: Uuid,
        force: bool,
    ) -> Result<std::result::Result<(RefreshOutcome, Transition), String>> {
        let Some(source) = self.sources.get(source_id).await? else {
            return Ok(Err("source not found".into()));
        };
        match source.status {
            SourceStatus::Disabled => return Ok(Err("source disabled".into())),
            SourceStatus::Error if !force => {
                return Ok(Err("source in error state, needs a forced refresh".into()))
            }
            _ => {}
        }

        let outcome = self.fetch(&source).await?;
        let transition = self.apply(&source, &outcome).await?;
        Ok(Ok((outcome, transition)))
    }

    /// Fetch and ingest. Only fetcher failures become a failed outcome;
    /// storage and coordination errors propagate to the queue.
    async fn fetch(&self, source: &Source) -> Result<RefreshOutcome> {
        self.limiter.wait_for_domain(&source.url).await?;

        let fetched = match self.fetcher.fetch(&source.url, &source.validators).await {
            Ok(fetched) => fetched,
            Err(e) => {
                return Ok(RefreshOutcome::Failed {
                    error: e.to_string(),
                })
            }
        };

        match fetched {
            FetchOutcome::NotModified => Ok(RefreshOutcome::NotModified),
            FetchOutcome::Modified { items, validators } => {
                let created = self.items.insert_new_items(source.id, &items).await?;
                start_items(self.queue.as_ref(), ItemKind::Article, &created).await?;
                debug!(
                    source_id = %source.id,
                    result_count = items.len(),
                    new_items = created.len(),
                    "Ingested items"
                );
                Ok(RefreshOutcome::Fetched {
                    new_items: created.len(),
                    validators,
                })
            }
        }
    }

    async fn apply(&self, source: &Source, outcome: &RefreshOutcome) -> Result<Transition> {
        let transition = transition(source, outcome, &self.config, Utc::now());
        self.sources
            .record_attempt(source.id, &transition.update)
            .await?;

        match outcome {
            RefreshOutcome::Failed { error: message } => {
                if transition.update.status == SourceStatus::Error {
                    error!(
                        source_id = %source.id,
                        error_count = transition.update.error_count,
                        error = %message,
                        "Source moved to error state after consecutive failures"
                    );
                } else {
                    warn!(
                        source_id = %source.id,
                        error_count = transition.update.error_count,
                        delay_secs = transition.next_delay.map(|d| d.as_secs()),
                        error = %message,
                        "Source refresh failed, backing off"
                    );
                }
            }
            RefreshOutcome::Fetched { new_items, .. } => {
                info!(source_id = %source.id, new_items, "Source refreshed");
            }
            RefreshOutcome::NotModified => {
                info!(source_id = %source.id, "Source not modified");
            }
        }
        Ok(transition)
    }

    /// Enqueue the next run unless another process already did for this
    /// window.
    async fn schedule_successor(
        &self,
        source_id: Uuid,
        delay: Duration,
        holder: &str,
    ) -> Result<Option<Uuid>> {
        let resource = Source::resource_key(source_id);
        if !self.lock.try_schedule(&resource, delay, holder).await? {
            return Ok(None);
        }

        // Plain enqueue: the running delivery still carries the same dedup key.
        match self
            .queue
            .enqueue(refresh_request(source_id, false).with_delay(delay))
            .await
        {
            Ok(task_id) => {
                debug!(%source_id, %task_id, delay_secs = delay.as_secs(), "Successor scheduled");
                Ok(Some(task_id))
            }
            Err(e) => {
                if let Err(clear) = self.lock.clear_schedule(&resource).await {
                    warn!(%source_id, error = %clear, "Failed to clear schedule lock");
                }
                Err(e)
            }
        }
    }

    /// Record a refresh killed by the task time limit as a failed attempt
    /// and continue the chain, provided `holder` still owns the source lock.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "scheduler", op = "record_timeout"))]
    pub async fn record_timeout(&self, source_id: Uuid, holder: &str) -> Result<()> {
        let resource = Source::resource_key(source_id);
        if !self.lock.is_held_by(&resource, holder).await? {
            debug!("Timed-out run no longer owns the source");
            return Ok(());
        }

        let applied = match self.sources.get(source_id).await? {
            Some(source) => {
                let outcome = RefreshOutcome::Failed {
                    error: "refresh timed out".into(),
                };
                Some(self.apply(&source, &outcome).await?)
            }
            None => None,
        };
        self.lock.release(&resource, holder).await?;

        if let Some(delay) = applied.and_then(|t| t.next_delay) {
            self.schedule_successor(source_id, delay, holder).await?;
        }
        Ok(())
    }

    /// Trigger a refresh from outside the chain.
    ///
    /// `force_immediate` enqueues on the high lane with no delay and is the
    /// only way to run a source in `ERROR`. Otherwise the delay comes from
    /// the source's `next_fetch_at` and is guarded by the schedule lock.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "scheduler", op = "schedule"))]
    pub async fn schedule(&self, source_id: Uuid, force_immediate: bool) -> Result<ScheduleReceipt> {
        let source = self
            .sources
            .get(source_id)
            .await?
            .ok_or(Error::SourceNotFound(source_id))?;

        if source.status == SourceStatus::Disabled {
            return Err(Error::InvalidInput(format!("source {source_id} is disabled")));
        }

        if force_immediate {
            let task_id = self
                .queue
                .enqueue(refresh_request(source_id, true).with_lane(Lane::High))
                .await?;
            info!(%source_id, %task_id, lane = Lane::High.as_str(), "Forced refresh queued");
            return Ok(ScheduleReceipt {
                task_id: Some(task_id),
                status: ScheduleStatus::Queued,
                delay: Duration::ZERO,
            });
        }

        if source.status == SourceStatus::Error {
            return Err(Error::InvalidInput(format!(
                "source {source_id} is in error state, force a refresh to retry it"
            )));
        }

        let delay = source
            .next_fetch_at
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .unwrap_or(Duration::ZERO);
        let already = ScheduleReceipt {
            task_id: None,
            status: ScheduleStatus::AlreadyScheduled,
            delay,
        };

        let resource = Source::resource_key(source_id);
        if !self.lock.try_schedule(&resource, delay, TRIGGER_HOLDER).await? {
            return Ok(already);
        }
        match self
            .queue
            .enqueue_unique(refresh_request(source_id, false).with_delay(delay))
            .await
        {
            Ok(Some(task_id)) => Ok(ScheduleReceipt {
                task_id: Some(task_id),
                status: ScheduleStatus::Queued,
                delay,
            }),
            Ok(None) => Ok(already),
            Err(e) => {
                self.lock.clear_schedule(&resource).await?;
                Err(e)
            }
        }
    }

    /// Enqueue a refresh for every active source that is due and has no
    /// pending run. Returns the number of tasks created.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "scheduler", op = "sweep_due"))]
    pub async fn sweep_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.sources.due(now, self.config.sweep_limit).await?;
        let mut enqueued = 0;
        for source in &due {
            if self
                .queue
                .enqueue_unique(refresh_request(source.id, false))
                .await?
                .is_some()
            {
                enqueued += 1;
            }
        }
        if enqueued > 0 {
            info!(result_count = enqueued, due = due.len(), "Re-enqueued due sources");
        }
        Ok(enqueued)
    }
}
