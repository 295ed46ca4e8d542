//! Task handlers for source refreshes and the due-source sweep.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use tributary_core::{TaskEnvelope, TaskKind};

use super::{RefreshKwargs, RefreshOutcome, RefreshReport, SourceScheduler};
use crate::handler::{holder_id, TaskContext, TaskHandler, TaskResult};

/// Handler for `refresh_source`.
///
/// A busy lock or an inactive source rejects the delivery. Fetch failures
/// are part of the source state machine and complete the task; only
/// storage or coordination errors reach the queue's retry policy.
pub struct RefreshSourceHandler {
    scheduler: Arc<SourceScheduler>,
}

impl RefreshSourceHandler {
    pub fn new(scheduler: Arc<SourceScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl TaskHandler for RefreshSourceHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::RefreshSource
    }

    #[instrument(
        skip(self, ctx),
        fields(subsystem = "jobs", component = "scheduler", op = "execute", task_id = %ctx.task_id())
    )]
    async fn execute(&self, ctx: TaskContext) -> TaskResult {
        let start = Instant::now();
        let kwargs: RefreshKwargs = match ctx.kwargs() {
            Ok(k) => k,
            Err(e) => return TaskResult::Failed(e.to_string()),
        };

        let report = match self
            .scheduler
            .refresh(kwargs.source_id, kwargs.force, &ctx.holder_id())
            .await
        {
            Ok(report) => report,
            Err(e) => return TaskResult::from_error(&e),
        };

        match report {
            RefreshReport::Locked => {
                debug!(source_id = %kwargs.source_id, "Source locked by another delivery");
                TaskResult::Rejected(format!("source {} is locked", kwargs.source_id))
            }
            RefreshReport::Skipped(reason) => TaskResult::Rejected(reason),
            RefreshReport::Completed {
                outcome,
                status,
                next_delay,
                successor,
            } => {
                let (fetch, new_items, error) = match &outcome {
                    RefreshOutcome::Fetched { new_items, .. } => ("success", *new_items, None),
                    RefreshOutcome::NotModified => ("not_modified", 0, None),
                    RefreshOutcome::Failed { error } => ("failed", 0, Some(error.clone())),
                };
                info!(
                    source_id = %kwargs.source_id,
                    fetch,
                    new_items,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Refresh finished"
                );
                TaskResult::Success(Some(json!({
                    "fetch": fetch,
                    "new_items": new_items,
                    "error": error,
                    "status": status.as_str(),
                    "next_delay_secs": next_delay.map(|d| d.as_secs()),
                    "successor": successor,
                })))
            }
        }
    }

    async fn on_timeout(&self, task: &TaskEnvelope) -> TaskResult {
        let Ok(kwargs) = task.kwargs::<RefreshKwargs>() else {
            return TaskResult::Failed("malformed kwargs".into());
        };
        if let Err(e) = self
            .scheduler
            .record_timeout(kwargs.source_id, &holder_id(task))
            .await
        {
            warn!(source_id = %kwargs.source_id, error = %e, "Failed to record refresh timeout");
        }
        TaskResult::Rejected(format!("refresh of {} timed out", kwargs.source_id))
    }
}

/// Handler for the periodic `sweep_due_sources` task.
pub struct SweepDueSourcesHandler {
    scheduler: Arc<SourceScheduler>,
}

impl SweepDueSourcesHandler {
    pub fn new(scheduler: Arc<SourceScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl TaskHandler for SweepDueSourcesHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::SweepDueSources
    }

    async fn execute(&self, _ctx: TaskContext) -> TaskResult {
        match self.scheduler.sweep_due(Utc::now()).await {
            Ok(enqueued) => TaskResult::Success(Some(json!({ "enqueued": enqueued }))),
            Err(e) => TaskResult::from_error(&e),
        }
    }
}
