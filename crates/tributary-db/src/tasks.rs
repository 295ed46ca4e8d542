//! PostgreSQL task queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres, Row};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use tributary_core::{
    defaults, EnqueueRequest, Error, QueueStats, Result, TaskEnvelope, TaskKind, TaskQueue,
    TaskStatus,
};

const TASK_COLUMNS: &str = "id, kind, kwargs, lane, status, eta, attempts, max_retries, dedup_key,
     result, last_error, created_at, started_at, finished_at";

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero())
}

/// PostgreSQL implementation of [`TaskQueue`].
///
/// Claims use `FOR UPDATE SKIP LOCKED` so any number of workers can poll
/// the same table without handing a task out twice.
pub struct PgTaskQueue {
    pool: Pool<Postgres>,
    /// Wakes idle workers in this process when a task is enqueued.
    notify: Arc<Notify>,
    default_max_retries: i32,
}

impl PgTaskQueue {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
            default_max_retries: defaults::TASK_MAX_RETRIES,
        }
    }

    /// Override the retry budget applied when a request does not set one.
    pub fn with_default_max_retries(mut self, max_retries: i32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    fn parse_task_row(row: sqlx::postgres::PgRow) -> Result<TaskEnvelope> {
        let kind: String = row.get("kind");
        let lane: String = row.get("lane");
        let status: String = row.get("status");
        Ok(TaskEnvelope {
            id: row.get("id"),
            kind: kind.parse()?,
            kwargs: row.get("kwargs"),
            lane: lane.parse()?,
            status: status.parse()?,
            eta: row.get("eta"),
            attempts: row.get("attempts"),
            max_retries: row.get("max_retries"),
            dedup_key: row.get("dedup_key"),
            result: row.get("result"),
            last_error: row.get("last_error"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
        })
    }

    async fn set_terminal(
        &self,
        id: Uuid,
        status: TaskStatus,
        result: Option<JsonValue>,
        error: Option<&str>,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE task_queue
             SET status = $1, result = COALESCE($2, result), last_error = COALESCE($3, last_error),
                 finished_at = $4
             WHERE id = $5",
        )
        .bind(status.as_str())
        .bind(&result)
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if updated.rows_affected() == 0 {
            return Err(Error::Queue(format!("task {id} not found")));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Uuid> {
        let id = Uuid::now_v7();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO task_queue (id, kind, kwargs, lane, lane_rank, status, eta, max_retries,
                                     dedup_key, created_at)
             VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, $8, $9)",
        )
        .bind(id)
        .bind(request.kind.as_str())
        .bind(&request.kwargs)
        .bind(request.lane.as_str())
        .bind(request.lane.rank())
        .bind(request.resolve_eta(now))
        .bind(request.max_retries.unwrap_or(self.default_max_retries))
        .bind(&request.dedup_key)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "task_queue",
            task_id = %id,
            task_kind = %request.kind,
            lane = request.lane.as_str(),
            "Task enqueued"
        );
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn enqueue_unique(&self, request: EnqueueRequest) -> Result<Option<Uuid>> {
        let Some(dedup_key) = request.dedup_key.clone() else {
            return self.enqueue(request).await.map(Some);
        };

        let id = Uuid::now_v7();
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Serialize concurrent enqueues of the same key for the rest of the
        // transaction; NOT EXISTS alone races under READ COMMITTED.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(&dedup_key)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        let inserted = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO task_queue (id, kind, kwargs, lane, lane_rank, status, eta, max_retries,
                                     dedup_key, created_at)
             SELECT $1, $2, $3, $4, $5, 'pending', $6, $7, $8, $9
             WHERE NOT EXISTS (
                 SELECT 1 FROM task_queue
                 WHERE dedup_key = $8 AND status IN ('pending', 'running')
             )
             RETURNING id",
        )
        .bind(id)
        .bind(request.kind.as_str())
        .bind(&request.kwargs)
        .bind(request.lane.as_str())
        .bind(request.lane.rank())
        .bind(request.resolve_eta(now))
        .bind(request.max_retries.unwrap_or(self.default_max_retries))
        .bind(&dedup_key)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        if inserted.is_some() {
            self.notify.notify_waiters();
        } else {
            debug!(
                subsystem = "db",
                component = "task_queue",
                dedup_key = %dedup_key,
                "Skipped enqueue, task with same key is pending or running"
            );
        }
        Ok(inserted)
    }

    async fn claim_next(&self, kinds: &[TaskKind]) -> Result<Option<TaskEnvelope>> {
        let now = Utc::now();
        let kind_strings: Vec<String> = kinds.iter().map(|k| k.as_str().to_string()).collect();

        let query = format!(
            "UPDATE task_queue
             SET status = 'running', started_at = $1
             WHERE id = (
                 SELECT id FROM task_queue
                 WHERE status = 'pending'
                   AND eta <= $1
                   AND (cardinality($2::text[]) = 0 OR kind = ANY($2))
                 ORDER BY lane_rank ASC, eta ASC, created_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {TASK_COLUMNS}"
        );

        let row = sqlx::query(&query)
            .bind(now)
            .bind(&kind_strings)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(Self::parse_task_row).transpose()
    }

    async fn complete(&self, id: Uuid, result: Option<JsonValue>) -> Result<()> {
        self.set_terminal(id, TaskStatus::Completed, result, None)
            .await
    }

    async fn reject(&self, id: Uuid, reason: &str) -> Result<()> {
        self.set_terminal(id, TaskStatus::Rejected, None, Some(reason))
            .await
    }

    async fn retry_or_dead(&self, id: Uuid, error: &str, delay: Duration) -> Result<TaskStatus> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let (attempts, max_retries): (i32, i32) = sqlx::query_as(
            "SELECT attempts, max_retries FROM task_queue WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .ok_or_else(|| Error::Queue(format!("task {id} not found")))?;

        let status = if attempts < max_retries {
            sqlx::query(
                "UPDATE task_queue
                 SET status = 'pending', attempts = attempts + 1, last_error = $1,
                     eta = $2, started_at = NULL
                 WHERE id = $3",
            )
            .bind(error)
            .bind(now + to_chrono(delay))
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
            TaskStatus::Pending
        } else {
            sqlx::query(
                "UPDATE task_queue
                 SET status = 'dead', last_error = $1, finished_at = $2
                 WHERE id = $3",
            )
            .bind(error)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
            TaskStatus::Dead
        };

        tx.commit().await.map_err(Error::Database)?;
        if status == TaskStatus::Pending {
            self.notify.notify_waiters();
        }
        Ok(status)
    }

    async fn dead_letter(&self, id: Uuid, error: &str) -> Result<()> {
        self.set_terminal(id, TaskStatus::Dead, None, Some(error))
            .await
    }

    async fn requeue_stale(&self, older_than: Duration) -> Result<u64> {
        let now = Utc::now();
        let cutoff: DateTime<Utc> = now - to_chrono(older_than);

        // SET expressions all see the pre-update row.
        let updated = sqlx::query(
            "UPDATE task_queue
             SET status = CASE WHEN attempts < max_retries THEN 'pending' ELSE 'dead' END,
                 attempts = CASE WHEN attempts < max_retries THEN attempts + 1 ELSE attempts END,
                 eta = CASE WHEN attempts < max_retries THEN $1 ELSE eta END,
                 started_at = CASE WHEN attempts < max_retries THEN NULL ELSE started_at END,
                 finished_at = CASE WHEN attempts < max_retries THEN NULL ELSE $1 END,
                 last_error = 'worker lost while running'
             WHERE status = 'running' AND started_at < $2",
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        let touched = updated.rows_affected();
        if touched > 0 {
            warn!(
                subsystem = "db",
                component = "task_queue",
                op = "requeue_stale",
                result_count = touched,
                "Reclaimed tasks orphaned by a lost worker"
            );
            self.notify.notify_waiters();
        }
        Ok(touched)
    }

    async fn get(&self, id: Uuid) -> Result<Option<TaskEnvelope>> {
        let query = format!("SELECT {TASK_COLUMNS} FROM task_queue WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(Self::parse_task_row).transpose()
    }

    async fn list_dead(&self, limit: i64) -> Result<Vec<TaskEnvelope>> {
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM task_queue
             WHERE status = 'dead'
             ORDER BY finished_at DESC
             LIMIT $1"
        );
        let rows = sqlx::query(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_task_row).collect()
    }

    async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'pending' AND lane = 'high') AS pending_high,
                COUNT(*) FILTER (WHERE status = 'running') AS running,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'rejected') AS rejected,
                COUNT(*) FILTER (WHERE status = 'dead') AS dead
             FROM task_queue",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(QueueStats {
            pending: row.get("pending"),
            pending_high: row.get("pending_high"),
            running: row.get("running"),
            completed: row.get("completed"),
            rejected: row.get("rejected"),
            dead: row.get("dead"),
        })
    }

    fn wake_signal(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_chrono_converts_seconds() {
        assert_eq!(to_chrono(Duration::from_secs(90)), chrono::Duration::seconds(90));
    }

    #[test]
    fn test_task_columns_cover_envelope_fields() {
        for column in [
            "id",
            "kind",
            "kwargs",
            "lane",
            "status",
            "eta",
            "attempts",
            "max_retries",
            "dedup_key",
            "result",
            "last_error",
            "created_at",
            "started_at",
            "finished_at",
        ] {
            assert!(TASK_COLUMNS.contains(column), "missing column {column}");
        }
    }
}
