//! Source repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use tributary_core::{
    defaults, CacheValidators, CreateSourceRequest, Error, Result, Source, SourceRepository,
    SourceStatus, SourceUpdate,
};

const SOURCE_COLUMNS: &str = "id, url, title, status, error_count, last_fetch_status,
     last_fetch_error, last_fetched_at, next_fetch_at, etag, last_modified,
     refresh_interval_minutes, created_at";

/// PostgreSQL implementation of [`SourceRepository`].
pub struct PgSourceRepository {
    pool: Pool<Postgres>,
}

impl PgSourceRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_source_row(row: sqlx::postgres::PgRow) -> Result<Source> {
        let status: String = row.get("status");
        let last_fetch_status: Option<String> = row.get("last_fetch_status");
        Ok(Source {
            id: row.get("id"),
            url: row.get("url"),
            title: row.get("title"),
            status: status.parse()?,
            error_count: row.get("error_count"),
            last_fetch_status: last_fetch_status.map(|s| s.parse()).transpose()?,
            last_fetch_error: row.get("last_fetch_error"),
            last_fetched_at: row.get("last_fetched_at"),
            next_fetch_at: row.get("next_fetch_at"),
            validators: CacheValidators {
                etag: row.get("etag"),
                last_modified: row.get("last_modified"),
            },
            refresh_interval_minutes: row.get("refresh_interval_minutes"),
            created_at: row.get("created_at"),
        })
    }
}

#[async_trait]
impl SourceRepository for PgSourceRepository {
    async fn create(&self, request: CreateSourceRequest) -> Result<Uuid> {
        if request.url.trim().is_empty() {
            return Err(Error::InvalidInput("source url must not be empty".into()));
        }
        let id = Uuid::now_v7();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO sources (id, url, title, status, next_fetch_at, refresh_interval_minutes,
                                  created_at)
             VALUES ($1, $2, $3, 'active', $4, $5, $4)",
        )
        .bind(id)
        .bind(&request.url)
        .bind(&request.title)
        .bind(now)
        .bind(
            request
                .refresh_interval_minutes
                .unwrap_or(defaults::SOURCE_REFRESH_INTERVAL_MINUTES),
        )
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Source>> {
        let query = format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(Self::parse_source_row).transpose()
    }

    async fn record_attempt(&self, id: Uuid, update: &SourceUpdate) -> Result<()> {
        let (has_validators, etag, last_modified) = match &update.validators {
            Some(v) => (true, v.etag.clone(), v.last_modified.clone()),
            None => (false, None, None),
        };

        let result = sqlx::query(
            "UPDATE sources
             SET status = $1,
                 error_count = $2,
                 last_fetch_status = $3,
                 last_fetch_error = $4,
                 last_fetched_at = $5,
                 next_fetch_at = $6,
                 etag = CASE WHEN $7 THEN $8 ELSE etag END,
                 last_modified = CASE WHEN $7 THEN $9 ELSE last_modified END
             WHERE id = $10",
        )
        .bind(update.status.as_str())
        .bind(update.error_count)
        .bind(update.last_fetch_status.as_str())
        .bind(&update.last_fetch_error)
        .bind(update.last_fetched_at)
        .bind(update.next_fetch_at)
        .bind(has_validators)
        .bind(etag)
        .bind(last_modified)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::SourceNotFound(id));
        }
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Source>> {
        let query = format!(
            "SELECT {SOURCE_COLUMNS} FROM sources
             WHERE status = 'active' AND (next_fetch_at IS NULL OR next_fetch_at <= $1)
             ORDER BY next_fetch_at ASC NULLS FIRST
             LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_source_row).collect()
    }

    async fn set_status(&self, id: Uuid, status: SourceStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sources
             SET status = $1,
                 error_count = CASE WHEN $1 = 'active' THEN 0 ELSE error_count END,
                 next_fetch_at = CASE WHEN $1 = 'active' THEN $2 ELSE next_fetch_at END
             WHERE id = $3",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::SourceNotFound(id));
        }
        Ok(())
    }
}
