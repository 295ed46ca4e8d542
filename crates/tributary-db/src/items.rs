//! Work item repository: items, per-stage flags and derived data.
//!
//! Every stage owns four columns on `work_items`, all derived from
//! [`Stage::flag_name`]: the tri-state flag, its attempt time, the attempt
//! counter and the last error.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde_json::json;
use sqlx::{PgConnection, Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use tributary_core::{
    Analysis, EmbeddedChunk, Error, ImageCaption, IncomingItem, ItemKind, ItemRepository,
    RepoDetails, RepoRef, Result, Stage, StageState, TriState, WorkItem,
};

const ITEM_BASE_COLUMNS: &str =
    "id, kind, source_id, external_id, title, url, content, metadata, created_at";

fn item_columns() -> String {
    let mut columns = ITEM_BASE_COLUMNS.to_string();
    for stage in Stage::ALL {
        let flag = stage.flag_name();
        columns.push_str(&format!(
            ", {flag}, {flag}_at, {flag}_attempts, {flag}_error"
        ));
    }
    columns
}

/// PostgreSQL implementation of [`ItemRepository`].
pub struct PgItemRepository {
    pool: Pool<Postgres>,
}

impl PgItemRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_item_row(row: sqlx::postgres::PgRow) -> Result<WorkItem> {
        let kind: ItemKind = row.get::<String, _>("kind").parse()?;

        let mut stages = BTreeMap::new();
        for &stage in kind.stages() {
            let flag = stage.flag_name();
            let status: String = row.get(flag);
            stages.insert(
                stage,
                StageState {
                    status: status.parse()?,
                    attempted_at: row.get(format!("{flag}_at").as_str()),
                    attempts: row.get(format!("{flag}_attempts").as_str()),
                    error: row.get(format!("{flag}_error").as_str()),
                },
            );
        }

        Ok(WorkItem {
            id: row.get("id"),
            kind,
            source_id: row.get("source_id"),
            external_id: row.get("external_id"),
            title: row.get("title"),
            url: row.get("url"),
            content: row.get("content"),
            metadata: row.get("metadata"),
            stages,
            created_at: row.get("created_at"),
        })
    }

    /// Find or insert a repository item on an open connection.
    async fn upsert_repository_on(conn: &mut PgConnection, repo: &RepoRef) -> Result<(Uuid, bool)> {
        let inserted = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO work_items (id, kind, external_id, title, url, content, created_at)
             VALUES ($1, 'repository', $2, $3, $4, $3, $5)
             ON CONFLICT (external_id) WHERE kind = 'repository' DO NOTHING
             RETURNING id",
        )
        .bind(Uuid::now_v7())
        .bind(repo.external_id())
        .bind(repo.full_name())
        .bind(repo.html_url())
        .bind(Utc::now())
        .fetch_optional(&mut *conn)
        .await
        .map_err(Error::Database)?;

        if let Some(id) = inserted {
            return Ok((id, true));
        }

        let existing = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM work_items WHERE kind = 'repository' AND external_id = $1",
        )
        .bind(repo.external_id())
        .fetch_one(&mut *conn)
        .await
        .map_err(Error::Database)?;

        Ok((existing, false))
    }

    async fn ensure_exists(&self, id: Uuid) -> Result<()> {
        let found = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM work_items WHERE id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        if found == 0 {
            return Err(Error::ItemNotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl ItemRepository for PgItemRepository {
    async fn get(&self, id: Uuid) -> Result<Option<WorkItem>> {
        let query = format!("SELECT {} FROM work_items WHERE id = $1", item_columns());
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(Self::parse_item_row).transpose()
    }

    async fn insert_new_items(
        &self,
        source_id: Uuid,
        items: &[IncomingItem],
    ) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let mut inserted = Vec::new();

        for item in items {
            let metadata = match item.published_at {
                Some(published_at) => json!({ "published_at": published_at }),
                None => json!({}),
            };
            let id = sqlx::query_scalar::<_, Uuid>(
                "INSERT INTO work_items (id, kind, source_id, external_id, title, url, content,
                                         metadata, created_at)
                 VALUES ($1, 'article', $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (source_id, external_id) WHERE source_id IS NOT NULL DO NOTHING
                 RETURNING id",
            )
            .bind(Uuid::now_v7())
            .bind(source_id)
            .bind(&item.external_id)
            .bind(&item.title)
            .bind(&item.url)
            .bind(&item.content)
            .bind(metadata)
            .bind(Utc::now())
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::Database)?;

            if let Some(id) = id {
                inserted.push(id);
            }
        }

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "items",
            source_id = %source_id,
            input_count = items.len(),
            result_count = inserted.len(),
            "Inserted new items"
        );
        Ok(inserted)
    }

    async fn record_stage(
        &self,
        id: Uuid,
        stage: Stage,
        status: TriState,
        error: Option<&str>,
    ) -> Result<()> {
        let flag = stage.flag_name();
        let error = match status {
            TriState::Failed => error,
            _ => None,
        };
        let query = format!(
            "UPDATE work_items
             SET {flag} = $1, {flag}_at = $2, {flag}_attempts = {flag}_attempts + 1,
                 {flag}_error = $3
             WHERE id = $4"
        );
        let result = sqlx::query(&query)
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::ItemNotFound(id));
        }
        Ok(())
    }

    async fn reset_stage(&self, id: Uuid, stage: Stage) -> Result<()> {
        let flag = stage.flag_name();
        let query = format!(
            "UPDATE work_items
             SET {flag} = 'unset', {flag}_at = NULL, {flag}_attempts = 0, {flag}_error = NULL
             WHERE id = $1"
        );
        let result = sqlx::query(&query)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::ItemNotFound(id));
        }
        Ok(())
    }

    async fn find_stalled(
        &self,
        stage: Stage,
        unset_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<Uuid>> {
        let flag = stage.flag_name();
        let (prerequisite, ready_at) = match stage.prerequisite() {
            Some(pre) => {
                let pre = pre.flag_name();
                (
                    format!("{pre} = 'success'"),
                    format!("COALESCE({pre}_at, created_at)"),
                )
            }
            None => ("TRUE".to_string(), "created_at".to_string()),
        };
        let query = format!(
            "SELECT id FROM work_items
             WHERE kind = $1
               AND (
                   ({flag} = 'unset' AND {prerequisite} AND {ready_at} < $5)
                   OR ({flag} = 'failed'
                       AND {flag}_attempts < $2
                       AND ({flag}_at IS NULL OR {flag}_at < $3))
               )
             ORDER BY created_at ASC
             LIMIT $4"
        );

        sqlx::query_scalar::<_, Uuid>(&query)
            .bind(stage.kind().as_str())
            .bind(max_attempts)
            .bind(failed_before)
            .bind(limit)
            .bind(unset_before)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)
    }

    async fn image_captions(&self, id: Uuid) -> Result<Vec<ImageCaption>> {
        let rows = sqlx::query(
            "SELECT url, caption FROM item_images WHERE item_id = $1 ORDER BY position",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| ImageCaption {
                url: row.get("url"),
                caption: row.get("caption"),
            })
            .collect())
    }

    async fn store_image_captions(&self, id: Uuid, captions: &[ImageCaption]) -> Result<()> {
        self.ensure_exists(id).await?;
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query("DELETE FROM item_images WHERE item_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        for (position, caption) in captions.iter().enumerate() {
            sqlx::query(
                "INSERT INTO item_images (item_id, position, url, caption) VALUES ($1, $2, $3, $4)",
            )
            .bind(id)
            .bind(position as i32)
            .bind(&caption.url)
            .bind(&caption.caption)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn replace_chunks(&self, id: Uuid, chunks: Vec<EmbeddedChunk>) -> Result<()> {
        self.ensure_exists(id).await?;
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query("DELETE FROM item_chunks WHERE item_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO item_chunks (item_id, chunk_index, content, embedding)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(id)
            .bind(chunk.index)
            .bind(&chunk.text)
            .bind(chunk.embedding)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn store_item_embedding(&self, id: Uuid, embedding: Vector) -> Result<()> {
        let result = sqlx::query("UPDATE work_items SET embedding = $1 WHERE id = $2")
            .bind(embedding)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::ItemNotFound(id));
        }
        Ok(())
    }

    async fn upsert_repository(&self, repo: &RepoRef) -> Result<(Uuid, bool)> {
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        Self::upsert_repository_on(&mut *conn, repo).await
    }

    async fn link_repositories(&self, article_id: Uuid, repos: &[RepoRef]) -> Result<Vec<Uuid>> {
        self.ensure_exists(article_id).await?;
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let mut created = Vec::new();

        for repo in repos {
            let (repo_id, is_new) = Self::upsert_repository_on(&mut *tx, repo).await?;
            if is_new {
                created.push(repo_id);
            }
            sqlx::query(
                "INSERT INTO item_repository_links (article_id, repository_id)
                 VALUES ($1, $2)
                 ON CONFLICT DO NOTHING",
            )
            .bind(article_id)
            .bind(repo_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        Ok(created)
    }

    async fn store_repository_details(
        &self,
        id: Uuid,
        details: &RepoDetails,
        analysis: Option<&Analysis>,
    ) -> Result<()> {
        let flag = Stage::RepoEmbedding.flag_name();
        let query = format!(
            "UPDATE work_items
             SET title = $1, content = $2, url = COALESCE($3, url), metadata = $4,
                 {flag} = 'unset', {flag}_at = NULL, {flag}_attempts = 0, {flag}_error = NULL
             WHERE id = $5 AND kind = 'repository'"
        );
        let metadata = json!({
            "details": details,
            "analysis": analysis,
        });

        let result = sqlx::query(&query)
            .bind(&details.full_name)
            .bind(details.document())
            .bind(&details.html_url)
            .bind(metadata)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::ItemNotFound(id));
        }
        Ok(())
    }
}
