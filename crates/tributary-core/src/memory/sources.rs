//! In-process source repository.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::defaults;
use crate::error::{Error, Result};
use crate::models::{CacheValidators, CreateSourceRequest, Source, SourceStatus, SourceUpdate};
use crate::traits::SourceRepository;

/// [`SourceRepository`] kept in memory.
#[derive(Default)]
pub struct MemorySourceRepository {
    sources: Mutex<HashMap<Uuid, Source>>,
}

impl MemorySourceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_sources<T>(&self, f: impl FnOnce(&mut HashMap<Uuid, Source>) -> T) -> T {
        let mut sources = self.sources.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut sources)
    }

    /// Insert a fully specified source.
    pub fn insert(&self, source: Source) {
        self.with_sources(|sources| sources.insert(source.id, source));
    }

    /// Build an active, immediately due source for `url`.
    pub fn new_source(url: &str) -> Source {
        Source {
            id: Uuid::now_v7(),
            url: url.to_string(),
            title: None,
            status: SourceStatus::Active,
            error_count: 0,
            last_fetch_status: None,
            last_fetch_error: None,
            last_fetched_at: None,
            next_fetch_at: Some(Utc::now()),
            validators: CacheValidators::default(),
            refresh_interval_minutes: defaults::SOURCE_REFRESH_INTERVAL_MINUTES,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
impl SourceRepository for MemorySourceRepository {
    async fn create(&self, request: CreateSourceRequest) -> Result<Uuid> {
        let mut source = Self::new_source(&request.url);
        source.title = request.title;
        if let Some(minutes) = request.refresh_interval_minutes {
            source.refresh_interval_minutes = minutes;
        }
        let id = source.id;
        self.insert(source);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Source>> {
        Ok(self.with_sources(|sources| sources.get(&id).cloned()))
    }

    async fn record_attempt(&self, id: Uuid, update: &SourceUpdate) -> Result<()> {
        self.with_sources(|sources| {
            let source = sources.get_mut(&id).ok_or(Error::SourceNotFound(id))?;
            source.status = update.status;
            source.error_count = update.error_count;
            source.last_fetch_status = Some(update.last_fetch_status);
            source.last_fetch_error = update.last_fetch_error.clone();
            source.last_fetched_at = Some(update.last_fetched_at);
            source.next_fetch_at = update.next_fetch_at;
            if let Some(validators) = &update.validators {
                source.validators = validators.clone();
            }
            Ok(())
        })
    }

    async fn due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Source>> {
        let mut due: Vec<Source> = self.with_sources(|sources| {
            sources
                .values()
                .filter(|s| {
                    s.status == SourceStatus::Active && s.next_fetch_at.map_or(true, |at| at <= now)
                })
                .cloned()
                .collect()
        });
        due.sort_by_key(|s| s.next_fetch_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn set_status(&self, id: Uuid, status: SourceStatus) -> Result<()> {
        self.with_sources(|sources| {
            let source = sources.get_mut(&id).ok_or(Error::SourceNotFound(id))?;
            source.status = status;
            if status == SourceStatus::Active {
                source.error_count = 0;
                source.next_fetch_at = Some(Utc::now());
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FetchStatus;

    #[tokio::test]
    async fn due_excludes_future_and_inactive_sources() {
        let repo = MemorySourceRepository::new();
        let due = MemorySourceRepository::new_source("https://a.example/feed");
        let mut later = MemorySourceRepository::new_source("https://b.example/feed");
        later.next_fetch_at = Some(Utc::now() + chrono::Duration::hours(1));
        let mut broken = MemorySourceRepository::new_source("https://c.example/feed");
        broken.status = SourceStatus::Error;

        let due_id = due.id;
        repo.insert(due);
        repo.insert(later);
        repo.insert(broken);

        let found = repo.due(Utc::now(), 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due_id);
    }

    #[tokio::test]
    async fn record_attempt_keeps_validators_when_absent() {
        let repo = MemorySourceRepository::new();
        let mut source = MemorySourceRepository::new_source("https://a.example/feed");
        source.validators.etag = Some("\"v1\"".into());
        let id = source.id;
        repo.insert(source);

        let update = SourceUpdate {
            status: SourceStatus::Active,
            error_count: 1,
            last_fetch_status: FetchStatus::Failed,
            last_fetch_error: Some("timeout".into()),
            last_fetched_at: Utc::now(),
            next_fetch_at: None,
            validators: None,
        };
        repo.record_attempt(id, &update).await.unwrap();

        let stored = repo.get(id).await.unwrap().unwrap();
        assert_eq!(stored.validators.etag.as_deref(), Some("\"v1\""));
        assert_eq!(stored.error_count, 1);
        assert_eq!(stored.last_fetch_status, Some(FetchStatus::Failed));
    }

    #[tokio::test]
    async fn reactivating_clears_error_count() {
        let repo = MemorySourceRepository::new();
        let mut source = MemorySourceRepository::new_source("https://a.example/feed");
        source.status = SourceStatus::Error;
        source.error_count = 10;
        let id = source.id;
        repo.insert(source);

        repo.set_status(id, SourceStatus::Active).await.unwrap();
        let stored = repo.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, SourceStatus::Active);
        assert_eq!(stored.error_count, 0);
    }
}
