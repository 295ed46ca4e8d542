//! In-process work item repository.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::*;
use crate::traits::ItemRepository;

#[derive(Default)]
struct Inner {
    items: HashMap<Uuid, WorkItem>,
    captions: HashMap<Uuid, Vec<ImageCaption>>,
    chunks: HashMap<Uuid, Vec<EmbeddedChunk>>,
    embeddings: HashMap<Uuid, Vector>,
    links: HashMap<Uuid, BTreeSet<Uuid>>,
}

impl Inner {
    fn item_mut(&mut self, id: Uuid) -> Result<&mut WorkItem> {
        self.items.get_mut(&id).ok_or(Error::ItemNotFound(id))
    }

    fn find_repository(&self, repo: &RepoRef) -> Option<Uuid> {
        let external_id = repo.external_id();
        self.items
            .values()
            .find(|i| i.kind == ItemKind::Repository && i.external_id == external_id)
            .map(|i| i.id)
    }

    fn upsert_repository(&mut self, repo: &RepoRef) -> (Uuid, bool) {
        if let Some(id) = self.find_repository(repo) {
            return (id, false);
        }
        let item = MemoryItemRepository::new_item(ItemKind::Repository, None, &repo.external_id());
        let id = item.id;
        self.items.insert(
            id,
            WorkItem {
                title: Some(repo.full_name()),
                url: Some(repo.html_url()),
                content: repo.full_name(),
                ..item
            },
        );
        (id, true)
    }
}

/// [`ItemRepository`] kept in memory, with accessors for derived data so
/// tests can assert on what each stage persisted.
#[derive(Default)]
pub struct MemoryItemRepository {
    inner: Mutex<Inner>,
}

impl MemoryItemRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut inner)
    }

    /// Build an item of `kind` with every stage unset.
    pub fn new_item(kind: ItemKind, source_id: Option<Uuid>, external_id: &str) -> WorkItem {
        WorkItem {
            id: Uuid::now_v7(),
            kind,
            source_id,
            external_id: external_id.to_string(),
            title: None,
            url: None,
            content: String::new(),
            metadata: json!({}),
            stages: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn insert(&self, item: WorkItem) {
        self.with_inner(|inner| inner.items.insert(item.id, item));
    }

    pub fn len(&self) -> usize {
        self.with_inner(|inner| inner.items.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored chunks of an item.
    pub fn chunks(&self, id: Uuid) -> Vec<(i32, String)> {
        self.with_inner(|inner| {
            inner
                .chunks
                .get(&id)
                .map(|chunks| chunks.iter().map(|c| (c.index, c.text.clone())).collect())
                .unwrap_or_default()
        })
    }

    pub fn has_embedding(&self, id: Uuid) -> bool {
        self.with_inner(|inner| inner.embeddings.contains_key(&id))
    }

    /// Repository ids linked from an article.
    pub fn linked_repositories(&self, article_id: Uuid) -> Vec<Uuid> {
        self.with_inner(|inner| {
            inner
                .links
                .get(&article_id)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default()
        })
    }

    /// Ids of every item of `kind`.
    pub fn ids_of(&self, kind: ItemKind) -> Vec<Uuid> {
        self.with_inner(|inner| {
            let mut ids: Vec<_> = inner
                .items
                .values()
                .filter(|i| i.kind == kind)
                .map(|i| i.id)
                .collect();
            ids.sort();
            ids
        })
    }
}

#[async_trait]
impl ItemRepository for MemoryItemRepository {
    async fn get(&self, id: Uuid) -> Result<Option<WorkItem>> {
        Ok(self.with_inner(|inner| inner.items.get(&id).cloned()))
    }

    async fn insert_new_items(
        &self,
        source_id: Uuid,
        items: &[IncomingItem],
    ) -> Result<Vec<Uuid>> {
        Ok(self.with_inner(|inner| {
            let mut known: BTreeSet<String> = inner
                .items
                .values()
                .filter(|i| i.source_id == Some(source_id))
                .map(|i| i.external_id.clone())
                .collect();
            let mut inserted = Vec::new();
            for incoming in items {
                if !known.insert(incoming.external_id.clone()) {
                    continue;
                }
                let mut item = Self::new_item(
                    ItemKind::Article,
                    Some(source_id),
                    &incoming.external_id,
                );
                item.title = incoming.title.clone();
                item.url = incoming.url.clone();
                item.content = incoming.content.clone();
                if let Some(published_at) = incoming.published_at {
                    item.metadata = json!({ "published_at": published_at });
                }
                inserted.push(item.id);
                inner.items.insert(item.id, item);
            }
            inserted
        }))
    }

    async fn record_stage(
        &self,
        id: Uuid,
        stage: Stage,
        status: TriState,
        error: Option<&str>,
    ) -> Result<()> {
        self.with_inner(|inner| {
            let item = inner.item_mut(id)?;
            let state = item.stages.entry(stage).or_default();
            state.status = status;
            state.attempted_at = Some(Utc::now());
            state.attempts += 1;
            state.error = match status {
                TriState::Failed => error.map(str::to_string),
                _ => None,
            };
            Ok(())
        })
    }

    async fn reset_stage(&self, id: Uuid, stage: Stage) -> Result<()> {
        self.with_inner(|inner| {
            let item = inner.item_mut(id)?;
            item.stages.insert(stage, StageState::default());
            Ok(())
        })
    }

    async fn find_stalled(
        &self,
        stage: Stage,
        unset_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<Uuid>> {
        Ok(self.with_inner(|inner| {
            let mut stalled: Vec<&WorkItem> = inner
                .items
                .values()
                .filter(|item| item.kind == stage.kind())
                .filter(|item| {
                    let state = item.stage(stage);
                    match state.status {
                        TriState::Unset => match stage.prerequisite() {
                            Some(pre) => {
                                let pre = item.stage(pre);
                                pre.status == TriState::Success
                                    && pre.attempted_at.unwrap_or(item.created_at) < unset_before
                            }
                            None => item.created_at < unset_before,
                        },
                        TriState::Failed => {
                            state.attempts < max_attempts
                                && state.attempted_at.map_or(true, |at| at < failed_before)
                        }
                        TriState::Success => false,
                    }
                })
                .collect();
            stalled.sort_by_key(|item| item.created_at);
            stalled
                .into_iter()
                .take(limit.max(0) as usize)
                .map(|item| item.id)
                .collect()
        }))
    }

    async fn image_captions(&self, id: Uuid) -> Result<Vec<ImageCaption>> {
        Ok(self.with_inner(|inner| inner.captions.get(&id).cloned().unwrap_or_default()))
    }

    async fn store_image_captions(&self, id: Uuid, captions: &[ImageCaption]) -> Result<()> {
        self.with_inner(|inner| {
            inner.item_mut(id)?;
            inner.captions.insert(id, captions.to_vec());
            Ok(())
        })
    }

    async fn replace_chunks(&self, id: Uuid, chunks: Vec<EmbeddedChunk>) -> Result<()> {
        self.with_inner(|inner| {
            inner.item_mut(id)?;
            inner.chunks.insert(id, chunks);
            Ok(())
        })
    }

    async fn store_item_embedding(&self, id: Uuid, embedding: Vector) -> Result<()> {
        self.with_inner(|inner| {
            inner.item_mut(id)?;
            inner.embeddings.insert(id, embedding);
            Ok(())
        })
    }

    async fn upsert_repository(&self, repo: &RepoRef) -> Result<(Uuid, bool)> {
        Ok(self.with_inner(|inner| inner.upsert_repository(repo)))
    }

    async fn link_repositories(&self, article_id: Uuid, repos: &[RepoRef]) -> Result<Vec<Uuid>> {
        self.with_inner(|inner| {
            inner.item_mut(article_id)?;
            let mut created = Vec::new();
            for repo in repos {
                let (repo_id, is_new) = inner.upsert_repository(repo);
                if is_new {
                    created.push(repo_id);
                }
                inner.links.entry(article_id).or_default().insert(repo_id);
            }
            Ok(created)
        })
    }

    async fn store_repository_details(
        &self,
        id: Uuid,
        details: &RepoDetails,
        analysis: Option<&Analysis>,
    ) -> Result<()> {
        self.with_inner(|inner| {
            let item = inner.item_mut(id)?;
            item.title = Some(details.full_name.clone());
            item.content = details.document();
            if let Some(url) = &details.html_url {
                item.url = Some(url.clone());
            }
            item.metadata = json!({
                "details": details,
                "analysis": analysis,
            });
            item.stages
                .insert(Stage::RepoEmbedding, StageState::default());
            Ok(())
        })
    }
}
