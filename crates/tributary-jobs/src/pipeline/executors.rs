//! Stage executors: the work done by each pipeline stage.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use serde_json::json;
use tracing::{debug, trace, warn};

use tributary_core::{
    Analysis, Captioner, ContentFetcher, EmbeddedChunk, Embedder, Error, ImageCaption,
    ItemRepository, RepoRef, Result, Stage, WorkItem,
};

use super::chunking::{chunk_text, strip_html, ChunkerConfig};
use super::{StageExecutor, StageOutput};
use crate::rate_limit::DomainRateLimiter;

static HTML_IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)<img\b[^>]*?\bsrc\s*=\s*["']([^"']+)["']"#).unwrap());

static MARKDOWN_IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[[^\]]*\]\(\s*<?([^)\s>]+)>?").unwrap());

static GITHUB_REPO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bgithub\.com/([a-z0-9](?:[a-z0-9-]{0,38}))/([a-z0-9._-]{1,100})").unwrap()
});

/// First path segments on github.com that are site sections, not owners.
const RESERVED_OWNERS: &[&str] = &[
    "about",
    "apps",
    "collections",
    "contact",
    "customer-stories",
    "enterprise",
    "events",
    "explore",
    "features",
    "join",
    "login",
    "marketplace",
    "new",
    "notifications",
    "orgs",
    "pricing",
    "pulls",
    "search",
    "security",
    "settings",
    "site",
    "sponsors",
    "topics",
    "trending",
];

/// Image URLs referenced by `content`, resolved against `base`, in order of
/// appearance, without duplicates or inline `data:` images.
pub fn extract_image_urls(content: &str, base: Option<&str>, limit: usize) -> Vec<String> {
    let base = base.and_then(|b| Url::parse(b).ok());
    let mut seen = HashSet::new();
    let mut urls = Vec::new();

    let mut matches: Vec<(usize, &str)> = HTML_IMAGE
        .captures_iter(content)
        .chain(MARKDOWN_IMAGE.captures_iter(content))
        .filter_map(|c| c.get(1))
        .map(|m| (m.start(), m.as_str()))
        .collect();
    matches.sort_by_key(|(pos, _)| *pos);

    for (_, raw) in matches {
        let raw = raw.trim();
        if raw.starts_with("data:") {
            continue;
        }
        let resolved = match Url::parse(raw) {
            Ok(url) => Some(url),
            Err(_) => base.as_ref().and_then(|b| b.join(raw).ok()),
        };
        let Some(url) = resolved.filter(|u| matches!(u.scheme(), "http" | "https")) else {
            trace!(src = raw, "Skipping unresolvable image source");
            continue;
        };
        let url = url.to_string();
        if seen.insert(url.clone()) {
            urls.push(url);
            if urls.len() >= limit {
                break;
            }
        }
    }
    urls
}

/// GitHub repositories linked from `content`, deduplicated case-insensitively.
pub fn extract_repo_refs(content: &str) -> Vec<RepoRef> {
    let mut seen = HashSet::new();
    let mut refs = Vec::new();
    for captures in GITHUB_REPO.captures_iter(content) {
        let owner = &captures[1];
        if RESERVED_OWNERS.contains(&owner.to_lowercase().as_str()) {
            continue;
        }
        let name = captures[2].trim_end_matches('.');
        let name = name.strip_suffix(".git").unwrap_or(name);
        if name.is_empty() || name == "." || name == ".." {
            continue;
        }
        let repo = RepoRef::new(owner, name);
        if seen.insert(repo.external_id()) {
            refs.push(repo);
        }
    }
    refs
}

/// Captions the images of an article.
///
/// Without a captioner the stage succeeds with no captions, so articles
/// still move on to the RAG stage.
pub struct ImageStage {
    items: Arc<dyn ItemRepository>,
    fetcher: Arc<dyn ContentFetcher>,
    limiter: DomainRateLimiter,
    captioner: Option<Arc<dyn Captioner>>,
    max_images: usize,
}

impl ImageStage {
    pub fn new(
        items: Arc<dyn ItemRepository>,
        fetcher: Arc<dyn ContentFetcher>,
        limiter: DomainRateLimiter,
        captioner: Option<Arc<dyn Captioner>>,
        max_images: usize,
    ) -> Self {
        Self {
            items,
            fetcher,
            limiter,
            captioner,
            max_images,
        }
    }

    async fn caption_one(&self, captioner: &dyn Captioner, url: &str) -> Result<String> {
        self.limiter.wait_for_domain(url).await?;
        let asset = self.fetcher.fetch_asset(url).await?;
        if !asset.mime_type.starts_with("image/") {
            return Err(Error::InvalidInput(format!(
                "{url} is {}, not an image",
                asset.mime_type
            )));
        }
        captioner.caption(&asset.bytes, &asset.mime_type).await
    }
}

#[async_trait]
impl StageExecutor for ImageStage {
    fn stage(&self) -> Stage {
        Stage::Images
    }

    async fn run(&self, item: &WorkItem) -> Result<StageOutput> {
        let urls = extract_image_urls(&item.content, item.url.as_deref(), self.max_images);
        let Some(captioner) = &self.captioner else {
            debug!(item_id = %item.id, found = urls.len(), "No captioner configured");
            return Ok(StageOutput::new(json!({ "found": urls.len(), "captioned": 0 })));
        };
        if urls.is_empty() {
            self.items.store_image_captions(item.id, &[]).await?;
            return Ok(StageOutput::new(json!({ "found": 0, "captioned": 0 })));
        }

        let mut captions = Vec::new();
        let mut last_error = None;
        for url in &urls {
            match self.caption_one(captioner.as_ref(), url).await {
                Ok(caption) => {
                    trace!(item_id = %item.id, url, "Captioned image");
                    captions.push(ImageCaption {
                        url: url.clone(),
                        caption,
                    });
                }
                Err(e) => {
                    warn!(item_id = %item.id, url, error = %e, "Image caption failed");
                    last_error = Some(e);
                }
            }
        }

        if captions.is_empty() {
            if let Some(e) = last_error {
                return Err(e);
            }
        }

        self.items.store_image_captions(item.id, &captions).await?;
        Ok(StageOutput::new(json!({
            "found": urls.len(),
            "captioned": captions.len(),
            "model": captioner.model_name(),
        })))
    }
}

/// Chunks an article (plus its image captions) and stores chunk embeddings.
pub struct RagStage {
    items: Arc<dyn ItemRepository>,
    embedder: Arc<dyn Embedder>,
    chunker: ChunkerConfig,
}

impl RagStage {
    pub fn new(
        items: Arc<dyn ItemRepository>,
        embedder: Arc<dyn Embedder>,
        chunker: ChunkerConfig,
    ) -> Self {
        Self {
            items,
            embedder,
            chunker,
        }
    }

    /// Plain-text document embedded for an article.
    pub fn document(item: &WorkItem, captions: &[ImageCaption]) -> String {
        let mut parts = Vec::new();
        if let Some(title) = item.title.as_deref().filter(|t| !t.trim().is_empty()) {
            parts.push(title.trim().to_string());
        }
        let body = strip_html(&item.content);
        if !body.is_empty() {
            parts.push(body);
        }
        for caption in captions {
            parts.push(format!("Image: {}", caption.caption));
        }
        parts.join("\n\n")
    }
}

#[async_trait]
impl StageExecutor for RagStage {
    fn stage(&self) -> Stage {
        Stage::Rag
    }

    async fn run(&self, item: &WorkItem) -> Result<StageOutput> {
        let captions = self.items.image_captions(item.id).await?;
        let document = Self::document(item, &captions);
        let texts = chunk_text(&document, &self.chunker);

        if texts.is_empty() {
            self.items.replace_chunks(item.id, Vec::new()).await?;
            return Ok(StageOutput::new(json!({ "chunks": 0 })));
        }

        let vectors = self.embedder.embed_texts(&texts).await?;
        if vectors.len() != texts.len() {
            return Err(Error::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }

        let chunks: Vec<EmbeddedChunk> = texts
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(index, (text, embedding))| EmbeddedChunk {
                index: index as i32,
                text,
                embedding,
            })
            .collect();
        let count = chunks.len();
        self.items.replace_chunks(item.id, chunks).await?;

        Ok(StageOutput::new(json!({
            "chunks": count,
            "captions": captions.len(),
            "model": self.embedder.model_name(),
        })))
    }
}

/// Links an article to the GitHub repositories it mentions.
pub struct RepoLinkStage {
    items: Arc<dyn ItemRepository>,
}

impl RepoLinkStage {
    pub fn new(items: Arc<dyn ItemRepository>) -> Self {
        Self { items }
    }
}

#[async_trait]
impl StageExecutor for RepoLinkStage {
    fn stage(&self) -> Stage {
        Stage::RepoLinks
    }

    async fn run(&self, item: &WorkItem) -> Result<StageOutput> {
        let refs = extract_repo_refs(&item.content);
        if refs.is_empty() {
            return Ok(StageOutput::new(json!({ "linked": 0, "created": 0 })));
        }

        let created = self.items.link_repositories(item.id, &refs).await?;
        Ok(StageOutput {
            detail: json!({
                "linked": refs.len(),
                "created": created.len(),
                "repositories": refs.iter().map(RepoRef::full_name).collect::<Vec<_>>(),
            }),
            follow_ups: created
                .into_iter()
                .map(|id| (Stage::RepoEmbedding, id))
                .collect(),
        })
    }
}

/// Embeds a repository's description, README and analysis as one vector.
pub struct RepoEmbeddingStage {
    items: Arc<dyn ItemRepository>,
    embedder: Arc<dyn Embedder>,
}

impl RepoEmbeddingStage {
    pub fn new(items: Arc<dyn ItemRepository>, embedder: Arc<dyn Embedder>) -> Self {
        Self { items, embedder }
    }

    /// Text embedded for a repository item.
    pub fn document(item: &WorkItem) -> String {
        let mut document = if item.content.trim().is_empty() {
            item.title.clone().unwrap_or_else(|| item.external_id.clone())
        } else {
            item.content.clone()
        };

        let analysis = item
            .metadata
            .get("analysis")
            .filter(|a| !a.is_null())
            .and_then(|a| serde_json::from_value::<Analysis>(a.clone()).ok());
        if let Some(analysis) = analysis {
            document.push_str("\n\nSummary: ");
            document.push_str(&analysis.summary);
            if !analysis.tags.is_empty() {
                document.push_str("\nTags: ");
                document.push_str(&analysis.tags.join(", "));
            }
            if let Some(category) = analysis.category {
                document.push_str("\nCategory: ");
                document.push_str(&category);
            }
        }
        document
    }
}

#[async_trait]
impl StageExecutor for RepoEmbeddingStage {
    fn stage(&self) -> Stage {
        Stage::RepoEmbedding
    }

    async fn run(&self, item: &WorkItem) -> Result<StageOutput> {
        let document = Self::document(item);
        let embedding = self
            .embedder
            .embed_texts(std::slice::from_ref(&document))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("embedder returned no vector".into()))?;

        self.items.store_item_embedding(item.id, embedding).await?;
        Ok(StageOutput::new(json!({
            "chars": document.len(),
            "model": self.embedder.model_name(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tributary_core::memory::MemoryItemRepository;
    use tributary_core::ItemKind;

    #[test]
    fn test_extract_image_urls() {
        let content = r#"<p><img alt="x" src="/img/a.png"></p>
            ![chart](https://cdn.example.com/chart.svg)
            <img src='https://cdn.example.com/chart.svg'>
            <img src="data:image/png;base64,AAAA">
            <IMG SRC="b.jpg">"#;
        let urls = extract_image_urls(content, Some("https://blog.example.com/posts/1"), 10);
        assert_eq!(
            urls,
            vec![
                "https://blog.example.com/img/a.png",
                "https://cdn.example.com/chart.svg",
                "https://blog.example.com/posts/b.jpg",
            ]
        );
    }

    #[test]
    fn test_extract_image_urls_respects_limit_and_missing_base() {
        let content = r#"<img src="a.png"><img src="https://x.example/1.png"><img src="https://x.example/2.png">"#;
        assert_eq!(
            extract_image_urls(content, None, 1),
            vec!["https://x.example/1.png"]
        );
    }

    #[test]
    fn test_extract_repo_refs() {
        let content = "See https://github.com/tokio-rs/tokio and github.com/Tokio-RS/Tokio.git, \
                       also https://github.com/serde-rs/serde/issues/1. \
                       Ignore https://github.com/topics/rust and https://github.com/sponsors/x.";
        let refs = extract_repo_refs(content);
        assert_eq!(
            refs,
            vec![RepoRef::new("tokio-rs", "tokio"), RepoRef::new("serde-rs", "serde")]
        );
    }

    #[test]
    fn test_rag_document_includes_captions() {
        let mut item = MemoryItemRepository::new_item(ItemKind::Article, None, "1");
        item.title = Some("Post".into());
        item.content = "<p>Body</p>".into();
        let captions = vec![ImageCaption {
            url: "https://x/1.png".into(),
            caption: "A graph".into(),
        }];
        assert_eq!(
            RagStage::document(&item, &captions),
            "Post\n\nBody\n\nImage: A graph"
        );
    }

    #[test]
    fn test_repo_document_appends_analysis() {
        let mut item = MemoryItemRepository::new_item(ItemKind::Repository, None, "a/b");
        item.content = "a/b\n\nA library".into();
        item.metadata = json!({
            "details": null,
            "analysis": { "summary": "Does things.", "tags": ["x", "y"], "category": "lib" }
        });
        assert_eq!(
            RepoEmbeddingStage::document(&item),
            "a/b\n\nA library\n\nSummary: Does things.\nTags: x, y\nCategory: lib"
        );

        item.metadata = json!({});
        item.content.clear();
        assert_eq!(RepoEmbeddingStage::document(&item), "a/b");
    }
}
