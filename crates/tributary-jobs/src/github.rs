//! GitHub REST client behind [`RepoCatalog`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use tributary_core::{defaults, FetchError, RepoCatalog, RepoDetails, RepoRef, Result};

const API_VERSION_HEADER: &str = "X-GitHub-Api-Version";
const API_VERSION: &str = "2022-11-28";
const JSON_MEDIA_TYPE: &str = "application/vnd.github+json";
const RAW_MEDIA_TYPE: &str = "application/vnd.github.raw";

/// Upper bound on pages fetched when listing stars.
const MAX_PAGES: usize = 100;

#[derive(Deserialize)]
struct StarredRepo {
    full_name: String,
}

#[derive(Deserialize)]
struct RepoResponse {
    full_name: String,
    description: Option<String>,
    #[serde(default)]
    topics: Vec<String>,
    language: Option<String>,
    #[serde(default)]
    stargazers_count: i64,
    html_url: Option<String>,
}

/// [`RepoCatalog`] backed by the GitHub REST API.
pub struct GithubCatalog {
    client: Client,
    base_url: String,
    token: Option<String>,
    page_size: usize,
    readme_max_bytes: usize,
}

impl GithubCatalog {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let client = Client::builder()
            .user_agent(defaults::USER_AGENT)
            .timeout(Duration::from_secs(defaults::FETCH_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            page_size: defaults::GITHUB_PAGE_SIZE,
            readme_max_bytes: defaults::GITHUB_README_MAX_BYTES,
        }
    }

    /// Reads `GITHUB_API_URL` and `GITHUB_TOKEN`.
    pub fn from_env() -> Self {
        let base_url =
            std::env::var("GITHUB_API_URL").unwrap_or_else(|_| defaults::GITHUB_API_URL.to_string());
        let token = std::env::var("GITHUB_TOKEN").ok();
        if token.is_none() {
            warn!(
                subsystem = "jobs",
                component = "github",
                "GITHUB_TOKEN not set, using unauthenticated rate limits"
            );
        }
        Self::new(base_url, token)
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, 100);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get(&self, path: &str, accept: &str) -> RequestBuilder {
        let mut request = self
            .client
            .get(format!("{}{path}", self.base_url))
            .header(ACCEPT, accept)
            .header(API_VERSION_HEADER, API_VERSION);
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        request
    }

    async fn send(request: RequestBuilder) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(FetchError::Status {
            code: status.as_u16(),
            message: message.chars().take(200).collect(),
        }
        .into())
    }

    async fn readme(&self, repo: &RepoRef) -> Result<Option<String>> {
        let path = format!("/repos/{}/{}/readme", repo.owner, repo.name);
        let response = self
            .get(&path, RAW_MEDIA_TYPE)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(FetchError::Status {
                code: response.status().as_u16(),
                message: "README request failed".into(),
            }
            .into());
        }
        let mut text = response
            .text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        if text.len() > self.readme_max_bytes {
            let mut cut = self.readme_max_bytes;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }
        Ok(Some(text))
    }
}

#[async_trait]
impl RepoCatalog for GithubCatalog {
    #[instrument(skip(self), fields(subsystem = "jobs", component = "github", op = "list_starred"))]
    async fn list_starred(&self, account: &str) -> Result<Vec<RepoRef>> {
        let mut repos = Vec::new();
        for page in 1..=MAX_PAGES {
            let path = format!(
                "/users/{account}/starred?per_page={}&page={page}",
                self.page_size
            );
            let batch: Vec<StarredRepo> = Self::send(self.get(&path, JSON_MEDIA_TYPE))
                .await?
                .json()
                .await
                .map_err(|e| FetchError::Parse(e.to_string()))?;
            let count = batch.len();
            repos.extend(batch.iter().filter_map(|r| RepoRef::parse(&r.full_name)));
            if count < self.page_size {
                break;
            }
        }
        debug!(result_count = repos.len(), "Listed starred repositories");
        Ok(repos)
    }

    #[instrument(skip(self), fields(subsystem = "jobs", component = "github", op = "fetch_details"))]
    async fn fetch_details(&self, repo: &RepoRef) -> Result<RepoDetails> {
        let path = format!("/repos/{}/{}", repo.owner, repo.name);
        let info: RepoResponse = Self::send(self.get(&path, JSON_MEDIA_TYPE))
            .await?
            .json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))?;
        let readme = self.readme(repo).await?;

        Ok(RepoDetails {
            full_name: info.full_name,
            description: info.description.filter(|d| !d.trim().is_empty()),
            readme,
            topics: info.topics,
            language: info.language,
            stars: info.stargazers_count,
            html_url: info.html_url,
        })
    }
}
