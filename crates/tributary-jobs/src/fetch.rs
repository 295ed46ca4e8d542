//! HTTP content fetcher with conditional requests.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, instrument};

use tributary_core::{
    defaults, Asset, CacheValidators, ContentFetcher, FetchError, FetchOutcome, IncomingItem,
    Result,
};

/// Longest response body excerpt kept in a status error.
const ERROR_BODY_LIMIT: usize = 200;

/// Turns a fetched document into items.
pub trait FeedParser: Send + Sync {
    fn parse(
        &self,
        body: &[u8],
        content_type: Option<&str>,
    ) -> std::result::Result<Vec<IncomingItem>, FetchError>;
}

/// Parser for JSON Feed documents (`https://jsonfeed.org/version/1.1`).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFeedParser;

#[derive(Deserialize)]
struct JsonFeed {
    items: Vec<JsonFeedItem>,
}

#[derive(Deserialize)]
struct JsonFeedItem {
    id: Option<JsonValue>,
    url: Option<String>,
    external_url: Option<String>,
    title: Option<String>,
    content_html: Option<String>,
    content_text: Option<String>,
    summary: Option<String>,
    date_published: Option<String>,
}

impl JsonFeedItem {
    fn external_id(&self) -> Option<String> {
        let id = match &self.id {
            Some(JsonValue::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Some(JsonValue::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        id.or_else(|| self.url.clone())
    }
}

impl FeedParser for JsonFeedParser {
    fn parse(
        &self,
        body: &[u8],
        _content_type: Option<&str>,
    ) -> std::result::Result<Vec<IncomingItem>, FetchError> {
        let feed: JsonFeed = serde_json::from_slice(body)
            .map_err(|e| FetchError::Parse(format!("invalid JSON feed: {e}")))?;

        let mut items = Vec::with_capacity(feed.items.len());
        for item in feed.items {
            let Some(external_id) = item.external_id() else {
                debug!("Skipping feed item without id or url");
                continue;
            };
            let published_at = item
                .date_published
                .as_deref()
                .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
                .map(|d| d.with_timezone(&Utc));
            let content = item
                .content_html
                .or(item.content_text)
                .or(item.summary)
                .unwrap_or_default();

            items.push(IncomingItem {
                external_id,
                title: item.title,
                url: item.url.or(item.external_url),
                content,
                published_at,
            });
        }
        Ok(items)
    }
}

/// [`ContentFetcher`] over HTTP.
///
/// Sends `If-None-Match` / `If-Modified-Since` from the stored validators,
/// maps `304 Not Modified` to [`FetchOutcome::NotModified`] and hands
/// other successful bodies to the configured [`FeedParser`].
pub struct HttpFetcher<P = JsonFeedParser> {
    client: Client,
    parser: P,
    timeout: Duration,
}

impl HttpFetcher<JsonFeedParser> {
    pub fn new() -> Self {
        Self::with_parser(JsonFeedParser)
    }
}

impl Default for HttpFetcher<JsonFeedParser> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: FeedParser> HttpFetcher<P> {
    pub fn with_parser(parser: P) -> Self {
        let client = Client::builder()
            .user_agent(defaults::USER_AGENT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            parser,
            timeout: Duration::from_secs(defaults::FETCH_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response> {
        let response = request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(response)
    }
}

fn header(response: &Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn status_error(response: Response) -> FetchError {
    let code = response.status().as_u16();
    let mut message = response.text().await.unwrap_or_default();
    if message.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    FetchError::Status { code, message }
}

#[async_trait]
impl<P: FeedParser> ContentFetcher for HttpFetcher<P> {
    #[instrument(skip(self, validators), fields(subsystem = "jobs", component = "fetcher", op = "fetch"))]
    async fn fetch(&self, url: &str, validators: &CacheValidators) -> Result<FetchOutcome> {
        let mut request = self.client.get(url);
        if let Some(etag) = &validators.etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &validators.last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        let response = self.send(request).await?;
        if response.status() == StatusCode::NOT_MODIFIED {
            debug!("Not modified");
            return Ok(FetchOutcome::NotModified);
        }
        if !response.status().is_success() {
            return Err(status_error(response).await.into());
        }

        let new_validators = CacheValidators {
            etag: header(&response, ETAG),
            last_modified: header(&response, LAST_MODIFIED),
        };
        let content_type = header(&response, CONTENT_TYPE);
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let items = self.parser.parse(&body, content_type.as_deref())?;
        debug!(result_count = items.len(), "Fetched document");
        Ok(FetchOutcome::Modified {
            items,
            validators: new_validators,
        })
    }

    #[instrument(skip(self), fields(subsystem = "jobs", component = "fetcher", op = "fetch_asset"))]
    async fn fetch_asset(&self, url: &str) -> Result<Asset> {
        let response = self.send(self.client.get(url)).await?;
        if !response.status().is_success() {
            return Err(status_error(response).await.into());
        }

        let mime_type = header(&response, CONTENT_TYPE)
            .and_then(|ct| ct.split(';').next().map(|m| m.trim().to_lowercase()))
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        Ok(Asset {
            bytes: bytes.to_vec(),
            mime_type,
        })
    }
}
