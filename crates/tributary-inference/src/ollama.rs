//! Ollama inference backend implementation.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use tributary_core::{defaults, Analysis, Analyzer, Embedder, Error, Result, Vector};

/// Default Ollama endpoint.
pub const DEFAULT_OLLAMA_URL: &str = defaults::OLLAMA_URL;

/// Default embedding model.
pub const DEFAULT_EMBED_MODEL: &str = defaults::EMBED_MODEL;

/// Default generation model.
pub const DEFAULT_GEN_MODEL: &str = defaults::GEN_MODEL;

/// Default embedding dimension for nomic-embed-text.
pub const DEFAULT_DIMENSION: usize = defaults::EMBED_DIMENSION;

const ANALYSIS_SYSTEM_PROMPT: &str = "You analyze software repositories and technical articles. \
Respond with a JSON object with the keys \"summary\" (two or three sentences), \
\"tags\" (up to eight lowercase keywords) and \"category\" (one short noun phrase).";

/// Ollama inference backend.
pub struct OllamaBackend {
    client: Client,
    base_url: String,
    embed_model: String,
    gen_model: String,
    dimension: usize,
    embed_timeout_secs: u64,
    gen_timeout_secs: u64,
}

impl OllamaBackend {
    /// Create a new Ollama backend with default settings.
    pub fn new() -> Self {
        Self::with_config(
            DEFAULT_OLLAMA_URL.to_string(),
            DEFAULT_EMBED_MODEL.to_string(),
            DEFAULT_GEN_MODEL.to_string(),
            DEFAULT_DIMENSION,
        )
    }

    /// Create a new Ollama backend with custom configuration.
    pub fn with_config(
        base_url: String,
        embed_model: String,
        gen_model: String,
        dimension: usize,
    ) -> Self {
        let gen_timeout = std::env::var("OLLAMA_GEN_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::GEN_TIMEOUT_SECS);

        let embed_timeout = std::env::var("OLLAMA_EMBED_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::EMBED_TIMEOUT_SECS);

        let client = Client::builder()
            .timeout(Duration::from_secs(gen_timeout))
            .user_agent(defaults::USER_AGENT)
            .build()
            .unwrap_or_else(|_| Client::new());

        info!(
            subsystem = "inference",
            component = "ollama",
            url = %base_url,
            embed_model = %embed_model,
            gen_model = %gen_model,
            "Initializing Ollama backend"
        );

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            embed_model,
            gen_model,
            dimension,
            embed_timeout_secs: embed_timeout,
            gen_timeout_secs: gen_timeout,
        }
    }

    /// Create from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `OLLAMA_BASE` | `http://127.0.0.1:11434` |
    /// | `OLLAMA_EMBED_MODEL` | `nomic-embed-text` |
    /// | `OLLAMA_GEN_MODEL` | `qwen3:8b` |
    /// | `OLLAMA_EMBED_DIM` | `768` |
    pub fn from_env() -> Self {
        let base_url =
            std::env::var("OLLAMA_BASE").unwrap_or_else(|_| DEFAULT_OLLAMA_URL.to_string());
        let embed_model =
            std::env::var("OLLAMA_EMBED_MODEL").unwrap_or_else(|_| DEFAULT_EMBED_MODEL.to_string());
        let gen_model =
            std::env::var("OLLAMA_GEN_MODEL").unwrap_or_else(|_| DEFAULT_GEN_MODEL.to_string());
        let dimension = std::env::var("OLLAMA_EMBED_DIM")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_DIMENSION);

        Self::with_config(base_url, embed_model, gen_model, dimension)
    }

    /// Name of the generation model used for analysis.
    pub fn gen_model(&self) -> &str {
        &self.gen_model
    }

    /// Chat completion with JSON output enforced.
    async fn chat_json(&self, system: &str, prompt: &str) -> Result<String> {
        let start = Instant::now();

        let request = ChatRequest {
            model: self.gen_model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            stream: false,
            format: Some(serde_json::Value::String("json".to_string())),
            think: Some(false),
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .timeout(Duration::from_secs(self.gen_timeout_secs))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Inference(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Inference(format!(
                "Ollama returned {}: {}",
                status, body
            )));
        }

        let result: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Inference(format!("Failed to parse response: {}", e)))?;

        let elapsed = start.elapsed().as_millis() as u64;
        debug!(
            response_len = result.message.content.len(),
            duration_ms = elapsed,
            "Generation complete"
        );
        if elapsed > 30000 {
            warn!(
                duration_ms = elapsed,
                prompt_len = prompt.len(),
                slow = true,
                "Slow generation operation"
            );
        }
        Ok(result.message.content)
    }
}

impl Default for OllamaBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the model's JSON answer, tolerating a surrounding code fence.
pub(crate) fn parse_analysis(raw: &str) -> Result<Analysis> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let mut analysis: Analysis = serde_json::from_str(body)
        .map_err(|e| Error::Inference(format!("Analyzer returned invalid JSON: {}", e)))?;
    if analysis.summary.trim().is_empty() {
        return Err(Error::Inference("Analyzer returned an empty summary".into()));
    }
    analysis.tags = analysis
        .tags
        .into_iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    Ok(analysis)
}

#[derive(Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<serde_json::Value>,
    /// Suppresses chain-of-thought output on models that support it.
    #[serde(skip_serializing_if = "Option::is_none")]
    think: Option<bool>,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[async_trait]
impl Embedder for OllamaBackend {
    #[instrument(skip(self, texts), fields(subsystem = "inference", component = "ollama", op = "embed_texts", model = %self.embed_model, input_count = texts.len()))]
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let start = Instant::now();

        let request = EmbeddingRequest {
            model: self.embed_model.clone(),
            input: texts.to_vec(),
        };

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .timeout(Duration::from_secs(self.embed_timeout_secs))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Embedding(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Embedding(format!(
                "Ollama returned {}: {}",
                status, body
            )));
        }

        let result: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::Embedding(format!("Failed to parse response: {}", e)))?;

        if result.embeddings.len() != texts.len() {
            return Err(Error::Embedding(format!(
                "Ollama returned {} embeddings for {} inputs",
                result.embeddings.len(),
                texts.len()
            )));
        }

        let vectors: Vec<Vector> = result.embeddings.into_iter().map(Vector::from).collect();
        let elapsed = start.elapsed().as_millis() as u64;

        debug!(
            result_count = vectors.len(),
            duration_ms = elapsed,
            "Embedding complete"
        );
        if elapsed > 5000 {
            warn!(
                duration_ms = elapsed,
                input_count = texts.len(),
                slow = true,
                "Slow embedding operation"
            );
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.embed_model
    }
}

#[async_trait]
impl Analyzer for OllamaBackend {
    #[instrument(skip(self, text), fields(subsystem = "inference", component = "ollama", op = "analyze", model = %self.gen_model, prompt_len = text.len()))]
    async fn analyze(&self, text: &str) -> Result<Analysis> {
        let raw = self.chat_json(ANALYSIS_SYSTEM_PROMPT, text).await?;
        parse_analysis(&raw)
    }

    fn model_name(&self) -> &str {
        &self.gen_model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_analysis_plain_json() {
        let analysis = parse_analysis(
            r#"{"summary": "An async runtime.", "tags": ["Async", " runtime "], "category": "library"}"#,
        )
        .unwrap();
        assert_eq!(analysis.summary, "An async runtime.");
        assert_eq!(analysis.tags, vec!["async", "runtime"]);
        assert_eq!(analysis.category.as_deref(), Some("library"));
    }

    #[test]
    fn test_parse_analysis_strips_code_fence() {
        let analysis = parse_analysis("```json\n{\"summary\": \"A parser.\"}\n```").unwrap();
        assert_eq!(analysis.summary, "A parser.");
        assert!(analysis.tags.is_empty());
    }

    #[test]
    fn test_parse_analysis_rejects_garbage() {
        assert!(matches!(
            parse_analysis("Sure! Here is the analysis"),
            Err(Error::Inference(_))
        ));
        assert!(parse_analysis(r#"{"summary": "  "}"#).is_err());
    }

    #[test]
    fn test_chat_request_serialization() {
        let request = ChatRequest {
            model: "qwen3:8b".to_string(),
            messages: vec![],
            stream: false,
            format: Some(serde_json::Value::String("json".to_string())),
            think: Some(false),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["format"], "json");
        assert_eq!(json["think"], false);
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn test_with_config_trims_trailing_slash() {
        let backend = OllamaBackend::with_config(
            "http://ollama:11434/".to_string(),
            "e".to_string(),
            "g".to_string(),
            16,
        );
        assert_eq!(backend.base_url, "http://ollama:11434");
        assert_eq!(backend.dimension(), 16);
        assert_eq!(Embedder::model_name(&backend), "e");
        assert_eq!(Analyzer::model_name(&backend), "g");
    }
}
