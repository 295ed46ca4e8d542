//! Ollama vision backend for image captions.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use tributary_core::{defaults, Captioner, Error, Result};

const CAPTION_PROMPT: &str =
    "Describe this image in two or three sentences. Include any text visible in the image.";

/// Ollama-based captioner (e.g., qwen3-vl, llava).
pub struct OllamaVisionBackend {
    base_url: String,
    model: String,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl OllamaVisionBackend {
    pub fn new(base_url: String, model: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            client: reqwest::Client::new(),
            timeout_secs: defaults::VISION_TIMEOUT_SECS,
        }
    }

    /// Create from environment variables.
    /// Returns None if OLLAMA_VISION_MODEL is not set.
    pub fn from_env() -> Option<Self> {
        let model = std::env::var(defaults::ENV_OLLAMA_VISION_MODEL).ok()?;
        if model.is_empty() {
            return None;
        }
        let base_url =
            std::env::var("OLLAMA_BASE").unwrap_or_else(|_| defaults::OLLAMA_URL.to_string());
        Some(Self::new(base_url, model))
    }
}

#[derive(Serialize)]
struct OllamaGenerateRequest {
    model: String,
    prompt: String,
    images: Vec<String>, // base64 encoded
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

#[async_trait]
impl Captioner for OllamaVisionBackend {
    #[instrument(skip(self, image), fields(subsystem = "inference", component = "vision", op = "caption", model = %self.model, image_bytes = image.len()))]
    async fn caption(&self, image: &[u8], mime_type: &str) -> Result<String> {
        if !mime_type.starts_with("image/") {
            return Err(Error::InvalidInput(format!(
                "cannot caption non-image content: {mime_type}"
            )));
        }

        let request = OllamaGenerateRequest {
            model: self.model.clone(),
            prompt: CAPTION_PROMPT.to_string(),
            images: vec![base64::engine::general_purpose::STANDARD.encode(image)],
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .timeout(Duration::from_secs(self.timeout_secs))
            .send()
            .await
            .map_err(|e| Error::Inference(format!("Vision request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Inference(format!(
                "Vision API returned {}: {}",
                status, body
            )));
        }

        let result: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| Error::Inference(format!("Failed to parse vision response: {}", e)))?;

        let caption = result.response.trim().to_string();
        debug!(caption_len = caption.len(), "Caption complete");
        Ok(caption)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ollama_vision_backend_new() {
        let backend =
            OllamaVisionBackend::new("http://localhost:11434/".to_string(), "llava".to_string());
        assert_eq!(backend.base_url, "http://localhost:11434");
        assert_eq!(backend.timeout_secs, defaults::VISION_TIMEOUT_SECS);
        assert_eq!(backend.model_name(), "llava");
    }

    #[test]
    fn test_ollama_generate_request_serialization() {
        let request = OllamaGenerateRequest {
            model: "llava".to_string(),
            prompt: "Describe this image".to_string(),
            images: vec!["base64data".to_string()],
            stream: false,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "llava");
        assert_eq!(json["images"][0], "base64data");
        assert_eq!(json["stream"], false);
    }

    #[tokio::test]
    async fn test_caption_rejects_non_image() {
        let backend =
            OllamaVisionBackend::new("http://localhost:1".to_string(), "llava".to_string());
        let err = backend.caption(b"%PDF", "application/pdf").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
