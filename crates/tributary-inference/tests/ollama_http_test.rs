//! HTTP-level tests for the Ollama backends against a wiremock server.

use serde_json::json;
use tributary_core::{Analyzer, Captioner, Embedder, Error};
use tributary_inference::{OllamaBackend, OllamaVisionBackend};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn backend(server: &MockServer) -> OllamaBackend {
    OllamaBackend::with_config(server.uri(), "nomic-embed-text".into(), "qwen3:8b".into(), 3)
}

#[tokio::test]
async fn test_embed_texts_returns_one_vector_per_input() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_partial_json(json!({ "model": "nomic-embed-text" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "embeddings": [[0.1, 0.2, 0.3], [0.4, 0.5, 0.6]]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let vectors = backend(&server)
        .embed_texts(&["a".to_string(), "b".to_string()])
        .await
        .unwrap();

    assert_eq!(vectors.len(), 2);
    assert_eq!(vectors[1].as_slice(), &[0.4, 0.5, 0.6]);
}

#[tokio::test]
async fn test_embed_empty_input_skips_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let vectors = backend(&server).embed_texts(&[]).await.unwrap();
    assert!(vectors.is_empty());
}

#[tokio::test]
async fn test_embed_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(503).set_body_string("model loading"))
        .mount(&server)
        .await;

    let err = backend(&server)
        .embed_texts(&["a".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Embedding(ref m) if m.contains("503")));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_analyze_parses_json_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({ "format": "json", "stream": false })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": {
                "role": "assistant",
                "content": "{\"summary\": \"A runtime for async Rust.\", \"tags\": [\"async\"], \"category\": \"runtime\"}"
            }
        })))
        .mount(&server)
        .await;

    let analysis = backend(&server).analyze("tokio-rs/tokio").await.unwrap();
    assert_eq!(analysis.summary, "A runtime for async Rust.");
    assert_eq!(analysis.tags, vec!["async"]);
    assert_eq!(analysis.category.as_deref(), Some("runtime"));
}

#[tokio::test]
async fn test_caption_sends_base64_image() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({ "model": "llava", "images": ["cG5n"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": "  A bar chart.  "
        })))
        .expect(1)
        .mount(&server)
        .await;

    let captioner = OllamaVisionBackend::new(server.uri(), "llava".into());
    let caption = captioner.caption(b"png", "image/png").await.unwrap();
    assert_eq!(caption, "A bar chart.");
}
