//! Mock inference backend for deterministic testing.
//!
//! Implements all three capability traits with outputs derived from the
//! input, records every call, and can be switched into a failing mode per
//! operation to exercise retry and failure paths.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tributary_inference::mock::{MockBackend, MockOperation};
//!
//! let backend = MockBackend::new().with_dimension(8);
//! backend.set_failing(MockOperation::Embed, true);
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use tributary_core::{Analysis, Analyzer, Captioner, Embedder, Error, Result, Vector};

/// Operation of the mock backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    Embed,
    Caption,
    Analyze,
}

/// One recorded call.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub operation: MockOperation,
    pub input: String,
}

#[derive(Default)]
struct MockState {
    calls: Vec<MockCall>,
    failing: HashSet<MockOperation>,
}

/// Mock capability backend.
#[derive(Clone)]
pub struct MockBackend {
    dimension: usize,
    latency: Duration,
    state: Arc<Mutex<MockState>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            dimension: 16,
            latency: Duration::ZERO,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Set the embedding dimension.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension.max(1);
        self
    }

    /// Delay every call, for timeout tests.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make `operation` fail (or succeed again) from now on.
    pub fn set_failing(&self, operation: MockOperation, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing.insert(operation);
        } else {
            state.failing.remove(&operation);
        }
    }

    /// All logged calls.
    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Number of calls of one operation.
    pub fn call_count(&self, operation: MockOperation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn record(&self, operation: MockOperation, input: String) -> Result<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut state = self.lock();
        state.calls.push(MockCall { operation, input });
        if state.failing.contains(&operation) {
            return Err(match operation {
                MockOperation::Embed => Error::Embedding("mock embedder unavailable".into()),
                _ => Error::Inference(format!("mock {operation:?} unavailable")),
            });
        }
        Ok(())
    }

    /// Deterministic unit vector for `text`.
    pub fn embedding_for(&self, text: &str) -> Vector {
        // FNV-1a seeded per component
        let mut values = Vec::with_capacity(self.dimension);
        for component in 0..self.dimension {
            let mut hash: u64 = 0xcbf2_9ce4_8422_2325 ^ component as u64;
            for byte in text.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(0x0100_0000_01b3);
            }
            values.push((hash % 2000) as f32 / 1000.0 - 1.0);
        }
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut values {
                *v /= norm;
            }
        }
        Vector::from(values)
    }
}

#[async_trait]
impl Embedder for MockBackend {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>> {
        self.record(MockOperation::Embed, texts.join("\n")).await?;
        Ok(texts.iter().map(|t| self.embedding_for(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "mock-embed"
    }
}

#[async_trait]
impl Captioner for MockBackend {
    async fn caption(&self, image: &[u8], mime_type: &str) -> Result<String> {
        self.record(MockOperation::Caption, format!("{mime_type}:{}", image.len()))
            .await?;
        Ok(format!("An image ({mime_type}, {} bytes)", image.len()))
    }

    fn model_name(&self) -> &str {
        "mock-vision"
    }
}

#[async_trait]
impl Analyzer for MockBackend {
    async fn analyze(&self, text: &str) -> Result<Analysis> {
        self.record(MockOperation::Analyze, text.to_string()).await?;
        let first_line = text.lines().next().unwrap_or_default().trim();
        Ok(Analysis {
            summary: format!("Summary of {first_line}"),
            tags: vec!["mock".to_string()],
            category: Some("testing".to_string()),
        })
    }

    fn model_name(&self) -> &str {
        "mock-analyze"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_embeddings_are_deterministic_and_normalized() {
        let backend = MockBackend::new().with_dimension(8);
        let a = backend
            .embed_texts(&["hello".to_string(), "world".to_string()])
            .await
            .unwrap();
        let b = backend.embed_texts(&["hello".to_string()]).await.unwrap();

        assert_eq!(a.len(), 2);
        assert_eq!(a[0].as_slice(), b[0].as_slice());
        assert_ne!(a[0].as_slice(), a[1].as_slice());
        assert_eq!(a[0].as_slice().len(), 8);
        let norm: f32 = a[0].as_slice().iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_failing_mode_is_per_operation() {
        let backend = MockBackend::new();
        backend.set_failing(MockOperation::Caption, true);

        assert!(backend.caption(b"png", "image/png").await.is_err());
        assert!(backend.analyze("tokio-rs/tokio").await.is_ok());

        backend.set_failing(MockOperation::Caption, false);
        assert!(backend.caption(b"png", "image/png").await.is_ok());
        assert_eq!(backend.call_count(MockOperation::Caption), 2);
    }

    #[tokio::test]
    async fn test_embed_failure_is_embedding_error() {
        let backend = MockBackend::new();
        backend.set_failing(MockOperation::Embed, true);
        let err = backend.embed_texts(&["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, Error::Embedding(_)));
        assert!(err.is_transient());
    }
}
