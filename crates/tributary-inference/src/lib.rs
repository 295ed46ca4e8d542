//! # tributary-inference
//!
//! AI capability backends for tributary.
//!
//! The pipeline only depends on the [`Embedder`], [`Captioner`] and
//! [`Analyzer`] traits from `tributary-core`; this crate provides the
//! concrete implementations selected at startup:
//!
//! - [`OllamaBackend`]: embeddings via `/api/embed` and structured analysis
//!   via `/api/chat` with JSON output
//! - [`OllamaVisionBackend`]: image captions via `/api/generate`
//! - [`MockBackend`]: deterministic in-process backend for tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use tributary_inference::OllamaBackend;
//! use tributary_core::Embedder;
//!
//! let backend = OllamaBackend::from_env();
//! let vectors = backend.embed_texts(&["hello".to_string()]).await?;
//! ```

pub mod mock;
#[cfg(feature = "ollama")]
pub mod ollama;
#[cfg(feature = "ollama")]
pub mod vision;

pub use mock::MockBackend;
#[cfg(feature = "ollama")]
pub use ollama::OllamaBackend;
#[cfg(feature = "ollama")]
pub use vision::OllamaVisionBackend;

// Re-export core traits for convenience
pub use tributary_core::{Analysis, Analyzer, Captioner, Embedder};
