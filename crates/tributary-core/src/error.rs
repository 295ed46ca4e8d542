//! Error types for tributary.

use thiserror::Error;

/// Result type alias using tributary's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a content fetcher.
///
/// Transport and status failures are retried on the normal backoff
/// schedule; parse failures count against the source the same way but
/// are never worth an immediate queue-level retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Connection, DNS, TLS or timeout failure.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The server answered with a non-success status code.
    #[error("unexpected status {code}: {message}")]
    Status { code: u16, message: String },

    /// The body could not be parsed into items.
    #[error("parse failure: {0}")]
    Parse(String),
}

impl FetchError {
    /// Whether the failure is expected to clear up on its own.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport(_) => true,
            FetchError::Status { code, .. } => *code == 429 || *code >= 500,
            FetchError::Parse(_) => false,
        }
    }
}

/// Core error type for tributary operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Source not found
    #[error("Source not found: {0}")]
    SourceNotFound(uuid::Uuid),

    /// Work item not found
    #[error("Item not found: {0}")]
    ItemNotFound(uuid::Uuid),

    /// Content fetch failed
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Embedding generation failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Inference/generation failed
    #[error("Inference error: {0}")]
    Inference(String),

    /// Task queue error
    #[error("Queue error: {0}")]
    Queue(String),

    /// Coordination store (locks, counters) error
    #[error("Coordination error: {0}")]
    Coordination(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Malformed input and parse failures are permanent; everything that
    /// touches a network or a shared service is treated as transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Fetch(e) => e.is_transient(),
            Error::Database(_)
            | Error::Embedding(_)
            | Error::Inference(_)
            | Error::Queue(_)
            | Error::Coordination(_)
            | Error::Request(_)
            | Error::Io(_) => true,
            Error::NotFound(_)
            | Error::SourceNotFound(_)
            | Error::ItemNotFound(_)
            | Error::Serialization(_)
            | Error::Config(_)
            | Error::InvalidInput(_)
            | Error::Internal(_) => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}
