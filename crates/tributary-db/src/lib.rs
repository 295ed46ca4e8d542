//! # tributary-db
//!
//! PostgreSQL persistence and Redis coordination for tributary.
//!
//! This crate provides:
//! - Connection pool management
//! - The durable task queue (`task_queue` table, `SKIP LOCKED` claims)
//! - Source and work item repositories, including pgvector chunk storage
//! - A Redis implementation of the coordination store
//!
//! ## Example
//!
//! ```rust,ignore
//! use tributary_db::{Database, SourceRepository, CreateSourceRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/tributary").await?;
//!     db.migrate().await?;
//!
//!     let id = db.sources.create(CreateSourceRequest {
//!         url: "https://blog.example/feed.json".to_string(),
//!         title: None,
//!         refresh_interval_minutes: None,
//!     }).await?;
//!
//!     println!("Registered source: {}", id);
//!     Ok(())
//! }
//! ```

pub mod coordination;
pub mod items;
pub mod pool;
pub mod sources;
pub mod tasks;

// Note: Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

use std::sync::Arc;

pub use tributary_core::*;

pub use coordination::RedisCoordinationStore;
pub use items::PgItemRepository;
pub use pool::{create_pool, log_pool_metrics, PoolConfig};
pub use sources::PgSourceRepository;
pub use tasks::PgTaskQueue;

/// Combined database context with all repositories.
///
/// Repositories are reference counted so they can be handed to the worker
/// runtime as trait objects while the context stays usable.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Polled sources and their scheduling columns.
    pub sources: Arc<PgSourceRepository>,
    /// Work items, stage flags and derived data.
    pub items: Arc<PgItemRepository>,
    /// Durable task queue.
    pub tasks: Arc<PgTaskQueue>,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            sources: Arc::new(PgSourceRepository::new(pool.clone())),
            items: Arc::new(PgItemRepository::new(pool.clone())),
            tasks: Arc::new(PgTaskQueue::new(pool.clone())),
            pool,
        }
    }

    /// Replace the task queue with one using a different default retry budget.
    pub fn with_task_max_retries(mut self, max_retries: i32) -> Self {
        self.tasks = Arc::new(PgTaskQueue::new(self.pool.clone()).with_default_max_retries(max_retries));
        self
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, PoolConfig::from_env()).await
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
