//! Redis-backed coordination store.
//!
//! Locks, rate limit markers, schedule guards and batch counters all live in
//! Redis so every worker process sees the same state. Each trait operation
//! maps onto a single atomic Redis command, except compare-and-delete which
//! runs as a Lua script.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `REDIS_URL`: Redis connection URL (default: redis://localhost:6379)
//! - `REDIS_KEY_PREFIX`: Namespace prepended to every key (default: `tributary:`)

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::info;

use tributary_core::{CoordinationStore, Error, Result};

/// Default Redis URL.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Default key namespace.
pub const DEFAULT_KEY_PREFIX: &str = "tributary:";

const DELETE_IF_EQUALS: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

fn redis_err(e: redis::RedisError) -> Error {
    Error::Coordination(e.to_string())
}

fn ttl_millis(ttl: Duration) -> Result<u64> {
    let ms = ttl.as_millis() as u64;
    if ms == 0 {
        return Err(Error::InvalidInput("ttl must be at least one millisecond".into()));
    }
    Ok(ms)
}

/// Host part of a connection URL, without credentials.
fn redacted_host(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.rsplit_once('@').map_or(rest, |(_, host)| host)
}

/// [`CoordinationStore`] backed by Redis.
#[derive(Clone)]
pub struct RedisCoordinationStore {
    connection: ConnectionManager,
    prefix: String,
    delete_if_equals: Script,
}

impl RedisCoordinationStore {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(redis_err)?;
        let connection = ConnectionManager::new(client).await.map_err(redis_err)?;

        info!(
            subsystem = "coordination",
            component = "redis",
            op = "connect",
            host = redacted_host(url),
            "Redis coordination store connected"
        );

        Ok(Self {
            connection,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            delete_if_equals: Script::new(DELETE_IF_EQUALS),
        })
    }

    /// Connect using `REDIS_URL` and `REDIS_KEY_PREFIX`.
    pub async fn from_env() -> Result<Self> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());
        let store = Self::connect(&url).await?;
        Ok(match std::env::var("REDIS_KEY_PREFIX") {
            Ok(prefix) => store.with_prefix(prefix),
            Err(_) => store,
        })
    }

    /// Replace the key namespace.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl)?)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl)?);
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(redis_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(removed > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let removed: i64 = self
            .delete_if_equals
            .key(self.key(key))
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(removed > 0)
    }

    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.connection.clone();
        let ms: i64 = redis::cmd("PTTL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        // -2: missing, -1: no expiry
        Ok((ms >= 0).then(|| Duration::from_millis(ms as u64)))
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.connection.clone();
        let value: i64 = redis::cmd("INCRBY")
            .arg(self.key(key))
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(self.key(key))
            .arg(ttl_millis(ttl)?)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(applied == 1)
    }
}
