//! In-process coordination store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::traits::CoordinationStore;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// [`CoordinationStore`] backed by a mutex-guarded map.
///
/// Expiry follows `tokio::time`, so tests running with a paused clock can
/// advance past TTLs deterministically. Only suitable for a single process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>, Instant) -> T) -> T {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        entries.retain(|_, entry| entry.is_live(now));
        f(&mut entries, now)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.with_entries(|entries, _| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        if ttl.is_zero() {
            return Err(Error::InvalidInput("TTL must be positive".into()));
        }
        Ok(self.with_entries(|entries, now| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Some(now + ttl),
                },
            );
            true
        }))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.with_entries(|entries, _| entries.get(key).map(|e| e.value.clone())))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.with_entries(|entries, now| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: ttl.map(|ttl| now + ttl),
                },
            );
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.with_entries(|entries, _| entries.remove(key).is_some()))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        Ok(self.with_entries(|entries, _| match entries.get(key) {
            Some(entry) if entry.value == expected => {
                entries.remove(key);
                true
            }
            _ => false,
        }))
    }

    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self.with_entries(|entries, now| {
            entries
                .get(key)
                .and_then(|entry| entry.expires_at)
                .map(|at| at.saturating_duration_since(now))
        }))
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        self.with_entries(|entries, _| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: "0".to_string(),
                expires_at: None,
            });
            let current: i64 = entry.value.parse().map_err(|_| {
                Error::Coordination(format!("value at {key} is not an integer"))
            })?;
            let next = current + delta;
            entry.value = next.to_string();
            Ok(next)
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        Ok(self.with_entries(|entries, now| match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                true
            }
            None => false,
        }))
    }
}
