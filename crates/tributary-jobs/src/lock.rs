//! Distributed task and schedule locks on the coordination store.
//!
//! A task lock (`lock:{resource}`) guarantees that only one handler mutates
//! a resource at a time. A schedule lock (`schedule:{resource}`) guarantees
//! that only one successor run of a resource is enqueued per delay window.
//! Both are plain set-if-absent keys with a TTL, so a crashed holder's lock
//! disappears on its own.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use tributary_core::{defaults, CoordinationStore, Result};

const SCHEDULE_KEY_PREFIX: &str = "schedule:";

/// Lock primitives over a [`CoordinationStore`].
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn CoordinationStore>,
    schedule_min_ttl: Duration,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            schedule_min_ttl: Duration::from_secs(defaults::SCHEDULE_LOCK_MIN_TTL_SECS),
        }
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    fn lock_key(resource: &str) -> String {
        format!("{}{resource}", defaults::LOCK_KEY_PREFIX)
    }

    fn schedule_key(resource: &str) -> String {
        format!("{SCHEDULE_KEY_PREFIX}{resource}")
    }

    /// Try to take the task lock on `resource` for `ttl`.
    ///
    /// `false` means another holder owns the resource. That is an expected
    /// outcome, not an error.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "lock", op = "acquire"))]
    pub async fn acquire(&self, resource: &str, ttl: Duration, holder: &str) -> Result<bool> {
        let acquired = self
            .store
            .set_if_absent(&Self::lock_key(resource), holder, ttl)
            .await?;
        if !acquired {
            debug!(lock_key = resource, "Lock busy");
        }
        Ok(acquired)
    }

    /// Release the task lock on `resource` if `holder` still owns it.
    ///
    /// Returns `false` when the lock had expired or belongs to someone else;
    /// in that case nothing is deleted.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "lock", op = "release"))]
    pub async fn release(&self, resource: &str, holder: &str) -> Result<bool> {
        let released = self
            .store
            .delete_if_equals(&Self::lock_key(resource), holder)
            .await?;
        if !released {
            warn!(
                lock_key = resource,
                "Lock no longer held at release, it expired or changed hands"
            );
        }
        Ok(released)
    }

    /// Whether a task lock on `resource` currently exists.
    pub async fn is_locked(&self, resource: &str) -> Result<bool> {
        Ok(self.store.get(&Self::lock_key(resource)).await?.is_some())
    }

    /// Whether `holder` currently owns the task lock on `resource`.
    pub async fn is_held_by(&self, resource: &str, holder: &str) -> Result<bool> {
        Ok(self.store.get(&Self::lock_key(resource)).await?.as_deref() == Some(holder))
    }

    /// Claim the right to schedule the next run of `resource` after `delay`.
    ///
    /// The schedule lock lives as long as the delay (with a small floor for
    /// immediate runs), so exactly one successor is enqueued per window.
    #[instrument(skip(self), fields(subsystem = "jobs", component = "lock", op = "try_schedule"))]
    pub async fn try_schedule(&self, resource: &str, delay: Duration, holder: &str) -> Result<bool> {
        let ttl = delay.max(self.schedule_min_ttl);
        let acquired = self
            .store
            .set_if_absent(&Self::schedule_key(resource), holder, ttl)
            .await?;
        if !acquired {
            debug!(lock_key = resource, "Next run already scheduled");
        }
        Ok(acquired)
    }

    /// Drop the schedule lock of `resource` if `holder` set it.
    pub async fn release_schedule(&self, resource: &str, holder: &str) -> Result<bool> {
        self.store
            .delete_if_equals(&Self::schedule_key(resource), holder)
            .await
    }

    /// Drop a schedule lock, e.g. after the enqueue it guarded failed.
    pub async fn clear_schedule(&self, resource: &str) -> Result<()> {
        self.store.delete(&Self::schedule_key(resource)).await?;
        Ok(())
    }
}
