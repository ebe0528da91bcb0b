//! Single-holder admission lock with a lease.
//!
//! The lock is one key in the shared store holding the owner's run id. It is
//! taken with an atomic set-if-absent carrying the lease as the entry TTL, so
//! a holder that dies without releasing frees the lock when the lease runs
//! out. Release is compare-and-delete: only the value's owner can remove it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::keys::lock_key;
use crate::kv::{KvStore, StoreError};

#[derive(Clone)]
pub struct AdmissionLock {
    store: Arc<dyn KvStore>,
    name: String,
    key: String,
}

impl AdmissionLock {
    pub fn new(store: Arc<dyn KvStore>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            key: lock_key(&name),
            name,
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the lock for `owner` unless someone holds it. Never waits.
    pub async fn try_acquire(&self, owner: &str, lease: Duration) -> Result<bool, StoreError> {
        let acquired = self
            .store
            .put_if_absent(&self.key, owner.as_bytes(), Some(lease))
            .await?;
        if acquired {
            info!(lock = %self.name, owner, lease_ms = lease.as_millis() as u64, "admission lock acquired");
        } else {
            debug!(lock = %self.name, owner, "admission lock busy");
        }
        Ok(acquired)
    }

    /// Release the lock if `owner` still holds it. Returns whether it was deleted.
    ///
    /// Releasing a lock held by someone else, or one whose lease already ran
    /// out, leaves the store untouched.
    pub async fn release(&self, owner: &str) -> Result<bool, StoreError> {
        let released = self
            .store
            .delete_if_equals(&self.key, owner.as_bytes())
            .await?;
        if released {
            info!(lock = %self.name, owner, "admission lock released");
        } else {
            warn!(lock = %self.name, owner, "release by non-holder ignored");
        }
        Ok(released)
    }

    /// Current holder, if the lock is taken.
    pub async fn holder(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .get(&self.key)
            .await?
            .map(|raw| String::from_utf8_lossy(&raw).to_string()))
    }
}
