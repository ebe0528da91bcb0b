//! Per-namespace result and status records keyed by job id.
//!
//! Both records live in the shared store with independent TTLs. A status
//! record that is missing or unreadable is reported as `pending`; a result
//! payload that is unreadable is reported as absent. Neither case is an error
//! for the caller, only store failures are.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

use crate::codec::{decode_json, encode_json, CodecError};
use crate::job::{JobId, StatusRecord};
use crate::keys::{namespace_prefix, result_key, status_key};
use crate::kv::{Expiry, KvStore, StoreError};
use crate::settings::CacheConfig;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(#[from] StoreError),
    #[error("failed to encode cache record: {0}")]
    Encode(#[from] CodecError),
}

#[derive(Clone)]
pub struct ResultCache {
    store: Arc<dyn KvStore>,
    namespace: String,
    status_ttl: Duration,
    result_ttl: Duration,
}

impl ResultCache {
    pub fn new(store: Arc<dyn KvStore>, namespace: impl Into<String>, cfg: &CacheConfig) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            status_ttl: cfg.status_ttl(),
            result_ttl: cfg.result_ttl(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn default_status_ttl(&self) -> Duration {
        self.status_ttl
    }

    pub fn default_result_ttl(&self) -> Duration {
        self.result_ttl
    }

    pub async fn put_status(
        &self,
        id: &JobId,
        record: &StatusRecord,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = status_key(&self.namespace, id.as_str());
        let value = encode_json(record)?;
        self.store.put(&key, &value, Some(ttl)).await?;
        debug!(key = %key, status = record.status.as_str(), "stored status");
        Ok(())
    }

    /// The stored status, or `pending` when none is readable.
    pub async fn get_status(&self, id: &JobId) -> Result<StatusRecord, CacheError> {
        let key = status_key(&self.namespace, id.as_str());
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(StatusRecord::pending());
        };
        match decode_json::<StatusRecord>(&raw) {
            Ok(record) => Ok(record),
            Err(e) => {
                error!(key = %key, error = %e, "unreadable status record");
                Ok(StatusRecord::pending())
            }
        }
    }

    pub async fn put_result(
        &self,
        id: &JobId,
        payload: &Value,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = result_key(&self.namespace, id.as_str());
        let value = encode_json(payload)?;
        self.store.put(&key, &value, Some(ttl)).await?;
        debug!(key = %key, bytes = value.len(), "stored result");
        Ok(())
    }

    pub async fn get_result(&self, id: &JobId) -> Result<Option<Value>, CacheError> {
        let key = result_key(&self.namespace, id.as_str());
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        match decode_json::<Value>(&raw) {
            Ok(payload) => Ok(Some(payload)),
            Err(e) => {
                error!(key = %key, error = %e, "unreadable result payload");
                Ok(None)
            }
        }
    }

    pub async fn exists_result(&self, id: &JobId) -> Result<bool, CacheError> {
        Ok(self.get_result(id).await?.is_some())
    }

    /// Time left before the result expires; `None` when there is no result.
    pub async fn result_ttl(&self, id: &JobId) -> Result<Option<Expiry>, CacheError> {
        let key = result_key(&self.namespace, id.as_str());
        Ok(self.store.remaining_ttl(&key).await?)
    }

    pub async fn delete(&self, id: &JobId) -> Result<(), CacheError> {
        let result = result_key(&self.namespace, id.as_str());
        let status = status_key(&self.namespace, id.as_str());
        self.store.delete(&[result.as_str(), status.as_str()]).await?;
        Ok(())
    }

    /// Drop expired records of this namespace from the store.
    pub async fn cleanup_expired(&self) -> Result<usize, CacheError> {
        let reaped = self
            .store
            .reap_expired(&namespace_prefix(&self.namespace))
            .await?;
        if reaped > 0 {
            debug!(namespace = %self.namespace, reaped, "removed expired cache records");
        }
        Ok(reaped)
    }
}
