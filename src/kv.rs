//! Shared key-value store used by every component.
//!
//! Values carry their own expiry (see [`crate::codec`]); expired entries read
//! as absent everywhere. The two conditional operations, `put_if_absent` and
//! `delete_if_equals`, are the only primitives the admission lock and the task
//! runner need for mutual exclusion, and both run as serializable
//! transactions so concurrent callers observe a single winner.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use slatedb::object_store::ObjectStore;
use slatedb::{Db, DbIterator, ErrorKind as SlateErrorKind, IsolationLevel, WriteBatch};
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec::{decode_entry, encode_entry};
use crate::settings::{Backend, DatabaseConfig};

const MAX_TXN_RETRIES: usize = 5;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Slate(#[from] slatedb::Error),
    #[error("invalid store location: {0}")]
    InvalidLocation(String),
    #[error("transaction conflict in {0}, exceeded max retries")]
    TransactionConflict(&'static str),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    fn is_txn_conflict(&self) -> bool {
        matches!(self, StoreError::Slate(e) if e.kind() == SlateErrorKind::Transaction)
    }
}

/// Time left on a live key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Never,
    In(Duration),
}

/// One mutation of an atomic batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// `None` when the key is absent or expired.
    async fn remaining_ttl(&self, key: &str) -> Result<Option<Expiry>, StoreError>;

    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Store `value` only if no live entry exists. Returns whether it was stored.
    async fn put_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    async fn delete(&self, keys: &[&str]) -> Result<(), StoreError>;

    /// Delete `key` only while its live value equals `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError>;

    /// Live entries under `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Apply all operations atomically.
    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;

    /// Physically remove expired entries under `prefix`. Returns how many were removed.
    async fn reap_expired(&self, prefix: &str) -> Result<usize, StoreError>;
}

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn deadline(now_ms: i64, ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|d| now_ms.saturating_add(d.as_millis() as i64))
}

/// Decode a raw value, dropping expired or unreadable entries.
fn live_payload(key: &str, raw: &[u8], now_ms: i64) -> Option<Vec<u8>> {
    match decode_entry(raw) {
        Ok(entry) if entry.is_expired(now_ms) => None,
        Ok(entry) => Some(entry.payload.to_vec()),
        Err(e) => {
            warn!(key, error = %e, "ignoring undecodable store entry");
            None
        }
    }
}

fn prefix_range(prefix: &str) -> std::ops::RangeInclusive<Vec<u8>> {
    let start = prefix.as_bytes().to_vec();
    let mut end = start.clone();
    end.push(0xFF);
    start..=end
}

/// Build the object store backing the database and the path slatedb should use inside it.
fn object_store_for(
    backend: Backend,
    path: &str,
) -> Result<(Arc<dyn ObjectStore>, String), StoreError> {
    match backend {
        Backend::Fs => {
            let root = Path::new(path);
            fs::create_dir_all(root).map_err(|e| {
                StoreError::InvalidLocation(format!("cannot create {}: {}", path, e))
            })?;
            // Relative roots get url-encoded inconsistently by the local store
            let canonical = root
                .canonicalize()
                .map_err(|e| StoreError::InvalidLocation(format!("{}: {}", path, e)))?
                .to_string_lossy()
                .to_string();
            let local =
                slatedb::object_store::local::LocalFileSystem::new_with_prefix(&canonical)
                    .map_err(|e| StoreError::InvalidLocation(e.to_string()))?;
            Ok((Arc::new(local), canonical))
        }
        Backend::Memory => Ok((
            Arc::new(slatedb::object_store::memory::InMemory::new()),
            path.to_string(),
        )),
        // s3://bucket/prefix and friends
        Backend::S3 | Backend::Url => Ok((Db::resolve_object_store(path)?, path.to_string())),
    }
}

/// [`KvStore`] backed by a SlateDB database.
pub struct SlateKvStore {
    db: Db,
}

impl SlateKvStore {
    pub async fn open(cfg: &DatabaseConfig) -> Result<Arc<Self>, StoreError> {
        let (object_store, path) = object_store_for(cfg.backend, &cfg.path)?;
        let mut builder = slatedb::DbBuilder::new(path.as_str(), object_store);
        if let Some(flush_ms) = cfg.flush_interval_ms {
            builder = builder.with_settings(slatedb::config::Settings {
                flush_interval: Some(Duration::from_millis(flush_ms)),
                ..Default::default()
            });
        }
        let db = builder.build().await?;
        debug!(path = %path, backend = ?cfg.backend, "opened store");
        Ok(Arc::new(Self { db }))
    }

    pub async fn close(&self) -> Result<(), StoreError> {
        self.db.close().await?;
        Ok(())
    }

    async fn put_if_absent_once(&self, key: &str, entry: &[u8]) -> Result<bool, StoreError> {
        let txn = self.db.begin(IsolationLevel::SerializableSnapshot).await?;
        if let Some(raw) = txn.get(key.as_bytes()).await? {
            if live_payload(key, &raw, now_epoch_ms()).is_some() {
                return Ok(false);
            }
        }
        txn.put(key.as_bytes(), entry)?;
        txn.commit().await?;
        Ok(true)
    }

    async fn delete_if_equals_once(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        let txn = self.db.begin(IsolationLevel::SerializableSnapshot).await?;
        let Some(raw) = txn.get(key.as_bytes()).await? else {
            return Ok(false);
        };
        match live_payload(key, &raw, now_epoch_ms()) {
            Some(current) if current == expected => {
                txn.delete(key.as_bytes())?;
                txn.commit().await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reap_expired_once(&self, prefix: &str) -> Result<usize, StoreError> {
        let now_ms = now_epoch_ms();
        let mut candidates = Vec::new();
        let mut iter: DbIterator = self.db.scan::<Vec<u8>, _>(prefix_range(prefix)).await?;
        while let Some(kv) = iter.next().await? {
            if matches!(decode_entry(&kv.value), Ok(entry) if entry.is_expired(now_ms)) {
                candidates.push(kv.key.to_vec());
            }
        }
        if candidates.is_empty() {
            return Ok(0);
        }

        // Re-check inside a transaction: a key may have been rewritten since the scan
        let txn = self.db.begin(IsolationLevel::SerializableSnapshot).await?;
        let mut reaped = 0;
        for key in &candidates {
            let Some(raw) = txn.get(key).await? else {
                continue;
            };
            if matches!(decode_entry(&raw), Ok(entry) if entry.is_expired(now_ms)) {
                txn.delete(key)?;
                reaped += 1;
            }
        }
        txn.commit().await?;
        Ok(reaped)
    }
}

#[async_trait]
impl KvStore for SlateKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(raw) = self.db.get(key.as_bytes()).await? else {
            return Ok(None);
        };
        Ok(live_payload(key, &raw, now_epoch_ms()))
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Expiry>, StoreError> {
        let Some(raw) = self.db.get(key.as_bytes()).await? else {
            return Ok(None);
        };
        let now_ms = now_epoch_ms();
        match decode_entry(&raw) {
            Ok(entry) if entry.is_expired(now_ms) => Ok(None),
            Ok(entry) => Ok(Some(match entry.remaining_ms(now_ms) {
                Some(ms) => Expiry::In(Duration::from_millis(ms as u64)),
                None => Expiry::Never,
            })),
            Err(_) => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        let entry = encode_entry(deadline(now_epoch_ms(), ttl), value);
        let mut batch = WriteBatch::new();
        batch.put(key.as_bytes(), &entry);
        self.db.write(batch).await?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let entry = encode_entry(deadline(now_epoch_ms(), ttl), value);
        for attempt in 0..MAX_TXN_RETRIES {
            match self.put_if_absent_once(key, &entry).await {
                Err(e) if e.is_txn_conflict() => {
                    // Another writer committed first; re-read and decide again
                    if attempt + 1 < MAX_TXN_RETRIES {
                        let delay_ms = 10 * (1 << attempt);
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        debug!(key, attempt = attempt + 1, "put_if_absent conflict, retrying");
                    }
                }
                other => return other,
            }
        }
        Err(StoreError::TransactionConflict("put_if_absent"))
    }

    async fn delete(&self, keys: &[&str]) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        for key in keys {
            batch.delete(key.as_bytes());
        }
        self.db.write(batch).await?;
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        for attempt in 0..MAX_TXN_RETRIES {
            match self.delete_if_equals_once(key, expected).await {
                Err(e) if e.is_txn_conflict() => {
                    if attempt + 1 < MAX_TXN_RETRIES {
                        let delay_ms = 10 * (1 << attempt);
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        debug!(key, attempt = attempt + 1, "delete_if_equals conflict, retrying");
                    }
                }
                other => return other,
            }
        }
        Err(StoreError::TransactionConflict("delete_if_equals"))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut iter: DbIterator = self.db.scan::<Vec<u8>, _>(prefix_range(prefix)).await?;
        let now_ms = now_epoch_ms();
        let mut out = Vec::new();
        while let Some(kv) = iter.next().await? {
            let key = String::from_utf8_lossy(&kv.key).to_string();
            if let Some(payload) = live_payload(&key, &kv.value, now_ms) {
                out.push((key, payload));
            }
        }
        Ok(out)
    }

    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let now_ms = now_epoch_ms();
        let mut batch = WriteBatch::new();
        for op in ops {
            match op {
                BatchOp::Put { key, value, ttl } => {
                    batch.put(key.as_bytes(), &encode_entry(deadline(now_ms, ttl), &value));
                }
                BatchOp::Delete { key } => batch.delete(key.as_bytes()),
            }
        }
        self.db.write(batch).await?;
        Ok(())
    }

    async fn reap_expired(&self, prefix: &str) -> Result<usize, StoreError> {
        for attempt in 0..MAX_TXN_RETRIES {
            match self.reap_expired_once(prefix).await {
                Err(e) if e.is_txn_conflict() => {
                    if attempt + 1 < MAX_TXN_RETRIES {
                        let delay_ms = 10 * (1 << attempt);
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                }
                other => return other,
            }
        }
        Err(StoreError::TransactionConflict("reap_expired"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_range_covers_only_prefixed_keys() {
        let range = prefix_range("tts:");
        assert!(range.contains(&b"tts:abc".to_vec()));
        assert!(range.contains(&b"tts:abc:status".to_vec()));
        assert!(!range.contains(&b"tts".to_vec()));
        assert!(!range.contains(&b"ttt:abc".to_vec()));
    }

    #[test]
    fn live_payload_hides_expired_and_garbage() {
        let raw = encode_entry(Some(100), b"v");
        assert_eq!(live_payload("k", &raw, 50), Some(b"v".to_vec()));
        assert_eq!(live_payload("k", &raw, 100), None);
        assert_eq!(live_payload("k", b"zz", 0), None);
    }
}
