//! Advisory online/offline record per downstream service.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::codec::{decode_json, encode_json, CodecError};
use crate::keys::{health_key, HEALTH_PREFIX};
use crate::kv::{KvStore, StoreError};
use crate::metrics::Metrics;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub service_name: String,
    pub online: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_online_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl HealthRecord {
    fn new(service: &str) -> Self {
        Self {
            service_name: service.to_string(),
            online: false,
            last_checked_at: None,
            last_online_at: None,
            error_message: None,
        }
    }

    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            online: self.online,
            last_checked_at: self.last_checked_at,
            last_online_at: self.last_online_at,
            error_message: self.error_message.clone(),
        }
    }
}

/// A record without its name, as listed by [`HealthRegistry::all_statuses`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub online: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_online_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Stores one [`HealthRecord`] per service without expiry.
///
/// Marks are read-modify-write and the last writer wins; records are telemetry
/// and never gate admission.
#[derive(Clone)]
pub struct HealthRegistry {
    store: Arc<dyn KvStore>,
    known_services: Vec<String>,
    metrics: Option<Metrics>,
}

impl HealthRegistry {
    pub fn new(store: Arc<dyn KvStore>, known_services: Vec<String>) -> Self {
        Self {
            store,
            known_services,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn known_services(&self) -> &[String] {
        &self.known_services
    }

    pub fn is_known(&self, service: &str) -> bool {
        self.known_services.iter().any(|s| s == service)
    }

    async fn load(&self, service: &str) -> Result<Option<HealthRecord>, HealthError> {
        let Some(raw) = self.store.get(&health_key(service)).await? else {
            return Ok(None);
        };
        match decode_json::<HealthRecord>(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                error!(service, error = %e, "unreadable health record, starting fresh");
                Ok(None)
            }
        }
    }

    async fn save(&self, record: &HealthRecord) -> Result<(), HealthError> {
        let value = encode_json(record)?;
        self.store
            .put(&health_key(&record.service_name), &value, None)
            .await?;
        if let Some(m) = &self.metrics {
            m.set_service_online(&record.service_name, record.online);
        }
        Ok(())
    }

    /// The service's record, created offline and never checked if absent.
    pub async fn for_service(&self, service: &str) -> Result<HealthRecord, HealthError> {
        if let Some(record) = self.load(service).await? {
            return Ok(record);
        }
        let record = HealthRecord::new(service);
        self.save(&record).await?;
        Ok(record)
    }

    pub async fn mark_online(&self, service: &str) -> Result<HealthRecord, HealthError> {
        let mut record = self
            .load(service)
            .await?
            .unwrap_or_else(|| HealthRecord::new(service));
        let now = Utc::now();
        if !record.online {
            info!(service, "service online");
        }
        record.online = true;
        record.last_checked_at = Some(now);
        record.last_online_at = Some(now);
        record.error_message = None;
        self.save(&record).await?;
        Ok(record)
    }

    /// Keeps `last_online_at` from the previous record.
    pub async fn mark_offline(
        &self,
        service: &str,
        error: impl Into<String>,
    ) -> Result<HealthRecord, HealthError> {
        let error = error.into();
        let mut record = self
            .load(service)
            .await?
            .unwrap_or_else(|| HealthRecord::new(service));
        warn!(service, error = %error, "service offline");
        record.online = false;
        record.last_checked_at = Some(Utc::now());
        record.error_message = Some(error);
        self.save(&record).await?;
        Ok(record)
    }

    /// Every known service plus any service with a stored record.
    pub async fn all_statuses(&self) -> Result<BTreeMap<String, HealthSummary>, HealthError> {
        let mut out = BTreeMap::new();
        for (key, raw) in self.store.scan_prefix(HEALTH_PREFIX).await? {
            match decode_json::<HealthRecord>(&raw) {
                Ok(record) => {
                    out.insert(record.service_name.clone(), record.summary());
                }
                Err(e) => error!(key = %key, error = %e, "unreadable health record"),
            }
        }
        for service in &self.known_services {
            if !out.contains_key(service) {
                let record = self.for_service(service).await?;
                out.insert(service.clone(), record.summary());
            }
        }
        Ok(out)
    }
}
