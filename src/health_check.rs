//! Active probing of downstream services, feeding [`HealthRegistry`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::health::{HealthError, HealthRegistry};

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Err` carries the reason recorded on the service.
    async fn check(&self) -> Result<(), String>;
}

/// GET against a status endpoint; any 2xx is healthy.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(url: impl Into<String>, timeout: Option<Duration>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout.unwrap_or(DEFAULT_PROBE_TIMEOUT))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self) -> Result<(), String> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!(
                "Service returned non-success response: {}",
                response.status()
            ))
        }
    }
}

pub struct HealthChecker {
    registry: HealthRegistry,
    probes: BTreeMap<String, Arc<dyn HealthProbe>>,
}

impl HealthChecker {
    pub fn new(registry: HealthRegistry) -> Self {
        Self {
            registry,
            probes: BTreeMap::new(),
        }
    }

    pub fn with_probe(mut self, service: impl Into<String>, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.insert(service.into(), probe);
        self
    }

    pub fn registry(&self) -> &HealthRegistry {
        &self.registry
    }

    pub fn has_probe(&self, service: &str) -> bool {
        self.probes.contains_key(service)
    }

    /// Probe one service and record the outcome. `None` when no probe is configured.
    pub async fn check(&self, service: &str) -> Result<Option<bool>, HealthError> {
        let Some(probe) = self.probes.get(service) else {
            return Ok(None);
        };
        match probe.check().await {
            Ok(()) => {
                self.registry.mark_online(service).await?;
                Ok(Some(true))
            }
            Err(reason) => {
                self.registry.mark_offline(service, reason).await?;
                Ok(Some(false))
            }
        }
    }

    /// Probe every configured service.
    pub async fn check_all(&self) -> Result<BTreeMap<String, bool>, HealthError> {
        let mut results = BTreeMap::new();
        for service in self.probes.keys() {
            if let Some(online) = self.check(service).await? {
                results.insert(service.clone(), online);
            }
        }
        Ok(results)
    }

    /// Run [`Self::check_all`] every `interval` until `shutdown` fires.
    pub fn spawn_periodic(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.check_all().await {
                            Ok(results) => info!(?results, "health check complete"),
                            Err(e) => warn!(error = %e, "health check failed"),
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("health checker shutting down");
                        break;
                    }
                }
            }
        })
    }
}
