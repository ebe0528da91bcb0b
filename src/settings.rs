use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::job::JobKind;
use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_http_addr")]
    pub http_addr: String, // e.g. 127.0.0.1:8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> String {
    "127.0.0.1:8080".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub backend: Backend,
    pub path: String,
    /// SlateDB WAL flush interval. Lower values make writes durable sooner.
    #[serde(default)]
    pub flush_interval_ms: Option<u64>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Fs,
            path: "/tmp/gpugate".to_string(),
            flush_interval_ms: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Fs,
    S3,
    Memory,
    Url,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdmissionConfig {
    #[serde(default = "default_lock_key")]
    pub lock_key: String,
    /// Fixed delay before a job that lost the lock race is tried again.
    #[serde(default = "default_contention_delay_ms")]
    pub contention_delay_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            lock_key: default_lock_key(),
            contention_delay_ms: default_contention_delay_ms(),
        }
    }
}

impl AdmissionConfig {
    pub fn contention_delay(&self) -> Duration {
        Duration::from_millis(self.contention_delay_ms)
    }
}

fn default_lock_key() -> String {
    "gpu_lock".to_string()
}

fn default_contention_delay_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_status_ttl_secs")]
    pub status_ttl_secs: u64,
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,
    #[serde(default = "default_status_ttl_secs")]
    pub failed_status_ttl_secs: u64,
    /// Prefix for the locator handed to pollers once a result exists.
    #[serde(default = "default_result_url_base")]
    pub result_url_base: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            status_ttl_secs: default_status_ttl_secs(),
            result_ttl_secs: default_result_ttl_secs(),
            failed_status_ttl_secs: default_status_ttl_secs(),
            result_url_base: default_result_url_base(),
        }
    }
}

impl CacheConfig {
    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }
    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }
    pub fn failed_status_ttl(&self) -> Duration {
        Duration::from_secs(self.failed_status_ttl_secs)
    }
}

fn default_status_ttl_secs() -> u64 {
    600
}

fn default_result_ttl_secs() -> u64 {
    3_600
}

fn default_result_url_base() -> String {
    "/result".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunnerConfig {
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// How long a worker's claim on a task survives if the worker dies.
    #[serde(default = "default_claim_lease_ms")]
    pub claim_lease_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            queue: default_queue(),
            workers: default_workers(),
            claim_lease_ms: default_claim_lease_ms(),
        }
    }
}

fn default_queue() -> String {
    "gpu".to_string()
}

fn default_workers() -> usize {
    2
}

fn default_claim_lease_ms() -> u64 {
    // Longest job lease plus headroom; a crashed worker's task becomes runnable again after this.
    3_600_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Services always listed by `all_statuses`, even before their first check.
    #[serde(default = "default_services")]
    pub services: Vec<String>,
    #[serde(default)]
    pub probes: Vec<ProbeConfig>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            services: default_services(),
            probes: Vec::new(),
        }
    }
}

fn default_check_interval_secs() -> u64 {
    60
}

fn default_services() -> Vec<String> {
    JobKind::ALL
        .iter()
        .map(|k| k.service_name().to_string())
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProbeConfig {
    pub service: String,
    pub url: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobConfig {
    pub kind: JobKind,
    pub backend_url: String,
    /// Overrides the kind's default admission lease.
    #[serde(default)]
    pub lease_secs: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl JobConfig {
    pub fn lease(&self) -> Duration {
        self.lease_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.kind.default_lease())
    }

    /// How long one compute call may take.
    pub fn timeout(&self) -> Duration {
        self.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(crate::compute::DEFAULT_TIMEOUT)
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                Self::parse(&data)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn parse(data: &str) -> anyhow::Result<Self> {
        let cfg: Self = toml::from_str(data)?;
        if cfg.runner.workers == 0 {
            anyhow::bail!("runner.workers must be at least 1");
        }
        if cfg.retry.attempts == 0 {
            anyhow::bail!("retry.attempts must be at least 1");
        }
        // A claim that lapses mid-attempt lets a second worker run the same task
        let claim_lease = Duration::from_millis(cfg.runner.claim_lease_ms);
        for job in &cfg.jobs {
            let longest = job.lease().max(job.timeout());
            if claim_lease <= longest {
                anyhow::bail!(
                    "runner.claim_lease_ms ({}) must exceed the lease and timeout of job kind {} ({}ms)",
                    cfg.runner.claim_lease_ms,
                    job.kind,
                    longest.as_millis()
                );
            }
        }
        Ok(cfg)
    }
}
