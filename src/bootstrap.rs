use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::admission::AdmissionLock;
use crate::broadcast::LocalBroadcastBus;
use crate::compute::HttpComputeBackend;
use crate::health::HealthRegistry;
use crate::health_check::{HealthChecker, HttpHealthProbe};
use crate::job_runner::{GenerationJob, JobRunner};
use crate::kv::{KvStore, SlateKvStore};
use crate::metrics::Metrics;
use crate::result_cache::ResultCache;
use crate::server::{run_http_with_reaper, AppState};
use crate::settings::AppConfig;
use crate::status::StatusReporter;
use crate::task_broker::LocalTaskRunner;
use crate::task_runner::TaskRunner;

/// Everything wired from one config, before anything is started.
pub struct Components {
    pub store: Arc<SlateKvStore>,
    pub tasks: Arc<LocalTaskRunner>,
    pub bus: Arc<LocalBroadcastBus>,
    pub checker: Arc<HealthChecker>,
    pub state: AppState,
}

pub async fn build(cfg: &AppConfig, metrics: Metrics) -> anyhow::Result<Components> {
    let store = SlateKvStore::open(&cfg.database).await?;
    let kv: Arc<dyn KvStore> = store.clone();

    let tasks = LocalTaskRunner::new(
        kv.clone(),
        &cfg.runner,
        cfg.retry.clone(),
        Some(metrics.clone()),
    );
    let task_runner: Arc<dyn TaskRunner> = tasks.clone();
    let health =
        HealthRegistry::new(kv.clone(), cfg.health.services.clone()).with_metrics(metrics.clone());
    let lock = AdmissionLock::new(kv.clone(), cfg.admission.lock_key.clone());
    let bus = Arc::new(LocalBroadcastBus::new());

    let mut caches = HashMap::new();
    for job in &cfg.jobs {
        let backend = HttpComputeBackend::new(
            job.backend_url.clone(),
            job.timeout_secs.map(Duration::from_secs),
        )?;
        let body = GenerationJob::new(job.kind, Arc::new(backend)).with_lease(job.lease());
        let cache = ResultCache::new(kv.clone(), job.kind.namespace(), &cfg.cache);
        let runner = JobRunner::new(
            Arc::new(body),
            lock.clone(),
            cache.clone(),
            health.clone(),
            task_runner.clone(),
            bus.clone(),
        )
        .with_contention_delay(cfg.admission.contention_delay())
        .with_failed_status_ttl(cfg.cache.failed_status_ttl())
        .with_metrics(metrics.clone());
        tasks.register(job.kind.as_str(), Arc::new(runner));
        caches.insert(job.kind, cache);
        info!(kind = %job.kind, backend = %job.backend_url, "job kind enabled");
    }

    let mut checker = HealthChecker::new(health.clone());
    for probe in &cfg.health.probes {
        let http = HttpHealthProbe::new(probe.url.clone(), probe.timeout_secs.map(Duration::from_secs))?;
        checker = checker.with_probe(probe.service.clone(), Arc::new(http));
    }
    let checker = Arc::new(checker);

    let reporter = StatusReporter::new(
        task_runner.clone(),
        cfg.runner.queue.clone(),
        cfg.cache.result_url_base.clone(),
    );
    let state = AppState {
        caches: Arc::new(caches),
        tasks: task_runner,
        reporter,
        health,
        checker: checker.clone(),
        bus: bus.clone(),
        metrics,
    };

    Ok(Components {
        store,
        tasks,
        bus,
        checker,
        state,
    })
}

/// Start a gpugate node the way `main` does, given a config path.
pub async fn start_from_config_path(path: &Path) -> anyhow::Result<NodeHandle> {
    let cfg = AppConfig::load(Some(path))?;
    start(cfg, crate::metrics::init()?).await
}

/// Build the components, start the workers, the health checker and the HTTP server.
pub async fn start(cfg: AppConfig, metrics: Metrics) -> anyhow::Result<NodeHandle> {
    let components = build(&cfg, metrics).await?;
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

    let listener = tokio::net::TcpListener::bind(&cfg.server.http_addr).await?;
    let addr = listener.local_addr()?;

    components.tasks.start();
    let health_loop = if cfg.health.probes.is_empty() {
        None
    } else {
        Some(components.checker.clone().spawn_periodic(
            Duration::from_secs(cfg.health.check_interval_secs.max(1)),
            shutdown_tx.subscribe(),
        ))
    };
    let server = tokio::spawn(run_http_with_reaper(
        listener,
        components.state.clone(),
        shutdown_rx,
    ));

    Ok(NodeHandle {
        addr,
        components,
        server,
        health_loop,
        shutdown: shutdown_tx,
    })
}

pub struct NodeHandle {
    pub addr: SocketAddr,
    pub components: Components,
    pub server: JoinHandle<Result<(), Box<dyn std::error::Error + Send + Sync>>>,
    pub health_loop: Option<JoinHandle<()>>,
    pub shutdown: broadcast::Sender<()>,
}

impl NodeHandle {
    /// Stop serving, let workers finish their current task, then close the store.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        match self.server.await {
            Ok(Err(e)) => error!(error = %e, "http server error"),
            Err(e) => error!(error = %e, "http server task failed"),
            Ok(Ok(())) => {}
        }
        if let Some(handle) = self.health_loop {
            handle.await.ok();
        }
        self.components.tasks.stop().await;
        if let Err(e) = self.components.store.close().await {
            error!(error = %e, "failed to close store");
        }
    }
}
