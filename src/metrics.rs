//! Prometheus metrics for gpugate.
//!
//! Initialize once at startup and hand clones to the components that record:
//! ```ignore
//! let metrics = gpugate::metrics::init()?;
//! metrics.record_lock_acquired("image");
//! ```
//!
//! The HTTP server exposes the registry at `/metrics`.

use std::sync::Arc;

use prometheus::{
    core::Collector, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

/// Compute calls run for seconds to tens of minutes
const COMPUTE_BUCKETS: &[f64] = &[
    0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0,
];

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    lock_acquisitions: CounterVec,
    lock_contentions: CounterVec,
    job_attempts: CounterVec,
    jobs_completed: CounterVec,
    compute_duration: HistogramVec,
    tasks_enqueued: CounterVec,
    service_online: GaugeVec,
}

impl Metrics {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_lock_acquired(&self, kind: &str) {
        self.lock_acquisitions.with_label_values(&[kind]).inc();
    }

    /// Record a job that found the admission lock held and was rescheduled.
    pub fn record_lock_contention(&self, kind: &str) {
        self.lock_contentions.with_label_values(&[kind]).inc();
    }

    /// `is_retry` is true for every attempt after the first.
    pub fn record_attempt(&self, kind: &str, is_retry: bool) {
        let is_retry_str = if is_retry { "true" } else { "false" };
        self.job_attempts
            .with_label_values(&[kind, is_retry_str])
            .inc();
    }

    /// Record a job reaching a terminal status ("complete" or "failed").
    pub fn record_completion(&self, kind: &str, status: &str) {
        self.jobs_completed.with_label_values(&[kind, status]).inc();
    }

    pub fn record_compute_duration(&self, kind: &str, duration_secs: f64) {
        self.compute_duration
            .with_label_values(&[kind])
            .observe(duration_secs);
    }

    pub fn record_enqueue(&self, queue: &str) {
        self.tasks_enqueued.with_label_values(&[queue]).inc();
    }

    pub fn set_service_online(&self, service: &str, online: bool) {
        self.service_online
            .with_label_values(&[service])
            .set(if online { 1.0 } else { 0.0 });
    }

    /// Registry contents in the Prometheus text exposition format.
    pub fn render(&self) -> Result<Vec<u8>, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

/// Helper to register a metric, logging on failure.
fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        tracing::warn!(error = %e, "failed to register metric");
    }
    metric
}

/// Initialize the metrics system with a fresh Prometheus registry.
pub fn init() -> anyhow::Result<Metrics> {
    let registry = Registry::new();

    let lock_acquisitions = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "gpugate_lock_acquisitions_total",
                "Admission lock acquisitions by job kind",
            ),
            &["kind"],
        )?,
    );

    let lock_contentions = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "gpugate_lock_contentions_total",
                "Attempts rescheduled because the admission lock was held",
            ),
            &["kind"],
        )?,
    );

    let job_attempts = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "gpugate_job_attempts_total",
                "Job attempts that acquired the lock and started",
            ),
            &["kind", "is_retry"],
        )?,
    );

    let jobs_completed = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "gpugate_jobs_completed_total",
                "Jobs that reached a terminal status",
            ),
            &["kind", "status"],
        )?,
    );

    let compute_duration = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                "gpugate_compute_duration_seconds",
                "Time spent inside the compute backend",
            )
            .buckets(COMPUTE_BUCKETS.to_vec()),
            &["kind"],
        )?,
    );

    let tasks_enqueued = register(
        &registry,
        CounterVec::new(
            Opts::new("gpugate_tasks_enqueued_total", "Tasks written to a queue"),
            &["queue"],
        )?,
    );

    let service_online = register(
        &registry,
        GaugeVec::new(
            Opts::new(
                "gpugate_service_online",
                "1 when the service was last marked online, 0 when offline",
            ),
            &["service"],
        )?,
    );

    Ok(Metrics {
        registry: Arc::new(registry),
        lock_acquisitions,
        lock_contentions,
        job_attempts,
        jobs_completed,
        compute_duration,
        tasks_enqueued,
        service_online,
    })
}
