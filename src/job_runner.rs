//! Runs GPU job bodies under the admission lock.
//!
//! One call to [`JobRunner::run_attempt`] is one attempt:
//!
//! - lock busy: the job is re-enqueued after a fixed delay with the same
//!   attempt number and nothing else happens;
//! - result already cached: the attempt is a replay and only makes sure the
//!   status says `complete`;
//! - status already `complete` or `failed`: nothing is written;
//! - otherwise the status goes to `processing`, the body runs, the lock is
//!   released, and the outcome is recorded. The result is always stored before
//!   the `complete` status.
//!
//! Failures are returned to the task runner, whose retry policy decides what
//! happens next. The runner's exhausted hook marks the service offline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::admission::AdmissionLock;
use crate::broadcast::{channel_name, BroadcastBus};
use crate::compute::{Attachment, ComputeBackend, ComputeError, ComputeOutput, ComputeRequest};
use crate::health::HealthRegistry;
use crate::job::{JobId, JobKind, StatusRecord};
use crate::metrics::Metrics;
use crate::result_cache::{CacheError, ResultCache};
use crate::task_runner::{TaskContext, TaskFailure, TaskHandler, TaskRunner, TaskRunnerError, TaskSpec};

const DEFAULT_CONTENTION_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_FAILED_STATUS_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum JobError {
    #[error("compute failed: {0}")]
    Compute(#[from] ComputeError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("invalid job arguments: {0}")]
    InvalidArgs(String),
    #[error("task runner error: {0}")]
    Runner(#[from] TaskRunnerError),
}

impl JobError {
    /// Bad arguments fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, JobError::InvalidArgs(_))
    }
}

impl From<JobError> for TaskFailure {
    fn from(e: JobError) -> Self {
        if e.is_retryable() {
            TaskFailure::retryable(e.to_string())
        } else {
            TaskFailure::fatal(e.to_string())
        }
    }
}

/// How an attempt ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Completed,
    /// The lock was busy; the job was queued again.
    Rescheduled,
    /// A result already existed; the body did not run.
    Replayed,
}

/// The business logic of one job kind.
#[async_trait]
pub trait GpuJob: Send + Sync {
    fn kind(&self) -> JobKind;

    fn service_name(&self) -> &str {
        self.kind().service_name()
    }

    fn lease(&self) -> Duration {
        self.kind().default_lease()
    }

    async fn perform(&self, job_id: &JobId, args: &Value) -> Result<ComputeOutput, JobError>;
}

pub struct JobRunner {
    job: Arc<dyn GpuJob>,
    lock: AdmissionLock,
    cache: ResultCache,
    health: HealthRegistry,
    tasks: Arc<dyn TaskRunner>,
    bus: Arc<dyn BroadcastBus>,
    contention_delay: Duration,
    failed_status_ttl: Duration,
    metrics: Option<Metrics>,
}

impl JobRunner {
    pub fn new(
        job: Arc<dyn GpuJob>,
        lock: AdmissionLock,
        cache: ResultCache,
        health: HealthRegistry,
        tasks: Arc<dyn TaskRunner>,
        bus: Arc<dyn BroadcastBus>,
    ) -> Self {
        Self {
            job,
            lock,
            cache,
            health,
            tasks,
            bus,
            contention_delay: DEFAULT_CONTENTION_DELAY,
            failed_status_ttl: DEFAULT_FAILED_STATUS_TTL,
            metrics: None,
        }
    }

    pub fn with_contention_delay(mut self, delay: Duration) -> Self {
        self.contention_delay = delay;
        self
    }

    pub fn with_failed_status_ttl(mut self, ttl: Duration) -> Self {
        self.failed_status_ttl = ttl;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn kind(&self) -> JobKind {
        self.job.kind()
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Run attempt `attempt` of `max_attempts` for `job_id`.
    pub async fn run_attempt(
        &self,
        job_id: &JobId,
        args: &Value,
        attempt: u32,
        max_attempts: u32,
    ) -> Result<AttemptOutcome, JobError> {
        let kind = self.job.kind();
        let owner = format!("{}:{}:{}", kind, job_id, Uuid::new_v4());

        let acquired = self
            .lock
            .try_acquire(&owner, self.job.lease())
            .await
            .map_err(CacheError::from)?;
        if !acquired {
            let spec = TaskSpec::new(kind.as_str(), job_id.clone(), args.clone()).with_attempt(attempt);
            self.tasks.enqueue_after(self.contention_delay, spec).await?;
            if let Some(m) = &self.metrics {
                m.record_lock_contention(kind.as_str());
            }
            info!(
                job_id = %job_id,
                kind = %kind,
                attempt,
                delay_ms = self.contention_delay.as_millis() as u64,
                "GPU busy, rescheduled"
            );
            return Ok(AttemptOutcome::Rescheduled);
        }
        if let Some(m) = &self.metrics {
            m.record_lock_acquired(kind.as_str());
        }

        let body = self.execute(job_id, args, attempt).await;
        self.release(&owner).await;

        match body {
            Ok(None) => {
                self.finish_replay(job_id).await?;
                Ok(AttemptOutcome::Replayed)
            }
            Ok(Some(output)) => {
                self.complete(job_id, attempt, output).await?;
                Ok(AttemptOutcome::Completed)
            }
            Err(err) => {
                self.record_failure(job_id, attempt, max_attempts, &err).await;
                Err(err)
            }
        }
    }

    /// The part of an attempt that runs while holding the lock.
    /// `Ok(None)` means a result already existed or the job already settled.
    async fn execute(
        &self,
        job_id: &JobId,
        args: &Value,
        attempt: u32,
    ) -> Result<Option<ComputeOutput>, JobError> {
        let kind = self.job.kind();
        if self.cache.exists_result(job_id).await? {
            info!(job_id = %job_id, kind = %kind, "result already cached, skipping compute");
            return Ok(None);
        }
        let current = self.cache.get_status(job_id).await?;
        if current.status.is_terminal() {
            info!(job_id = %job_id, kind = %kind, status = ?current.status, "job already settled, skipping compute");
            return Ok(None);
        }

        self.cache
            .put_status(
                job_id,
                &StatusRecord::processing(attempt),
                self.cache.default_status_ttl(),
            )
            .await?;
        self.publish(job_id, json!({ "status": "processing" })).await;
        if let Some(m) = &self.metrics {
            m.record_attempt(kind.as_str(), attempt > 1);
        }

        let started = Instant::now();
        let result = self.job.perform(job_id, args).await;
        let elapsed = started.elapsed().as_secs_f64();
        if let Some(m) = &self.metrics {
            m.record_compute_duration(kind.as_str(), elapsed);
        }

        let mut output = result?;
        output
            .extras
            .entry("duration".to_string())
            .or_insert_with(|| json!((elapsed * 1000.0).round() / 1000.0));
        Ok(Some(output))
    }

    async fn release(&self, owner: &str) {
        if let Err(e) = self.lock.release(owner).await {
            // The lease still bounds how long the lock stays taken
            error!(owner, error = %e, "failed to release admission lock");
        }
    }

    async fn complete(
        &self,
        job_id: &JobId,
        attempt: u32,
        output: ComputeOutput,
    ) -> Result<(), JobError> {
        let kind = self.job.kind();
        self.cache
            .put_result(job_id, &output.payload, self.cache.default_result_ttl())
            .await?;
        let mut record = StatusRecord::complete(output.extras);
        record.attempt = Some(attempt);
        self.cache
            .put_status(job_id, &record, self.cache.default_status_ttl())
            .await?;
        self.publish(job_id, json!({ "status": "complete" })).await;

        if let Err(e) = self.health.mark_online(self.job.service_name()).await {
            warn!(service = self.job.service_name(), error = %e, "failed to mark service online");
        }
        if let Some(m) = &self.metrics {
            m.record_completion(kind.as_str(), "complete");
        }
        info!(job_id = %job_id, kind = %kind, attempt, "job complete");
        Ok(())
    }

    async fn finish_replay(&self, job_id: &JobId) -> Result<(), JobError> {
        if !self.cache.get_status(job_id).await?.status.is_terminal() {
            self.cache
                .put_status(
                    job_id,
                    &StatusRecord::complete(Default::default()),
                    self.cache.default_status_ttl(),
                )
                .await?;
        }
        Ok(())
    }

    /// Write the status for a failed attempt. Only the final failure is
    /// terminal; earlier ones keep `processing` so status never moves backwards.
    async fn record_failure(&self, job_id: &JobId, attempt: u32, max_attempts: u32, err: &JobError) {
        let kind = self.job.kind();
        let message = err.to_string();
        let is_final = !err.is_retryable() || attempt >= max_attempts;

        let (record, ttl) = if is_final {
            let mut record = StatusRecord::failed(message.clone());
            record.attempt = Some(attempt);
            (record, self.failed_status_ttl)
        } else {
            let record = StatusRecord::processing(attempt).with_extra("last_error", message.clone());
            (record, self.cache.default_status_ttl())
        };
        if let Err(e) = self.cache.put_status(job_id, &record, ttl).await {
            error!(job_id = %job_id, error = %e, "failed to record job failure");
        }

        if is_final {
            self.publish(job_id, json!({ "status": "failed", "error": message }))
                .await;
            if let Some(m) = &self.metrics {
                m.record_completion(kind.as_str(), "failed");
            }
            error!(job_id = %job_id, kind = %kind, attempt, error = %message, "job failed");
        } else {
            warn!(
                job_id = %job_id,
                kind = %kind,
                attempt,
                max_attempts,
                error = %message,
                "job attempt failed"
            );
        }
    }

    async fn publish(&self, job_id: &JobId, message: Value) {
        self.bus
            .publish(&channel_name(self.job.kind(), job_id), message)
            .await;
    }
}

#[async_trait]
impl TaskHandler for JobRunner {
    async fn perform(&self, ctx: &TaskContext) -> Result<(), TaskFailure> {
        self.run_attempt(&ctx.job_id, &ctx.args, ctx.attempt, ctx.max_attempts)
            .await
            .map(|_| ())
            .map_err(TaskFailure::from)
    }

    async fn on_exhausted(&self, ctx: &TaskContext, failure: &TaskFailure) {
        // Bad arguments say nothing about the backend
        if !failure.retryable {
            return;
        }
        let service = self.job.service_name();
        if let Err(e) = self.health.mark_offline(service, failure.message.clone()).await {
            error!(service, job_id = %ctx.job_id, error = %e, "failed to mark service offline");
        }
    }
}

/// `{"base64": ..., "original_filename": ...}` as sent by the upload form.
#[derive(Debug, Deserialize)]
struct UploadedFile {
    base64: String,
    original_filename: String,
}

#[derive(Debug, Deserialize)]
struct GenerationArgs {
    #[serde(default)]
    params: Value,
    #[serde(default)]
    file: Option<UploadedFile>,
}

/// The job body shared by every kind: decode the arguments, call the backend,
/// stamp the payload.
pub struct GenerationJob {
    kind: JobKind,
    backend: Arc<dyn ComputeBackend>,
    lease: Option<Duration>,
}

impl GenerationJob {
    pub fn new(kind: JobKind, backend: Arc<dyn ComputeBackend>) -> Self {
        Self {
            kind,
            backend,
            lease: None,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = Some(lease);
        self
    }
}

#[async_trait]
impl GpuJob for GenerationJob {
    fn kind(&self) -> JobKind {
        self.kind
    }

    fn lease(&self) -> Duration {
        self.lease.unwrap_or_else(|| self.kind.default_lease())
    }

    async fn perform(&self, job_id: &JobId, args: &Value) -> Result<ComputeOutput, JobError> {
        let args: GenerationArgs = serde_json::from_value(args.clone())
            .map_err(|e| JobError::InvalidArgs(e.to_string()))?;

        let mut inputs = Vec::new();
        if let Some(file) = args.file {
            let bytes = BASE64
                .decode(file.base64.as_bytes())
                .map_err(|e| JobError::InvalidArgs(format!("file is not valid base64: {}", e)))?;
            inputs.push(Attachment {
                filename: file.original_filename,
                bytes,
            });
        }

        let mut output = self
            .backend
            .compute(ComputeRequest {
                kind: self.kind,
                job_id: job_id.clone(),
                params: args.params,
                inputs,
            })
            .await?;
        if let Value::Object(payload) = &mut output.payload {
            payload
                .entry("created_at".to_string())
                .or_insert_with(|| json!(Utc::now().to_rfc3339()));
        }
        Ok(output)
    }
}
