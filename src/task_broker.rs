use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::{decode_json, encode_json};
use crate::keys::{claim_key, parse_task_key, task_key, task_queue_prefix, CLAIM_PREFIX};
use crate::kv::{now_epoch_ms, BatchOp, KvStore};
use crate::metrics::Metrics;
use crate::retry::{next_retry_time_ms, RetryPolicy};
use crate::settings::RunnerConfig;
use crate::task_runner::{
    PendingTask, TaskContext, TaskFailure, TaskHandler, TaskRecord, TaskRunner, TaskRunnerError,
    TaskSpec,
};

const MIN_IDLE_SLEEP_MS: u64 = 10;
const MAX_IDLE_SLEEP_MS: u64 = 1_000;

/// A task a worker holds the claim for.
struct ClaimedTask {
    key: String,
    record: TaskRecord,
}

/// Store-backed task queue with an in-process worker pool.
///
/// - Task records live under `tasks/<queue>/<ready_at>/<seq>/<task_id>` until the
///   task finishes, so the pending list always contains running tasks too.
/// - A worker owns a task while its claim key exists; claims carry a lease so a
///   crashed worker's task becomes runnable again. A running worker renews its
///   claim every third of the lease.
/// - Finishing a task deletes the record and claim in one batch; a retry writes the
///   next attempt's record in that same batch.
pub struct LocalTaskRunner {
    store: Arc<dyn KvStore>,
    queue: String,
    workers: usize,
    claim_lease: Duration,
    retry: RetryPolicy,
    handlers: Mutex<HashMap<String, Arc<dyn TaskHandler>>>,
    seq: AtomicU64,
    running: AtomicBool,
    notify: Notify,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    instance: String,
    metrics: Option<Metrics>,
}

impl LocalTaskRunner {
    pub fn new(
        store: Arc<dyn KvStore>,
        cfg: &RunnerConfig,
        retry: RetryPolicy,
        metrics: Option<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            queue: cfg.queue.clone(),
            workers: cfg.workers.max(1),
            claim_lease: Duration::from_millis(cfg.claim_lease_ms),
            retry,
            handlers: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            running: AtomicBool::new(false),
            notify: Notify::new(),
            worker_handles: Mutex::new(Vec::new()),
            instance: Uuid::new_v4().to_string(),
            metrics,
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Route tasks whose `job_type` is `job_type` to `handler`.
    pub fn register(&self, job_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_type.into(), handler);
    }

    fn handler_for(&self, job_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_type)
            .cloned()
    }

    /// Spawn the worker pool. Calling it again while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut handles = self
            .worker_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for n in 0..self.workers {
            let runner = Arc::clone(self);
            let worker = format!("{}-{}", runner.instance, n);
            handles.push(tokio::spawn(async move { runner.worker_loop(worker).await }));
        }
        info!(queue = %self.queue, workers = self.workers, "task runner started");
    }

    /// Stop the workers after their current task and wait for them to exit.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
        let handles: Vec<_> = self
            .worker_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "task worker exited abnormally");
            }
        }
        info!(queue = %self.queue, "task runner stopped");
    }

    async fn worker_loop(self: Arc<Self>, worker: String) {
        let mut sleep_ms = MIN_IDLE_SLEEP_MS;
        while self.running.load(Ordering::SeqCst) {
            match self.claim_next(&worker).await {
                Ok(Some(claimed)) => {
                    self.dispatch(&worker, claimed).await;
                    sleep_ms = MIN_IDLE_SLEEP_MS;
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(worker = %worker, error = %e, "failed to claim task"),
            }

            let delay = tokio::time::sleep(Duration::from_millis(sleep_ms));
            tokio::pin!(delay);
            tokio::select! {
                _ = &mut delay => {
                    sleep_ms = (sleep_ms * 2).min(MAX_IDLE_SLEEP_MS);
                },
                _ = self.notify.notified() => {
                    debug!(worker = %worker, "worker woken by enqueue");
                    sleep_ms = MIN_IDLE_SLEEP_MS;
                }
            }
        }
        debug!(worker = %worker, "worker exiting");
    }

    /// Claim the earliest ready task nobody else holds.
    async fn claim_next(&self, worker: &str) -> Result<Option<ClaimedTask>, TaskRunnerError> {
        let now_ms = now_epoch_ms();
        let entries = self
            .store
            .scan_prefix(&task_queue_prefix(&self.queue))
            .await?;
        for (key, raw) in entries {
            let Some(parsed) = parse_task_key(&key) else {
                continue;
            };
            // Keys sort by ready time; nothing after this one is ready either
            if parsed.ready_at_ms > now_ms {
                break;
            }
            let claim = claim_key(&parsed.task_id);
            if !self
                .store
                .put_if_absent(&claim, worker.as_bytes(), Some(self.claim_lease))
                .await?
            {
                continue;
            }
            // The record may have been finished between our scan and the claim
            if self.store.get(&key).await?.is_none() {
                self.store.delete(&[claim.as_str()]).await?;
                continue;
            }
            match decode_json::<TaskRecord>(&raw) {
                Ok(record) => return Ok(Some(ClaimedTask { key, record })),
                Err(e) => {
                    error!(key = %key, error = %e, "dropping malformed task record");
                    self.store.delete(&[key.as_str(), claim.as_str()]).await?;
                }
            }
        }
        Ok(None)
    }

    async fn dispatch(&self, worker: &str, claimed: ClaimedTask) {
        let ClaimedTask { key, record } = claimed;
        let ctx = TaskContext::from(&record);
        let handler = self.handler_for(&record.job_type);

        debug!(
            task_id = %record.task_id,
            job_type = %record.job_type,
            job_id = %record.job_id,
            attempt = record.attempt,
            "dispatching task"
        );
        let outcome = match &handler {
            Some(h) => self.perform_holding_claim(worker, &record.task_id, h.as_ref(), &ctx).await,
            None => Err(TaskFailure::fatal(format!(
                "no handler registered for job type {}",
                record.job_type
            ))),
        };

        let mut ops = vec![
            BatchOp::Delete { key: key.clone() },
            BatchOp::Delete {
                key: claim_key(&record.task_id),
            },
        ];

        if let Err(failure) = outcome {
            let policy = RetryPolicy {
                attempts: record.max_attempts,
                ..self.retry.clone()
            };
            let next_ready = if failure.retryable {
                next_retry_time_ms(now_epoch_ms(), record.attempt, &policy)
            } else {
                None
            };
            match next_ready {
                Some(ready_at_ms) => {
                    let next = TaskRecord {
                        attempt: record.attempt + 1,
                        ready_at_ms,
                        ..record.clone()
                    };
                    match encode_json(&next) {
                        Ok(value) => {
                            ops.push(BatchOp::Put {
                                key: task_key(&self.queue, ready_at_ms, self.next_seq(), &next.task_id),
                                value,
                                ttl: None,
                            });
                            info!(
                                task_id = %record.task_id,
                                job_id = %record.job_id,
                                attempt = record.attempt,
                                retry_at_ms = ready_at_ms,
                                error = %failure,
                                "task failed, retry scheduled"
                            );
                        }
                        Err(e) => error!(task_id = %record.task_id, error = %e, "cannot encode retry record"),
                    }
                }
                None => {
                    warn!(
                        task_id = %record.task_id,
                        job_id = %record.job_id,
                        attempt = record.attempt,
                        retryable = failure.retryable,
                        error = %failure,
                        "task failed permanently"
                    );
                    if let Some(h) = &handler {
                        h.on_exhausted(&ctx, &failure).await;
                    }
                }
            }
        }

        if let Err(e) = self.store.write_batch(ops).await {
            // The claim lease eventually expires and the task is run again
            error!(task_id = %record.task_id, error = %e, "failed to finalize task");
        }
        self.notify.notify_one();
    }

    /// Run the handler while renewing the claim, so the claim outlives the attempt.
    async fn perform_holding_claim(
        &self,
        worker: &str,
        task_id: &str,
        handler: &dyn TaskHandler,
        ctx: &TaskContext,
    ) -> Result<(), TaskFailure> {
        let claim = claim_key(task_id);
        let period = (self.claim_lease / 3).max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let work = handler.perform(ctx);
        tokio::pin!(work);
        loop {
            tokio::select! {
                outcome = &mut work => return outcome,
                _ = heartbeat.tick() => self.renew_claim(worker, &claim).await,
            }
        }
    }

    async fn renew_claim(&self, worker: &str, claim: &str) {
        match self.store.get(claim).await {
            Ok(Some(owner)) if owner == worker.as_bytes() => {
                if let Err(e) = self
                    .store
                    .put(claim, worker.as_bytes(), Some(self.claim_lease))
                    .await
                {
                    warn!(claim, error = %e, "failed to renew task claim");
                }
            }
            Ok(_) => warn!(claim, worker, "task claim lost while running"),
            Err(e) => warn!(claim, error = %e, "failed to read task claim"),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskRunner for LocalTaskRunner {
    async fn enqueue(&self, spec: TaskSpec) -> Result<String, TaskRunnerError> {
        self.enqueue_after(Duration::ZERO, spec).await
    }

    async fn enqueue_after(
        &self,
        delay: Duration,
        spec: TaskSpec,
    ) -> Result<String, TaskRunnerError> {
        let now_ms = now_epoch_ms();
        let record = TaskRecord {
            task_id: Uuid::new_v4().to_string(),
            queue: self.queue.clone(),
            job_type: spec.job_type,
            job_id: spec.job_id,
            args: spec.args,
            attempt: spec.attempt,
            max_attempts: self.retry.attempts.max(1),
            enqueued_at_ms: now_ms,
            ready_at_ms: now_ms + delay.as_millis() as i64,
        };
        let key = task_key(&self.queue, record.ready_at_ms, self.next_seq(), &record.task_id);
        self.store.put(&key, &encode_json(&record)?, None).await?;
        debug!(
            task_id = %record.task_id,
            job_id = %record.job_id,
            delay_ms = delay.as_millis() as u64,
            "task enqueued"
        );
        if let Some(m) = &self.metrics {
            m.record_enqueue(&self.queue);
        }
        self.notify.notify_one();
        Ok(record.task_id)
    }

    async fn pending(&self, queue: &str) -> Result<Vec<PendingTask>, TaskRunnerError> {
        let claimed: HashSet<String> = self
            .store
            .scan_prefix(CLAIM_PREFIX)
            .await?
            .into_iter()
            .filter_map(|(key, _)| key.strip_prefix(CLAIM_PREFIX).map(str::to_string))
            .collect();

        let mut out = Vec::new();
        for (key, raw) in self.store.scan_prefix(&task_queue_prefix(queue)).await? {
            let Some(parsed) = parse_task_key(&key) else {
                continue;
            };
            let Ok(record) = decode_json::<TaskRecord>(&raw) else {
                continue;
            };
            out.push(PendingTask {
                claimed: claimed.contains(&parsed.task_id),
                task_id: parsed.task_id,
                job_type: record.job_type,
                job_id: record.job_id,
                attempt: record.attempt,
                ready_at_ms: parsed.ready_at_ms,
            });
        }
        Ok(out)
    }
}
