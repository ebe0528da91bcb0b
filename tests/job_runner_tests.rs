
use std::sync::Arc;
use std::time::Duration;

use gpugate::admission::AdmissionLock;
use gpugate::broadcast::{channel_name, NullBroadcastBus};
use gpugate::compute::ComputeBackend;
use gpugate::health::HealthRegistry;
use gpugate::job::{JobId, JobKind, StatusKind, StatusRecord};
use gpugate::job_runner::{AttemptOutcome, GenerationJob, JobError, JobRunner};
use gpugate::kv::KvStore;
use gpugate::result_cache::ResultCache;
use gpugate::retry::RetryPolicy;
use gpugate::settings::{CacheConfig, RunnerConfig};
use gpugate::task_broker::LocalTaskRunner;
use gpugate::task_runner::{TaskContext, TaskFailure, TaskHandler, TaskRunner, TaskSpec};
use serde_json::json;
use test_helpers::*;

async fn store() -> Arc<dyn KvStore> {
    open_memory_store().await
}

fn args() -> serde_json::Value {
    json!({"params": {"prompt": "a red fox"}})
}

fn ctx(job_id: &str, attempt: u32, max_attempts: u32) -> TaskContext {
    TaskContext {
        task_id: format!("task-{}", job_id),
        job_type: "image".to_string(),
        job_id: JobId::from(job_id),
        args: args(),
        attempt,
        max_attempts,
    }
}

#[gpugate::test]
async fn successful_attempt_stores_result_then_completes() {
    let backend = ScriptedBackend::new(vec![Ok(json!({"url": "/files/abc.png"}))]);
    let rig = Rig::new(store().await, JobKind::Image, backend.clone());
    let id = JobId::from("abc");
    let mut events = rig.bus.subscribe(&channel_name(JobKind::Image, &id));

    let outcome = rig.runner.run_attempt(&id, &args(), 1, 3).await.unwrap();
    assert_eq!(outcome, AttemptOutcome::Completed);
    assert_eq!(backend.calls(), 1);

    let result = rig.cache.get_result(&id).await.unwrap().unwrap();
    assert_eq!(result["url"], "/files/abc.png");
    assert!(result.get("created_at").is_some());

    let status = rig.cache.get_status(&id).await.unwrap();
    assert_eq!(status.status, StatusKind::Complete);
    assert_eq!(status.attempt, Some(1));
    assert!(status.extra.contains_key("duration"));

    assert_eq!(rig.lock.holder().await.unwrap(), None);
    assert!(rig.health.for_service("images").await.unwrap().online);

    assert_eq!(events.recv().await.unwrap()["status"], "processing");
    assert_eq!(events.recv().await.unwrap()["status"], "complete");
}

#[gpugate::test]
async fn busy_lock_reschedules_with_same_attempt() {
    let backend = ScriptedBackend::new(vec![]);
    let rig = Rig::new(store().await, JobKind::Image, backend.clone());
    assert!(rig
        .lock
        .try_acquire("someone-else", Duration::from_secs(30))
        .await
        .unwrap());

    let id = JobId::from("def");
    let outcome = rig.runner.run_attempt(&id, &args(), 2, 3).await.unwrap();
    assert_eq!(outcome, AttemptOutcome::Rescheduled);
    assert_eq!(backend.calls(), 0);

    let enqueued = rig.tasks.enqueued();
    assert_eq!(enqueued.len(), 1);
    let (delay, spec) = &enqueued[0];
    assert_eq!(*delay, Duration::from_secs(5));
    assert_eq!(spec.job_type, "image");
    assert_eq!(spec.job_id, id);
    assert_eq!(spec.attempt, 2);
    assert_eq!(spec.args, args());

    // Contention writes nothing for the job and leaves the holder alone
    assert_eq!(rig.cache.get_status(&id).await.unwrap().status, StatusKind::Pending);
    assert_eq!(rig.lock.holder().await.unwrap().as_deref(), Some("someone-else"));
}

#[gpugate::test]
async fn contention_delay_is_configurable() {
    let backend = ScriptedBackend::new(vec![]);
    let mut rig = Rig::new(store().await, JobKind::Video, backend);
    rig.runner = rig.runner.with_contention_delay(Duration::from_millis(250));
    rig.lock
        .try_acquire("holder", Duration::from_secs(30))
        .await
        .unwrap();

    rig.runner
        .run_attempt(&JobId::from("v1"), &args(), 1, 3)
        .await
        .unwrap();
    assert_eq!(rig.tasks.enqueued()[0].0, Duration::from_millis(250));
}

#[gpugate::test]
async fn existing_result_replays_without_compute() {
    let backend = ScriptedBackend::new(vec![]);
    let rig = Rig::new(store().await, JobKind::Image, backend.clone());
    let id = JobId::from("done");
    rig.cache
        .put_result(&id, &json!({"url": "/files/done.png"}), Duration::from_secs(60))
        .await
        .unwrap();

    let outcome = rig.runner.run_attempt(&id, &args(), 1, 3).await.unwrap();
    assert_eq!(outcome, AttemptOutcome::Replayed);
    assert_eq!(backend.calls(), 0);
    assert_eq!(rig.cache.get_status(&id).await.unwrap().status, StatusKind::Complete);
    assert_eq!(rig.lock.holder().await.unwrap(), None);
}

#[gpugate::test]
async fn early_failure_keeps_processing_with_last_error() {
    let backend = ScriptedBackend::always_failing("CUDA out of memory", 1);
    let rig = Rig::new(store().await, JobKind::Image, backend);
    let id = JobId::from("oom");

    let err = rig.runner.run_attempt(&id, &args(), 1, 3).await.unwrap_err();
    assert!(err.is_retryable());

    let status = rig.cache.get_status(&id).await.unwrap();
    assert_eq!(status.status, StatusKind::Processing);
    assert_eq!(status.attempt, Some(1));
    assert_eq!(
        status.extra.get("last_error").and_then(|v| v.as_str()),
        Some("compute failed: CUDA out of memory")
    );
    assert!(!rig.cache.exists_result(&id).await.unwrap());
    assert_eq!(rig.lock.holder().await.unwrap(), None);
}

#[gpugate::test]
async fn last_attempt_failure_is_terminal() {
    let backend = ScriptedBackend::always_failing("CUDA out of memory", 1);
    let rig = Rig::new(store().await, JobKind::Image, backend);
    let id = JobId::from("oom");
    let mut events = rig.bus.subscribe(&channel_name(JobKind::Image, &id));

    rig.runner.run_attempt(&id, &args(), 3, 3).await.unwrap_err();

    let status = rig.cache.get_status(&id).await.unwrap();
    assert_eq!(status.status, StatusKind::Failed);
    assert_eq!(status.attempt, Some(3));
    assert_eq!(status.error.as_deref(), Some("compute failed: CUDA out of memory"));

    assert_eq!(events.recv().await.unwrap()["status"], "processing");
    let failed = events.recv().await.unwrap();
    assert_eq!(failed["status"], "failed");
    assert_eq!(failed["error"], "compute failed: CUDA out of memory");
}

#[gpugate::test]
async fn invalid_arguments_fail_immediately() {
    let backend = ScriptedBackend::new(vec![]);
    let rig = Rig::new(store().await, JobKind::Image, backend.clone());
    let id = JobId::from("bad-args");
    let bad = json!({"file": {"base64": "%%% not base64 %%%", "original_filename": "in.png"}});

    let err = rig.runner.run_attempt(&id, &bad, 1, 3).await.unwrap_err();
    assert!(matches!(err, JobError::InvalidArgs(_)));
    assert!(!err.is_retryable());
    assert_eq!(backend.calls(), 0);

    let status = rig.cache.get_status(&id).await.unwrap();
    assert_eq!(status.status, StatusKind::Failed);
    assert_eq!(status.attempt, Some(1));
    assert!(!TaskFailure::from(err).retryable);
}

#[gpugate::test]
async fn exhausted_retryable_failure_marks_service_offline() {
    let rig = Rig::new(store().await, JobKind::Speech, ScriptedBackend::new(vec![]));
    rig.health.mark_online("tts").await.unwrap();

    rig.runner
        .on_exhausted(&ctx("s1", 3, 3), &TaskFailure::retryable("backend timed out"))
        .await;

    let record = rig.health.for_service("tts").await.unwrap();
    assert!(!record.online);
    assert_eq!(record.error_message.as_deref(), Some("backend timed out"));
    assert!(record.last_online_at.is_some());
}

#[gpugate::test]
async fn exhausted_fatal_failure_leaves_health_alone() {
    let rig = Rig::new(store().await, JobKind::Speech, ScriptedBackend::new(vec![]));
    rig.health.mark_online("tts").await.unwrap();

    rig.runner
        .on_exhausted(&ctx("s2", 1, 3), &TaskFailure::fatal("invalid job arguments"))
        .await;

    assert!(rig.health.for_service("tts").await.unwrap().online);
}

#[gpugate::test]
async fn handler_perform_maps_errors_to_task_failures() {
    let backend = ScriptedBackend::always_failing("boom", 1);
    let rig = Rig::new(store().await, JobKind::Image, backend);

    let failure = rig.runner.perform(&ctx("h1", 1, 3)).await.unwrap_err();
    assert!(failure.retryable);
    assert_eq!(failure.message, "compute failed: boom");

    rig.runner.perform(&ctx("h1", 2, 3)).await.unwrap();
    assert_eq!(
        rig.cache.get_status(&JobId::from("h1")).await.unwrap().status,
        StatusKind::Complete
    );
}

#[gpugate::test]
async fn two_jobs_sharing_the_lock_never_overlap() {
    let store = store().await;
    let gated = GatedBackend::new();
    let first = Arc::new(Rig::new(store.clone(), JobKind::Image, gated.clone()));
    let second = Rig::new(store.clone(), JobKind::Video, ScriptedBackend::new(vec![]));

    let running = {
        let first = first.clone();
        tokio::spawn(async move {
            first
                .runner
                .run_attempt(&JobId::from("abc"), &args(), 1, 3)
                .await
        })
    };
    let started = gated.clone();
    with_timeout!(5_000, {
        started.started.notified().await;
    });

    // While the first job computes, the second only reschedules, every time
    for _ in 0..2 {
        let outcome = second
            .runner
            .run_attempt(&JobId::from("def"), &args(), 1, 3)
            .await
            .unwrap();
        assert_eq!(outcome, AttemptOutcome::Rescheduled);
    }
    let rescheduled = second.tasks.enqueued();
    assert_eq!(rescheduled.len(), 2);
    assert!(rescheduled.iter().all(|(_, spec)| spec.attempt == 1));

    gated.open(1);
    let outcome = with_timeout!(5_000, { running.await.unwrap().unwrap() });
    assert_eq!(outcome, AttemptOutcome::Completed);

    let outcome = second
        .runner
        .run_attempt(&JobId::from("def"), &args(), 1, 3)
        .await
        .unwrap();
    assert_eq!(outcome, AttemptOutcome::Completed);
    assert_eq!(second.tasks.enqueued().len(), 2);
}

#[gpugate::test]
async fn settled_job_is_not_run_again() {
    let backend = ScriptedBackend::new(vec![]);
    let rig = Rig::new(store().await, JobKind::Image, backend.clone());
    let id = JobId::from("gone");
    rig.cache
        .put_status(&id, &StatusRecord::failed("compute failed: oom"), Duration::from_secs(60))
        .await
        .unwrap();

    let outcome = rig.runner.run_attempt(&id, &args(), 1, 3).await.unwrap();
    assert_eq!(outcome, AttemptOutcome::Replayed);
    assert_eq!(backend.calls(), 0);
    let status = rig.cache.get_status(&id).await.unwrap();
    assert_eq!(status.status, StatusKind::Failed);
    assert_eq!(status.error.as_deref(), Some("compute failed: oom"));
    assert_eq!(rig.lock.holder().await.unwrap(), None);
}

/// A job runner driven by a real task runner, over a store that records
/// every health write.
struct Pipeline {
    tasks: Arc<LocalTaskRunner>,
    cache: ResultCache,
    health: HealthRegistry,
    store: Arc<FlakyStore>,
}

async fn pipeline(backend: Arc<dyn ComputeBackend>, workers: usize, claim_lease_ms: u64) -> Pipeline {
    let inner: Arc<dyn KvStore> = open_memory_store().await;
    let store = FlakyStore::watching(inner, "health/");
    let kv: Arc<dyn KvStore> = store.clone();
    let tasks = LocalTaskRunner::new(
        kv.clone(),
        &RunnerConfig {
            queue: "gpu".to_string(),
            workers,
            claim_lease_ms,
        },
        RetryPolicy {
            attempts: 3,
            initial_interval_ms: 20,
            max_interval_ms: None,
            backoff_factor: 2.0,
        },
        None,
    );
    let cache = ResultCache::new(kv.clone(), JobKind::Image.namespace(), &CacheConfig::default());
    let health = HealthRegistry::new(kv.clone(), vec!["images".to_string()]);
    let runner = JobRunner::new(
        Arc::new(GenerationJob::new(JobKind::Image, backend)),
        AdmissionLock::new(kv.clone(), "gpu_lock"),
        cache.clone(),
        health.clone(),
        tasks.clone(),
        Arc::new(NullBroadcastBus),
    )
    .with_contention_delay(Duration::from_millis(20));
    tasks.register("image", Arc::new(runner));
    Pipeline {
        tasks,
        cache,
        health,
        store,
    }
}

async fn run_to_drain(p: &Pipeline, job_id: &JobId) {
    p.tasks
        .enqueue(TaskSpec::new("image", job_id.clone(), args()))
        .await
        .unwrap();
    p.tasks.start();
    let tasks = p.tasks.clone();
    with_timeout!(10_000, {
        while !tasks.pending("gpu").await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });
    p.tasks.stop().await;
}

#[gpugate::test]
async fn exhausting_retries_marks_offline_exactly_once() {
    let backend = ScriptedBackend::always_failing("CUDA out of memory", 3);
    let p = pipeline(backend.clone(), 2, 60_000).await;
    let id = JobId::from("doomed");

    run_to_drain(&p, &id).await;

    assert_eq!(backend.calls(), 3);
    assert_eq!(offline_marks(&p.store), 1);
    let status = p.cache.get_status(&id).await.unwrap();
    assert_eq!(status.status, StatusKind::Failed);
    assert_eq!(status.attempt, Some(3));
    let record = p.health.for_service("images").await.unwrap();
    assert!(!record.online);
    assert_eq!(
        record.error_message.as_deref(),
        Some("compute failed: CUDA out of memory")
    );
}

#[gpugate::test]
async fn transient_failures_never_mark_offline() {
    let backend = ScriptedBackend::new(vec![
        Err("CUDA out of memory".to_string()),
        Err("CUDA out of memory".to_string()),
        Ok(json!({"url": "/files/ok.png"})),
    ]);
    let p = pipeline(backend.clone(), 1, 60_000).await;
    p.health.mark_online("images").await.unwrap();
    let id = JobId::from("recovers");

    run_to_drain(&p, &id).await;

    assert_eq!(backend.calls(), 3);
    assert_eq!(offline_marks(&p.store), 0);
    assert_eq!(p.cache.get_status(&id).await.unwrap().status, StatusKind::Complete);
    assert!(p.health.for_service("images").await.unwrap().online);
}

#[gpugate::test]
async fn slow_attempts_outliving_the_claim_lease_run_once_each() {
    let backend = ScriptedBackend::with_delay(
        (0..3).map(|_| Err("CUDA out of memory".to_string())).collect(),
        Duration::from_millis(400),
    );
    let p = pipeline(backend.clone(), 2, 100).await;
    let id = JobId::from("slow");

    run_to_drain(&p, &id).await;

    assert_eq!(backend.calls(), 3);
    assert_eq!(backend.max_in_flight(), 1);
    assert_eq!(offline_marks(&p.store), 1);
    let status = p.cache.get_status(&id).await.unwrap();
    assert_eq!(status.status, StatusKind::Failed);
    assert_eq!(status.attempt, Some(3));
}
