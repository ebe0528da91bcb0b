
use std::sync::Arc;
use std::time::Duration;

use gpugate::job::{JobId, JobKind, StatusKind, StatusRecord};
use gpugate::kv::KvStore;
use gpugate::result_cache::ResultCache;
use gpugate::retry::RetryPolicy;
use gpugate::settings::{CacheConfig, RunnerConfig};
use gpugate::status::{PollResponse, StatusReporter};
use gpugate::task_broker::LocalTaskRunner;
use gpugate::task_runner::{TaskRunner, TaskSpec};
use serde_json::json;
use test_helpers::*;

fn image_cache(store: Arc<dyn KvStore>) -> ResultCache {
    ResultCache::new(store, "image", &CacheConfig::default())
}

#[gpugate::test]
async fn unknown_job_reports_pending() {
    let store: Arc<dyn KvStore> = open_memory_store().await;
    let reporter = StatusReporter::new(RecordingTaskRunner::new(), "gpu", "/result");
    let report = reporter
        .report(&image_cache(store), &JobId::from("ghost"))
        .await;
    assert_eq!(report, PollResponse::Pending);
}

#[gpugate::test]
async fn queued_jobs_report_their_position() {
    let store: Arc<dyn KvStore> = open_memory_store().await;
    let tasks = LocalTaskRunner::new(
        store.clone(),
        &RunnerConfig::default(),
        RetryPolicy::default(),
        None,
    );
    for id in ["first", "second"] {
        tasks
            .enqueue(TaskSpec::new("image", JobId::from(id), json!({})))
            .await
            .unwrap();
    }
    tasks
        .enqueue(TaskSpec::new("video", JobId::from("other"), json!({})))
        .await
        .unwrap();
    tasks
        .enqueue(TaskSpec::new("image", JobId::from("third"), json!({})))
        .await
        .unwrap();

    let reporter = StatusReporter::new(tasks.clone(), RunnerConfig::default().queue, "/result");
    let cache = image_cache(store);
    assert_eq!(
        reporter.report(&cache, &JobId::from("first")).await,
        PollResponse::Queued { position: 1 }
    );
    assert_eq!(
        reporter.report(&cache, &JobId::from("second")).await,
        PollResponse::Queued { position: 2 }
    );
    // Jobs of other kinds still wait for the same GPU
    assert_eq!(
        reporter.report(&cache, &JobId::from("third")).await,
        PollResponse::Queued { position: 4 }
    );
}

#[gpugate::test]
async fn claimed_tasks_are_not_counted_ahead() {
    let store: Arc<dyn KvStore> = open_memory_store().await;
    let tasks = RecordingTaskRunner::new();
    tasks.set_pending(vec![
        pending_task("image", "running", true),
        pending_task("image", "next", false),
    ]);
    let reporter = StatusReporter::new(tasks, "gpu", "/result");
    assert_eq!(
        reporter.report(&image_cache(store), &JobId::from("next")).await,
        PollResponse::Queued { position: 1 }
    );
}

#[gpugate::test]
async fn cached_status_wins_over_queue() {
    let store: Arc<dyn KvStore> = open_memory_store().await;
    let cache = image_cache(store);
    let tasks = RecordingTaskRunner::new();
    tasks.set_pending(vec![pending_task("image", "retrying", false)]);
    let reporter = StatusReporter::new(tasks, "gpu", "/result");
    let ttl = Duration::from_secs(60);

    let id = JobId::from("retrying");
    cache
        .put_status(&id, &StatusRecord::processing(1).with_extra("last_error", "oom"), ttl)
        .await
        .unwrap();
    assert_eq!(reporter.report(&cache, &id).await, PollResponse::Processing);

    let failed = JobId::from("failed");
    cache
        .put_status(&failed, &StatusRecord::failed("compute failed: oom"), ttl)
        .await
        .unwrap();
    assert_eq!(
        reporter.report(&cache, &failed).await,
        PollResponse::Failed {
            error: "compute failed: oom".to_string()
        }
    );

    let done = JobId::from("done");
    cache.put_result(&done, &json!({"url": "x"}), ttl).await.unwrap();
    assert_eq!(
        reporter.report(&cache, &done).await,
        PollResponse::Complete {
            result_url: "/result?kind=image&id=done".to_string()
        }
    );
}

#[gpugate::test]
async fn store_outage_degrades_to_pending() {
    let inner: Arc<dyn KvStore> = open_memory_store().await;
    let flaky = FlakyStore::new(inner);
    let cache = image_cache(flaky.clone());
    let reporter = StatusReporter::new(RecordingTaskRunner::new(), "gpu", "/result");
    flaky.set_failing(true);

    assert_eq!(
        reporter.report(&cache, &JobId::from("any")).await,
        PollResponse::Pending
    );
}

#[gpugate::test(flavor = "multi_thread", worker_threads = 2)]
async fn reported_status_never_moves_backwards() {
    let store: Arc<dyn KvStore> = open_memory_store().await;
    let tasks = LocalTaskRunner::new(
        store.clone(),
        &RunnerConfig {
            queue: "gpu".to_string(),
            workers: 1,
            claim_lease_ms: 60_000,
        },
        RetryPolicy {
            attempts: 3,
            initial_interval_ms: 10,
            max_interval_ms: None,
            backoff_factor: 1.0,
        },
        None,
    );
    let backend = ScriptedBackend::with_delay(
        vec![Err("warming up".to_string()), Ok(json!({"url": "/files/m.png"}))],
        Duration::from_millis(20),
    );
    let rig = Rig::new(store.clone(), JobKind::Image, backend);
    let cache = rig.cache.clone();
    tasks.register("image", Arc::new(rig.runner));
    let reporter = StatusReporter::new(tasks.clone(), "gpu", "/result");

    let id = JobId::from("mono");
    tasks
        .enqueue(TaskSpec::new("image", id.clone(), json!({"params": {}})))
        .await
        .unwrap();
    tasks.start();

    let seen = with_timeout!(10_000, {
        let mut seen = Vec::new();
        loop {
            let report = reporter.report(&cache, &id).await;
            let kind = report.kind();
            seen.push(kind);
            if kind.is_terminal() {
                break seen;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });
    tasks.stop().await;

    assert_eq!(seen.last(), Some(&StatusKind::Complete));
    for pair in seen.windows(2) {
        assert!(
            pair[0].rank() <= pair[1].rank(),
            "status moved backwards: {:?}",
            seen
        );
    }
}
