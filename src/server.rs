//! JSON HTTP surface: enqueue, polling, live updates, results, service health
//! and metrics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::broadcast::{channel_name, LocalBroadcastBus};
use crate::health::{HealthError, HealthRecord, HealthRegistry};
use crate::health_check::HealthChecker;
use crate::job::{JobId, JobKind, UnknownJobKind};
use crate::metrics::Metrics;
use crate::result_cache::ResultCache;
use crate::status::StatusReporter;
use crate::task_runner::{TaskRunner, TaskSpec};

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    /// One cache per enabled job kind.
    pub caches: Arc<HashMap<JobKind, ResultCache>>,
    pub tasks: Arc<dyn TaskRunner>,
    pub reporter: StatusReporter,
    pub health: HealthRegistry,
    pub checker: Arc<HealthChecker>,
    /// Job updates pushed to `/events` subscribers.
    pub bus: Arc<LocalBroadcastBus>,
    pub metrics: Metrics,
}

#[derive(Deserialize)]
pub struct KindParams {
    kind: String,
}

#[derive(Deserialize)]
pub struct JobParams {
    kind: String,
    id: String,
}

#[derive(Deserialize)]
pub struct ServiceParams {
    name: String,
}

#[derive(Deserialize)]
pub struct CheckParams {
    service: Option<String>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn unavailable(e: impl std::fmt::Display) -> Response {
    warn!(error = %e, "store unavailable while serving request");
    error_response(StatusCode::SERVICE_UNAVAILABLE, "store unavailable")
}

impl AppState {
    fn cache_for(&self, kind: &str) -> Result<(JobKind, &ResultCache), Response> {
        let parsed: JobKind = kind.parse().map_err(|e: UnknownJobKind| {
            error_response(StatusCode::BAD_REQUEST, e.to_string())
        })?;
        self.caches
            .get(&parsed)
            .map(|cache| (parsed, cache))
            .ok_or_else(|| {
                error_response(
                    StatusCode::BAD_REQUEST,
                    format!("job kind not enabled: {}", parsed),
                )
            })
    }
}

fn service_json(record: &HealthRecord) -> Value {
    json!({
        "service": record.service_name,
        "online": record.online,
        "last_checked_at": record.last_checked_at,
        "last_online_at": record.last_online_at,
        "error_message": record.error_message,
    })
}

async fn enqueue_handler(
    State(state): State<AppState>,
    Query(params): Query<KindParams>,
    body: Option<Json<Value>>,
) -> Response {
    let (kind, _) = match state.cache_for(&params.kind) {
        Ok(found) => found,
        Err(resp) => return resp,
    };
    let args = body.map(|Json(v)| v).unwrap_or_else(|| json!({}));
    let job_id = JobId::generate();
    match state
        .tasks
        .enqueue(TaskSpec::new(kind.as_str(), job_id.clone(), args))
        .await
    {
        Ok(task_id) => {
            info!(job_id = %job_id, kind = %kind, task_id = %task_id, "job enqueued");
            (
                StatusCode::ACCEPTED,
                Json(json!({ "job_id": job_id, "status": "queued" })),
            )
                .into_response()
        }
        Err(e) => unavailable(e),
    }
}

async fn status_handler(
    State(state): State<AppState>,
    Query(params): Query<JobParams>,
) -> Response {
    let (_, cache) = match state.cache_for(&params.kind) {
        Ok(found) => found,
        Err(resp) => return resp,
    };
    let response = state.reporter.report(cache, &JobId::from(params.id)).await;
    Json(response).into_response()
}

/// Server-sent events for one job, one `data:` line per published update.
async fn events_handler(
    State(state): State<AppState>,
    Query(params): Query<JobParams>,
) -> Response {
    let (kind, _) = match state.cache_for(&params.kind) {
        Ok(found) => found,
        Err(resp) => return resp,
    };
    let channel = channel_name(kind, &JobId::from(params.id));
    let updates = BroadcastStream::new(state.bus.subscribe(&channel)).filter_map(move |msg| {
        match msg {
            Ok(message) => Some(Event::default().json_data(message)),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(channel = %channel, skipped, "event subscriber lagged");
                None
            }
        }
    });
    Sse::new(updates)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn result_handler(
    State(state): State<AppState>,
    Query(params): Query<JobParams>,
) -> Response {
    let (_, cache) = match state.cache_for(&params.kind) {
        Ok(found) => found,
        Err(resp) => return resp,
    };
    match cache.get_result(&JobId::from(params.id)).await {
        Ok(Some(payload)) => Json(payload).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Result not found"),
        Err(e) => unavailable(e),
    }
}

async fn health_index_handler(State(state): State<AppState>) -> Response {
    match state.health.all_statuses().await {
        Ok(statuses) => Json(statuses).into_response(),
        Err(e) => unavailable(e),
    }
}

async fn health_service_handler(
    State(state): State<AppState>,
    Query(params): Query<ServiceParams>,
) -> Response {
    if !state.health.is_known(&params.name) {
        return error_response(StatusCode::NOT_FOUND, "Unknown service");
    }
    match state.health.for_service(&params.name).await {
        Ok(record) => Json(service_json(&record)).into_response(),
        Err(e) => unavailable(e),
    }
}

async fn health_check_handler(
    State(state): State<AppState>,
    Query(params): Query<CheckParams>,
) -> Response {
    let Some(service) = params.service.filter(|s| !s.is_empty()) else {
        let result: Result<_, HealthError> = async {
            state.checker.check_all().await?;
            state.health.all_statuses().await
        }
        .await;
        return match result {
            Ok(statuses) => Json(statuses).into_response(),
            Err(e) => unavailable(e),
        };
    };

    if !state.health.is_known(&service) || !state.checker.has_probe(&service) {
        return error_response(StatusCode::NOT_FOUND, "Unknown service");
    }
    match state.checker.check(&service).await {
        Ok(_) => match state.health.for_service(&service).await {
            Ok(record) => Json(service_json(&record)).into_response(),
            Err(e) => unavailable(e),
        },
        Err(e) => unavailable(e),
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
                .into_response()
        }
    }
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/jobs", post(enqueue_handler))
        .route("/status", get(status_handler))
        .route("/events", get(events_handler))
        .route("/result", get(result_handler))
        .route("/health", get(health_index_handler))
        .route("/health/service", get(health_service_handler))
        .route("/health/check", post(health_check_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(not_found_handler)
        .with_state(state)
}

/// Serve the API and sweep expired cache records until shutdown.
pub async fn run_http_with_reaper(
    listener: TcpListener,
    state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (tick_tx, mut tick_rx) = broadcast::channel::<()>(1);
    let caches = state.caches.clone();
    let reaper: JoinHandle<()> = tokio::spawn(async move {
        let mut interval = tokio::time::interval(CACHE_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for cache in caches.values() {
                        if let Err(e) = cache.cleanup_expired().await {
                            debug!(namespace = cache.namespace(), error = %e, "cache sweep failed");
                        }
                    }
                }
                _ = tick_rx.recv() => {
                    break;
                }
            }
        }
    });

    let addr = listener.local_addr()?;
    info!(addr = %addr, "http server listening");
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            info!("graceful shutdown signal received");
            let _ = tick_tx.send(());
        })
        .await?;

    reaper.await.ok();
    Ok(())
}
