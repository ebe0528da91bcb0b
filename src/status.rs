//! Read side of the polling contract.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::job::{JobId, StatusKind};
use crate::result_cache::ResultCache;
use crate::task_runner::{PendingTask, TaskRunner};

/// What a poller sees for a job id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PollResponse {
    Pending,
    Queued { position: usize },
    Processing,
    Complete { result_url: String },
    Failed { error: String },
}

impl PollResponse {
    pub fn kind(&self) -> StatusKind {
        match self {
            PollResponse::Pending => StatusKind::Pending,
            PollResponse::Queued { .. } => StatusKind::Queued,
            PollResponse::Processing => StatusKind::Processing,
            PollResponse::Complete { .. } => StatusKind::Complete,
            PollResponse::Failed { .. } => StatusKind::Failed,
        }
    }
}

/// 1-based position of `job_id` among the tasks waiting for a worker.
///
/// Tasks a worker already holds are not counted as ahead of anyone.
pub fn queue_position(pending: &[PendingTask], job_type: &str, job_id: &JobId) -> Option<usize> {
    let mut ahead = 0;
    for task in pending {
        if task.job_type == job_type && &task.job_id == job_id {
            return Some(ahead + 1);
        }
        if !task.claimed {
            ahead += 1;
        }
    }
    None
}

#[derive(Clone)]
pub struct StatusReporter {
    tasks: Arc<dyn TaskRunner>,
    queue: String,
    result_url_base: String,
}

impl StatusReporter {
    pub fn new(
        tasks: Arc<dyn TaskRunner>,
        queue: impl Into<String>,
        result_url_base: impl Into<String>,
    ) -> Self {
        Self {
            tasks,
            queue: queue.into(),
            result_url_base: result_url_base.into(),
        }
    }

    pub fn result_url(&self, cache: &ResultCache, id: &JobId) -> String {
        format!(
            "{}?kind={}&id={}",
            self.result_url_base,
            cache.namespace(),
            id
        )
    }

    /// Current state of `id`. Store failures degrade to `pending`.
    pub async fn report(&self, cache: &ResultCache, id: &JobId) -> PollResponse {
        if let Some(settled) = self.from_cache(cache, id).await {
            return settled;
        }

        let position = match self.tasks.pending(&self.queue).await {
            Ok(pending) => queue_position(&pending, cache.namespace(), id),
            Err(e) => {
                warn!(job_id = %id, error = %e, "pending list unavailable while reporting");
                return PollResponse::Pending;
            }
        };
        match position {
            Some(position) => PollResponse::Queued { position },
            // The job may have started and finished its task since the first look
            None => self
                .from_cache(cache, id)
                .await
                .unwrap_or(PollResponse::Pending),
        }
    }

    /// The answer given by the cached result and status alone, if they give one.
    async fn from_cache(&self, cache: &ResultCache, id: &JobId) -> Option<PollResponse> {
        match cache.exists_result(id).await {
            Ok(true) => {
                return Some(PollResponse::Complete {
                    result_url: self.result_url(cache, id),
                })
            }
            Ok(false) => {}
            Err(e) => {
                warn!(job_id = %id, error = %e, "result lookup failed while reporting");
                return Some(PollResponse::Pending);
            }
        }

        let record = match cache.get_status(id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(job_id = %id, error = %e, "status lookup failed while reporting");
                return Some(PollResponse::Pending);
            }
        };
        match record.status {
            StatusKind::Failed => Some(PollResponse::Failed {
                error: record.error.unwrap_or_else(|| "unknown error".to_string()),
            }),
            StatusKind::Complete => Some(PollResponse::Complete {
                result_url: self.result_url(cache, id),
            }),
            StatusKind::Processing => Some(PollResponse::Processing),
            StatusKind::Pending | StatusKind::Queued => None,
        }
    }
}
