//! Background task runner boundary: enqueueing, delayed enqueueing, the
//! pending list pollers inspect, and the handler contract the runner drives.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::codec::CodecError;
use crate::job::JobId;
use crate::kv::StoreError;

#[derive(Debug, Error)]
pub enum TaskRunnerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// What to run: the handler registered under `job_type`, with `args`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub job_type: String,
    pub job_id: JobId,
    pub args: Value,
    /// 1-based attempt this task runs as. Rescheduling after lock contention
    /// carries the current attempt over unchanged.
    pub attempt: u32,
}

impl TaskSpec {
    pub fn new(job_type: impl Into<String>, job_id: JobId, args: Value) -> Self {
        Self {
            job_type: job_type.into(),
            job_id,
            args,
            attempt: 1,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt.max(1);
        self
    }
}

/// Durable form of a queued task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub queue: String,
    pub job_type: String,
    pub job_id: JobId,
    pub args: Value,
    pub attempt: u32,
    pub max_attempts: u32,
    pub enqueued_at_ms: i64,
    pub ready_at_ms: i64,
}

/// A not-yet-finished task as listed by [`TaskRunner::pending`].
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTask {
    pub task_id: String,
    pub job_type: String,
    pub job_id: JobId,
    pub attempt: u32,
    pub ready_at_ms: i64,
    /// A worker is currently running it.
    pub claimed: bool,
}

/// Everything a handler sees about the attempt it is running.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub job_type: String,
    pub job_id: JobId,
    pub args: Value,
    pub attempt: u32,
    pub max_attempts: u32,
}

impl TaskContext {
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

impl From<&TaskRecord> for TaskContext {
    fn from(record: &TaskRecord) -> Self {
        Self {
            task_id: record.task_id.clone(),
            job_type: record.job_type.clone(),
            job_id: record.job_id.clone(),
            args: record.args.clone(),
            attempt: record.attempt,
            max_attempts: record.max_attempts,
        }
    }
}

/// Why a handler attempt failed and whether the runner may try again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub message: String,
    pub retryable: bool,
}

impl TaskFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn perform(&self, ctx: &TaskContext) -> Result<(), TaskFailure>;

    /// Called once when the runner gives up on a task: after its last
    /// permitted attempt failed, or after a non-retryable failure.
    async fn on_exhausted(&self, _ctx: &TaskContext, _failure: &TaskFailure) {}
}

#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Queue a task to run as soon as a worker is free. Returns the task id.
    async fn enqueue(&self, spec: TaskSpec) -> Result<String, TaskRunnerError>;

    async fn enqueue_after(
        &self,
        delay: Duration,
        spec: TaskSpec,
    ) -> Result<String, TaskRunnerError>;

    /// Not-yet-finished tasks of `queue`, in the order they will be run.
    async fn pending(&self, queue: &str) -> Result<Vec<PendingTask>, TaskRunnerError>;
}
