//! Compute backend boundary and the HTTP implementation.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::job::{JobId, JobKind};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("backend timed out")]
    Timeout,
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
    #[error("{0}")]
    Failed(String),
}

/// An uploaded input file handed to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComputeRequest {
    pub kind: JobKind,
    pub job_id: JobId,
    pub params: Value,
    pub inputs: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ComputeOutput {
    /// Stored as the job's result.
    pub payload: Value,
    /// Copied into the `complete` status record.
    pub extras: Map<String, Value>,
}

impl ComputeOutput {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            extras: Map::new(),
        }
    }
}

#[async_trait]
pub trait ComputeBackend: Send + Sync {
    async fn compute(&self, request: ComputeRequest) -> Result<ComputeOutput, ComputeError>;
}

#[derive(Serialize)]
struct WireInput<'a> {
    filename: &'a str,
    base64: String,
}

/// Posts the request as JSON and takes the JSON response body as the payload.
pub struct HttpComputeBackend {
    client: reqwest::Client,
    url: String,
}

impl HttpComputeBackend {
    pub fn new(url: impl Into<String>, timeout: Option<Duration>) -> Result<Self, ComputeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()
            .map_err(|e| ComputeError::Unreachable(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ComputeBackend for HttpComputeBackend {
    async fn compute(&self, request: ComputeRequest) -> Result<ComputeOutput, ComputeError> {
        let inputs: Vec<WireInput<'_>> = request
            .inputs
            .iter()
            .map(|a| WireInput {
                filename: &a.filename,
                base64: BASE64.encode(&a.bytes),
            })
            .collect();
        let body = json!({
            "kind": request.kind,
            "job_id": request.job_id,
            "params": request.params,
            "inputs": inputs,
        });

        debug!(url = %self.url, job_id = %request.job_id, "calling compute backend");
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ComputeError::Timeout
                } else {
                    ComputeError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ComputeError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ComputeError::InvalidResponse(e.to_string()))?;
        Ok(ComputeOutput::new(payload))
    }
}
