//! Job identity, job kinds and the status record shared by the cache, the
//! runner and the status reporter.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Opaque correlation token for one generation request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The GPU job types that share the single admission lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Image,
    Video,
    Music,
    Speech,
    Model3d,
    Rembg,
    Vtracer,
    Stems,
}

impl JobKind {
    pub const ALL: [JobKind; 8] = [
        JobKind::Image,
        JobKind::Video,
        JobKind::Music,
        JobKind::Speech,
        JobKind::Model3d,
        JobKind::Rembg,
        JobKind::Vtracer,
        JobKind::Stems,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Image => "image",
            JobKind::Video => "video",
            JobKind::Music => "music",
            JobKind::Speech => "speech",
            JobKind::Model3d => "model3d",
            JobKind::Rembg => "rembg",
            JobKind::Vtracer => "vtracer",
            JobKind::Stems => "stems",
        }
    }

    /// Cache key prefix for this kind's result and status records.
    pub fn namespace(&self) -> &'static str {
        self.as_str()
    }

    /// Name used for health marking. Speech shares the TTS server's name.
    pub fn service_name(&self) -> &'static str {
        match self {
            JobKind::Speech => "tts",
            JobKind::Image => "images",
            other => other.as_str(),
        }
    }

    /// Lease for the admission lock; must outlast the slowest realistic run.
    pub fn default_lease(&self) -> Duration {
        let secs = match self {
            JobKind::Image | JobKind::Rembg | JobKind::Vtracer => 300,
            JobKind::Speech | JobKind::Music => 600,
            JobKind::Stems | JobKind::Model3d => 900,
            JobKind::Video => 1_800,
        };
        Duration::from_secs(secs)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job kind: {0}")]
pub struct UnknownJobKind(pub String);

impl FromStr for JobKind {
    type Err = UnknownJobKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownJobKind(s.to_string()))
    }
}

/// Lifecycle of a job as seen by pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Pending,
    Queued,
    Processing,
    Complete,
    Failed,
}

impl StatusKind {
    /// Position in the lifecycle. Terminal kinds share the highest rank.
    pub fn rank(&self) -> u8 {
        match self {
            StatusKind::Pending => 0,
            StatusKind::Queued => 1,
            StatusKind::Processing => 2,
            StatusKind::Complete | StatusKind::Failed => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StatusKind::Complete | StatusKind::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Pending => "pending",
            StatusKind::Queued => "queued",
            StatusKind::Processing => "processing",
            StatusKind::Complete => "complete",
            StatusKind::Failed => "failed",
        }
    }
}

/// Stored status of one job id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: StatusKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// Job-type specific fields such as `duration` or `last_error`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StatusRecord {
    pub fn new(status: StatusKind) -> Self {
        Self {
            status,
            started_at: None,
            completed_at: None,
            failed_at: None,
            error: None,
            attempt: None,
            extra: Map::new(),
        }
    }

    pub fn pending() -> Self {
        Self::new(StatusKind::Pending)
    }

    pub fn processing(attempt: u32) -> Self {
        Self {
            started_at: Some(Utc::now()),
            attempt: Some(attempt),
            ..Self::new(StatusKind::Processing)
        }
    }

    pub fn complete(extra: Map<String, Value>) -> Self {
        Self {
            completed_at: Some(Utc::now()),
            extra,
            ..Self::new(StatusKind::Complete)
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            failed_at: Some(Utc::now()),
            error: Some(error.into()),
            ..Self::new(StatusKind::Failed)
        }
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}
