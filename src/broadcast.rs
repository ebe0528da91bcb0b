//! Fire-and-forget push of job status changes to live subscribers.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use crate::job::{JobId, JobKind};

const CHANNEL_CAPACITY: usize = 16;

/// Channel a job's updates are published on, e.g. `stems_<id>`.
pub fn channel_name(kind: JobKind, job_id: &JobId) -> String {
    format!("{}_{}", kind.as_str(), job_id)
}

/// At-most-once delivery: messages published while nobody listens are dropped.
#[async_trait]
pub trait BroadcastBus: Send + Sync {
    async fn publish(&self, channel: &str, message: Value);
}

/// In-process bus over tokio broadcast channels.
#[derive(Default)]
pub struct LocalBroadcastBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Value>>>,
}

impl LocalBroadcastBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Value> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

#[async_trait]
impl BroadcastBus for LocalBroadcastBus {
    async fn publish(&self, channel: &str, message: Value) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = channels.get(channel) else {
            trace!(channel, "no subscribers, dropping message");
            return;
        };
        if sender.send(message).is_err() {
            // Every receiver is gone
            channels.remove(channel);
        }
    }
}

/// Bus that drops everything.
pub struct NullBroadcastBus;

#[async_trait]
impl BroadcastBus for NullBroadcastBus {
    async fn publish(&self, _channel: &str, _message: Value) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_published_messages() {
        let bus = LocalBroadcastBus::new();
        let id = JobId::from("abc");
        let channel = channel_name(JobKind::Stems, &id);
        assert_eq!(channel, "stems_abc");

        let mut rx = bus.subscribe(&channel);
        bus.publish(&channel, json!({"status": "processing"})).await;
        assert_eq!(rx.recv().await.unwrap()["status"], "processing");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus = LocalBroadcastBus::new();
        bus.publish("image_x", json!({"status": "complete"})).await;
        let mut rx = bus.subscribe("image_x");
        assert!(rx.try_recv().is_err());
    }
}
