// src/broadcast/mod.rs
//! Status change broadcaster: one topic per pipeline, every transition
//! published as the full updated record.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, trace};

use crate::pipeline::{Pipeline, PipelineId};

pub mod registry;

pub use registry::{SubscriptionHandle, SubscriptionId, SubscriptionRegistry};

/// Default per-topic buffer. A subscriber further behind than this lags.
pub const DEFAULT_TOPIC_BUFFER: usize = 256;

/// Topic name for a pipeline's status stream
pub fn topic_name(pipeline_id: &str) -> String {
    format!("pipeline:{}", pipeline_id)
}

/// One published transition
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEvent {
    pub topic: String,
    pub pipeline: Pipeline,
}

/// Topics are created lazily by subscribers. Publishing to a pipeline nobody
/// observes is a no-op. After a terminal publish the topic is dropped;
/// receivers drain what is buffered and then see the stream close.
pub struct StatusBroadcaster {
    topics: RwLock<HashMap<PipelineId, broadcast::Sender<PipelineEvent>>>,
    buffer: usize,
}

impl StatusBroadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Join a pipeline's topic. Only transitions published from now on are seen.
    pub async fn subscribe(&self, pipeline_id: &str) -> broadcast::Receiver<PipelineEvent> {
        let mut topics = self.topics.write().await;
        let sender = topics.entry(pipeline_id.to_string()).or_insert_with(|| {
            debug!(topic = %topic_name(pipeline_id), "📡 Opened status topic");
            broadcast::channel(self.buffer).0
        });
        sender.subscribe()
    }

    /// Publish a transition. Returns how many subscribers it reached.
    pub async fn publish(&self, pipeline: &Pipeline) -> usize {
        let event = PipelineEvent {
            topic: topic_name(&pipeline.id),
            pipeline: pipeline.clone(),
        };

        let delivered = if pipeline.is_terminal() {
            // Dropping the sender closes the topic once receivers drain it
            match self.topics.write().await.remove(&pipeline.id) {
                Some(sender) => sender.send(event).unwrap_or(0),
                None => 0,
            }
        } else {
            match self.topics.read().await.get(&pipeline.id) {
                Some(sender) => sender.send(event).unwrap_or(0),
                None => 0,
            }
        };

        trace!(
            pipeline_id = %pipeline.id,
            status = %pipeline.status,
            revision = pipeline.revision,
            delivered,
            "Published status change"
        );
        delivered
    }

    /// Drop a topic that has no receivers left
    pub async fn release(&self, pipeline_id: &str) {
        let mut topics = self.topics.write().await;
        if let Some(sender) = topics.get(pipeline_id) {
            if sender.receiver_count() == 0 {
                topics.remove(pipeline_id);
                debug!(topic = %topic_name(pipeline_id), "📡 Closed idle status topic");
            }
        }
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_BUFFER)
    }
}
