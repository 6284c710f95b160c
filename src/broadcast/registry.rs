// src/broadcast/registry.rs
//! Subscription registry - explicit handles per pipeline topic instead of a
//! shared set of channel names. A handle reconciles a point-read snapshot
//! with the live stream using the record revision.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{topic_name, PipelineEvent, StatusBroadcaster};
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::store::PipelineStore;
use crate::pipeline::{Pipeline, PipelineId};

pub type SubscriptionId = String;

/// Client-held subscription to one pipeline's topic
pub struct SubscriptionHandle {
    id: SubscriptionId,
    pipeline_id: PipelineId,
    topic: String,
    receiver: broadcast::Receiver<PipelineEvent>,
    snapshot: Pipeline,
    last_revision: u64,
    finished: bool,
    idle_timeout: Duration,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Record as read right after joining the topic
    pub fn snapshot(&self) -> &Pipeline {
        &self.snapshot
    }

    /// True once a terminal record has been observed
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next record newer than anything this handle has seen.
    /// `Ok(None)` once the pipeline is terminal.
    pub async fn next(&mut self) -> PipelineResult<Option<Pipeline>> {
        if self.finished {
            return Ok(None);
        }

        loop {
            let event = match timeout(self.idle_timeout, self.receiver.recv()).await {
                Err(_) => {
                    return Err(PipelineError::SubscriptionTimeout {
                        topic: self.topic.clone(),
                        seconds: self.idle_timeout.as_secs(),
                    })
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    return Err(PipelineError::SubscriptionError {
                        topic: self.topic.clone(),
                        reason: format!("subscriber lagged, {} transitions skipped", skipped),
                    })
                }
                Ok(Err(RecvError::Closed)) => {
                    return Err(PipelineError::SubscriptionError {
                        topic: self.topic.clone(),
                        reason: "topic closed before a terminal status was seen".to_string(),
                    })
                }
                Ok(Ok(event)) => event,
            };

            // At-least-once: drop anything already covered by the snapshot
            if event.pipeline.revision <= self.last_revision {
                continue;
            }
            self.observe(&event.pipeline);
            return Ok(Some(event.pipeline));
        }
    }

    /// Layer a fresh point-read on top of the stream (fallback after a timeout)
    pub fn reconcile(&mut self, current: &Pipeline) -> bool {
        if current.revision <= self.last_revision {
            return false;
        }
        self.observe(current);
        true
    }

    fn observe(&mut self, pipeline: &Pipeline) {
        self.last_revision = pipeline.revision;
        if pipeline.is_terminal() {
            self.finished = true;
        }
    }
}

pub struct SubscriptionRegistry {
    broadcaster: Arc<StatusBroadcaster>,
    store: Arc<dyn PipelineStore>,
    handles: RwLock<HashMap<PipelineId, HashSet<SubscriptionId>>>,
    idle_timeout: Duration,
}

impl SubscriptionRegistry {
    pub fn new(
        broadcaster: Arc<StatusBroadcaster>,
        store: Arc<dyn PipelineStore>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            broadcaster,
            store,
            handles: RwLock::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Join the topic first, then point-read, so no transition can slip
    /// between the two.
    pub async fn open(&self, pipeline_id: &str) -> PipelineResult<SubscriptionHandle> {
        let receiver = self.broadcaster.subscribe(pipeline_id).await;

        let snapshot = match self.store.get(pipeline_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                drop(receiver);
                self.broadcaster.release(pipeline_id).await;
                return Err(PipelineError::NotFound(pipeline_id.to_string()));
            }
            Err(e) => {
                drop(receiver);
                self.broadcaster.release(pipeline_id).await;
                return Err(e);
            }
        };

        let handle = SubscriptionHandle {
            id: Uuid::new_v4().to_string(),
            pipeline_id: pipeline_id.to_string(),
            topic: topic_name(pipeline_id),
            receiver,
            last_revision: snapshot.revision,
            finished: snapshot.is_terminal(),
            snapshot,
            idle_timeout: self.idle_timeout,
        };

        self.handles
            .write()
            .await
            .entry(handle.pipeline_id.clone())
            .or_default()
            .insert(handle.id.clone());

        info!(
            subscription_id = %handle.id,
            topic = %handle.topic,
            revision = handle.last_revision,
            "📡 Opened subscription"
        );
        Ok(handle)
    }

    /// Tear down a handle. Never affects the pipeline itself.
    pub async fn close(&self, handle: SubscriptionHandle) {
        let SubscriptionHandle {
            id,
            pipeline_id,
            receiver,
            ..
        } = handle;

        {
            let mut handles = self.handles.write().await;
            let removed = match handles.get_mut(&pipeline_id) {
                Some(ids) => {
                    let removed = ids.remove(&id);
                    if ids.is_empty() {
                        handles.remove(&pipeline_id);
                    }
                    removed
                }
                None => false,
            };
            if !removed {
                warn!(subscription_id = %id, "Closing a subscription the registry does not know");
            }
        }

        drop(receiver);
        self.broadcaster.release(&pipeline_id).await;
        debug!(subscription_id = %id, pipeline_id = %pipeline_id, "📡 Closed subscription");
    }

    pub async fn active_count(&self, pipeline_id: &str) -> usize {
        self.handles
            .read()
            .await
            .get(pipeline_id)
            .map_or(0, HashSet::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::store::InMemoryPipelineStore;
    use crate::pipeline::testing::pipeline_with;
    use crate::pipeline::{Mode, PipelineStatus};

    async fn setup() -> (SubscriptionRegistry, Arc<StatusBroadcaster>, Arc<InMemoryPipelineStore>, Pipeline) {
        let broadcaster = Arc::new(StatusBroadcaster::new(4));
        let store = Arc::new(InMemoryPipelineStore::new());
        let pipeline = pipeline_with(Mode::Auto, "script");
        store.insert(&pipeline).await.unwrap();
        let registry = SubscriptionRegistry::new(
            broadcaster.clone(),
            store.clone(),
            Duration::from_millis(50),
        );
        (registry, broadcaster, store, pipeline)
    }

    fn bumped(pipeline: &Pipeline, status: PipelineStatus) -> Pipeline {
        let mut next = pipeline.clone();
        next.status = status;
        next.revision += 1;
        next
    }

    #[tokio::test]
    async fn test_open_unknown_pipeline_is_not_found() {
        let (registry, broadcaster, _, _) = setup().await;
        assert!(matches!(
            registry.open("missing").await,
            Err(PipelineError::NotFound(_))
        ));
        assert_eq!(broadcaster.topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_stale_and_duplicate_events_are_skipped() {
        let (registry, broadcaster, _, pipeline) = setup().await;
        let mut handle = registry.open(&pipeline.id).await.unwrap();
        assert_eq!(handle.snapshot().revision, 0);

        let running = bumped(&pipeline, PipelineStatus::Running);
        broadcaster.publish(&pipeline).await;
        broadcaster.publish(&running).await;
        broadcaster.publish(&running).await;
        let done = bumped(&running, PipelineStatus::Success);
        broadcaster.publish(&done).await;

        assert_eq!(handle.next().await.unwrap(), Some(running));
        assert_eq!(handle.next().await.unwrap(), Some(done));
        assert!(handle.is_finished());
        assert_eq!(handle.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_two_subscribers_see_the_same_suffix() {
        let (registry, broadcaster, _, pipeline) = setup().await;
        let mut early = registry.open(&pipeline.id).await.unwrap();

        let running = bumped(&pipeline, PipelineStatus::Running);
        broadcaster.publish(&running).await;
        assert_eq!(early.next().await.unwrap(), Some(running.clone()));

        let mut late = registry.open(&pipeline.id).await.unwrap();
        let paused = bumped(&running, PipelineStatus::Paused);
        let resumed = bumped(&paused, PipelineStatus::Running);
        broadcaster.publish(&paused).await;
        broadcaster.publish(&resumed).await;

        for handle in [&mut early, &mut late] {
            assert_eq!(handle.next().await.unwrap(), Some(paused.clone()));
            assert_eq!(handle.next().await.unwrap(), Some(resumed.clone()));
        }
    }

    #[tokio::test]
    async fn test_idle_subscription_times_out_and_can_reconcile() {
        let (registry, _, _, pipeline) = setup().await;
        let mut handle = registry.open(&pipeline.id).await.unwrap();

        let err = handle.next().await.unwrap_err();
        assert!(matches!(err, PipelineError::SubscriptionTimeout { .. }));
        assert!(err.is_recoverable());

        let done = bumped(&pipeline, PipelineStatus::Success);
        assert!(handle.reconcile(&done));
        assert!(!handle.reconcile(&done));
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_gets_recoverable_error() {
        let (registry, broadcaster, _, pipeline) = setup().await;
        let mut handle = registry.open(&pipeline.id).await.unwrap();

        let mut current = pipeline.clone();
        for _ in 0..10 {
            current = bumped(&current, PipelineStatus::Running);
            broadcaster.publish(&current).await;
        }

        let err = handle.next().await.unwrap_err();
        assert!(matches!(err, PipelineError::SubscriptionError { .. }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_open_on_terminal_pipeline_is_already_finished() {
        let (registry, _, store, pipeline) = setup().await;
        let done = bumped(&pipeline, PipelineStatus::Success);
        store.update(&done).await.unwrap();

        let mut handle = registry.open(&pipeline.id).await.unwrap();
        assert!(handle.is_finished());
        assert_eq!(handle.next().await.unwrap(), None);
        registry.close(handle).await;
    }

    #[tokio::test]
    async fn test_close_releases_topic_and_registry_entry() {
        let (registry, broadcaster, _, pipeline) = setup().await;
        let first = registry.open(&pipeline.id).await.unwrap();
        let second = registry.open(&pipeline.id).await.unwrap();
        assert_eq!(registry.active_count(&pipeline.id).await, 2);
        assert_ne!(first.id(), second.id());

        registry.close(first).await;
        assert_eq!(registry.active_count(&pipeline.id).await, 1);
        assert_eq!(broadcaster.topic_count().await, 1);

        registry.close(second).await;
        assert_eq!(registry.active_count(&pipeline.id).await, 0);
        assert_eq!(broadcaster.topic_count().await, 0);
    }
}
