// src/pipeline/testing.rs
//! Test doubles shared by the pipeline unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::{sleep, Duration};

use super::checkpoint::Checkpoint;
use super::executor::{Artifact, Stage, StageError, StageFunction, StageInput};
use super::store::{InMemoryPipelineStore, PipelineStore};
use super::{CreatePipelineRequest, Mode, Pipeline};
use crate::error::{PipelineError, PipelineResult};
use crate::gate::FeatureGate;

/// Deterministic stage function with injectable failures and latency
#[derive(Default)]
pub struct ScriptedStages {
    failures: HashMap<Stage, String>,
    delay: Duration,
    calls: Mutex<Vec<Stage>>,
}

impl ScriptedStages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(mut self, stage: Stage, message: &str) -> Self {
        self.failures.insert(stage, message.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Stages invoked so far, in order
    pub fn calls(&self) -> Vec<Stage> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StageFunction for ScriptedStages {
    async fn execute(&self, stage: Stage, input: &StageInput) -> Result<Artifact, StageError> {
        self.calls.lock().unwrap().push(stage);
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        if let Some(message) = self.failures.get(&stage) {
            return Err(StageError::new(message.clone()));
        }

        let id = &input.pipeline_id;
        Ok(match stage {
            Stage::Script => Artifact::Script(format!("script for {}", id)),
            Stage::Slides => Artifact::SlideDeck(format!("deck_{}", id)),
            Stage::Voiceover => Artifact::TtsNarration {
                id: format!("tts_{}", id),
                duration_seconds: 12.5,
            },
            Stage::NarratedDeck => Artifact::NarratedDeck(format!("narrated_{}", id)),
            Stage::ScriptReview => return Err(StageError::new("review is not executed")),
        })
    }
}

/// Fresh `pending` pipeline on the premium tier
pub fn pipeline_with(mode: Mode, features: &str) -> Pipeline {
    let admission = FeatureGate::new()
        .admit(&CreatePipelineRequest {
            mode: mode.as_str().to_string(),
            features: features.to_string(),
            tier: "premium".to_string(),
            ..Default::default()
        })
        .unwrap();
    Pipeline::new(&admission)
}

/// In-memory store whose checkpoint reads or deletes can be made to fail
#[derive(Default)]
pub struct FlakyCheckpointStore {
    inner: InMemoryPipelineStore,
    fail_load: AtomicBool,
    fail_delete: AtomicBool,
}

impl FlakyCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_loads(&self) {
        self.fail_load.store(true, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self) {
        self.fail_delete.store(true, Ordering::SeqCst);
    }

    fn outage() -> PipelineError {
        PipelineError::Database(sqlx::Error::PoolTimedOut)
    }
}

#[async_trait]
impl PipelineStore for FlakyCheckpointStore {
    async fn insert(&self, pipeline: &Pipeline) -> PipelineResult<()> {
        self.inner.insert(pipeline).await
    }

    async fn update(&self, pipeline: &Pipeline) -> PipelineResult<()> {
        self.inner.update(pipeline).await
    }

    async fn get(&self, id: &str) -> PipelineResult<Option<Pipeline>> {
        self.inner.get(id).await
    }

    async fn list_for_user(&self, user_id: &str) -> PipelineResult<Vec<Pipeline>> {
        self.inner.list_for_user(user_id).await
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> PipelineResult<()> {
        self.inner.save_checkpoint(checkpoint).await
    }

    async fn load_checkpoint(&self, pipeline_id: &str) -> PipelineResult<Option<Checkpoint>> {
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(Self::outage());
        }
        self.inner.load_checkpoint(pipeline_id).await
    }

    async fn delete_checkpoint(&self, pipeline_id: &str) -> PipelineResult<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Self::outage());
        }
        self.inner.delete_checkpoint(pipeline_id).await
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> PipelineResult<u64> {
        self.inner.delete_finished_before(cutoff).await
    }
}
