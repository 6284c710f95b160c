// src/pipeline/state_machine.rs
//! Pipeline state machine - the only writer of pipeline records.
//! Every transition is validated, persisted and broadcast under a
//! per-pipeline lock, so transitions on one pipeline are totally ordered.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use super::executor::{Artifact, Stage, StageOutcome, StagePlan};
use super::store::PipelineStore;
use super::{CreatePipelineRequest, Pipeline, PipelineId, PipelineStatus};
use crate::broadcast::StatusBroadcaster;
use crate::error::{PipelineError, PipelineResult};
use crate::gate::{Admission, FeatureGate};

/// Completion report for one executed stage
#[derive(Debug, Clone)]
pub struct StageResult {
    pub stage_index: usize,
    pub stage: Stage,
    pub outcome: StageOutcome,
    pub elapsed: Duration,
}

impl StageResult {
    /// Success without running anything, used when resuming past a review stage
    pub fn synthetic_success(stage_index: usize, stage: Stage) -> Self {
        Self {
            stage_index,
            stage,
            outcome: StageOutcome::Success { artifact: None },
            elapsed: Duration::ZERO,
        }
    }
}

/// What the driver should do after `advance`
#[derive(Debug, Clone)]
pub enum Advance {
    /// Still running; execute the stage at `next_index`
    Continue {
        pipeline: Pipeline,
        next_index: usize,
    },
    /// Paused, succeeded or failed; no further stage is invoked
    Halted(Pipeline),
}

impl Advance {
    pub fn pipeline(&self) -> &Pipeline {
        match self {
            Advance::Continue { pipeline, .. } => pipeline,
            Advance::Halted(pipeline) => pipeline,
        }
    }
}

pub struct PipelineStateMachine {
    store: Arc<dyn PipelineStore>,
    broadcaster: Arc<StatusBroadcaster>,
    gate: FeatureGate,
    locks: RwLock<HashMap<PipelineId, Arc<Mutex<()>>>>,
}

impl PipelineStateMachine {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        broadcaster: Arc<StatusBroadcaster>,
        gate: FeatureGate,
    ) -> Self {
        Self {
            store,
            broadcaster,
            gate,
            locks: RwLock::new(HashMap::new()),
        }
    }

    pub fn gate(&self) -> &FeatureGate {
        &self.gate
    }

    /// Admit a create command through the gate and persist a `pending` record.
    /// Rejected commands never reach the store.
    pub async fn create(
        &self,
        request: &CreatePipelineRequest,
    ) -> PipelineResult<(Pipeline, Admission)> {
        let admission = self.gate.admit(request)?;
        let pipeline = Pipeline::new(&admission);

        self.store.insert(&pipeline).await?;
        self.broadcaster.publish(&pipeline).await;

        info!(
            pipeline_id = %pipeline.id,
            mode = %pipeline.mode,
            features = %pipeline.features_csv(),
            tier = %pipeline.tier,
            "🎬 Created pipeline"
        );
        Ok((pipeline, admission))
    }

    /// Point-read of the current record
    pub async fn get(&self, id: &str) -> PipelineResult<Pipeline> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(id.to_string()))
    }

    pub async fn list_for_user(&self, user_id: &str) -> PipelineResult<Vec<Pipeline>> {
        self.store.list_for_user(user_id).await
    }

    /// `pending -> running`
    pub async fn start(&self, id: &str) -> PipelineResult<Pipeline> {
        self.transition(id, |pipeline| {
            let first = StagePlan::of(pipeline).stage(0).unwrap_or(Stage::Script);
            pipeline.status = PipelineStatus::Running;
            pipeline.started_at = Some(Utc::now());
            pipeline.current_step = first.label().to_string();
            Ok(())
        })
        .await
    }

    /// Apply the outcome of the stage at `result.stage_index`
    pub async fn advance(&self, id: &str, result: StageResult) -> PipelineResult<Advance> {
        let mut next_index = None;

        let pipeline = self
            .transition(id, |pipeline| {
                if pipeline.status != PipelineStatus::Running {
                    return Err(PipelineError::InvalidTransition {
                        id: pipeline.id.clone(),
                        from: pipeline.status,
                        to: target_status(&result.outcome),
                    });
                }

                let plan = StagePlan::of(pipeline);
                if plan.stage(result.stage_index) != Some(result.stage) {
                    return Err(PipelineError::StageFailure {
                        stage: result.stage.to_string(),
                        message: format!(
                            "stage is not at position {} of this pipeline's plan",
                            result.stage_index
                        ),
                    });
                }

                let now = Utc::now();
                let elapsed_ms = result.elapsed.as_millis() as i64;
                pipeline.processing_time_ms =
                    Some(pipeline.processing_time_ms.unwrap_or(0) + elapsed_ms);

                match &result.outcome {
                    StageOutcome::Success { artifact } => {
                        if let Some(artifact) = artifact {
                            record_artifact(pipeline, artifact);
                        }
                        pipeline.progress =
                            pipeline.progress.max(plan.progress_after(result.stage_index));

                        match plan.stage(result.stage_index + 1) {
                            Some(next) => {
                                pipeline.current_step = next.label().to_string();
                                next_index = Some(result.stage_index + 1);
                            }
                            None => {
                                pipeline.status = PipelineStatus::Success;
                                pipeline.progress = 100;
                                pipeline.current_step = "Completed".to_string();
                                pipeline.completed_at = Some(now);
                            }
                        }
                    }
                    StageOutcome::PauseRequested { reason } => {
                        pipeline.status = PipelineStatus::Paused;
                        pipeline.paused_at = Some(now);
                        pipeline.pause_reason = Some(*reason);
                        pipeline.current_step = result.stage.label().to_string();
                    }
                    StageOutcome::Failure { message, details } => {
                        pipeline.status = PipelineStatus::Failed;
                        pipeline.error_message = Some(message.clone());
                        pipeline.error_details = Some(details.clone().unwrap_or_else(|| {
                            serde_json::json!({ "stage": result.stage.as_str() })
                        }));
                        pipeline.completed_at = Some(now);
                    }
                }
                Ok(())
            })
            .await?;

        match pipeline.status {
            PipelineStatus::Success => info!(pipeline_id = %id, "✅ Pipeline completed"),
            PipelineStatus::Paused => info!(
                pipeline_id = %id,
                stage = %result.stage,
                "⏸️ Pipeline paused for human input"
            ),
            PipelineStatus::Failed => error!(
                pipeline_id = %id,
                stage = %result.stage,
                error = pipeline.error_message.as_deref().unwrap_or_default(),
                "❌ Pipeline failed"
            ),
            _ => debug!(
                pipeline_id = %id,
                progress = pipeline.progress,
                step = %pipeline.current_step,
                "Pipeline advanced"
            ),
        }

        Ok(match next_index {
            Some(next_index) => Advance::Continue {
                pipeline,
                next_index,
            },
            None => Advance::Halted(pipeline),
        })
    }

    /// `paused -> running`, the only way out of `paused`. Pause payload is cleared
    /// and progress continues from the paused value.
    pub async fn readmit(&self, id: &str) -> PipelineResult<Pipeline> {
        self.transition(id, |pipeline| {
            if pipeline.status != PipelineStatus::Paused {
                return Err(PipelineError::NotResumable {
                    id: pipeline.id.clone(),
                    reason: format!("status is {}", pipeline.status),
                });
            }
            pipeline.status = PipelineStatus::Running;
            pipeline.paused_at = None;
            pipeline.pause_reason = None;
            Ok(())
        })
        .await
    }

    /// Fail a running pipeline outside of a stage outcome (e.g. resume substitution)
    pub async fn fail(
        &self,
        id: &str,
        message: String,
        details: Option<serde_json::Value>,
    ) -> PipelineResult<Pipeline> {
        let pipeline = self
            .transition(id, |pipeline| {
                pipeline.status = PipelineStatus::Failed;
                pipeline.error_message = Some(message);
                pipeline.error_details = details;
                pipeline.paused_at = None;
                pipeline.pause_reason = None;
                pipeline.completed_at = Some(Utc::now());
                Ok(())
            })
            .await?;
        warn!(pipeline_id = %id, "❌ Pipeline failed outside of a stage");
        Ok(pipeline)
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().await.get(id) {
            return lock.clone();
        }
        let mut locks = self.locks.write().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Load, mutate, validate the edge, persist, broadcast. A rejected closure
    /// or an illegal edge leaves the stored record untouched.
    async fn transition<F>(&self, id: &str, apply: F) -> PipelineResult<Pipeline>
    where
        F: FnOnce(&mut Pipeline) -> PipelineResult<()>,
    {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let previous = self.get(id).await?;
        let mut next = previous.clone();
        apply(&mut next)?;

        if !previous.status.can_transition_to(next.status) {
            return Err(PipelineError::InvalidTransition {
                id: id.to_string(),
                from: previous.status,
                to: next.status,
            });
        }
        debug_assert!(next.invariants_hold(), "pipeline {} violates invariants", id);

        next.updated_at = Utc::now();
        next.revision = previous.revision + 1;

        self.store.update(&next).await?;
        self.broadcaster.publish(&next).await;

        if next.is_terminal() {
            self.locks.write().await.remove(id);
        }
        Ok(next)
    }
}

fn target_status(outcome: &StageOutcome) -> PipelineStatus {
    match outcome {
        StageOutcome::Success { .. } => PipelineStatus::Running,
        StageOutcome::PauseRequested { .. } => PipelineStatus::Paused,
        StageOutcome::Failure { .. } => PipelineStatus::Failed,
    }
}

fn record_artifact(pipeline: &mut Pipeline, artifact: &Artifact) {
    match artifact {
        // Scripts stay in the working payload
        Artifact::Script(_) => {}
        Artifact::SlideDeck(id) => pipeline.slide_deck_id = Some(id.clone()),
        Artifact::TtsNarration {
            id,
            duration_seconds,
        } => {
            pipeline.tts_narration_id = Some(id.clone());
            pipeline.duration_seconds = Some(*duration_seconds);
        }
        Artifact::NarratedDeck(id) => pipeline.narrated_deck_id = Some(id.clone()),
    }
}
