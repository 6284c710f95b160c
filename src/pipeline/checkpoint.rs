// src/pipeline/checkpoint.rs
//! Pause checkpoints and the resume protocol

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::executor::{Stage, WorkingPayload};
use super::state_machine::{Advance, PipelineStateMachine, StageResult};
use super::store::PipelineStore;
use super::{Pipeline, PipelineId, ResumePayload};
use crate::error::{PipelineError, PipelineResult};

/// Snapshot of a paused pipeline: where it stopped and the working state
/// needed to continue. One per pipeline, removed once resumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub pipeline_id: PipelineId,
    pub stage_index: usize,
    pub stage: Stage,
    pub payload: WorkingPayload,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(pipeline_id: &str, stage_index: usize, stage: Stage, payload: WorkingPayload) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            stage_index,
            stage,
            payload,
            created_at: Utc::now(),
        }
    }
}

/// Result of a resume attempt that got past validation
#[derive(Debug, Clone)]
pub enum ResumeDecision {
    /// Back to `running`; the driver continues at `next_index` (if any)
    Reentered {
        pipeline: Pipeline,
        payload: WorkingPayload,
        next_index: Option<usize>,
    },
    /// The edit could not be applied and the pipeline is now `failed`
    Rejected {
        pipeline: Pipeline,
        errors: Vec<String>,
    },
}

pub struct ResumeManager {
    state_machine: Arc<PipelineStateMachine>,
    store: Arc<dyn PipelineStore>,
}

impl ResumeManager {
    pub fn new(state_machine: Arc<PipelineStateMachine>, store: Arc<dyn PipelineStore>) -> Self {
        Self {
            state_machine,
            store,
        }
    }

    /// Persist the working state of a pipeline about to pause at `stage_index`
    pub async fn checkpoint(
        &self,
        pipeline_id: &str,
        stage_index: usize,
        stage: Stage,
        payload: WorkingPayload,
    ) -> PipelineResult<()> {
        let checkpoint = Checkpoint::new(pipeline_id, stage_index, stage, payload);
        self.store.save_checkpoint(&checkpoint).await?;
        info!(pipeline_id = %pipeline_id, stage = %stage, "💾 Saved pause checkpoint");
        Ok(())
    }

    /// Re-admit a paused pipeline with a human-edited script.
    ///
    /// Malformed payloads and non-paused pipelines are rejected with an error
    /// and leave the record untouched. Once the pipeline has been re-admitted,
    /// any failure to apply the edit moves it to `failed`.
    pub async fn resume(&self, id: &str, payload: ResumePayload) -> PipelineResult<ResumeDecision> {
        if payload.edited_script.trim().is_empty() {
            return Err(PipelineError::InvalidRequest(
                "editedScript must not be empty".to_string(),
            ));
        }
        let user_id = payload.user_id.trim();
        if user_id.is_empty() {
            return Err(PipelineError::InvalidRequest(
                "userId must not be empty".to_string(),
            ));
        }

        let current = match self.store.get(id).await? {
            Some(pipeline) => pipeline,
            None => {
                return Err(PipelineError::NotResumable {
                    id: id.to_string(),
                    reason: "pipeline does not exist".to_string(),
                })
            }
        };
        if let Some(owner) = current.user_id.as_deref() {
            if owner != user_id {
                return Err(PipelineError::InvalidRequest(format!(
                    "pipeline {} does not belong to user {}",
                    id, user_id
                )));
            }
        }
        if !payload.tier.trim().eq_ignore_ascii_case(current.tier.as_str()) {
            warn!(
                pipeline_id = %id,
                recorded = %current.tier,
                supplied = %payload.tier,
                "Resume tier differs from creation tier, gating on the recorded tier"
            );
        }

        // Only one concurrent resume gets past this point
        let pipeline = self.state_machine.readmit(id).await?;

        // From here on every failure must leave the pipeline `failed`
        let checkpoint = match self.store.load_checkpoint(id).await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => {
                return self
                    .reject(id, "no checkpoint recorded for the paused stage".to_string())
                    .await
            }
            Err(e) => {
                return self
                    .reject(id, format!("could not load checkpoint: {}", e))
                    .await
            }
        };

        if let Err(e) = self
            .state_machine
            .gate()
            .check_edited_script(pipeline.tier, &payload.edited_script)
        {
            let reason = match e {
                PipelineError::InvalidRequest(reason) => reason,
                other => other.to_string(),
            };
            return self.reject(id, reason).await;
        }

        let mut working = checkpoint.payload;
        working.script = Some(payload.edited_script);

        let advance = match self
            .state_machine
            .advance(
                id,
                StageResult::synthetic_success(checkpoint.stage_index, checkpoint.stage),
            )
            .await
        {
            Ok(advance) => advance,
            Err(e) => return self.reject(id, e.to_string()).await,
        };

        self.discard_checkpoint(id).await;
        info!(pipeline_id = %id, stage = %checkpoint.stage, "▶️ Pipeline resumed");

        Ok(match advance {
            Advance::Continue {
                pipeline,
                next_index,
            } => ResumeDecision::Reentered {
                pipeline,
                payload: working,
                next_index: Some(next_index),
            },
            Advance::Halted(pipeline) => ResumeDecision::Reentered {
                pipeline,
                payload: working,
                next_index: None,
            },
        })
    }

    async fn reject(&self, id: &str, reason: String) -> PipelineResult<ResumeDecision> {
        warn!(pipeline_id = %id, reason = %reason, "Resume substitution failed");
        let pipeline = self
            .state_machine
            .fail(
                id,
                format!("Resume failed: {}", reason),
                Some(json!({ "stage": "script_review", "resume": true })),
            )
            .await?;
        self.discard_checkpoint(id).await;
        Ok(ResumeDecision::Rejected {
            pipeline,
            errors: vec![reason],
        })
    }

    /// A leftover checkpoint is never read again once the pipeline has left
    /// `paused`; the next pause overwrites it and deletion cascades
    async fn discard_checkpoint(&self, id: &str) {
        if let Err(e) = self.store.delete_checkpoint(id).await {
            warn!(pipeline_id = %id, error = %e, "Could not delete resume checkpoint");
        }
    }
}
