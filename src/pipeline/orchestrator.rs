// src/pipeline/orchestrator.rs
//! Driver - runs a pipeline's stage plan in order, handing each outcome to
//! the state machine. At most one stage of a pipeline is in flight.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

use super::checkpoint::{ResumeDecision, ResumeManager};
use super::executor::{StageExecutor, StageFunction, StageInput, StageOutcome, StagePlan, WorkingPayload};
use super::state_machine::{Advance, PipelineStateMachine, StageResult};
use super::store::PipelineStore;
use super::{CreatePipelineRequest, Pipeline, PipelineId, PipelineStatus, ResumePayload, ResumeResponse};
use crate::broadcast::StatusBroadcaster;
use crate::error::{PipelineError, PipelineResult};
use crate::gate::FeatureGate;

pub struct Orchestrator {
    store: Arc<dyn PipelineStore>,
    state_machine: Arc<PipelineStateMachine>,
    executor: StageExecutor,
    resume: ResumeManager,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        broadcaster: Arc<StatusBroadcaster>,
        stages: Arc<dyn StageFunction>,
        stage_timeout: Duration,
    ) -> Self {
        let state_machine = Arc::new(PipelineStateMachine::new(
            store.clone(),
            broadcaster,
            FeatureGate::new(),
        ));
        Self {
            resume: ResumeManager::new(state_machine.clone(), store.clone()),
            executor: StageExecutor::new(stages, stage_timeout),
            state_machine,
            store,
        }
    }

    /// Create a pipeline and start driving it in the background
    pub async fn submit(self: &Arc<Self>, request: &CreatePipelineRequest) -> PipelineResult<Pipeline> {
        let (pipeline, admission) = self.state_machine.create(request).await?;
        self.spawn_run(
            pipeline.id.clone(),
            0,
            WorkingPayload::from_source(admission.source_text),
        );
        Ok(pipeline)
    }

    /// Create without driving; the caller invokes `run`
    pub async fn create(&self, request: &CreatePipelineRequest) -> PipelineResult<(Pipeline, WorkingPayload)> {
        let (pipeline, admission) = self.state_machine.create(request).await?;
        Ok((pipeline, WorkingPayload::from_source(admission.source_text)))
    }

    /// Drive a pipeline from `from_index` until it pauses or terminates
    pub async fn run(
        &self,
        id: &str,
        from_index: usize,
        payload: WorkingPayload,
    ) -> PipelineResult<Pipeline> {
        let mut pipeline = self.state_machine.get(id).await?;
        if pipeline.status == PipelineStatus::Pending {
            pipeline = self.state_machine.start(id).await?;
            info!(pipeline_id = %id, stages = StagePlan::of(&pipeline).len(), "🚀 Pipeline started");
        }
        self.drive(pipeline, from_index, payload).await
    }

    async fn drive(
        &self,
        mut pipeline: Pipeline,
        mut index: usize,
        mut payload: WorkingPayload,
    ) -> PipelineResult<Pipeline> {
        loop {
            match self.step(&pipeline, index, &mut payload).await? {
                Advance::Continue {
                    pipeline: next,
                    next_index,
                } => {
                    pipeline = next;
                    index = next_index;
                }
                Advance::Halted(done) => return Ok(done),
            }
        }
    }

    /// Execute the stage at `index` and apply its outcome
    pub async fn step(
        &self,
        pipeline: &Pipeline,
        index: usize,
        payload: &mut WorkingPayload,
    ) -> PipelineResult<Advance> {
        let stage = StagePlan::of(pipeline).stage(index).ok_or_else(|| {
            PipelineError::StageFailure {
                stage: format!("#{}", index),
                message: format!("pipeline {} has no stage at this position", pipeline.id),
            }
        })?;

        let started = Instant::now();
        let mut outcome = self
            .executor
            .execute(stage, &StageInput::new(pipeline, payload.clone()))
            .await;
        let elapsed = started.elapsed();

        match &outcome {
            StageOutcome::Success {
                artifact: Some(artifact),
            } => payload.absorb(artifact),
            StageOutcome::PauseRequested { .. } => {
                // A pause without a checkpoint could never be resumed
                if let Err(e) = self
                    .resume
                    .checkpoint(&pipeline.id, index, stage, payload.clone())
                    .await
                {
                    outcome = StageOutcome::Failure {
                        message: format!("could not save pause checkpoint: {}", e),
                        details: Some(json!({ "stage": stage.as_str(), "checkpoint": false })),
                    };
                }
            }
            _ => {}
        }

        self.state_machine
            .advance(
                &pipeline.id,
                StageResult {
                    stage_index: index,
                    stage,
                    outcome,
                    elapsed,
                },
            )
            .await
    }

    /// Resume a paused pipeline. The first resumed stage runs before this
    /// returns; the remainder continues in the background.
    pub async fn resume(self: &Arc<Self>, id: &str, payload: ResumePayload) -> PipelineResult<ResumeResponse> {
        let (pipeline, mut working, next_index) = match self.resume.resume(id, payload).await? {
            ResumeDecision::Rejected { errors, .. } => return Ok(ResumeResponse::rejected(errors)),
            ResumeDecision::Reentered {
                pipeline,
                payload,
                next_index,
            } => (pipeline, payload, next_index),
        };

        let Some(index) = next_index else {
            return Ok(ResumeResponse::reentered());
        };

        match self.step(&pipeline, index, &mut working).await {
            Ok(Advance::Continue {
                pipeline,
                next_index,
            }) => {
                self.spawn_drive(pipeline, next_index, working);
                Ok(ResumeResponse::reentered())
            }
            Ok(Advance::Halted(done)) if done.status == PipelineStatus::Failed => {
                Ok(ResumeResponse::rejected(vec![done
                    .error_message
                    .unwrap_or_else(|| "stage failed".to_string())]))
            }
            Ok(Advance::Halted(_)) => Ok(ResumeResponse::reentered()),
            Err(e) => {
                self.abandon(id, &e).await;
                Ok(ResumeResponse::rejected(vec![e.to_string()]))
            }
        }
    }

    pub async fn get(&self, id: &str) -> PipelineResult<Pipeline> {
        self.state_machine.get(id).await
    }

    pub async fn list_for_user(&self, user_id: &str) -> PipelineResult<Vec<Pipeline>> {
        self.state_machine.list_for_user(user_id).await
    }

    /// Drop terminal pipelines older than `retention`
    pub async fn cleanup_finished(&self, retention: chrono::Duration) -> PipelineResult<u64> {
        self.store.delete_finished_before(Utc::now() - retention).await
    }

    fn spawn_run(self: &Arc<Self>, id: PipelineId, from_index: usize, payload: WorkingPayload) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.run(&id, from_index, payload).await {
                this.abandon(&id, &e).await;
            }
        });
    }

    fn spawn_drive(self: &Arc<Self>, pipeline: Pipeline, index: usize, payload: WorkingPayload) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let id = pipeline.id.clone();
            if let Err(e) = this.drive(pipeline, index, payload).await {
                this.abandon(&id, &e).await;
            }
        });
    }

    /// Infrastructure error while driving: record it on the pipeline when the
    /// state machine still allows it
    async fn abandon(&self, id: &str, cause: &PipelineError) {
        error!(pipeline_id = %id, error = %cause, "Pipeline driver stopped");
        let details = json!({ "driver": true });
        if let Err(e) = self
            .state_machine
            .fail(id, cause.to_string(), Some(details))
            .await
        {
            warn!(pipeline_id = %id, error = %e, "Could not mark abandoned pipeline as failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::store::InMemoryPipelineStore;
    use crate::broadcast::{SubscriptionHandle, SubscriptionRegistry};
    use crate::pipeline::testing::{FlakyCheckpointStore, ScriptedStages};
    use crate::pipeline::executor::Stage;
    use crate::pipeline::PauseReason;

    fn orchestrator(stages: ScriptedStages) -> (Arc<Orchestrator>, Arc<ScriptedStages>) {
        let stages = Arc::new(stages);
        let orchestrator = orchestrator_on(
            Arc::new(InMemoryPipelineStore::new()),
            Arc::new(StatusBroadcaster::new(64)),
            stages.clone(),
        );
        (orchestrator, stages)
    }

    fn orchestrator_on(
        store: Arc<dyn PipelineStore>,
        broadcaster: Arc<StatusBroadcaster>,
        stages: Arc<ScriptedStages>,
    ) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(store, broadcaster, stages, Duration::from_secs(5)))
    }

    fn request(mode: &str, features: &str, tier: &str) -> CreatePipelineRequest {
        CreatePipelineRequest {
            mode: mode.to_string(),
            features: features.to_string(),
            tier: tier.to_string(),
            user_id: Some("u1".to_string()),
            source_text: Some("Quarterly results".to_string()),
            ..Default::default()
        }
    }

    fn resume_payload(script: &str) -> ResumePayload {
        ResumePayload {
            edited_script: script.to_string(),
            user_id: "u1".to_string(),
            tier: "pro".to_string(),
        }
    }

    async fn paused(orchestrator: &Orchestrator, mode: &str, features: &str, tier: &str) -> Pipeline {
        let (pipeline, payload) = orchestrator.create(&request(mode, features, tier)).await.unwrap();
        let paused = orchestrator.run(&pipeline.id, 0, payload).await.unwrap();
        assert_eq!(paused.status, PipelineStatus::Paused);
        paused
    }

    async fn wait_for_terminal(orchestrator: &Orchestrator, id: &str) -> Pipeline {
        for _ in 0..200 {
            let pipeline = orchestrator.get(id).await.unwrap();
            if pipeline.is_terminal() {
                return pipeline;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pipeline {} never finished", id);
    }

    #[tokio::test]
    async fn test_auto_pipeline_runs_to_success() {
        let (orchestrator, stages) = orchestrator(ScriptedStages::new());
        let (pipeline, payload) = orchestrator
            .create(&request("auto", "script,slides,voiceover", "premium"))
            .await
            .unwrap();

        let done = orchestrator.run(&pipeline.id, 0, payload).await.unwrap();
        assert_eq!(done.status, PipelineStatus::Success);
        assert_eq!(done.progress, 100);
        assert!(done.slide_deck_id.is_some());
        assert!(done.tts_narration_id.is_some());
        assert!(done.narrated_deck_id.is_some());
        assert_eq!(done.duration_seconds, Some(12.5));
        assert_eq!(
            stages.calls(),
            vec![Stage::Script, Stage::Slides, Stage::Voiceover, Stage::NarratedDeck]
        );
    }

    #[tokio::test]
    async fn test_script_only_never_produces_downstream_artifacts() {
        let (orchestrator, stages) = orchestrator(ScriptedStages::new());
        let (pipeline, payload) = orchestrator
            .create(&request("hybrid", "script", "pro"))
            .await
            .unwrap();

        let done = orchestrator.run(&pipeline.id, 0, payload).await.unwrap();
        assert_eq!(done.status, PipelineStatus::Success);
        assert!(done.slide_deck_id.is_none());
        assert!(done.tts_narration_id.is_none());
        assert!(done.narrated_deck_id.is_none());
        assert_eq!(stages.calls(), vec![Stage::Script]);
    }

    #[tokio::test]
    async fn test_hybrid_pipeline_pauses_then_resumes_to_success() {
        let (orchestrator, stages) = orchestrator(ScriptedStages::new());
        let paused = paused(&orchestrator, "hybrid", "script,slides,voiceover", "pro").await;
        assert_eq!(paused.pause_reason, Some(PauseReason::ScriptReviewRequired));
        assert!(paused.tts_narration_id.is_none());
        assert_eq!(stages.calls(), vec![Stage::Script]);

        let response = orchestrator
            .resume(&paused.id, resume_payload("Hello world"))
            .await
            .unwrap();
        assert_eq!(response, ResumeResponse::reentered());

        let done = wait_for_terminal(&orchestrator, &paused.id).await;
        assert_eq!(done.status, PipelineStatus::Success);
        assert_eq!(done.progress, 100);
        assert!(done.tts_narration_id.is_some());
        assert!(done.paused_at.is_none());
        assert!(done.narrated_deck_id.is_some());
        assert_eq!(
            stages.calls(),
            vec![Stage::Script, Stage::Slides, Stage::Voiceover, Stage::NarratedDeck]
        );
    }

    #[tokio::test]
    async fn test_resume_on_running_pipeline_is_not_resumable() {
        let (orchestrator, _) = orchestrator(ScriptedStages::new());
        let (pipeline, _) = orchestrator
            .create(&request("hybrid", "script,voiceover", "pro"))
            .await
            .unwrap();

        let err = orchestrator
            .resume(&pipeline.id, resume_payload("Edited"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotResumable { .. }));
        assert_eq!(
            orchestrator.get(&pipeline.id).await.unwrap().status,
            PipelineStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_concurrent_resumes_only_one_wins() {
        let (orchestrator, _) = orchestrator(ScriptedStages::new());
        let paused = paused(&orchestrator, "manual", "script,slides", "pro").await;

        let (a, b) = tokio::join!(
            orchestrator.resume(&paused.id, resume_payload("first")),
            orchestrator.resume(&paused.id, resume_payload("second")),
        );
        let outcomes = [a, b];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes.iter().any(|r| matches!(r, Err(PipelineError::NotResumable { .. }))));
    }

    #[tokio::test]
    async fn test_oversized_edit_fails_pipeline() {
        let (orchestrator, _) = orchestrator(ScriptedStages::new());
        let paused = paused(&orchestrator, "hybrid", "script,voiceover", "pro").await;

        let response = orchestrator
            .resume(&paused.id, resume_payload(&"x".repeat(20_001)))
            .await
            .unwrap();
        assert!(!response.success);

        let failed = orchestrator.get(&paused.id).await.unwrap();
        assert_eq!(failed.status, PipelineStatus::Failed);
        assert!(failed.error_message.is_some());
    }

    #[tokio::test]
    async fn test_failure_in_first_resumed_stage_is_reported() {
        let stages = ScriptedStages::new().failing_at(Stage::Voiceover, "tts quota exhausted");
        let (orchestrator, _) = orchestrator(stages);
        let paused = paused(&orchestrator, "hybrid", "script,voiceover", "pro").await;

        let response = orchestrator
            .resume(&paused.id, resume_payload("Edited"))
            .await
            .unwrap();
        assert_eq!(
            response,
            ResumeResponse::rejected(vec!["tts quota exhausted".to_string()])
        );
        assert_eq!(
            orchestrator.get(&paused.id).await.unwrap().status,
            PipelineStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_stage_failure_stops_the_plan() {
        let stages = ScriptedStages::new().failing_at(Stage::Slides, "renderer crashed");
        let (orchestrator, stages) = orchestrator(stages);

        let pipeline = orchestrator
            .submit(&request("auto", "script,slides,voiceover", "premium"))
            .await
            .unwrap();
        let failed = wait_for_terminal(&orchestrator, &pipeline.id).await;

        assert_eq!(failed.status, PipelineStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("renderer crashed"));
        assert!(failed.tts_narration_id.is_none());
        assert_eq!(stages.calls(), vec![Stage::Script, Stage::Slides]);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_old_terminal_pipelines() {
        let (orchestrator, _) = orchestrator(ScriptedStages::new());
        let (done, payload) = orchestrator.create(&request("auto", "script", "free")).await.unwrap();
        orchestrator.run(&done.id, 0, payload).await.unwrap();
        let live = paused(&orchestrator, "hybrid", "script,slides", "pro").await;

        assert_eq!(orchestrator.cleanup_finished(chrono::Duration::hours(1)).await.unwrap(), 0);
        assert_eq!(orchestrator.cleanup_finished(chrono::Duration::zero()).await.unwrap(), 1);
        assert!(orchestrator.get(&done.id).await.is_err());
        assert!(orchestrator.get(&live.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_store_outage_during_resume_fails_the_pipeline() {
        let store = Arc::new(FlakyCheckpointStore::new());
        let orchestrator = orchestrator_on(
            store.clone(),
            Arc::new(StatusBroadcaster::new(64)),
            Arc::new(ScriptedStages::new()),
        );
        let paused = paused(&orchestrator, "hybrid", "script,slides,voiceover", "pro").await;
        store.fail_loads();

        let response = orchestrator
            .resume(&paused.id, resume_payload("Hello world"))
            .await
            .unwrap();
        assert!(!response.success);

        let failed = orchestrator.get(&paused.id).await.unwrap();
        assert_eq!(failed.status, PipelineStatus::Failed);
        assert!(failed.invariants_hold());
        assert!(matches!(
            orchestrator.resume(&paused.id, resume_payload("again")).await,
            Err(PipelineError::NotResumable { .. })
        ));
    }

    async fn drain(handle: &mut SubscriptionHandle) -> Vec<(u64, PipelineStatus)> {
        let mut seen = Vec::new();
        while let Some(pipeline) = handle.next().await.unwrap() {
            seen.push((pipeline.revision, pipeline.status));
        }
        seen
    }

    #[tokio::test]
    async fn test_subscribers_share_the_final_transitions() {
        let store: Arc<dyn PipelineStore> = Arc::new(InMemoryPipelineStore::new());
        let broadcaster = Arc::new(StatusBroadcaster::new(64));
        let orchestrator = orchestrator_on(
            store.clone(),
            broadcaster.clone(),
            Arc::new(ScriptedStages::new()),
        );
        let registry = SubscriptionRegistry::new(broadcaster, store, Duration::from_secs(5));

        let (pipeline, payload) = orchestrator
            .create(&request("hybrid", "script,slides,voiceover", "Pro"))
            .await
            .unwrap();
        let mut early = registry.open(&pipeline.id).await.unwrap();

        let paused = orchestrator.run(&pipeline.id, 0, payload).await.unwrap();
        assert_eq!(paused.status, PipelineStatus::Paused);
        let mut late = registry.open(&pipeline.id).await.unwrap();
        assert_eq!(late.snapshot().revision, paused.revision);

        let mut resume = resume_payload("Hello world");
        resume.tier = "Pro".to_string();
        assert_eq!(
            orchestrator.resume(&pipeline.id, resume).await.unwrap(),
            ResumeResponse::reentered()
        );

        let early_seen = drain(&mut early).await;
        let late_seen = drain(&mut late).await;

        assert!(early_seen.contains(&(paused.revision, PipelineStatus::Paused)));
        assert!(!late_seen.is_empty());
        assert!(early_seen.ends_with(&late_seen));
        assert_eq!(late_seen.last().map(|(_, status)| *status), Some(PipelineStatus::Success));
        assert!(early.is_finished() && late.is_finished());
    }
}
