// src/pipeline/executor.rs
//! Stage executor - runs exactly one stage and reports success, pause or failure.
//! Content generation itself sits behind the `StageFunction` trait.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{timeout, Duration};

use super::{Feature, Mode, PauseReason, Pipeline, PipelineId};
use crate::error::PipelineError;
use crate::gate::{ExportFormat, Tier};

/// One discrete unit of pipeline work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Script,
    ScriptReview,
    Slides,
    Voiceover,
    NarratedDeck,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Script => "script",
            Stage::ScriptReview => "script_review",
            Stage::Slides => "slides",
            Stage::Voiceover => "voiceover",
            Stage::NarratedDeck => "narrated_deck",
        }
    }

    /// Human readable `currentStep` label
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Script => "Generating script",
            Stage::ScriptReview => "Awaiting script review",
            Stage::Slides => "Generating slides",
            Stage::Voiceover => "Synthesizing narration",
            Stage::NarratedDeck => "Assembling narrated deck",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "script" => Ok(Stage::Script),
            "script_review" => Ok(Stage::ScriptReview),
            "slides" => Ok(Stage::Slides),
            "voiceover" => Ok(Stage::Voiceover),
            "narrated_deck" => Ok(Stage::NarratedDeck),
            other => Err(PipelineError::Corrupt(format!("unknown stage '{}'", other))),
        }
    }
}

/// Fixed linear stage sequence for one pipeline, derived from mode and features.
/// The script review stage is the only branch point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    stages: Vec<Stage>,
}

impl StagePlan {
    pub fn for_pipeline(mode: Mode, features: &BTreeSet<Feature>) -> Self {
        let slides = features.contains(&Feature::Slides);
        let voiceover = features.contains(&Feature::Voiceover);

        // Slides and narration both consume the script
        let mut stages = vec![Stage::Script];
        if mode.requires_script_review() && (slides || voiceover) {
            stages.push(Stage::ScriptReview);
        }
        if slides {
            stages.push(Stage::Slides);
        }
        if voiceover {
            stages.push(Stage::Voiceover);
        }
        if slides && voiceover {
            stages.push(Stage::NarratedDeck);
        }

        Self { stages }
    }

    pub fn of(pipeline: &Pipeline) -> Self {
        Self::for_pipeline(pipeline.mode, &pipeline.features)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, index: usize) -> Option<Stage> {
        self.stages.get(index).copied()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Progress once the stage at `index` has completed
    pub fn progress_after(&self, index: usize) -> u8 {
        if self.stages.is_empty() {
            return 100;
        }
        let done = (index + 1).min(self.stages.len());
        (100 * done / self.stages.len()) as u8
    }
}

/// Working state carried from stage to stage (and across a pause)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingPayload {
    pub source_text: Option<String>,
    pub script: Option<String>,
    pub slide_deck_id: Option<String>,
    pub tts_narration_id: Option<String>,
}

impl WorkingPayload {
    pub fn from_source(source_text: Option<String>) -> Self {
        Self {
            source_text,
            ..Default::default()
        }
    }

    /// Fold a produced artifact into the working state for later stages
    pub fn absorb(&mut self, artifact: &Artifact) {
        match artifact {
            Artifact::Script(text) => self.script = Some(text.clone()),
            Artifact::SlideDeck(id) => self.slide_deck_id = Some(id.clone()),
            Artifact::TtsNarration { id, .. } => self.tts_narration_id = Some(id.clone()),
            Artifact::NarratedDeck(_) => {}
        }
    }
}

/// Everything a stage function may look at
#[derive(Debug, Clone)]
pub struct StageInput {
    pub pipeline_id: PipelineId,
    pub mode: Mode,
    pub tier: Tier,
    pub voice: Option<String>,
    pub export_format: ExportFormat,
    pub payload: WorkingPayload,
}

impl StageInput {
    pub fn new(pipeline: &Pipeline, payload: WorkingPayload) -> Self {
        Self {
            pipeline_id: pipeline.id.clone(),
            mode: pipeline.mode,
            tier: pipeline.tier,
            voice: pipeline.voice.clone(),
            export_format: pipeline.export_format,
            payload,
        }
    }
}

/// What a successful stage produced. Ids point into artifact stores owned
/// by external collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Script(String),
    SlideDeck(String),
    TtsNarration { id: String, duration_seconds: f64 },
    NarratedDeck(String),
}

impl Artifact {
    pub fn stage(&self) -> Stage {
        match self {
            Artifact::Script(_) => Stage::Script,
            Artifact::SlideDeck(_) => Stage::Slides,
            Artifact::TtsNarration { .. } => Stage::Voiceover,
            Artifact::NarratedDeck(_) => Stage::NarratedDeck,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Success { artifact: Option<Artifact> },
    PauseRequested { reason: PauseReason },
    Failure {
        message: String,
        details: Option<serde_json::Value>,
    },
}

impl StageOutcome {
    pub fn failure(message: impl Into<String>) -> Self {
        StageOutcome::Failure {
            message: message.into(),
            details: None,
        }
    }
}

/// Error reported by a stage function
#[derive(Debug, Clone)]
pub struct StageError {
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl StageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Opaque content generation for one stage
#[async_trait]
pub trait StageFunction: Send + Sync {
    async fn execute(&self, stage: Stage, input: &StageInput) -> Result<Artifact, StageError>;
}

/// Runs one stage. Has no knowledge of pipeline history.
pub struct StageExecutor {
    function: Arc<dyn StageFunction>,
    stage_timeout: Duration,
}

impl StageExecutor {
    pub fn new(function: Arc<dyn StageFunction>, stage_timeout: Duration) -> Self {
        Self {
            function,
            stage_timeout,
        }
    }

    pub async fn execute(&self, stage: Stage, input: &StageInput) -> StageOutcome {
        if stage == Stage::ScriptReview {
            return match input.mode {
                Mode::Auto => StageOutcome::Success { artifact: None },
                Mode::Hybrid | Mode::Manual => StageOutcome::PauseRequested {
                    reason: PauseReason::ScriptReviewRequired,
                },
            };
        }

        tracing::debug!(pipeline_id = %input.pipeline_id, stage = %stage, "executing stage");

        match timeout(self.stage_timeout, self.function.execute(stage, input)).await {
            Ok(Ok(artifact)) if artifact.stage() == stage => StageOutcome::Success {
                artifact: Some(artifact),
            },
            Ok(Ok(artifact)) => StageOutcome::failure(format!(
                "stage '{}' produced a {} artifact",
                stage,
                artifact.stage()
            )),
            Ok(Err(e)) => StageOutcome::Failure {
                message: e.message,
                details: e.details,
            },
            Err(_) => StageOutcome::Failure {
                message: format!(
                    "stage '{}' timed out after {}s",
                    stage,
                    self.stage_timeout.as_secs()
                ),
                details: Some(serde_json::json!({ "stage": stage.as_str(), "timeout": true })),
            },
        }
    }
}
