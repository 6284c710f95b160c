// src/pipeline/mod.rs
//! Document-to-video pipeline: record types, stage execution, state machine,
//! checkpoint/resume and the driver that ties them together.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::gate::{Admission, ExportFormat, Tier};

pub mod checkpoint;
pub mod executor;
pub mod orchestrator;
pub mod stages;
pub mod state_machine;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

/// Unique identifier for a pipeline
pub type PipelineId = String;

/// Canonical pipeline status. Pause and error fields hang off this
/// discriminant and are never authoritative on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Pending,
    Running,
    Paused,
    Success,
    Failed,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Pending => "pending",
            PipelineStatus::Running => "running",
            PipelineStatus::Paused => "paused",
            PipelineStatus::Success => "success",
            PipelineStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStatus::Success | PipelineStatus::Failed)
    }

    /// Legal edges of the state machine. `running -> running` is the
    /// stage-to-stage advance.
    pub fn can_transition_to(&self, next: PipelineStatus) -> bool {
        use PipelineStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Running)
                | (Running, Paused)
                | (Running, Success)
                | (Running, Failed)
                | (Paused, Running)
        )
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PipelineStatus::Pending),
            "running" => Ok(PipelineStatus::Running),
            "paused" => Ok(PipelineStatus::Paused),
            "success" => Ok(PipelineStatus::Success),
            "failed" => Ok(PipelineStatus::Failed),
            other => Err(PipelineError::Corrupt(format!("unknown status '{}'", other))),
        }
    }
}

/// Whether a human script review is inserted before narration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Auto,
    Hybrid,
    Manual,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Auto => "auto",
            Mode::Hybrid => "hybrid",
            Mode::Manual => "manual",
        }
    }

    pub fn requires_script_review(&self) -> bool {
        !matches!(self, Mode::Auto)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Mode::Auto),
            "hybrid" => Ok(Mode::Hybrid),
            "manual" => Ok(Mode::Manual),
            other => Err(PipelineError::InvalidRequest(format!(
                "unknown mode '{}', expected auto, hybrid or manual",
                other
            ))),
        }
    }
}

/// A requested stage family. Ordering follows execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    Script,
    Slides,
    Voiceover,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Script => "script",
            Feature::Slides => "slides",
            Feature::Voiceover => "voiceover",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "script" => Ok(Feature::Script),
            "slides" => Ok(Feature::Slides),
            "voiceover" => Ok(Feature::Voiceover),
            other => Err(PipelineError::InvalidRequest(format!(
                "unknown feature '{}'",
                other
            ))),
        }
    }
}

/// Closed set of reasons a pipeline may park itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    ScriptReviewRequired,
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseReason::ScriptReviewRequired => "script_review_required",
        }
    }
}

impl FromStr for PauseReason {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "script_review_required" => Ok(PauseReason::ScriptReviewRequired),
            other => Err(PipelineError::Corrupt(format!("unknown pause reason '{}'", other))),
        }
    }
}

/// Create command as received from a client
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePipelineRequest {
    pub mode: String,
    /// Comma-separated feature names; sanitized before use
    pub features: String,
    pub tier: String,
    pub source_text: Option<String>,
    pub user_id: Option<String>,
    pub voice: Option<String>,
    pub export_format: Option<String>,
}

/// Resume payload supplied after a human edit
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumePayload {
    pub edited_script: String,
    pub user_id: String,
    /// Informational only; gating uses the tier recorded at creation
    pub tier: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

impl ResumeResponse {
    pub fn reentered() -> Self {
        Self {
            success: true,
            errors: None,
        }
    }

    pub fn rejected(errors: Vec<String>) -> Self {
        Self {
            success: false,
            errors: Some(errors),
        }
    }
}

/// The unit of work. This full record is what gets persisted and broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    pub id: PipelineId,
    pub status: PipelineStatus,
    pub mode: Mode,
    pub features: BTreeSet<Feature>,
    pub current_step: String,
    pub progress: u8,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    pub processing_time_ms: Option<i64>,
    pub duration_seconds: Option<f64>,
    pub tier: Tier,
    pub user_id: Option<String>,
    pub voice: Option<String>,
    pub export_format: ExportFormat,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub slide_deck_id: Option<String>,
    pub narrated_deck_id: Option<String>,
    pub tts_narration_id: Option<String>,
    pub paused_at: Option<DateTime<Utc>>,
    pub pause_reason: Option<PauseReason>,
    /// Bumped on every transition; subscribers use it to layer the live
    /// stream on top of a point-read.
    pub revision: u64,
}

impl Pipeline {
    pub fn new(admission: &Admission) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            status: PipelineStatus::Pending,
            mode: admission.mode,
            features: admission.features.clone(),
            current_step: "Queued".to_string(),
            progress: 0,
            error_message: None,
            error_details: None,
            processing_time_ms: None,
            duration_seconds: None,
            tier: admission.tier,
            user_id: admission.user_id.clone(),
            voice: admission.voice.clone(),
            export_format: admission.export_format,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            slide_deck_id: None,
            narrated_deck_id: None,
            tts_narration_id: None,
            paused_at: None,
            pause_reason: None,
            revision: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Pause/error payload must agree with the status discriminant.
    pub fn invariants_hold(&self) -> bool {
        let paused_ok = (self.status == PipelineStatus::Paused)
            == (self.paused_at.is_some()
                && self.pause_reason.is_some()
                && self.error_message.is_none());
        let failed_ok = (self.status == PipelineStatus::Failed) == self.error_message.is_some();
        paused_ok && failed_ok && self.progress <= 100
    }

    pub fn features_csv(&self) -> String {
        self.features
            .iter()
            .map(Feature::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}
