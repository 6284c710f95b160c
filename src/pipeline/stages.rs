// src/pipeline/stages.rs
//! Built-in stage functions used by the service binary. Content generation
//! is simulated: artifacts are addressed by fresh ids and narration length is
//! estimated from the script.

use async_trait::async_trait;
use tokio::time::{sleep, Duration};
use tracing::debug;
use uuid::Uuid;

use super::executor::{Artifact, Stage, StageError, StageFunction, StageInput};

/// Average narration pace
const WORDS_PER_SECOND: f64 = 2.5;

const FALLBACK_SCRIPT: &str = "Welcome. This presentation walks through the submitted document.";

pub struct SimulatedStages {
    latency: Duration,
}

impl SimulatedStages {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

impl Default for SimulatedStages {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

/// Collapse whitespace in the source document; empty sources get a stock intro
pub fn draft_script(source_text: Option<&str>) -> String {
    let words: Vec<&str> = source_text
        .map(|text| text.split_whitespace().collect())
        .unwrap_or_default();
    if words.is_empty() {
        FALLBACK_SCRIPT.to_string()
    } else {
        words.join(" ")
    }
}

pub fn estimate_narration_seconds(script: &str) -> f64 {
    let words = script.split_whitespace().count() as f64;
    (words / WORDS_PER_SECOND * 10.0).round() / 10.0
}

fn artifact_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

fn require<'a>(value: Option<&'a str>, stage: Stage, what: &str) -> Result<&'a str, StageError> {
    value.ok_or_else(|| {
        StageError::new(format!("{} stage needs a {}", stage, what))
            .with_details(serde_json::json!({ "stage": stage.as_str(), "missing": what }))
    })
}

#[async_trait]
impl StageFunction for SimulatedStages {
    async fn execute(&self, stage: Stage, input: &StageInput) -> Result<Artifact, StageError> {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        let payload = &input.payload;
        let artifact = match stage {
            Stage::Script => Artifact::Script(draft_script(payload.source_text.as_deref())),
            Stage::Slides => {
                require(payload.script.as_deref(), stage, "script")?;
                Artifact::SlideDeck(artifact_id("deck"))
            }
            Stage::Voiceover => {
                let script = require(payload.script.as_deref(), stage, "script")?;
                require(input.voice.as_deref(), stage, "voice")?;
                Artifact::TtsNarration {
                    id: artifact_id("tts"),
                    duration_seconds: estimate_narration_seconds(script),
                }
            }
            Stage::NarratedDeck => {
                require(payload.slide_deck_id.as_deref(), stage, "slide deck")?;
                require(payload.tts_narration_id.as_deref(), stage, "narration")?;
                Artifact::NarratedDeck(artifact_id("narrated"))
            }
            Stage::ScriptReview => {
                return Err(StageError::new("script review does not generate content"))
            }
        };

        debug!(pipeline_id = %input.pipeline_id, stage = %stage, "Generated artifact");
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::executor::WorkingPayload;
    use crate::pipeline::testing::pipeline_with;
    use crate::pipeline::Mode;

    #[test]
    fn test_draft_script_falls_back_on_blank_source() {
        assert_eq!(draft_script(None), FALLBACK_SCRIPT);
        assert_eq!(draft_script(Some("  \n ")), FALLBACK_SCRIPT);
        assert_eq!(draft_script(Some("Rust\n\n is  fast")), "Rust is fast");
    }

    #[test]
    fn test_narration_estimate_scales_with_words() {
        assert_eq!(estimate_narration_seconds(""), 0.0);
        assert_eq!(estimate_narration_seconds("one two three four five"), 2.0);
    }

    #[tokio::test]
    async fn test_voiceover_needs_a_script() {
        let stages = SimulatedStages::default();
        let pipeline = pipeline_with(Mode::Auto, "script,voiceover");
        let input = StageInput::new(&pipeline, WorkingPayload::default());

        let err = stages.execute(Stage::Voiceover, &input).await.unwrap_err();
        assert!(err.message.contains("script"));
        assert!(err.details.is_some());
    }

    #[tokio::test]
    async fn test_narrated_deck_after_slides_and_voiceover() {
        let stages = SimulatedStages::default();
        let pipeline = pipeline_with(Mode::Auto, "script,slides,voiceover");
        let mut payload = WorkingPayload::from_source(Some("A short document".to_string()));

        for stage in [Stage::Script, Stage::Slides, Stage::Voiceover] {
            let artifact = stages
                .execute(stage, &StageInput::new(&pipeline, payload.clone()))
                .await
                .unwrap();
            assert_eq!(artifact.stage(), stage);
            payload.absorb(&artifact);
        }

        let deck = stages
            .execute(Stage::NarratedDeck, &StageInput::new(&pipeline, payload))
            .await
            .unwrap();
        assert!(matches!(deck, Artifact::NarratedDeck(ref id) if id.starts_with("narrated_")));
    }
}
