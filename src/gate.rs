// src/gate.rs
//! Feature gate: one ordered tier table resolved into a capability set.
//! Pipelines are admitted (and later resumed) against the tier recorded at
//! creation, never the caller's live subscription.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::{CreatePipelineRequest, Feature, Mode};

lazy_static::lazy_static! {
    static ref DISALLOWED_FEATURE_CHARS: Regex = Regex::new(r"[^A-Za-z,]").unwrap();
}

/// Entitlement level. Declaration order is the tier order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Basic,
    Pro,
    Premium,
    Admin,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Pro => "pro",
            Tier::Premium => "premium",
            Tier::Admin => "admin",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "basic" => Ok(Tier::Basic),
            "pro" => Ok(Tier::Pro),
            "premium" => Ok(Tier::Premium),
            "admin" => Ok(Tier::Admin),
            other => Err(PipelineError::InvalidRequest(format!("unknown tier '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Markdown,
    Pdf,
    Pptx,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Markdown => "markdown",
            ExportFormat::Pdf => "pdf",
            ExportFormat::Pptx => "pptx",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(ExportFormat::Markdown),
            "pdf" => Ok(ExportFormat::Pdf),
            "pptx" => Ok(ExportFormat::Pptx),
            other => Err(PipelineError::InvalidRequest(format!(
                "unknown export format '{}'",
                other
            ))),
        }
    }
}

/// Narration voices; lower tiers get a prefix of this list
const VOICES: [&str; 8] = [
    "rachel", "drew", "adam", "bella", "antoni", "elli", "josh", "sam",
];

const ALL_FEATURES: [Feature; 3] = [Feature::Script, Feature::Slides, Feature::Voiceover];
const ALL_MODES: [Mode; 3] = [Mode::Auto, Mode::Hybrid, Mode::Manual];

/// What a tier may do
#[derive(Debug)]
pub struct Capabilities {
    pub features: &'static [Feature],
    pub modes: &'static [Mode],
    pub voices: &'static [&'static str],
    pub exports: &'static [ExportFormat],
    pub max_script_chars: usize,
}

impl Capabilities {
    pub fn allows_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    pub fn allows_mode(&self, mode: Mode) -> bool {
        self.modes.contains(&mode)
    }
}

static TIER_TABLE: [(Tier, Capabilities); 5] = [
    (
        Tier::Free,
        Capabilities {
            features: &[Feature::Script],
            modes: &[Mode::Auto],
            voices: &[],
            exports: &[ExportFormat::Markdown],
            max_script_chars: 2_000,
        },
    ),
    (
        Tier::Basic,
        Capabilities {
            features: &ALL_FEATURES,
            modes: &[Mode::Auto, Mode::Hybrid],
            voices: &["rachel"],
            exports: &[ExportFormat::Markdown],
            max_script_chars: 5_000,
        },
    ),
    (
        Tier::Pro,
        Capabilities {
            features: &ALL_FEATURES,
            modes: &ALL_MODES,
            voices: &["rachel", "drew", "adam", "bella"],
            exports: &[ExportFormat::Markdown, ExportFormat::Pdf],
            max_script_chars: 20_000,
        },
    ),
    (
        Tier::Premium,
        Capabilities {
            features: &ALL_FEATURES,
            modes: &ALL_MODES,
            voices: &VOICES,
            exports: &[ExportFormat::Markdown, ExportFormat::Pdf, ExportFormat::Pptx],
            max_script_chars: 50_000,
        },
    ),
    (
        Tier::Admin,
        Capabilities {
            features: &ALL_FEATURES,
            modes: &ALL_MODES,
            voices: &VOICES,
            exports: &[ExportFormat::Markdown, ExportFormat::Pdf, ExportFormat::Pptx],
            max_script_chars: 100_000,
        },
    ),
];

/// Strip everything except ASCII letters and commas. Idempotent.
pub fn sanitize_features(raw: &str) -> String {
    DISALLOWED_FEATURE_CHARS.replace_all(raw, "").into_owned()
}

/// Sanitize, split and parse a feature string. Empty segments are dropped and
/// duplicates collapse; an empty result or an unknown name is rejected.
pub fn parse_features(raw: &str) -> PipelineResult<BTreeSet<Feature>> {
    let sanitized = sanitize_features(raw).to_ascii_lowercase();
    let features = sanitized
        .split(',')
        .filter(|segment| !segment.is_empty())
        .map(Feature::from_str)
        .collect::<PipelineResult<BTreeSet<_>>>()?;

    if features.is_empty() {
        return Err(PipelineError::InvalidRequest(
            "at least one feature is required".to_string(),
        ));
    }
    Ok(features)
}

/// A create command that passed the gate
#[derive(Debug, Clone)]
pub struct Admission {
    pub mode: Mode,
    pub features: BTreeSet<Feature>,
    pub tier: Tier,
    pub user_id: Option<String>,
    pub voice: Option<String>,
    pub export_format: ExportFormat,
    pub source_text: Option<String>,
}

/// Read-only view over the tier table
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureGate;

impl FeatureGate {
    pub fn new() -> Self {
        Self
    }

    pub fn capabilities(&self, tier: Tier) -> &'static Capabilities {
        TIER_TABLE
            .iter()
            .find(|(t, _)| *t == tier)
            .map(|(_, caps)| caps)
            .unwrap_or(&TIER_TABLE[0].1)
    }

    /// Validate a create command against its tier
    pub fn admit(&self, request: &CreatePipelineRequest) -> PipelineResult<Admission> {
        let tier: Tier = request.tier.parse()?;
        let mode: Mode = request.mode.parse()?;
        let features = parse_features(&request.features)?;
        let caps = self.capabilities(tier);

        if let Some(denied) = features.iter().find(|f| !caps.allows_feature(**f)) {
            return Err(PipelineError::InvalidRequest(format!(
                "feature '{}' is not available on the {} tier",
                denied, tier
            )));
        }
        if !caps.allows_mode(mode) {
            return Err(PipelineError::InvalidRequest(format!(
                "mode '{}' is not available on the {} tier",
                mode, tier
            )));
        }

        let voice = self.resolve_voice(tier, &features, request.voice.as_deref())?;

        let export_format = match request.export_format.as_deref() {
            Some(raw) => raw.parse::<ExportFormat>()?,
            None => ExportFormat::Markdown,
        };
        if !caps.exports.contains(&export_format) {
            return Err(PipelineError::InvalidRequest(format!(
                "export format '{}' is not available on the {} tier",
                export_format.as_str(),
                tier
            )));
        }

        Ok(Admission {
            mode,
            features,
            tier,
            user_id: request
                .user_id
                .as_ref()
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty()),
            voice,
            export_format,
            source_text: request.source_text.clone(),
        })
    }

    fn resolve_voice(
        &self,
        tier: Tier,
        features: &BTreeSet<Feature>,
        requested: Option<&str>,
    ) -> PipelineResult<Option<String>> {
        let caps = self.capabilities(tier);
        let requested = requested.map(|v| v.trim().to_ascii_lowercase());

        if !features.contains(&Feature::Voiceover) {
            return match requested {
                Some(voice) if !voice.is_empty() => Err(PipelineError::InvalidRequest(format!(
                    "voice '{}' given but voiceover was not requested",
                    voice
                ))),
                _ => Ok(None),
            };
        }

        match requested {
            Some(voice) if !voice.is_empty() => {
                if caps.voices.contains(&voice.as_str()) {
                    Ok(Some(voice))
                } else {
                    Err(PipelineError::InvalidRequest(format!(
                        "voice '{}' is not available on the {} tier",
                        voice, tier
                    )))
                }
            }
            _ => Ok(caps.voices.first().map(|v| v.to_string())),
        }
    }

    /// Check an edited script against the creation-time tier. The error is a
    /// human readable reason, reported back through the resume response.
    pub fn check_edited_script(&self, tier: Tier, script: &str) -> PipelineResult<()> {
        let limit = self.capabilities(tier).max_script_chars;
        let length = script.chars().count();
        if length > limit {
            return Err(PipelineError::InvalidRequest(format!(
                "edited script is {} characters, the {} tier allows {}",
                length, tier, limit
            )));
        }
        Ok(())
    }
}
