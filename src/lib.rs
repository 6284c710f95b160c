// lib.rs - Document-to-video pipeline orchestrator
pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod gate;
pub mod handlers;
pub mod middleware;
pub mod pipeline;

use std::sync::Arc;

pub use broadcast::{StatusBroadcaster, SubscriptionHandle, SubscriptionRegistry};
pub use config::Config;
pub use error::{PipelineError, PipelineResult};
pub use gate::{FeatureGate, Tier};
pub use pipeline::orchestrator::Orchestrator;
pub use pipeline::{Pipeline, PipelineStatus};

// Shared state handed to every handler
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<SubscriptionRegistry>,
    pub config: Config,
    /// "postgres" or "memory"
    pub store_kind: &'static str,
}
