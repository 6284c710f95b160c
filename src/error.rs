// src/error.rs
//! Error taxonomy for the pipeline orchestrator and its HTTP surface

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::pipeline::PipelineStatus;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Malformed create/resume input. Nothing is persisted.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Pipeline {0} not found")]
    NotFound(String),

    /// Resume called on a missing, running or terminal pipeline. No state change.
    #[error("Pipeline {id} is not resumable: {reason}")]
    NotResumable { id: String, reason: String },

    #[error("Stage '{stage}' failed: {message}")]
    StageFailure { stage: String, message: String },

    #[error("Illegal transition {from} -> {to} for pipeline {id}")]
    InvalidTransition {
        id: String,
        from: PipelineStatus,
        to: PipelineStatus,
    },

    #[error("Subscription error on {topic}: {reason}")]
    SubscriptionError { topic: String, reason: String },

    #[error("Subscription on {topic} idle for {seconds}s")]
    SubscriptionTimeout { topic: String, seconds: u64 },

    #[error("Stored pipeline record is corrupt: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Transport-level failures a subscriber can recover from by reopening
    /// or falling back to point-reads.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::SubscriptionError { .. } | PipelineError::SubscriptionTimeout { .. }
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::NotResumable { .. } | PipelineError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            PipelineError::StageFailure { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::SubscriptionError { .. } | PipelineError::SubscriptionTimeout { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PipelineError::Corrupt(_)
            | PipelineError::Database(_)
            | PipelineError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status.is_server_error() && !self.is_recoverable() {
            tracing::error!(error = %self, "internal error while handling pipeline request");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        (
            status,
            Json(json!({
                "success": false,
                "error": message,
            })),
        )
            .into_response()
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
