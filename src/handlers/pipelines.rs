// src/handlers/pipelines.rs
//! Pipeline endpoints - create, point-read, list, resume

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::PipelineError;
use crate::pipeline::{CreatePipelineRequest, PipelineId, ResumePayload};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub user_id: Option<String>,
}

impl ListQuery {
    fn user_id(&self) -> Result<&str, PipelineError> {
        match self.user_id.as_deref().map(str::trim) {
            Some(user_id) if !user_id.is_empty() => Ok(user_id),
            _ => Err(PipelineError::InvalidRequest("user_id is required".to_string())),
        }
    }
}

/// POST /api/pipelines - Admit and start a pipeline
pub async fn create_pipeline(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<CreatePipelineRequest>,
) -> Result<impl IntoResponse, PipelineError> {
    let pipeline = state.orchestrator.submit(&request).await?;
    Ok((StatusCode::CREATED, Json(pipeline)))
}

/// GET /api/pipelines/:pipeline_id - Current record
pub async fn get_pipeline(
    Path(pipeline_id): Path<PipelineId>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, PipelineError> {
    let pipeline = state.orchestrator.get(&pipeline_id).await?;
    Ok(Json(pipeline))
}

/// GET /api/pipelines?user_id= - A user's pipelines, newest first
pub async fn list_pipelines(
    Query(query): Query<ListQuery>,
    Extension(state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, PipelineError> {
    let user_id = query.user_id()?;
    let pipelines = state.orchestrator.list_for_user(user_id).await?;
    Ok(Json(serde_json::json!({
        "user_id": user_id,
        "count": pipelines.len(),
        "pipelines": pipelines,
    })))
}

/// POST /api/pipelines/:pipeline_id/resume - Continue after script review
pub async fn resume_pipeline(
    Path(pipeline_id): Path<PipelineId>,
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<ResumePayload>,
) -> Result<impl IntoResponse, PipelineError> {
    let response = state.orchestrator.resume(&pipeline_id, payload).await?;
    if !response.success {
        tracing::warn!(pipeline_id = %pipeline_id, errors = ?response.errors, "Resume rejected");
    }
    Ok(Json(response))
}

pub fn pipeline_routes() -> Router {
    Router::new()
        .route("/api/pipelines", post(create_pipeline).get(list_pipelines))
        .route("/api/pipelines/:pipeline_id", get(get_pipeline))
        .route("/api/pipelines/:pipeline_id/resume", post(resume_pipeline))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Uri;

    fn list_query(uri: &str) -> ListQuery {
        let uri: Uri = uri.parse().unwrap();
        Query::<ListQuery>::try_from_uri(&uri).unwrap().0
    }

    #[test]
    fn test_missing_user_id_is_an_invalid_request() {
        for uri in ["/api/pipelines", "/api/pipelines?user_id=", "/api/pipelines?user_id=%20"] {
            let err = list_query(uri).user_id().unwrap_err();
            assert!(matches!(err, PipelineError::InvalidRequest(_)));
            assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        }
    }

    #[test]
    fn test_user_id_is_trimmed() {
        assert_eq!(list_query("/api/pipelines?user_id=%20u1%20").user_id().unwrap(), "u1");
    }
}
