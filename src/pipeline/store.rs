// src/pipeline/store.rs
//! Pipeline persistence - in-memory for development/tests, PostgreSQL for production

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::info;

use super::checkpoint::Checkpoint;
use super::executor::WorkingPayload;
use super::{Feature, Pipeline, PipelineId};
use crate::error::{PipelineError, PipelineResult};

/// Storage seam for pipeline records and pause checkpoints.
/// Only the state machine writes pipeline records.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn insert(&self, pipeline: &Pipeline) -> PipelineResult<()>;
    async fn update(&self, pipeline: &Pipeline) -> PipelineResult<()>;
    async fn get(&self, id: &str) -> PipelineResult<Option<Pipeline>>;
    async fn list_for_user(&self, user_id: &str) -> PipelineResult<Vec<Pipeline>>;

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> PipelineResult<()>;
    async fn load_checkpoint(&self, pipeline_id: &str) -> PipelineResult<Option<Checkpoint>>;
    async fn delete_checkpoint(&self, pipeline_id: &str) -> PipelineResult<()>;

    /// Remove terminal pipelines (and their checkpoints) completed before `cutoff`
    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> PipelineResult<u64>;
}

#[derive(Default)]
pub struct InMemoryPipelineStore {
    pipelines: RwLock<HashMap<PipelineId, Pipeline>>,
    checkpoints: RwLock<HashMap<PipelineId, Checkpoint>>,
}

impl InMemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineStore for InMemoryPipelineStore {
    async fn insert(&self, pipeline: &Pipeline) -> PipelineResult<()> {
        let mut pipelines = self.pipelines.write().await;
        if pipelines.contains_key(&pipeline.id) {
            return Err(PipelineError::InvalidRequest(format!(
                "pipeline {} already exists",
                pipeline.id
            )));
        }
        pipelines.insert(pipeline.id.clone(), pipeline.clone());
        Ok(())
    }

    async fn update(&self, pipeline: &Pipeline) -> PipelineResult<()> {
        let mut pipelines = self.pipelines.write().await;
        match pipelines.get_mut(&pipeline.id) {
            Some(existing) => {
                *existing = pipeline.clone();
                Ok(())
            }
            None => Err(PipelineError::NotFound(pipeline.id.clone())),
        }
    }

    async fn get(&self, id: &str) -> PipelineResult<Option<Pipeline>> {
        let pipelines = self.pipelines.read().await;
        Ok(pipelines.get(id).cloned())
    }

    async fn list_for_user(&self, user_id: &str) -> PipelineResult<Vec<Pipeline>> {
        let pipelines = self.pipelines.read().await;
        let mut owned: Vec<Pipeline> = pipelines
            .values()
            .filter(|p| p.user_id.as_deref() == Some(user_id))
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(owned)
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> PipelineResult<()> {
        let mut checkpoints = self.checkpoints.write().await;
        checkpoints.insert(checkpoint.pipeline_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load_checkpoint(&self, pipeline_id: &str) -> PipelineResult<Option<Checkpoint>> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints.get(pipeline_id).cloned())
    }

    async fn delete_checkpoint(&self, pipeline_id: &str) -> PipelineResult<()> {
        let mut checkpoints = self.checkpoints.write().await;
        checkpoints.remove(pipeline_id);
        Ok(())
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> PipelineResult<u64> {
        let mut pipelines = self.pipelines.write().await;
        let expired: Vec<PipelineId> = pipelines
            .values()
            .filter(|p| p.is_terminal() && p.completed_at.map_or(false, |at| at < cutoff))
            .map(|p| p.id.clone())
            .collect();

        let mut checkpoints = self.checkpoints.write().await;
        for id in &expired {
            pipelines.remove(id);
            checkpoints.remove(id);
        }
        Ok(expired.len() as u64)
    }
}

/// PostgreSQL-backed store. Schema lives in `migrations/`.
pub struct PgPipelineStore {
    pool: PgPool,
}

impl PgPipelineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const PIPELINE_COLUMNS: &str = "id, status, mode, features, current_step, progress, \
    error_message, error_details, processing_time_ms, duration_seconds, tier, user_id, \
    voice, export_format, created_at, updated_at, started_at, completed_at, slide_deck_id, \
    narrated_deck_id, tts_narration_id, paused_at, pause_reason, revision";

#[async_trait]
impl PipelineStore for PgPipelineStore {
    async fn insert(&self, pipeline: &Pipeline) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pipelines (
                id, status, mode, features, current_step, progress,
                error_message, error_details, processing_time_ms, duration_seconds,
                tier, user_id, voice, export_format,
                created_at, updated_at, started_at, completed_at,
                slide_deck_id, narrated_deck_id, tts_narration_id,
                paused_at, pause_reason, revision
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24
            )
            "#,
        )
        .bind(&pipeline.id)
        .bind(pipeline.status.as_str())
        .bind(pipeline.mode.as_str())
        .bind(pipeline.features_csv())
        .bind(&pipeline.current_step)
        .bind(pipeline.progress as i16)
        .bind(&pipeline.error_message)
        .bind(&pipeline.error_details)
        .bind(pipeline.processing_time_ms)
        .bind(pipeline.duration_seconds)
        .bind(pipeline.tier.as_str())
        .bind(&pipeline.user_id)
        .bind(&pipeline.voice)
        .bind(pipeline.export_format.as_str())
        .bind(pipeline.created_at)
        .bind(pipeline.updated_at)
        .bind(pipeline.started_at)
        .bind(pipeline.completed_at)
        .bind(&pipeline.slide_deck_id)
        .bind(&pipeline.narrated_deck_id)
        .bind(&pipeline.tts_narration_id)
        .bind(pipeline.paused_at)
        .bind(pipeline.pause_reason.map(|r| r.as_str()))
        .bind(pipeline.revision as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, pipeline: &Pipeline) -> PipelineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pipelines SET
                status = $2, current_step = $3, progress = $4,
                error_message = $5, error_details = $6,
                processing_time_ms = $7, duration_seconds = $8,
                updated_at = $9, started_at = $10, completed_at = $11,
                slide_deck_id = $12, narrated_deck_id = $13, tts_narration_id = $14,
                paused_at = $15, pause_reason = $16, revision = $17
            WHERE id = $1
            "#,
        )
        .bind(&pipeline.id)
        .bind(pipeline.status.as_str())
        .bind(&pipeline.current_step)
        .bind(pipeline.progress as i16)
        .bind(&pipeline.error_message)
        .bind(&pipeline.error_details)
        .bind(pipeline.processing_time_ms)
        .bind(pipeline.duration_seconds)
        .bind(pipeline.updated_at)
        .bind(pipeline.started_at)
        .bind(pipeline.completed_at)
        .bind(&pipeline.slide_deck_id)
        .bind(&pipeline.narrated_deck_id)
        .bind(&pipeline.tts_narration_id)
        .bind(pipeline.paused_at)
        .bind(pipeline.pause_reason.map(|r| r.as_str()))
        .bind(pipeline.revision as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::NotFound(pipeline.id.clone()));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> PipelineResult<Option<Pipeline>> {
        let query = format!("SELECT {} FROM pipelines WHERE id = $1", PIPELINE_COLUMNS);
        let row = sqlx::query_as::<_, PipelineRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Pipeline::try_from).transpose()
    }

    async fn list_for_user(&self, user_id: &str) -> PipelineResult<Vec<Pipeline>> {
        let query = format!(
            "SELECT {} FROM pipelines WHERE user_id = $1 ORDER BY created_at DESC",
            PIPELINE_COLUMNS
        );
        let rows = sqlx::query_as::<_, PipelineRow>(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Pipeline::try_from).collect()
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> PipelineResult<()> {
        let payload = serde_json::to_value(&checkpoint.payload)?;
        sqlx::query(
            r#"
            INSERT INTO pipeline_checkpoints (pipeline_id, stage_index, stage, payload, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (pipeline_id) DO UPDATE SET
                stage_index = EXCLUDED.stage_index,
                stage = EXCLUDED.stage,
                payload = EXCLUDED.payload,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(&checkpoint.pipeline_id)
        .bind(checkpoint.stage_index as i32)
        .bind(checkpoint.stage.as_str())
        .bind(payload)
        .bind(checkpoint.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_checkpoint(&self, pipeline_id: &str) -> PipelineResult<Option<Checkpoint>> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT pipeline_id, stage_index, stage, payload, created_at
            FROM pipeline_checkpoints
            WHERE pipeline_id = $1
            "#,
        )
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let payload: WorkingPayload = serde_json::from_value(row.payload)?;
                Ok(Some(Checkpoint {
                    pipeline_id: row.pipeline_id,
                    stage_index: row.stage_index.max(0) as usize,
                    stage: row.stage.parse()?,
                    payload,
                    created_at: row.created_at,
                }))
            }
            None => Ok(None),
        }
    }

    async fn delete_checkpoint(&self, pipeline_id: &str) -> PipelineResult<()> {
        sqlx::query("DELETE FROM pipeline_checkpoints WHERE pipeline_id = $1")
            .bind(pipeline_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> PipelineResult<u64> {
        // Checkpoints cascade
        let result = sqlx::query(
            "DELETE FROM pipelines WHERE status IN ('success', 'failed') AND completed_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        info!("🧹 Removed {} finished pipelines", result.rows_affected());
        Ok(result.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct PipelineRow {
    id: String,
    status: String,
    mode: String,
    features: String,
    current_step: String,
    progress: i16,
    error_message: Option<String>,
    error_details: Option<serde_json::Value>,
    processing_time_ms: Option<i64>,
    duration_seconds: Option<f64>,
    tier: String,
    user_id: Option<String>,
    voice: Option<String>,
    export_format: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    slide_deck_id: Option<String>,
    narrated_deck_id: Option<String>,
    tts_narration_id: Option<String>,
    paused_at: Option<DateTime<Utc>>,
    pause_reason: Option<String>,
    revision: i64,
}

impl TryFrom<PipelineRow> for Pipeline {
    type Error = PipelineError;

    fn try_from(row: PipelineRow) -> Result<Self, Self::Error> {
        let features: BTreeSet<Feature> = row
            .features
            .split(',')
            .filter(|f| !f.is_empty())
            .map(|f| f.parse::<Feature>())
            .collect::<PipelineResult<_>>()
            .map_err(|e| PipelineError::Corrupt(format!("pipeline {}: {}", row.id, e)))?;

        Ok(Pipeline {
            status: row.status.parse()?,
            mode: row.mode.parse()?,
            features,
            current_step: row.current_step,
            progress: row.progress.clamp(0, 100) as u8,
            error_message: row.error_message,
            error_details: row.error_details,
            processing_time_ms: row.processing_time_ms,
            duration_seconds: row.duration_seconds,
            tier: row.tier.parse()?,
            user_id: row.user_id,
            voice: row.voice,
            export_format: row.export_format.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            slide_deck_id: row.slide_deck_id,
            narrated_deck_id: row.narrated_deck_id,
            tts_narration_id: row.tts_narration_id,
            paused_at: row.paused_at,
            pause_reason: row.pause_reason.map(|r| r.parse()).transpose()?,
            revision: row.revision.max(0) as u64,
            id: row.id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    pipeline_id: String,
    stage_index: i32,
    stage: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::executor::Stage;
    use crate::pipeline::testing::pipeline_with;
    use crate::pipeline::{Mode, PipelineStatus};

    #[tokio::test]
    async fn test_insert_rejects_duplicate_ids() {
        let store = InMemoryPipelineStore::new();
        let pipeline = pipeline_with(Mode::Auto, "script");
        store.insert(&pipeline).await.unwrap();
        assert!(store.insert(&pipeline).await.is_err());
    }

    #[tokio::test]
    async fn test_update_unknown_pipeline_is_not_found() {
        let store = InMemoryPipelineStore::new();
        let pipeline = pipeline_with(Mode::Auto, "script");
        assert!(matches!(
            store.update(&pipeline).await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_for_user_filters_by_owner() {
        let store = InMemoryPipelineStore::new();
        let mut mine = pipeline_with(Mode::Auto, "script");
        mine.user_id = Some("u1".to_string());
        let mut theirs = pipeline_with(Mode::Auto, "script");
        theirs.user_id = Some("u2".to_string());
        store.insert(&mine).await.unwrap();
        store.insert(&theirs).await.unwrap();

        let listed = store.list_for_user("u1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, mine.id);
    }

    #[tokio::test]
    async fn test_delete_finished_before_keeps_live_pipelines() {
        let store = InMemoryPipelineStore::new();
        let live = pipeline_with(Mode::Hybrid, "script,voiceover");
        let mut done = pipeline_with(Mode::Auto, "script");
        done.status = PipelineStatus::Success;
        done.completed_at = Some(Utc::now() - chrono::Duration::hours(48));
        store.insert(&live).await.unwrap();
        store.insert(&done).await.unwrap();
        store
            .save_checkpoint(&Checkpoint::new(&done.id, 1, Stage::ScriptReview, WorkingPayload::default()))
            .await
            .unwrap();

        let removed = store
            .delete_finished_before(Utc::now() - chrono::Duration::hours(24))
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(store.get(&live.id).await.unwrap().is_some());
        assert!(store.get(&done.id).await.unwrap().is_none());
        assert!(store.load_checkpoint(&done.id).await.unwrap().is_none());
    }
}
