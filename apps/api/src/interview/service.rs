//! Interview reviews: a completed transcription composed with an LLM analysis.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::asr::service::{self as asr, AsrTask};
use crate::clock::new_task_id;
use crate::errors::AppError;
use crate::identity::Caller;
use crate::response::PageQuery;
use crate::state::AppState;
use crate::tasks::TaskStatus;
use crate::workflow::invoker::{self, Invocation, InvokeRequest};
use crate::workflow::site_variable;

/// Site variable naming the workflow that analyses interviews.
pub const ANALYSIS_WORKFLOW_KEY: &str = "interview-analysis-workflow";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Transcribing,
    Analyzing,
    Completed,
    Failed,
}

impl ReviewStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Transcribing => "transcribing",
            ReviewStatus::Analyzing => "analyzing",
            ReviewStatus::Completed => "completed",
            ReviewStatus::Failed => "failed",
        }
    }

    /// Analysis may be (re)started only from `pending` or `failed`.
    pub fn can_start_analysis(self) -> bool {
        matches!(self, ReviewStatus::Pending | ReviewStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewMetadata {
    pub main_audio_id: Uuid,
    #[serde(default)]
    pub workflow_id: Option<Uuid>,
    pub status: ReviewStatus,
    #[serde(default)]
    pub asr_result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InterviewReview {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Analysis output; null until the review completes.
    pub data: Option<Value>,
    pub metadata: Json<ReviewMetadata>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateReviewRequest {
    pub main_audio_id: Uuid,
    /// Snapshot to analyse. Defaults to the ASR task's stored result.
    #[serde(default)]
    pub asr_result: Option<Value>,
}

async fn require(pool: &PgPool, id: Uuid) -> Result<InterviewReview, AppError> {
    sqlx::query_as::<_, InterviewReview>("SELECT * FROM interview_reviews WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Interview review {id} not found")))
}

/// A review is built from the caller's own completed transcription. The admin
/// override of other reads does not apply here.
fn ensure_source_audio(audio: &AsrTask, user_id: Uuid) -> Result<(), AppError> {
    if audio.user_id != user_id {
        return Err(AppError::Forbidden);
    }
    if audio.status != TaskStatus::Completed {
        return Err(AppError::InvalidState(format!(
            "ASR task {} is not completed",
            audio.id
        )));
    }
    Ok(())
}

pub async fn create(
    pool: &PgPool,
    now: DateTime<Utc>,
    caller: &Caller,
    request: &CreateReviewRequest,
) -> Result<InterviewReview, AppError> {
    let audio = asr::require(pool, request.main_audio_id).await?;
    ensure_source_audio(&audio, caller.user_id)?;

    let asr_result = request
        .asr_result
        .clone()
        .or(audio.result)
        .unwrap_or(Value::Null);
    let metadata = ReviewMetadata {
        main_audio_id: audio.id,
        workflow_id: None,
        status: ReviewStatus::Pending,
        asr_result,
        error_message: None,
    };

    let review = sqlx::query_as::<_, InterviewReview>(
        r#"
        INSERT INTO interview_reviews (id, user_id, data, metadata, created_at, updated_at)
        VALUES ($1, $2, NULL, $3, $4, $4)
        RETURNING *
        "#,
    )
    .bind(new_task_id())
    .bind(caller.user_id)
    .bind(Json(&metadata))
    .bind(now)
    .fetch_one(pool)
    .await?;

    info!("Interview review {} created for user {}", review.id, caller.user_id);
    Ok(review)
}

pub async fn get(pool: &PgPool, caller: &Caller, id: Uuid) -> Result<InterviewReview, AppError> {
    let review = require(pool, id).await?;
    caller.ensure_owner(review.user_id)?;
    Ok(review)
}

pub async fn list(
    pool: &PgPool,
    user_id: Uuid,
    page: PageQuery,
) -> Result<(Vec<InterviewReview>, i64), AppError> {
    let items = sqlx::query_as::<_, InterviewReview>(
        "SELECT * FROM interview_reviews WHERE user_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3",
    )
    .bind(user_id)
    .bind(page.limit)
    .bind(page.offset())
    .fetch_all(pool)
    .await?;

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM interview_reviews WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await?;

    Ok((items, total))
}

async fn analysis_workflow(pool: &PgPool) -> Result<Uuid, AppError> {
    let configured = site_variable(pool, ANALYSIS_WORKFLOW_KEY).await?.ok_or_else(|| {
        AppError::InvalidState(format!(
            "interview analysis is not configured: site variable '{ANALYSIS_WORKFLOW_KEY}' is empty"
        ))
    })?;
    Uuid::parse_str(&configured).map_err(|_| {
        AppError::InvalidState(format!(
            "site variable '{ANALYSIS_WORKFLOW_KEY}' is not a workflow id: {configured}"
        ))
    })
}

/// Runs the analysis workflow and waits for it. The run and its terminal
/// write happen on a spawned task so a dropped request cannot leave the
/// review stuck in `analyzing`.
pub async fn trigger_analysis(state: &AppState, caller: &Caller, id: Uuid) -> Result<InterviewReview, AppError> {
    let review = get(&state.db, caller, id).await?;
    if !review.metadata.status.can_start_analysis() {
        return Err(AppError::InvalidState(format!(
            "review is {}, analysis can only start from pending or failed",
            review.metadata.status.as_str()
        )));
    }
    let workflow_id = analysis_workflow(&state.db).await?;

    let claimed = sqlx::query_as::<_, InterviewReview>(
        r#"
        UPDATE interview_reviews
        SET metadata = (metadata - 'error_message')
                       || jsonb_build_object('status', 'analyzing', 'workflow_id', $2::text),
            updated_at = $3
        WHERE id = $1 AND metadata->>'status' IN ('pending', 'failed')
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(workflow_id.to_string())
    .bind(state.clock.now())
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| AppError::InvalidState("review analysis is already running".to_string()))?;

    info!("Interview review {id} analysis started with workflow {workflow_id}");

    let request = InvokeRequest {
        workflow_id,
        user_id: claimed.user_id,
        resume_id: None,
        inputs: json!({ "asr_result": claimed.metadata.asr_result }),
    };
    let task_state = state.clone();
    tokio::spawn(async move { run_analysis(&task_state, id, &request).await })
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("analysis task aborted: {e}")))?
}

async fn run_analysis(state: &AppState, id: Uuid, request: &InvokeRequest) -> Result<InterviewReview, AppError> {
    let outcome = invoker::invoke(state, request).await;
    let now = state.clock.now();

    match outcome {
        Ok(Invocation::Completed(data)) => {
            sqlx::query(
                r#"
                UPDATE interview_reviews
                SET data = $2,
                    metadata = metadata || '{"status": "completed"}'::jsonb,
                    updated_at = $3
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(&data)
            .bind(now)
            .execute(&state.db)
            .await?;
            info!("Interview review {id} completed");
        }
        Ok(Invocation::Rejected(message)) => mark_failed(&state.db, id, &message, now).await?,
        Err(e) => mark_failed(&state.db, id, &e.to_string(), now).await?,
    }

    require(&state.db, id).await
}

async fn mark_failed(pool: &PgPool, id: Uuid, message: &str, now: DateTime<Utc>) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE interview_reviews
        SET metadata = metadata || jsonb_build_object('status', 'failed', 'error_message', $2::text),
            updated_at = $3
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(message)
    .bind(now)
    .execute(pool)
    .await?;
    warn!("Interview review {id} analysis failed: {message}");
    Ok(())
}
