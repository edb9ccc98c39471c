//! ASR task engine: submission, vendor polling and task management.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{FromRow, PgPool};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::asr::client::VendorStatus;
use crate::clock::new_task_id;
use crate::errors::AppError;
use crate::identity::Caller;
use crate::response::PageQuery;
use crate::state::AppState;
use crate::tasks::dispatcher::Job;
use crate::tasks::{self, ensure_retryable, TaskKind, TaskStatus, OPEN_GUARD};

pub const AUDIO_FORMATS: [&str; 4] = ["mp3", "wav", "ogg", "raw"];

/// Progress reported once the vendor has accepted the job.
const ACCEPTED_PROGRESS: i32 = 10;

/// Processing tasks refreshed per scheduler tick.
const REFRESH_BATCH: i64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AsrTask {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: TaskStatus,
    pub progress: i32,
    pub error_message: Option<String>,
    pub audio_url: String,
    pub audio_format: String,
    pub options: Value,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub audio_url: String,
    pub audio_format: String,
    #[serde(default)]
    pub options: Option<Value>,
}

pub fn validate_format(format: &str) -> Result<(), AppError> {
    if AUDIO_FORMATS.contains(&format) {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "audio_format must be one of {}, got '{format}'",
            AUDIO_FORMATS.join(", ")
        )))
    }
}

/// Vendor defaults overlaid with the caller's options.
pub fn merge_options(overrides: Option<&Value>) -> Result<Value, AppError> {
    let mut options = json!({ "enableItn": true, "enableDdc": true });
    match overrides {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            if let Value::Object(base) = &mut options {
                for (k, v) in map {
                    base.insert(k.clone(), v.clone());
                }
            }
        }
        Some(_) => {
            return Err(AppError::Validation(
                "options must be a JSON object".to_string(),
            ))
        }
    }
    Ok(options)
}

async fn fetch(pool: &PgPool, id: Uuid) -> Result<Option<AsrTask>, sqlx::Error> {
    sqlx::query_as::<_, AsrTask>("SELECT * FROM asr_tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn require(pool: &PgPool, id: Uuid) -> Result<AsrTask, AppError> {
    fetch(pool, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("ASR task {id} not found")))
}

// ────────────────────────────────────────────────────────────────────────────
// Submission & worker
// ────────────────────────────────────────────────────────────────────────────

pub async fn submit(state: &AppState, user_id: Uuid, request: &SubmitRequest) -> Result<AsrTask, AppError> {
    validate_format(&request.audio_format)?;
    if request.audio_url.trim().is_empty() {
        return Err(AppError::Validation("audio_url cannot be empty".to_string()));
    }
    let options = merge_options(request.options.as_ref())?;
    let now = state.clock.now();

    let task = sqlx::query_as::<_, AsrTask>(
        r#"
        INSERT INTO asr_tasks (id, user_id, status, progress, audio_url, audio_format, options, created_at, updated_at)
        VALUES ($1, $2, 'pending', 0, $3, $4, $5, $6, $6)
        RETURNING *
        "#,
    )
    .bind(new_task_id())
    .bind(user_id)
    .bind(request.audio_url.trim())
    .bind(&request.audio_format)
    .bind(&options)
    .bind(now)
    .fetch_one(&state.db)
    .await?;

    info!("ASR task {} submitted by {user_id}", task.id);
    state.dispatcher.enqueue(Job {
        kind: TaskKind::Asr,
        id: task.id,
    });
    Ok(task)
}

/// Worker body: hands the audio to the vendor and records the outcome.
pub async fn run_submission(state: &AppState, id: Uuid) {
    let task = match fetch(&state.db, id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            debug!("ASR task {id} vanished before it ran");
            return;
        }
        Err(e) => {
            error!("Failed to load ASR task {id}: {e}");
            return;
        }
    };

    let result = state
        .asr
        .submit(task.id, &task.audio_url, &task.audio_format, &task.options)
        .await;

    let written = match result {
        Ok(()) => {
            tasks::mark_processing(&state.db, TaskKind::Asr, id, ACCEPTED_PROGRESS, state.clock.now()).await
        }
        Err(e) => {
            warn!("ASR vendor rejected task {id}: {e}");
            tasks::mark_failed(&state.db, TaskKind::Asr, id, &e.to_string(), state.clock.now()).await
        }
    };
    if let Err(e) = written {
        error!("Failed to record ASR task {id} state: {e}");
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Reads & polling
// ────────────────────────────────────────────────────────────────────────────

pub async fn get(pool: &PgPool, caller: &Caller, id: Uuid) -> Result<AsrTask, AppError> {
    let task = require(pool, id).await?;
    caller.ensure_owner(task.user_id)?;
    Ok(task)
}

pub async fn list(pool: &PgPool, user_id: Uuid, page: PageQuery) -> Result<(Vec<AsrTask>, i64), AppError> {
    let items = sqlx::query_as::<_, AsrTask>(
        "SELECT * FROM asr_tasks WHERE user_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3",
    )
    .bind(user_id)
    .bind(page.limit)
    .bind(page.offset())
    .fetch_all(pool)
    .await?;

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM asr_tasks WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await?;

    Ok((items, total))
}

pub async fn poll(state: &AppState, caller: &Caller, id: Uuid) -> Result<AsrTask, AppError> {
    let task = get(&state.db, caller, id).await?;
    refresh(state, task).await
}

/// Re-queries the vendor for a processing task. Terminal and not-yet-accepted
/// tasks are returned unchanged without an outbound call.
pub async fn refresh(state: &AppState, task: AsrTask) -> Result<AsrTask, AppError> {
    if task.status != TaskStatus::Processing {
        return Ok(task);
    }

    let vendor = state
        .asr
        .query(task.id)
        .await
        .map_err(|e| AppError::Upstream(e.to_string()))?;

    let now = state.clock.now();
    match vendor {
        VendorStatus::Processing => return Ok(task),
        VendorStatus::Completed(result) => {
            let sql = format!(
                "UPDATE asr_tasks SET status = 'completed', progress = 100, result = $2, updated_at = $3 \
                 WHERE id = $1 AND {OPEN_GUARD}"
            );
            let updated = sqlx::query(&sql)
                .bind(task.id)
                .bind(&result)
                .bind(now)
                .execute(&state.db)
                .await?
                .rows_affected();
            if updated == 1 {
                info!("ASR task {} completed", task.id);
            }
        }
        VendorStatus::Failed(message) => {
            tasks::mark_failed(&state.db, TaskKind::Asr, task.id, &message, now).await?;
        }
    }

    require(&state.db, task.id).await
}

/// Scheduler hook: refreshes every processing task. Returns how many moved to
/// a terminal state.
pub async fn refresh_processing(state: &AppState) -> Result<usize, AppError> {
    let ids: Vec<Uuid> = sqlx::query_scalar(
        "SELECT id FROM asr_tasks WHERE status = 'processing' ORDER BY updated_at LIMIT $1",
    )
    .bind(REFRESH_BATCH)
    .fetch_all(&state.db)
    .await?;

    let mut finished = 0;
    for id in ids {
        let Some(task) = fetch(&state.db, id).await? else {
            continue;
        };
        match refresh(state, task).await {
            Ok(task) if task.status.is_terminal() => finished += 1,
            Ok(_) => {}
            Err(e) => warn!("ASR refresh for {id} failed: {e}"),
        }
    }
    Ok(finished)
}

// ────────────────────────────────────────────────────────────────────────────
// Retry & delete
// ────────────────────────────────────────────────────────────────────────────

pub async fn retry(state: &AppState, caller: &Caller, id: Uuid) -> Result<AsrTask, AppError> {
    let task = get(&state.db, caller, id).await?;
    ensure_retryable(task.status)?;

    tasks::reset_for_retry(&state.db, TaskKind::Asr, id, state.clock.now()).await?;
    state.dispatcher.enqueue(Job {
        kind: TaskKind::Asr,
        id,
    });
    require(&state.db, id).await
}

pub async fn delete(pool: &PgPool, caller: &Caller, id: Uuid) -> Result<(), AppError> {
    get(pool, caller, id).await?;
    tasks::delete(pool, TaskKind::Asr, id).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepted_formats() {
        for format in AUDIO_FORMATS {
            assert!(validate_format(format).is_ok());
        }
        assert!(matches!(validate_format("flac"), Err(AppError::Validation(_))));
        assert!(matches!(validate_format("MP3"), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_default_options() {
        let options = merge_options(None).unwrap();
        assert_eq!(options, json!({"enableItn": true, "enableDdc": true}));
        assert_eq!(merge_options(Some(&Value::Null)).unwrap(), options);
    }

    #[test]
    fn test_overrides_replace_defaults() {
        let options = merge_options(Some(&json!({"enableItn": false, "speakers": 2}))).unwrap();
        assert_eq!(options["enableItn"], false);
        assert_eq!(options["enableDdc"], true);
        assert_eq!(options["speakers"], 2);
    }

    #[test]
    fn test_non_object_options_rejected() {
        assert!(matches!(
            merge_options(Some(&json!(["x"]))),
            Err(AppError::Validation(_))
        ));
    }

    fn task_in(status: TaskStatus) -> AsrTask {
        let at = chrono::DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        AsrTask {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            status,
            progress: if status == TaskStatus::Completed { 100 } else { 0 },
            error_message: None,
            audio_url: "https://cdn.example.com/a.mp3".to_string(),
            audio_format: "mp3".to_string(),
            options: merge_options(None).unwrap(),
            result: (status == TaskStatus::Completed).then(|| json!({"text": "hello"})),
            created_at: at,
            updated_at: at,
        }
    }

    /// The test state points at an unresolvable vendor and an unconnected
    /// pool, so any outbound call would surface as an error.
    #[tokio::test]
    async fn test_refresh_skips_vendor_unless_processing() {
        let state = crate::state::test_state();
        for status in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Pending] {
            let task = task_in(status);
            let refreshed = refresh(&state, task.clone()).await.unwrap();
            assert_eq!(refreshed.status, status);
            assert_eq!(refreshed.result, task.result);
            assert_eq!(refreshed.updated_at, task.updated_at);
        }
    }

    #[tokio::test]
    async fn test_refresh_of_processing_task_reaches_vendor() {
        let state = crate::state::test_state();
        let result = refresh(&state, task_in(TaskStatus::Processing)).await;
        assert!(matches!(result, Err(AppError::Upstream(_))));
    }
}
