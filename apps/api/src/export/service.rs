//! PDF export engine: task creation, the render worker and file access.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::new_task_id;
use crate::errors::AppError;
use crate::export::token;
use crate::identity::Caller;
use crate::models::resume::ResumeRow;
use crate::state::AppState;
use crate::tasks::dispatcher::Job;
use crate::tasks::{self, TaskKind, TaskStatus, OPEN_GUARD};

const RENDERING_PROGRESS: i32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PdfExportTask {
    pub id: Uuid,
    pub user_id: Uuid,
    pub resume_id: Uuid,
    pub status: TaskStatus,
    pub progress: i32,
    pub error_message: Option<String>,
    #[serde(skip)]
    pub token: String,
    pub pdf_file_path: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What the renderer receives from `/export/:taskId`.
#[derive(Debug, Clone, Serialize)]
pub struct RenderData {
    pub task_id: Uuid,
    pub resume_id: Uuid,
    pub title: String,
    pub content: Value,
}

pub fn render_url(public_base_url: &str, task_id: Uuid, token: &str) -> String {
    format!(
        "{}/export/{task_id}?token={token}",
        public_base_url.trim_end_matches('/')
    )
}

/// `<uploads>/pdf/YYYY-MM-DD/<taskId>.pdf`, dated by the UTC completion day.
pub fn pdf_path(uploads_dir: &Path, completed_at: DateTime<Utc>, task_id: Uuid) -> PathBuf {
    uploads_dir
        .join("pdf")
        .join(completed_at.format("%Y-%m-%d").to_string())
        .join(format!("{task_id}.pdf"))
}

pub async fn write_pdf(
    uploads_dir: &Path,
    completed_at: DateTime<Utc>,
    task_id: Uuid,
    body: &[u8],
) -> std::io::Result<PathBuf> {
    let path = pdf_path(uploads_dir, completed_at, task_id);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, body).await?;
    Ok(path)
}

async fn fetch(pool: &PgPool, id: Uuid) -> Result<Option<PdfExportTask>, sqlx::Error> {
    sqlx::query_as::<_, PdfExportTask>("SELECT * FROM pdf_export_tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

async fn require(pool: &PgPool, id: Uuid) -> Result<PdfExportTask, AppError> {
    fetch(pool, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Export task {id} not found")))
}

async fn require_resume(pool: &PgPool, id: Uuid) -> Result<ResumeRow, AppError> {
    sqlx::query_as::<_, ResumeRow>("SELECT * FROM resumes WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Resume {id} not found")))
}

// ────────────────────────────────────────────────────────────────────────────
// Creation & worker
// ────────────────────────────────────────────────────────────────────────────

pub async fn create_task(state: &AppState, caller: &Caller, resume_id: Uuid) -> Result<PdfExportTask, AppError> {
    let resume = require_resume(&state.db, resume_id).await?;
    if resume.user_id != caller.user_id {
        return Err(AppError::Forbidden);
    }

    let task = sqlx::query_as::<_, PdfExportTask>(
        r#"
        INSERT INTO pdf_export_tasks (id, user_id, resume_id, status, progress, token, created_at, updated_at)
        VALUES ($1, $2, $3, 'pending', 0, $4, $5, $5)
        RETURNING *
        "#,
    )
    .bind(new_task_id())
    .bind(caller.user_id)
    .bind(resume.id)
    .bind(token::generate_token())
    .bind(state.clock.now())
    .fetch_one(&state.db)
    .await?;

    info!("PDF export {} created for resume {}", task.id, resume.id);
    state.dispatcher.enqueue(Job {
        kind: TaskKind::PdfExport,
        id: task.id,
    });
    Ok(task)
}

/// Worker body: renders the resume and stores the PDF.
pub async fn run_render(state: &AppState, id: Uuid) {
    let task = match fetch(&state.db, id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            debug!("Export task {id} vanished before it ran");
            return;
        }
        Err(e) => {
            error!("Failed to load export task {id}: {e}");
            return;
        }
    };

    match tasks::mark_processing(&state.db, TaskKind::PdfExport, id, RENDERING_PROGRESS, state.clock.now()).await {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => {
            error!("Failed to start export task {id}: {e}");
            return;
        }
    }

    let outcome = render_and_store(state, &task).await;
    let written = match outcome {
        Ok((path, completed_at)) => complete(&state.db, id, &path, completed_at).await.map(|_| ()),
        Err(message) => {
            warn!("Export task {id} failed: {message}");
            tasks::mark_failed(&state.db, TaskKind::PdfExport, id, &message, state.clock.now())
                .await
                .map(|_| ())
        }
    };
    if let Err(e) = written {
        error!("Failed to record export task {id} state: {e}");
    }
}

/// Renders the PDF and writes it under the completion day, which the caller
/// must also record as `completed_at`.
async fn render_and_store(state: &AppState, task: &PdfExportTask) -> Result<(PathBuf, DateTime<Utc>), String> {
    let url = render_url(&state.config.public_base_url, task.id, &task.token);
    let body = state
        .renderer
        .render(task.id, &url)
        .await
        .map_err(|e| e.to_string())?;

    let completed_at = state.clock.now();
    let path = write_pdf(Path::new(&state.config.uploads_dir), completed_at, task.id, &body)
        .await
        .map_err(|e| format!("failed to write PDF: {e}"))?;
    Ok((path, completed_at))
}

/// Records the stored PDF. When the row is gone or already closed, the file
/// has no owner and is removed.
async fn complete(pool: &PgPool, id: Uuid, path: &Path, now: DateTime<Utc>) -> Result<bool, sqlx::Error> {
    let sql = format!(
        "UPDATE pdf_export_tasks \
         SET status = 'completed', progress = 100, pdf_file_path = $2, completed_at = $3, updated_at = $3 \
         WHERE id = $1 AND {OPEN_GUARD}"
    );
    let updated = sqlx::query(&sql)
        .bind(id)
        .bind(path.to_string_lossy().as_ref())
        .bind(now)
        .execute(pool)
        .await?
        .rows_affected();
    if updated == 1 {
        info!("PDF export {id} completed at {}", path.display());
        return Ok(true);
    }

    debug!("Export task {id} is gone or closed, discarding {}", path.display());
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!("Failed to remove orphaned PDF {}: {e}", path.display());
    }
    Ok(false)
}

// ────────────────────────────────────────────────────────────────────────────
// Reads
// ────────────────────────────────────────────────────────────────────────────

pub async fn get(pool: &PgPool, caller: &Caller, id: Uuid) -> Result<PdfExportTask, AppError> {
    let task = require(pool, id).await?;
    caller.ensure_owner(task.user_id)?;
    Ok(task)
}

/// The stored PDF, only once the task completed and the file is still there.
pub async fn get_pdf_file_path(pool: &PgPool, caller: &Caller, id: Uuid) -> Result<PathBuf, AppError> {
    let task = get(pool, caller, id).await?;
    if task.status != TaskStatus::Completed {
        return Err(AppError::InvalidState("PDF is not ready yet".to_string()));
    }
    let path = task
        .pdf_file_path
        .map(PathBuf::from)
        .ok_or_else(|| AppError::NotFound(format!("PDF for export {id} not found")))?;
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(AppError::NotFound(format!("PDF for export {id} no longer exists")));
    }
    Ok(path)
}

/// Renderer-side fetch, authorised by the task's token rather than a caller.
pub async fn render_data(
    pool: &PgPool,
    now: DateTime<Utc>,
    task_id: Uuid,
    presented: &str,
) -> Result<RenderData, AppError> {
    let task = require(pool, task_id).await?;
    if !token::verify(&task.token, presented, task.created_at, now) {
        warn!("Rejected render token for export {task_id}");
        return Err(AppError::Forbidden);
    }

    let resume = require_resume(pool, task.resume_id).await?;
    Ok(RenderData {
        task_id: task.id,
        resume_id: resume.id,
        title: resume.title,
        content: resume.content,
    })
}
