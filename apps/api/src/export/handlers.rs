//! Axum route handlers for the PDF Export API.

use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::export::service::{self, PdfExportTask, RenderData};
use crate::extract::{Json, Path, Query};
use crate::identity::Caller;
use crate::response::{ok, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    pub resume_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    #[serde(default)]
    pub token: String,
}

/// POST /resume/export
pub async fn handle_create(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<ExportRequest>,
) -> ApiResult<PdfExportTask> {
    ok(service::create_task(&state, &caller, request.resume_id).await?)
}

/// GET /resume/export/:taskId
pub async fn handle_status(
    State(state): State<AppState>,
    caller: Caller,
    Path(task_id): Path<Uuid>,
) -> ApiResult<PdfExportTask> {
    ok(service::get(&state.db, &caller, task_id).await?)
}

/// GET /resume/export/download/:taskId
pub async fn handle_download(
    State(state): State<AppState>,
    caller: Caller,
    Path(task_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let path = service::get_pdf_file_path(&state.db, &caller, task_id).await?;
    let body = tokio::fs::read(&path)
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to read {}: {e}", path.display())))?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{task_id}.pdf\""),
            ),
        ],
        body,
    )
        .into_response())
}

/// GET /export/:taskId?token=
pub async fn handle_render_data(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Query(query): Query<TokenQuery>,
) -> ApiResult<RenderData> {
    ok(service::render_data(&state.db, state.clock.now(), task_id, &query.token).await?)
}
