//! Axum route handlers for the ASR API.

use axum::extract::State;
use uuid::Uuid;

use crate::asr::service::{self, AsrTask, SubmitRequest};
use crate::extract::{Json, Path, Query};
use crate::identity::Caller;
use crate::response::{ok, ApiResult, PageQuery, Paged};
use crate::state::AppState;

/// POST /asr/tasks
pub async fn handle_submit(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<SubmitRequest>,
) -> ApiResult<AsrTask> {
    ok(service::submit(&state, caller.user_id, &request).await?)
}

/// GET /asr/tasks
pub async fn handle_list(
    State(state): State<AppState>,
    caller: Caller,
    Query(page): Query<PageQuery>,
) -> ApiResult<Paged<AsrTask>> {
    let page = page.normalized();
    let (items, total) = service::list(&state.db, caller.user_id, page).await?;
    ok(Paged::new(items, total, page))
}

/// GET /asr/tasks/:id
pub async fn handle_get(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<AsrTask> {
    ok(service::get(&state.db, &caller, id).await?)
}

/// DELETE /asr/tasks/:id
pub async fn handle_delete(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<()> {
    service::delete(&state.db, &caller, id).await?;
    ok(())
}

/// POST /asr/tasks/:id/poll
pub async fn handle_poll(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<AsrTask> {
    ok(service::poll(&state, &caller, id).await?)
}

/// POST /asr/tasks/:id/retry
pub async fn handle_retry(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<AsrTask> {
    ok(service::retry(&state, &caller, id).await?)
}
