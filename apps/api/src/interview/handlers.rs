//! Axum route handlers for the Interview Review API.

use axum::extract::State;
use uuid::Uuid;

use crate::extract::{Json, Path, Query};
use crate::identity::Caller;
use crate::interview::service::{self, CreateReviewRequest, InterviewReview};
use crate::response::{ok, ApiResult, PageQuery, Paged};
use crate::state::AppState;

/// POST /interview/reviews
pub async fn handle_create(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<CreateReviewRequest>,
) -> ApiResult<InterviewReview> {
    ok(service::create(&state.db, state.clock.now(), &caller, &request).await?)
}

/// GET /interview/reviews
pub async fn handle_list(
    State(state): State<AppState>,
    caller: Caller,
    Query(page): Query<PageQuery>,
) -> ApiResult<Paged<InterviewReview>> {
    let page = page.normalized();
    let (items, total) = service::list(&state.db, caller.user_id, page).await?;
    ok(Paged::new(items, total, page))
}

/// GET /interview/reviews/:id
pub async fn handle_get(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<InterviewReview> {
    ok(service::get(&state.db, &caller, id).await?)
}

/// POST /interview/reviews/:id/analyze
pub async fn handle_analyze(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<InterviewReview> {
    ok(service::trigger_analysis(&state, &caller, id).await?)
}
