//! Axum route handlers for the Invitation API.

use axum::extract::State;
use axum::http::HeaderMap;
use serde::Deserialize;

use crate::extract::{Json, Path, Query};
use crate::identity::{AdminCaller, Caller};
use crate::invitations::code::{InvitationCode, InvitationUse};
use crate::invitations::registry::{
    self, BatchUpdateRequest, BatchUpdateResult, CreateCodesRequest, UpdateCodeRequest,
    UseOutcome, UseRequest, Validation,
};
use crate::response::{ok, ApiResult, PageQuery, Paged};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CodeBody {
    pub code: String,
}

/// First hop of `x-forwarded-for`, then `x-real-ip`, else empty.
pub fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty()) {
            return first.to_string();
        }
    }
    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

// ── Public / caller ─────────────────────────────────────────────────────────

/// POST /invitations/validate
pub async fn handle_validate(
    State(state): State<AppState>,
    Json(body): Json<CodeBody>,
) -> ApiResult<Validation> {
    ok(registry::validate(&state.db, state.clock.now(), &body.code).await?)
}

/// POST /invitations/use
pub async fn handle_use(
    State(state): State<AppState>,
    caller: Caller,
    headers: HeaderMap,
    Json(body): Json<CodeBody>,
) -> ApiResult<UseOutcome> {
    let request = UseRequest {
        code: body.code,
        user_id: caller.user_id,
        ip: client_ip(&headers),
        user_agent: user_agent(&headers),
    };
    ok(registry::use_code(&state.db, state.clock.now(), &request).await?)
}

// ── Admin ───────────────────────────────────────────────────────────────────

/// GET /admin/invitations
pub async fn handle_list(
    State(state): State<AppState>,
    _admin: AdminCaller,
    Query(page): Query<PageQuery>,
) -> ApiResult<Paged<InvitationCode>> {
    let page = page.normalized();
    let (items, total) = registry::list(&state.db, page).await?;
    ok(Paged::new(items, total, page))
}

/// POST /admin/invitations
pub async fn handle_create(
    State(state): State<AppState>,
    AdminCaller(admin): AdminCaller,
    Json(request): Json<CreateCodesRequest>,
) -> ApiResult<Vec<InvitationCode>> {
    ok(registry::create_codes(&state.db, state.clock.now(), admin.user_id, &request).await?)
}

/// PUT /admin/invitations/batch
pub async fn handle_batch_update(
    State(state): State<AppState>,
    _admin: AdminCaller,
    Json(request): Json<BatchUpdateRequest>,
) -> ApiResult<BatchUpdateResult> {
    ok(registry::batch_update(&state.db, state.clock.now(), &request).await?)
}

/// GET /admin/invitations/:code
pub async fn handle_detail(
    State(state): State<AppState>,
    _admin: AdminCaller,
    Path(code): Path<String>,
) -> ApiResult<InvitationCode> {
    ok(registry::detail(&state.db, &code).await?)
}

/// PUT /admin/invitations/:code
pub async fn handle_update(
    State(state): State<AppState>,
    _admin: AdminCaller,
    Path(code): Path<String>,
    Json(request): Json<UpdateCodeRequest>,
) -> ApiResult<InvitationCode> {
    ok(registry::update(&state.db, state.clock.now(), &code, &request).await?)
}

/// POST /admin/invitations/:code/activate
pub async fn handle_activate(
    State(state): State<AppState>,
    _admin: AdminCaller,
    Path(code): Path<String>,
) -> ApiResult<InvitationCode> {
    ok(registry::set_active(&state.db, state.clock.now(), &code, true).await?)
}

/// POST /admin/invitations/:code/deactivate
pub async fn handle_deactivate(
    State(state): State<AppState>,
    _admin: AdminCaller,
    Path(code): Path<String>,
) -> ApiResult<InvitationCode> {
    ok(registry::set_active(&state.db, state.clock.now(), &code, false).await?)
}

/// GET /admin/invitations/:code/uses
pub async fn handle_list_uses(
    State(state): State<AppState>,
    _admin: AdminCaller,
    Path(code): Path<String>,
) -> ApiResult<Vec<InvitationUse>> {
    ok(registry::list_uses(&state.db, &code).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_client_ip_prefers_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.9"));
        assert_eq!(client_ip(&headers), "203.0.113.7");
    }

    #[test]
    fn test_client_ip_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static(" 198.51.100.4 "));
        assert_eq!(client_ip(&headers), "198.51.100.4");
        assert_eq!(client_ip(&HeaderMap::new()), "");
    }
}
