//! Axum route handlers for the Billing API.

use axum::extract::State;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::billing::catalog::{
    self, ActionPriceUpdate, NewActionPrice, TemplateInput, TemplateUpdate,
};
use crate::billing::ledger::{
    self, AssignRequest, CreditCheck, DeductOutcome, DeductRequest,
};
use crate::billing::models::{ActionPrice, CreditUsageRecord, PackageTemplate, UserPackage};
use crate::errors::AppError;
use crate::extract::{Json, Path, Query};
use crate::identity::{AdminCaller, Caller, InternalCaller};
use crate::response::{ok, ApiResult, PageQuery, Paged};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct CreditsResponse {
    pub total_credits: i64,
}

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub user_id: Uuid,
    pub action_key: String,
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct AdminListQuery {
    #[serde(default)]
    pub active_only: bool,
}

#[derive(Debug, Serialize)]
pub struct SweepResponse {
    pub expired: u64,
}

// ── Public ──────────────────────────────────────────────────────────────────

/// GET /billing/action-prices
pub async fn handle_list_action_prices(
    State(state): State<AppState>,
) -> ApiResult<Vec<ActionPrice>> {
    ok(catalog::list_action_prices(&state.db, true).await?)
}

/// GET /billing/packages
pub async fn handle_list_public_packages(
    State(state): State<AppState>,
) -> ApiResult<Vec<PackageTemplate>> {
    ok(catalog::list_templates(&state.db, true, true).await?)
}

// ── Caller ──────────────────────────────────────────────────────────────────

/// GET /user/billing/credits
pub async fn handle_get_credits(
    State(state): State<AppState>,
    caller: Caller,
) -> ApiResult<CreditsResponse> {
    let total_credits = ledger::total_credits(&state.db, caller.user_id, state.clock.now()).await?;
    ok(CreditsResponse { total_credits })
}

/// GET /user/billing/packages
pub async fn handle_list_my_packages(
    State(state): State<AppState>,
    caller: Caller,
) -> ApiResult<Vec<UserPackage>> {
    ok(ledger::list_user_packages(&state.db, caller.user_id).await?)
}

/// GET /user/billing/usage
pub async fn handle_list_my_usage(
    State(state): State<AppState>,
    caller: Caller,
    Query(page): Query<PageQuery>,
) -> ApiResult<Paged<CreditUsageRecord>> {
    let page = page.normalized();
    let (items, total) = ledger::list_usage(&state.db, caller.user_id, page).await?;
    ok(Paged::new(items, total, page))
}

// ── Admin ───────────────────────────────────────────────────────────────────

/// GET /admin/billing/packages
pub async fn handle_admin_list_templates(
    State(state): State<AppState>,
    _admin: AdminCaller,
    Query(q): Query<AdminListQuery>,
) -> ApiResult<Vec<PackageTemplate>> {
    ok(catalog::list_templates(&state.db, q.active_only, false).await?)
}

/// POST /admin/billing/packages
pub async fn handle_create_template(
    State(state): State<AppState>,
    _admin: AdminCaller,
    Json(input): Json<TemplateInput>,
) -> ApiResult<PackageTemplate> {
    ok(catalog::create_template(&state.db, state.clock.now(), &input).await?)
}

/// PUT /admin/billing/packages/:id
pub async fn handle_update_template(
    State(state): State<AppState>,
    _admin: AdminCaller,
    Path(id): Path<i64>,
    Json(update): Json<TemplateUpdate>,
) -> ApiResult<PackageTemplate> {
    ok(catalog::update_template(&state.db, state.clock.now(), id, &update).await?)
}

/// GET /admin/billing/action-prices
pub async fn handle_admin_list_action_prices(
    State(state): State<AppState>,
    _admin: AdminCaller,
    Query(q): Query<AdminListQuery>,
) -> ApiResult<Vec<ActionPrice>> {
    ok(catalog::list_action_prices(&state.db, q.active_only).await?)
}

/// POST /admin/billing/action-prices
pub async fn handle_create_action_price(
    State(state): State<AppState>,
    _admin: AdminCaller,
    Json(input): Json<NewActionPrice>,
) -> ApiResult<ActionPrice> {
    ok(catalog::create_action_price(&state.db, state.clock.now(), &input).await?)
}

/// PUT /admin/billing/action-prices/:id
pub async fn handle_update_action_price(
    State(state): State<AppState>,
    _admin: AdminCaller,
    Path(id): Path<i64>,
    Json(update): Json<ActionPriceUpdate>,
) -> ApiResult<ActionPrice> {
    ok(catalog::update_action_price(&state.db, state.clock.now(), id, &update).await?)
}

/// POST /admin/billing/user-packages
pub async fn handle_assign_package(
    State(state): State<AppState>,
    _admin: AdminCaller,
    Json(request): Json<AssignRequest>,
) -> ApiResult<UserPackage> {
    ok(ledger::assign(&state.db, state.clock.now(), &request).await?)
}

/// GET /admin/billing/user-packages?user_id=
pub async fn handle_admin_list_user_packages(
    State(state): State<AppState>,
    _admin: AdminCaller,
    Query(q): Query<UserQuery>,
) -> ApiResult<Vec<UserPackage>> {
    ok(ledger::list_user_packages(&state.db, q.user_id).await?)
}

/// POST /admin/billing/user-packages/:id/activate
pub async fn handle_activate_package(
    State(state): State<AppState>,
    _admin: AdminCaller,
    Path(id): Path<i64>,
) -> ApiResult<UserPackage> {
    ok(ledger::activate(&state.db, state.clock.now(), id).await?)
}

/// POST /admin/billing/sweep
pub async fn handle_sweep(
    State(state): State<AppState>,
    _admin: AdminCaller,
) -> ApiResult<SweepResponse> {
    let expired = ledger::sweep_expired(&state.db, state.clock.now()).await?;
    ok(SweepResponse { expired })
}

// ── Internal ────────────────────────────────────────────────────────────────

/// POST /internal/billing/credits/check
pub async fn handle_check_credits(
    State(state): State<AppState>,
    _internal: InternalCaller,
    Json(request): Json<CheckRequest>,
) -> ApiResult<CreditCheck> {
    if request.action_key.trim().is_empty() {
        return Err(AppError::Validation("action_key cannot be empty".to_string()));
    }
    ok(ledger::check(&state.db, state.clock.now(), request.user_id, &request.action_key).await?)
}

/// POST /internal/billing/credits/deduct
///
/// An insufficient balance still answers `code = 0` with `success: false`.
pub async fn handle_deduct_credits(
    State(state): State<AppState>,
    _internal: InternalCaller,
    Json(request): Json<DeductRequest>,
) -> ApiResult<DeductOutcome> {
    if request.action_key.trim().is_empty() {
        return Err(AppError::Validation("action_key cannot be empty".to_string()));
    }
    ok(ledger::deduct(&state.db, state.clock.now(), &request).await?)
}
