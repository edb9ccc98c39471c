//! Credit ledger: per-user package balances with priority-ordered consumption.
//!
//! Flow of a deduction:
//!   resolve price → BEGIN → lock the user's active rows in consumption order →
//!   expire rows past their deadline → plan takes → apply takes + usage record → COMMIT.
//!
//! Consumption order is `(priority asc, expires_at asc nulls last, id asc)`. The same
//! order is used for lock acquisition, so concurrent deductions for one user serialize
//! on their common rows without deadlocking.

use std::cmp::Ordering;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::billing::catalog::{get_action_price, get_template};
use crate::billing::models::{CreditUsageRecord, PackageSource, PackageStatus, UserPackage};
use crate::errors::AppError;
use crate::response::PageQuery;

// ────────────────────────────────────────────────────────────────────────────
// Request / outcome types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct AssignRequest {
    pub user_id: Uuid,
    pub template_id: i64,
    pub source: PackageSource,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub auto_activate: bool,
    #[serde(default)]
    pub priority: i32,
    pub order_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeductRequest {
    pub user_id: Uuid,
    pub action_key: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreditCheck {
    pub has_enough: bool,
    pub total: i64,
    pub required: i32,
}

/// Result of a deduction. An insufficient balance is `success: false`, not an error.
#[derive(Debug, Clone, Serialize)]
pub struct DeductOutcome {
    pub success: bool,
    pub deducted_credits: i32,
    pub remaining_credits: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Pure planning
// ────────────────────────────────────────────────────────────────────────────

/// Consumption order: lower priority value first, then earliest expiry, dated
/// packages before permanent ones, then oldest row.
pub fn consumption_order(a: &UserPackage, b: &UserPackage) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| match (a.expires_at, b.expires_at) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.id.cmp(&b.id))
}

/// Credits taken from one package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PackageTake {
    pub package_id: i64,
    pub credits: i32,
    /// True when this take empties the package.
    pub depletes: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeductionPlan {
    Insufficient { available: i64, required: i32 },
    Takes(Vec<PackageTake>),
}

/// Decides how `required` credits are drawn from `packages`. Rows that are not
/// spendable at `now` are ignored; the rest are walked in consumption order.
pub fn plan_deduction(packages: &[UserPackage], required: i32, now: DateTime<Utc>) -> DeductionPlan {
    let mut spendable: Vec<&UserPackage> =
        packages.iter().filter(|p| p.is_spendable(now)).collect();
    spendable.sort_by(|a, b| consumption_order(a, b));

    let available: i64 = spendable.iter().map(|p| p.remaining as i64).sum();
    if available < required as i64 {
        return DeductionPlan::Insufficient {
            available,
            required,
        };
    }

    let mut outstanding = required;
    let mut takes = Vec::new();
    for package in spendable {
        if outstanding == 0 {
            break;
        }
        let credits = package.remaining.min(outstanding);
        outstanding -= credits;
        takes.push(PackageTake {
            package_id: package.id,
            credits,
            depletes: credits == package.remaining,
        });
    }

    DeductionPlan::Takes(takes)
}

/// Lifecycle fields set when a package is activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation {
    pub status: PackageStatus,
    pub activated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A package with no credits is activated straight into `depleted`.
pub fn activation_at(now: DateTime<Utc>, validity_days: i32, total: i32) -> Activation {
    let expires_at = (validity_days > 0).then(|| now + Duration::days(validity_days as i64));
    let status = if total > 0 {
        PackageStatus::Active
    } else {
        PackageStatus::Depleted
    };
    Activation {
        status,
        activated_at: now,
        expires_at,
    }
}

pub fn insufficient_message(available: i64, required: i32) -> String {
    format!("Insufficient credits: {available} available, {required} required")
}

// ────────────────────────────────────────────────────────────────────────────
// Assignment & activation
// ────────────────────────────────────────────────────────────────────────────

/// Creates a ledger entry from a template, optionally activating it at once.
pub async fn assign(
    pool: &PgPool,
    now: DateTime<Utc>,
    request: &AssignRequest,
) -> Result<UserPackage, AppError> {
    let template = get_template(pool, request.template_id).await?;

    let (status, activated_at, expires_at) = if request.auto_activate {
        let a = activation_at(now, template.validity_days, template.credits_granted);
        (a.status, Some(a.activated_at), a.expires_at)
    } else {
        (PackageStatus::Pending, None, None)
    };

    let package = sqlx::query_as::<_, UserPackage>(
        r#"
        INSERT INTO user_packages
            (user_id, template_id, template_name, template_type, validity_days,
             total, used, remaining, activated_at, expires_at, status, priority,
             source, order_id, notes, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, 0, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
        RETURNING *
        "#,
    )
    .bind(request.user_id)
    .bind(template.id)
    .bind(&template.name)
    .bind(template.package_type)
    .bind(template.validity_days)
    .bind(template.credits_granted)
    .bind(activated_at)
    .bind(expires_at)
    .bind(status)
    .bind(request.priority)
    .bind(request.source)
    .bind(request.order_id.as_deref())
    .bind(&request.notes)
    .bind(now)
    .fetch_one(pool)
    .await?;

    info!(
        "Assigned package {} (template {}, {} credits, status {:?}) to user {}",
        package.id, template.id, package.total, package.status, package.user_id
    );
    Ok(package)
}

/// Moves a `pending` package to `active`, computing its expiry from the snapshot.
pub async fn activate(
    pool: &PgPool,
    now: DateTime<Utc>,
    package_id: i64,
) -> Result<UserPackage, AppError> {
    let mut tx = pool.begin().await?;

    let package =
        sqlx::query_as::<_, UserPackage>("SELECT * FROM user_packages WHERE id = $1 FOR UPDATE")
            .bind(package_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User package {package_id} not found")))?;

    if package.status != PackageStatus::Pending {
        return Err(AppError::InvalidState(format!(
            "Package {package_id} is {:?}; only pending packages can be activated",
            package.status
        )));
    }

    let a = activation_at(now, package.validity_days, package.total);
    let package = sqlx::query_as::<_, UserPackage>(
        r#"
        UPDATE user_packages
        SET status = $2, activated_at = $3, expires_at = $4, updated_at = $5
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(package_id)
    .bind(a.status)
    .bind(a.activated_at)
    .bind(a.expires_at)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    info!(
        "Activated package {} for user {} (expires {:?})",
        package.id, package.user_id, package.expires_at
    );
    Ok(package)
}

// ────────────────────────────────────────────────────────────────────────────
// Balance reads
// ────────────────────────────────────────────────────────────────────────────

/// Sum of spendable credits. Non-locking.
pub async fn total_credits(pool: &PgPool, user_id: Uuid, now: DateTime<Utc>) -> Result<i64, AppError> {
    let total: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(remaining), 0)::BIGINT
        FROM user_packages
        WHERE user_id = $1
          AND status = 'active'
          AND (expires_at IS NULL OR expires_at > $2)
        "#,
    )
    .bind(user_id)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(total)
}

/// Advisory balance check; reserves nothing.
pub async fn check(
    pool: &PgPool,
    now: DateTime<Utc>,
    user_id: Uuid,
    action_key: &str,
) -> Result<CreditCheck, AppError> {
    let price = get_action_price(pool, action_key).await?;
    let total = total_credits(pool, user_id, now).await?;
    Ok(CreditCheck {
        has_enough: total >= price.cost as i64,
        total,
        required: price.cost,
    })
}

pub async fn list_user_packages(pool: &PgPool, user_id: Uuid) -> Result<Vec<UserPackage>, AppError> {
    Ok(sqlx::query_as::<_, UserPackage>(
        r#"
        SELECT * FROM user_packages
        WHERE user_id = $1
        ORDER BY priority ASC, expires_at ASC NULLS LAST, id ASC
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?)
}

pub async fn list_usage(
    pool: &PgPool,
    user_id: Uuid,
    page: PageQuery,
) -> Result<(Vec<CreditUsageRecord>, i64), AppError> {
    let records = sqlx::query_as::<_, CreditUsageRecord>(
        r#"
        SELECT * FROM credit_usage_records
        WHERE user_id = $1
        ORDER BY created_at DESC, id DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(user_id)
    .bind(page.limit)
    .bind(page.offset())
    .fetch_all(pool)
    .await?;

    let total: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM credit_usage_records WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(pool)
            .await?;

    Ok((records, total))
}

// ────────────────────────────────────────────────────────────────────────────
// Deduction
// ────────────────────────────────────────────────────────────────────────────

/// Atomically charges the price of `action_key` against the user's packages.
pub async fn deduct(
    pool: &PgPool,
    now: DateTime<Utc>,
    request: &DeductRequest,
) -> Result<DeductOutcome, AppError> {
    let required = get_action_price(pool, &request.action_key).await?.cost;

    let mut tx = pool.begin().await?;

    let locked = lock_active_packages(&mut tx, request.user_id).await?;
    expire_locked(&mut tx, &locked, now).await?;

    let takes = match plan_deduction(&locked, required, now) {
        DeductionPlan::Insufficient {
            available,
            required,
        } => {
            tx.rollback().await?;
            debug!(
                "Deduction of {} for user {} rejected: {} available",
                required, request.user_id, available
            );
            return Ok(DeductOutcome {
                success: false,
                deducted_credits: 0,
                remaining_credits: available,
                message: Some(insufficient_message(available, required)),
            });
        }
        DeductionPlan::Takes(takes) => takes,
    };

    for take in &takes {
        apply_take(&mut tx, take, now).await?;
    }
    record_usage(&mut tx, request, required, &takes, now).await?;

    tx.commit().await?;

    let remaining_credits = total_credits(pool, request.user_id, now).await?;
    info!(
        "Deducted {} credits for '{}' from user {} across {} package(s); {} left",
        required,
        request.action_key,
        request.user_id,
        takes.len(),
        remaining_credits
    );

    Ok(DeductOutcome {
        success: true,
        deducted_credits: required,
        remaining_credits,
        message: None,
    })
}

/// Locks every active, non-empty package of the user in consumption order.
/// Rows past expiry are included so they can be expired under the same locks.
async fn lock_active_packages(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
) -> Result<Vec<UserPackage>, AppError> {
    Ok(sqlx::query_as::<_, UserPackage>(
        r#"
        SELECT * FROM user_packages
        WHERE user_id = $1 AND status = 'active' AND remaining > 0
        ORDER BY priority ASC, expires_at ASC NULLS LAST, id ASC
        FOR UPDATE
        "#,
    )
    .bind(user_id)
    .fetch_all(&mut **tx)
    .await?)
}

async fn expire_locked(
    tx: &mut Transaction<'_, Postgres>,
    locked: &[UserPackage],
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    let expired: Vec<i64> = locked
        .iter()
        .filter(|p| p.is_past_expiry(now))
        .map(|p| p.id)
        .collect();
    if expired.is_empty() {
        return Ok(());
    }

    sqlx::query(
        "UPDATE user_packages SET status = 'expired', updated_at = $2 WHERE id = ANY($1)",
    )
    .bind(&expired)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    debug!("Expired {} package(s) on touch", expired.len());
    Ok(())
}

async fn apply_take(
    tx: &mut Transaction<'_, Postgres>,
    take: &PackageTake,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE user_packages
        SET used = used + $2,
            remaining = remaining - $2,
            status = CASE WHEN remaining - $2 = 0 THEN 'depleted'::package_status ELSE status END,
            updated_at = $3
        WHERE id = $1
        "#,
    )
    .bind(take.package_id)
    .bind(take.credits)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn record_usage(
    tx: &mut Transaction<'_, Postgres>,
    request: &DeductRequest,
    credits: i32,
    takes: &[PackageTake],
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    let breakdown = json!(takes
        .iter()
        .map(|t| json!({ "package_id": t.package_id, "credits": t.credits }))
        .collect::<Vec<_>>());

    sqlx::query(
        r#"
        INSERT INTO credit_usage_records
            (user_id, action_key, credits, resource_type, resource_id, breakdown, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(request.user_id)
    .bind(&request.action_key)
    .bind(credits)
    .bind(request.resource_type.as_deref())
    .bind(request.resource_id.as_deref())
    .bind(&breakdown)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// ────────────────────────────────────────────────────────────────────────────
// Expiry sweep
// ────────────────────────────────────────────────────────────────────────────

/// Marks active packages past their deadline as `expired`. Depleted rows are
/// terminal and never touched. Idempotent.
pub async fn sweep_expired(pool: &PgPool, now: DateTime<Utc>) -> Result<u64, AppError> {
    let result = sqlx::query(
        r#"
        UPDATE user_packages
        SET status = 'expired', updated_at = $1
        WHERE status = 'active'
          AND remaining > 0
          AND expires_at IS NOT NULL
          AND expires_at <= $1
        "#,
    )
    .bind(now)
    .execute(pool)
    .await?;

    let count = result.rows_affected();
    if count > 0 {
        info!("Expiry sweep marked {count} package(s) expired");
    }
    Ok(count)
}
