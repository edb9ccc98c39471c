//! Invitation registry: validation, redemption and administration of codes.
//!
//! Redemption safety rests on two database facts rather than application locks:
//! the `(code, used_by)` unique constraint, and a conditional `used_count + 1`
//! update that refuses to pass `max_uses`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::AppError;
use crate::invitations::code::{
    expiry_change, generate_code, normalize_code, validate_max_uses, InvitationCode,
    InvitationUse, Rejection, MAX_BATCH,
};
use crate::response::PageQuery;

const MAX_GENERATION_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Serialize)]
pub struct Validation {
    pub valid: bool,
    pub max_uses: Option<i32>,
    pub used_count: Option<i32>,
    pub expires_at: Option<DateTime<Utc>>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct UseRequest {
    pub code: String,
    pub user_id: Uuid,
    pub ip: String,
    pub user_agent: String,
}

/// Redemption result. Policy refusals come back as `success: false`.
#[derive(Debug, Clone, Serialize)]
pub struct UseOutcome {
    pub success: bool,
    pub message: String,
}

impl UseOutcome {
    fn rejected(reason: Rejection) -> Self {
        Self {
            success: false,
            message: reason.message().to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCodesRequest {
    #[serde(default = "default_count")]
    pub count: u32,
    pub max_uses: i32,
    pub expires_in_days: Option<i32>,
    #[serde(default)]
    pub note: String,
}

fn default_count() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateCodeRequest {
    pub max_uses: Option<i32>,
    pub expires_in_days: Option<i32>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchUpdateRequest {
    pub codes: Vec<String>,
    pub max_uses: Option<i32>,
    pub expires_in_days: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchUpdateResult {
    pub updated: u64,
}

async fn find_code(pool: &PgPool, code: &str) -> Result<Option<InvitationCode>, AppError> {
    Ok(
        sqlx::query_as::<_, InvitationCode>("SELECT * FROM invitation_codes WHERE code = $1")
            .bind(code)
            .fetch_optional(pool)
            .await?,
    )
}

async fn require_code(pool: &PgPool, code: &str) -> Result<InvitationCode, AppError> {
    find_code(pool, code)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Invitation code {code} not found")))
}

// ────────────────────────────────────────────────────────────────────────────
// Validate & use
// ────────────────────────────────────────────────────────────────────────────

pub async fn validate(pool: &PgPool, now: DateTime<Utc>, raw_code: &str) -> Result<Validation, AppError> {
    let code = normalize_code(raw_code);
    let Some(row) = find_code(pool, &code).await? else {
        return Ok(Validation {
            valid: false,
            max_uses: None,
            used_count: None,
            expires_at: None,
            message: "not found".to_string(),
        });
    };

    let (valid, message) = match row.check(now) {
        Ok(()) => (true, "ok".to_string()),
        Err(reason) => (false, reason.message().to_string()),
    };
    Ok(Validation {
        valid,
        max_uses: Some(row.max_uses),
        used_count: Some(row.used_count),
        expires_at: row.expires_at,
        message,
    })
}

/// Redeems a code for one user inside a single transaction.
pub async fn use_code(pool: &PgPool, now: DateTime<Utc>, request: &UseRequest) -> Result<UseOutcome, AppError> {
    let code = normalize_code(&request.code);
    let mut tx = pool.begin().await?;

    let row = sqlx::query_as::<_, InvitationCode>("SELECT * FROM invitation_codes WHERE code = $1")
        .bind(&code)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Invitation code {code} not found")))?;

    if let Err(reason) = row.check(now) {
        return Ok(UseOutcome::rejected(reason));
    }

    // A concurrent insert by the same user blocks here until it resolves, then
    // conflicts.
    let inserted = sqlx::query(
        r#"
        INSERT INTO invitation_uses (code, used_by, used_at, ip, user_agent)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (code, used_by) DO NOTHING
        "#,
    )
    .bind(&code)
    .bind(request.user_id)
    .bind(now)
    .bind(&request.ip)
    .bind(&request.user_agent)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if inserted == 0 {
        tx.rollback().await?;
        return Ok(UseOutcome::rejected(Rejection::AlreadyUsed));
    }

    // Re-evaluated against the latest committed row once any competing
    // redemption releases its lock.
    let incremented = sqlx::query(
        r#"
        UPDATE invitation_codes
        SET used_count = used_count + 1, updated_at = $2
        WHERE code = $1
          AND active
          AND (expires_at IS NULL OR expires_at >= $2)
          AND (max_uses = -1 OR used_count < max_uses)
        "#,
    )
    .bind(&code)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if incremented == 0 {
        tx.rollback().await?;
        let reason = match find_code(pool, &code).await?.map(|r| r.check(now)) {
            Some(Err(reason)) => reason,
            _ => Rejection::Exhausted,
        };
        warn!("Invitation {code} refused for user {}: {:?}", request.user_id, reason);
        return Ok(UseOutcome::rejected(reason));
    }

    tx.commit().await?;

    info!("Invitation {code} used by {}", request.user_id);
    Ok(UseOutcome {
        success: true,
        message: "ok".to_string(),
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Administration
// ────────────────────────────────────────────────────────────────────────────

/// Mints `count` new codes. A collision on the unique column just draws again.
pub async fn create_codes(
    pool: &PgPool,
    now: DateTime<Utc>,
    creator_id: Uuid,
    request: &CreateCodesRequest,
) -> Result<Vec<InvitationCode>, AppError> {
    if request.count == 0 || request.count > MAX_BATCH {
        return Err(AppError::Validation(format!(
            "count must be between 1 and {MAX_BATCH}"
        )));
    }
    validate_max_uses(request.max_uses)?;
    let (_, expires_at) = expiry_change(now, request.expires_in_days)?.as_binds();

    let mut created = Vec::with_capacity(request.count as usize);
    for _ in 0..request.count {
        let mut minted = None;
        for _ in 0..MAX_GENERATION_ATTEMPTS {
            minted = sqlx::query_as::<_, InvitationCode>(
                r#"
                INSERT INTO invitation_codes
                    (code, creator_id, max_uses, used_count, expires_at, active, note, created_at, updated_at)
                VALUES ($1, $2, $3, 0, $4, TRUE, $5, $6, $6)
                ON CONFLICT (code) DO NOTHING
                RETURNING *
                "#,
            )
            .bind(generate_code())
            .bind(creator_id)
            .bind(request.max_uses)
            .bind(expires_at)
            .bind(&request.note)
            .bind(now)
            .fetch_optional(pool)
            .await?;
            if minted.is_some() {
                break;
            }
        }
        let code = minted.ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!(
                "could not mint a unique invitation code after {MAX_GENERATION_ATTEMPTS} attempts"
            ))
        })?;
        created.push(code);
    }

    info!("User {creator_id} minted {} invitation code(s)", created.len());
    Ok(created)
}

pub async fn list(pool: &PgPool, page: PageQuery) -> Result<(Vec<InvitationCode>, i64), AppError> {
    let codes = sqlx::query_as::<_, InvitationCode>(
        "SELECT * FROM invitation_codes ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2",
    )
    .bind(page.limit)
    .bind(page.offset())
    .fetch_all(pool)
    .await?;

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM invitation_codes")
        .fetch_one(pool)
        .await?;

    Ok((codes, total))
}

pub async fn detail(pool: &PgPool, raw_code: &str) -> Result<InvitationCode, AppError> {
    require_code(pool, &normalize_code(raw_code)).await
}

pub async fn list_uses(pool: &PgPool, raw_code: &str) -> Result<Vec<InvitationUse>, AppError> {
    let code = normalize_code(raw_code);
    require_code(pool, &code).await?;
    Ok(sqlx::query_as::<_, InvitationUse>(
        "SELECT * FROM invitation_uses WHERE code = $1 ORDER BY used_at DESC, id DESC",
    )
    .bind(&code)
    .fetch_all(pool)
    .await?)
}

pub async fn set_active(
    pool: &PgPool,
    now: DateTime<Utc>,
    raw_code: &str,
    active: bool,
) -> Result<InvitationCode, AppError> {
    let code = normalize_code(raw_code);
    let row = sqlx::query_as::<_, InvitationCode>(
        "UPDATE invitation_codes SET active = $2, updated_at = $3 WHERE code = $1 RETURNING *",
    )
    .bind(&code)
    .bind(active)
    .bind(now)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("Invitation code {code} not found")))?;

    info!("Invitation {code} active={active}");
    Ok(row)
}

pub async fn update(
    pool: &PgPool,
    now: DateTime<Utc>,
    raw_code: &str,
    request: &UpdateCodeRequest,
) -> Result<InvitationCode, AppError> {
    let code = normalize_code(raw_code);
    if let Some(max_uses) = request.max_uses {
        validate_max_uses(max_uses)?;
    }
    let (touch_expiry, expires_at) = expiry_change(now, request.expires_in_days)?.as_binds();

    sqlx::query_as::<_, InvitationCode>(
        r#"
        UPDATE invitation_codes SET
            max_uses   = COALESCE($2, max_uses),
            expires_at = CASE WHEN $3 THEN $4 ELSE expires_at END,
            note       = COALESCE($5, note),
            updated_at = $6
        WHERE code = $1
        RETURNING *
        "#,
    )
    .bind(&code)
    .bind(request.max_uses)
    .bind(touch_expiry)
    .bind(expires_at)
    .bind(request.note.as_deref())
    .bind(now)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("Invitation code {code} not found")))
}

/// Applies the same change to every listed code, or to none if any is missing.
pub async fn batch_update(
    pool: &PgPool,
    now: DateTime<Utc>,
    request: &BatchUpdateRequest,
) -> Result<BatchUpdateResult, AppError> {
    if request.codes.is_empty() {
        return Err(AppError::Validation("codes cannot be empty".to_string()));
    }
    if request.max_uses.is_none() && request.expires_in_days.is_none() {
        return Err(AppError::Validation(
            "nothing to update: provide max_uses and/or expires_in_days".to_string(),
        ));
    }
    if let Some(max_uses) = request.max_uses {
        validate_max_uses(max_uses)?;
    }
    let (touch_expiry, expires_at) = expiry_change(now, request.expires_in_days)?.as_binds();

    let mut codes: Vec<String> = request.codes.iter().map(|c| normalize_code(c)).collect();
    codes.sort();
    codes.dedup();

    let mut tx = pool.begin().await?;

    let existing: Vec<String> = sqlx::query_scalar(
        "SELECT code FROM invitation_codes WHERE code = ANY($1) ORDER BY code FOR UPDATE",
    )
    .bind(&codes)
    .fetch_all(&mut *tx)
    .await?;

    if existing.len() != codes.len() {
        let missing: Vec<&str> = codes
            .iter()
            .filter(|c| !existing.contains(c))
            .map(String::as_str)
            .collect();
        return Err(AppError::NotFound(format!(
            "Invitation codes not found: {}",
            missing.join(", ")
        )));
    }

    let updated = sqlx::query(
        r#"
        UPDATE invitation_codes SET
            max_uses   = COALESCE($2, max_uses),
            expires_at = CASE WHEN $3 THEN $4 ELSE expires_at END,
            updated_at = $5
        WHERE code = ANY($1)
        "#,
    )
    .bind(&codes)
    .bind(request.max_uses)
    .bind(touch_expiry)
    .bind(expires_at)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    tx.commit().await?;

    info!("Batch-updated {updated} invitation code(s)");
    Ok(BatchUpdateResult { updated })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    async fn mint(pool: &PgPool, max_uses: i32) -> String {
        let request = CreateCodesRequest {
            count: 1,
            max_uses,
            expires_in_days: None,
            note: String::new(),
        };
        let mut codes = create_codes(pool, now(), Uuid::new_v4(), &request).await.unwrap();
        codes.remove(0).code
    }

    fn redeem(code: &str, user_id: Uuid) -> UseRequest {
        UseRequest {
            code: code.to_string(),
            user_id,
            ip: "203.0.113.7".to_string(),
            user_agent: "test".to_string(),
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_single_use_code_admits_one_of_two_racing_users(pool: PgPool) {
        let code = mint(&pool, 1).await;
        let (a, b) = (redeem(&code, Uuid::new_v4()), redeem(&code, Uuid::new_v4()));

        let (first, second) = tokio::join!(use_code(&pool, now(), &a), use_code(&pool, now(), &b));
        let outcomes = [first.unwrap(), second.unwrap()];

        assert_eq!(outcomes.iter().filter(|o| o.success).count(), 1);
        let refused = outcomes.iter().find(|o| !o.success).unwrap();
        assert_eq!(refused.message, Rejection::Exhausted.message());

        let row = detail(&pool, &code).await.unwrap();
        assert_eq!(row.used_count, 1);
        assert_eq!(list_uses(&pool, &code).await.unwrap().len(), 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_same_user_racing_twice_counts_once(pool: PgPool) {
        let code = mint(&pool, 5).await;
        let request = redeem(&code, Uuid::new_v4());

        let (first, second) =
            tokio::join!(use_code(&pool, now(), &request), use_code(&pool, now(), &request));
        let outcomes = [first.unwrap(), second.unwrap()];

        assert_eq!(outcomes.iter().filter(|o| o.success).count(), 1);
        let refused = outcomes.iter().find(|o| !o.success).unwrap();
        assert_eq!(refused.message, Rejection::AlreadyUsed.message());
        assert_eq!(detail(&pool, &code).await.unwrap().used_count, 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_exhausted_code_fails_validation(pool: PgPool) {
        let code = mint(&pool, 1).await;
        assert!(use_code(&pool, now(), &redeem(&code, Uuid::new_v4())).await.unwrap().success);

        let late = use_code(&pool, now(), &redeem(&code, Uuid::new_v4())).await.unwrap();
        assert!(!late.success);

        let validation = validate(&pool, now(), &code.to_lowercase()).await.unwrap();
        assert!(!validation.valid);
        assert_eq!(validation.used_count, Some(1));
        assert_eq!(list_uses(&pool, &code).await.unwrap().len(), 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_batch_update_is_all_or_nothing(pool: PgPool) {
        let code = mint(&pool, 1).await;
        let request = BatchUpdateRequest {
            codes: vec![code.clone(), "ZZZZ-ZZZZ-ZZZZ".to_string()],
            max_uses: Some(9),
            expires_in_days: None,
        };
        assert!(matches!(
            batch_update(&pool, now(), &request).await,
            Err(AppError::NotFound(_))
        ));
        assert_eq!(detail(&pool, &code).await.unwrap().max_uses, 1);
    }
}
