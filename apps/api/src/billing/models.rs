use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "package_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PackageType {
    Duration,
    Credits,
    Hybrid,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "package_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    Pending,
    Active,
    Expired,
    Depleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "package_source", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PackageSource {
    Purchase,
    Gift,
    Promotion,
    System,
}

/// A billable action and its credit cost.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ActionPrice {
    pub id: i64,
    pub key: String,
    pub display_name: String,
    pub cost: i32,
    pub active: bool,
    pub sort_order: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Administrator-defined product. Snapshotted into `UserPackage` on assignment.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PackageTemplate {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub package_type: PackageType,
    pub credits_granted: i32,
    /// 0 = never expires.
    pub validity_days: i32,
    pub active: bool,
    pub visible: bool,
    pub price_cents: i64,
    pub original_price_cents: i64,
    pub sort_order: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A ledger entry: one template instance held by one user.
///
/// `used + remaining = total` is enforced by a table constraint.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserPackage {
    pub id: i64,
    pub user_id: Uuid,
    pub template_id: i64,
    pub template_name: String,
    pub template_type: PackageType,
    pub validity_days: i32,
    pub total: i32,
    pub used: i32,
    pub remaining: i32,
    pub activated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: PackageStatus,
    pub priority: i32,
    pub source: PackageSource,
    pub order_id: Option<String>,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserPackage {
    /// Active, not past expiry, and holding credits.
    pub fn is_spendable(&self, now: DateTime<Utc>) -> bool {
        self.status == PackageStatus::Active && self.remaining > 0 && !self.is_past_expiry(now)
    }

    /// True once `now` has reached `expires_at`. Permanent packages never expire.
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// One successful deduction, with the per-package split.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CreditUsageRecord {
    pub id: i64,
    pub user_id: Uuid,
    pub action_key: String,
    pub credits: i32,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub breakdown: Value,
    pub created_at: DateTime<Utc>,
}
