//! Action price and package template catalogs.
//!
//! Both are small administrator-maintained tables. Ledger code reads them;
//! template edits never rewrite the snapshots already taken into `user_packages`.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::PgPool;
use tracing::info;

use crate::billing::models::{ActionPrice, PackageTemplate, PackageType};
use crate::errors::AppError;

// ────────────────────────────────────────────────────────────────────────────
// Action prices
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct NewActionPrice {
    pub key: String,
    pub display_name: String,
    pub cost: i32,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub sort_order: i32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionPriceUpdate {
    pub display_name: Option<String>,
    pub cost: Option<i32>,
    pub active: Option<bool>,
    pub sort_order: Option<i32>,
}

fn default_true() -> bool {
    true
}

/// Keys are short identifiers such as `ai_chat` or `resume_optimize`.
pub fn validate_action_key(key: &str) -> Result<(), AppError> {
    let valid = !key.is_empty()
        && key.len() <= 64
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "action key '{key}' must be 1-64 characters of [a-z0-9_-]"
        )))
    }
}

pub fn validate_cost(cost: i32) -> Result<(), AppError> {
    if cost < 1 {
        return Err(AppError::Validation(format!(
            "cost must be at least 1, got {cost}"
        )));
    }
    Ok(())
}

/// Returns the price for `key`. Inactive and unknown keys are both missing.
pub async fn get_action_price(pool: &PgPool, key: &str) -> Result<ActionPrice, AppError> {
    sqlx::query_as::<_, ActionPrice>("SELECT * FROM action_prices WHERE key = $1 AND active")
        .bind(key)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Action '{key}' has no active price")))
}

pub async fn list_action_prices(
    pool: &PgPool,
    active_only: bool,
) -> Result<Vec<ActionPrice>, AppError> {
    Ok(sqlx::query_as::<_, ActionPrice>(
        r#"
        SELECT * FROM action_prices
        WHERE ($1 = FALSE OR active)
        ORDER BY sort_order ASC, id ASC
        "#,
    )
    .bind(active_only)
    .fetch_all(pool)
    .await?)
}

pub async fn create_action_price(
    pool: &PgPool,
    now: DateTime<Utc>,
    input: &NewActionPrice,
) -> Result<ActionPrice, AppError> {
    validate_action_key(&input.key)?;
    validate_cost(input.cost)?;
    if input.display_name.trim().is_empty() {
        return Err(AppError::Validation("display_name cannot be empty".to_string()));
    }

    let price = sqlx::query_as::<_, ActionPrice>(
        r#"
        INSERT INTO action_prices (key, display_name, cost, active, sort_order, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $6)
        ON CONFLICT (key) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(&input.key)
    .bind(input.display_name.trim())
    .bind(input.cost)
    .bind(input.active)
    .bind(input.sort_order)
    .bind(now)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::Validation(format!("action key '{}' already exists", input.key)))?;

    info!("Created action price {} = {} credits", price.key, price.cost);
    Ok(price)
}

pub async fn update_action_price(
    pool: &PgPool,
    now: DateTime<Utc>,
    id: i64,
    update: &ActionPriceUpdate,
) -> Result<ActionPrice, AppError> {
    if let Some(cost) = update.cost {
        validate_cost(cost)?;
    }

    let price = sqlx::query_as::<_, ActionPrice>(
        r#"
        UPDATE action_prices SET
            display_name = COALESCE($2, display_name),
            cost         = COALESCE($3, cost),
            active       = COALESCE($4, active),
            sort_order   = COALESCE($5, sort_order),
            updated_at   = $6
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(update.display_name.as_deref().map(str::trim))
    .bind(update.cost)
    .bind(update.active)
    .bind(update.sort_order)
    .bind(now)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("Action price {id} not found")))?;

    info!("Updated action price {} (active={})", price.key, price.active);
    Ok(price)
}

// ────────────────────────────────────────────────────────────────────────────
// Package templates
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub package_type: PackageType,
    pub credits_granted: i32,
    pub validity_days: i32,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default)]
    pub price_cents: i64,
    #[serde(default)]
    pub original_price_cents: i64,
    #[serde(default)]
    pub sort_order: i32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub package_type: Option<PackageType>,
    pub credits_granted: Option<i32>,
    pub validity_days: Option<i32>,
    pub active: Option<bool>,
    pub visible: Option<bool>,
    pub price_cents: Option<i64>,
    pub original_price_cents: Option<i64>,
    pub sort_order: Option<i32>,
}

impl TemplateUpdate {
    /// Overlays the provided fields on an existing template.
    fn apply_to(&self, current: &PackageTemplate) -> TemplateInput {
        TemplateInput {
            name: self.name.clone().unwrap_or_else(|| current.name.clone()),
            description: self
                .description
                .clone()
                .unwrap_or_else(|| current.description.clone()),
            package_type: self.package_type.unwrap_or(current.package_type),
            credits_granted: self.credits_granted.unwrap_or(current.credits_granted),
            validity_days: self.validity_days.unwrap_or(current.validity_days),
            active: self.active.unwrap_or(current.active),
            visible: self.visible.unwrap_or(current.visible),
            price_cents: self.price_cents.unwrap_or(current.price_cents),
            original_price_cents: self
                .original_price_cents
                .unwrap_or(current.original_price_cents),
            sort_order: self.sort_order.unwrap_or(current.sort_order),
        }
    }
}

pub fn validate_template(input: &TemplateInput) -> Result<(), AppError> {
    if input.name.trim().is_empty() {
        return Err(AppError::Validation("name cannot be empty".to_string()));
    }
    if input.credits_granted < 0 {
        return Err(AppError::Validation(
            "credits_granted cannot be negative".to_string(),
        ));
    }
    if input.validity_days < 0 {
        return Err(AppError::Validation(
            "validity_days cannot be negative".to_string(),
        ));
    }
    if input.package_type == PackageType::Permanent && input.validity_days != 0 {
        return Err(AppError::Validation(
            "permanent packages must have validity_days = 0".to_string(),
        ));
    }
    if input.price_cents < 0 || input.original_price_cents < 0 {
        return Err(AppError::Validation("prices cannot be negative".to_string()));
    }
    Ok(())
}

pub async fn get_template(pool: &PgPool, id: i64) -> Result<PackageTemplate, AppError> {
    sqlx::query_as::<_, PackageTemplate>("SELECT * FROM package_templates WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Package template {id} not found")))
}

pub async fn list_templates(
    pool: &PgPool,
    active_only: bool,
    visible_only: bool,
) -> Result<Vec<PackageTemplate>, AppError> {
    Ok(sqlx::query_as::<_, PackageTemplate>(
        r#"
        SELECT * FROM package_templates
        WHERE ($1 = FALSE OR active)
          AND ($2 = FALSE OR visible)
        ORDER BY sort_order ASC, id ASC
        "#,
    )
    .bind(active_only)
    .bind(visible_only)
    .fetch_all(pool)
    .await?)
}

pub async fn create_template(
    pool: &PgPool,
    now: DateTime<Utc>,
    input: &TemplateInput,
) -> Result<PackageTemplate, AppError> {
    validate_template(input)?;

    let template = sqlx::query_as::<_, PackageTemplate>(
        r#"
        INSERT INTO package_templates
            (name, description, package_type, credits_granted, validity_days, active, visible,
             price_cents, original_price_cents, sort_order, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
        RETURNING *
        "#,
    )
    .bind(input.name.trim())
    .bind(&input.description)
    .bind(input.package_type)
    .bind(input.credits_granted)
    .bind(input.validity_days)
    .bind(input.active)
    .bind(input.visible)
    .bind(input.price_cents)
    .bind(input.original_price_cents)
    .bind(input.sort_order)
    .bind(now)
    .fetch_one(pool)
    .await?;

    info!(
        "Created package template {} '{}' ({} credits, {} days)",
        template.id, template.name, template.credits_granted, template.validity_days
    );
    Ok(template)
}

pub async fn update_template(
    pool: &PgPool,
    now: DateTime<Utc>,
    id: i64,
    update: &TemplateUpdate,
) -> Result<PackageTemplate, AppError> {
    let mut tx = pool.begin().await?;

    let current = sqlx::query_as::<_, PackageTemplate>(
        "SELECT * FROM package_templates WHERE id = $1 FOR UPDATE",
    )
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| AppError::NotFound(format!("Package template {id} not found")))?;

    let merged = update.apply_to(&current);
    validate_template(&merged)?;

    let template = sqlx::query_as::<_, PackageTemplate>(
        r#"
        UPDATE package_templates SET
            name = $2, description = $3, package_type = $4, credits_granted = $5,
            validity_days = $6, active = $7, visible = $8, price_cents = $9,
            original_price_cents = $10, sort_order = $11, updated_at = $12
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(merged.name.trim())
    .bind(&merged.description)
    .bind(merged.package_type)
    .bind(merged.credits_granted)
    .bind(merged.validity_days)
    .bind(merged.active)
    .bind(merged.visible)
    .bind(merged.price_cents)
    .bind(merged.original_price_cents)
    .bind(merged.sort_order)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    info!("Updated package template {} '{}'", template.id, template.name);
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template_input(package_type: PackageType, validity_days: i32) -> TemplateInput {
        TemplateInput {
            name: "Starter".to_string(),
            description: String::new(),
            package_type,
            credits_granted: 100,
            validity_days,
            active: true,
            visible: true,
            price_cents: 990,
            original_price_cents: 1990,
            sort_order: 0,
        }
    }

    #[test]
    fn test_action_key_accepts_identifiers() {
        assert!(validate_action_key("ai_chat").is_ok());
        assert!(validate_action_key("resume-optimize2").is_ok());
    }

    #[test]
    fn test_action_key_rejects_bad_input() {
        assert!(validate_action_key("").is_err());
        assert!(validate_action_key("AI Chat").is_err());
        assert!(validate_action_key(&"k".repeat(65)).is_err());
    }

    #[test]
    fn test_cost_must_be_positive() {
        assert!(validate_cost(1).is_ok());
        assert!(validate_cost(0).is_err());
        assert!(validate_cost(-3).is_err());
    }

    #[test]
    fn test_permanent_template_requires_zero_validity() {
        assert!(validate_template(&template_input(PackageType::Permanent, 0)).is_ok());
        assert!(validate_template(&template_input(PackageType::Permanent, 30)).is_err());
        assert!(validate_template(&template_input(PackageType::Credits, 30)).is_ok());
    }

    #[test]
    fn test_template_rejects_negative_values() {
        let mut input = template_input(PackageType::Credits, 30);
        input.credits_granted = -1;
        assert!(validate_template(&input).is_err());

        let mut input = template_input(PackageType::Credits, -1);
        input.credits_granted = 10;
        assert!(validate_template(&input).is_err());
    }

    #[test]
    fn test_update_overlay_keeps_unset_fields() {
        let now = Utc::now();
        let current = PackageTemplate {
            id: 7,
            name: "Monthly".to_string(),
            description: "30 days".to_string(),
            package_type: PackageType::Duration,
            credits_granted: 300,
            validity_days: 30,
            active: true,
            visible: true,
            price_cents: 2900,
            original_price_cents: 3900,
            sort_order: 2,
            created_at: now,
            updated_at: now,
        };
        let update = TemplateUpdate {
            credits_granted: Some(500),
            visible: Some(false),
            ..Default::default()
        };
        let merged = update.apply_to(&current);
        assert_eq!(merged.name, "Monthly");
        assert_eq!(merged.credits_granted, 500);
        assert!(!merged.visible);
        assert_eq!(merged.validity_days, 30);
    }

    #[test]
    fn test_update_to_permanent_with_validity_is_rejected() {
        let now = Utc::now();
        let current = PackageTemplate {
            id: 1,
            name: "Trial".to_string(),
            description: String::new(),
            package_type: PackageType::Credits,
            credits_granted: 10,
            validity_days: 7,
            active: true,
            visible: false,
            price_cents: 0,
            original_price_cents: 0,
            sort_order: 0,
            created_at: now,
            updated_at: now,
        };
        let update = TemplateUpdate {
            package_type: Some(PackageType::Permanent),
            ..Default::default()
        };
        assert!(validate_template(&update.apply_to(&current)).is_err());
    }
}
