pub mod client;
pub mod handlers;
pub mod invoker;

use sqlx::PgPool;

use crate::errors::AppError;
use crate::models::site_variable::SiteVariableRow;

/// Reads a site variable. Blank values count as unset.
pub async fn site_variable(pool: &PgPool, key: &str) -> Result<Option<String>, AppError> {
    let row = sqlx::query_as::<_, SiteVariableRow>("SELECT * FROM site_variables WHERE key = $1")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row
        .map(|r| r.value.trim().to_string())
        .filter(|v| !v.is_empty()))
}
