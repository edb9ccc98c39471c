use axum::Json;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// Uniform `{code, data, msg}` envelope. `code = 0` on success; errors are
/// rendered by `AppError::into_response` with the same shape.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub data: T,
    pub msg: String,
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, AppError>;

/// Wraps a successful payload.
pub fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse {
        code: 0,
        data,
        msg: "ok".to_string(),
    }))
}

/// `?page=&limit=` query parameters shared by list endpoints.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_limit", alias = "pageSize")]
    pub limit: i64,
}

fn default_page() -> i64 {
    1
}

fn default_limit() -> i64 {
    20
}

impl PageQuery {
    /// Clamps to `page >= 1` and `1 <= limit <= 100`.
    pub fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            limit: self.limit.clamp(1, 100),
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page.max(1) - 1) * self.limit
    }
}

/// A page of results plus the total row count.
#[derive(Debug, Serialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}

impl<T> Paged<T> {
    pub fn new(items: Vec<T>, total: i64, query: PageQuery) -> Self {
        Self {
            items,
            total,
            page: query.page,
            limit: query.limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_query_normalization() {
        let q = PageQuery { page: 0, limit: 500 }.normalized();
        assert_eq!(q.page, 1);
        assert_eq!(q.limit, 100);
        assert_eq!(q.offset(), 0);

        let q = PageQuery { page: 3, limit: 20 }.normalized();
        assert_eq!(q.offset(), 40);
    }

    #[test]
    fn test_ok_envelope_shape() {
        let Json(body) = ok(serde_json::json!({"n": 1})).unwrap();
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["code"], 0);
        assert_eq!(value["msg"], "ok");
        assert_eq!(value["data"]["n"], 1);
    }
}
