//! Caller identity. Authentication happens at the gateway, which forwards the
//! resolved user in `x-user-id` / `x-user-role`.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::errors::AppError;
use crate::state::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Admin,
}

/// The authenticated caller of a request.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub user_id: Uuid,
    pub role: Role,
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Owners and administrators may touch a resource; everyone else is refused.
    pub fn ensure_owner(&self, owner_id: Uuid) -> Result<(), AppError> {
        if self.user_id == owner_id || self.is_admin() {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }
}

/// A caller that must hold the administrator role.
#[derive(Debug, Clone, Copy)]
pub struct AdminCaller(pub Caller);

/// A trusted service-to-service call authenticated by the shared internal token.
#[derive(Debug, Clone, Copy)]
pub struct InternalCaller;

fn parse_caller(parts: &Parts) -> Result<Caller, AppError> {
    let user_id = parts
        .headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .ok_or(AppError::Unauthorized)?;

    let role = match parts
        .headers
        .get(USER_ROLE_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        Some(r) if r.eq_ignore_ascii_case("admin") => Role::Admin,
        _ => Role::User,
    };

    Ok(Caller { user_id, role })
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parse_caller(parts)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AdminCaller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let caller = parse_caller(parts)?;
        if !caller.is_admin() {
            return Err(AppError::Forbidden);
        }
        Ok(AdminCaller(caller))
    }
}

#[async_trait]
impl FromRequestParts<AppState> for InternalCaller {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get(INTERNAL_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(AppError::Unauthorized)?;

        if !constant_time_eq(presented.as_bytes(), state.config.internal_api_token.as_bytes()) {
            return Err(AppError::Unauthorized);
        }
        Ok(InternalCaller)
    }
}

/// Byte comparison whose running time depends only on the input lengths.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts_with(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_missing_user_header_is_unauthorized() {
        let parts = parts_with(&[]);
        assert!(matches!(parse_caller(&parts), Err(AppError::Unauthorized)));
    }

    #[test]
    fn test_malformed_user_id_is_unauthorized() {
        let parts = parts_with(&[(USER_ID_HEADER, "not-a-uuid")]);
        assert!(matches!(parse_caller(&parts), Err(AppError::Unauthorized)));
    }

    #[test]
    fn test_role_defaults_to_user() {
        let id = Uuid::new_v4();
        let parts = parts_with(&[(USER_ID_HEADER, &id.to_string())]);
        let caller = parse_caller(&parts).unwrap();
        assert_eq!(caller.user_id, id);
        assert_eq!(caller.role, Role::User);
    }

    #[test]
    fn test_admin_role_parsed_case_insensitively() {
        let id = Uuid::new_v4();
        let parts = parts_with(&[(USER_ID_HEADER, &id.to_string()), (USER_ROLE_HEADER, "ADMIN")]);
        assert!(parse_caller(&parts).unwrap().is_admin());
    }

    #[test]
    fn test_ensure_owner() {
        let owner = Uuid::new_v4();
        let stranger = Caller {
            user_id: Uuid::new_v4(),
            role: Role::User,
        };
        let admin = Caller {
            user_id: Uuid::new_v4(),
            role: Role::Admin,
        };
        assert!(matches!(stranger.ensure_owner(owner), Err(AppError::Forbidden)));
        assert!(admin.ensure_owner(owner).is_ok());
        assert!(Caller {
            user_id: owner,
            role: Role::User
        }
        .ensure_owner(owner)
        .is_ok());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
