use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::errors::AppError;

/// Characters of entropy in a code, before grouping.
const CODE_CHARS: usize = 12;
const GROUP_LEN: usize = 4;
const RANDOM_BYTES: usize = 9;

/// Largest batch an administrator can mint in one request.
pub const MAX_BATCH: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvitationCode {
    pub id: i64,
    pub code: String,
    pub creator_id: Uuid,
    /// -1 = unlimited.
    pub max_uses: i32,
    pub used_count: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub note: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvitationUse {
    pub id: i64,
    pub code: String,
    pub used_by: Uuid,
    pub used_at: DateTime<Utc>,
    pub ip: String,
    pub user_agent: String,
}

/// Why a redemption or validation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Inactive,
    Expired,
    Exhausted,
    AlreadyUsed,
}

impl Rejection {
    pub fn message(self) -> &'static str {
        match self {
            Rejection::Inactive => "invitation code has been deactivated",
            Rejection::Expired => "invitation code has expired",
            Rejection::Exhausted => "invitation code usage limit reached",
            Rejection::AlreadyUsed => "you have already used this invitation code",
        }
    }
}

/// Draws a fresh `XXXX-XXXX-XXXX` code from the OS-seeded thread RNG.
pub fn generate_code() -> String {
    let mut bytes = [0u8; RANDOM_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    format_code(&bytes)
}

/// Encodes random bytes as unpadded RFC 4648 base32 and groups the first
/// twelve characters in fours.
pub fn format_code(bytes: &[u8]) -> String {
    let encoded = base32::encode(base32::Alphabet::Rfc4648 { padding: false }, bytes);
    encoded
        .chars()
        .take(CODE_CHARS)
        .collect::<Vec<_>>()
        .chunks(GROUP_LEN)
        .map(|group| group.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

/// Codes are matched case-insensitively and tolerate surrounding whitespace.
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

impl InvitationCode {
    pub fn check(&self, now: DateTime<Utc>) -> Result<(), Rejection> {
        if !self.active {
            return Err(Rejection::Inactive);
        }
        if self.expires_at.is_some_and(|at| now > at) {
            return Err(Rejection::Expired);
        }
        if self.max_uses != -1 && self.used_count >= self.max_uses {
            return Err(Rejection::Exhausted);
        }
        Ok(())
    }
}

pub fn validate_max_uses(max_uses: i32) -> Result<(), AppError> {
    if max_uses == -1 || max_uses > 0 {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "max_uses must be -1 (unlimited) or greater than 0, got {max_uses}"
        )))
    }
}

/// Requested change to a code's expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryChange {
    Keep,
    Clear,
    Set(DateTime<Utc>),
}

/// `0` clears the expiry, a positive value sets it that many days from `now`.
pub fn expiry_change(now: DateTime<Utc>, expires_in_days: Option<i32>) -> Result<ExpiryChange, AppError> {
    match expires_in_days {
        None => Ok(ExpiryChange::Keep),
        Some(0) => Ok(ExpiryChange::Clear),
        Some(days) if days > 0 => Ok(ExpiryChange::Set(now + Duration::days(days as i64))),
        Some(days) => Err(AppError::Validation(format!(
            "expires_in_days cannot be negative, got {days}"
        ))),
    }
}

impl ExpiryChange {
    /// `(touch, value)` pair bound into `CASE WHEN touch THEN value ELSE expires_at END`.
    pub fn as_binds(self) -> (bool, Option<DateTime<Utc>>) {
        match self {
            ExpiryChange::Keep => (false, None),
            ExpiryChange::Clear => (true, None),
            ExpiryChange::Set(at) => (true, Some(at)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-05-10T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn code(max_uses: i32, used_count: i32, expires_at: Option<DateTime<Utc>>) -> InvitationCode {
        InvitationCode {
            id: 1,
            code: "ABCD-EFGH-IJKL".to_string(),
            creator_id: Uuid::nil(),
            max_uses,
            used_count,
            expires_at,
            active: true,
            note: String::new(),
            created_at: now(),
            updated_at: now(),
        }
    }

    #[test]
    fn test_generated_code_shape() {
        for _ in 0..50 {
            let c = generate_code();
            assert_eq!(c.len(), 14);
            let groups: Vec<&str> = c.split('-').collect();
            assert_eq!(groups.len(), 3);
            for g in groups {
                assert_eq!(g.len(), 4);
                assert!(g.chars().all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit()));
            }
        }
    }

    #[test]
    fn test_format_code_is_deterministic() {
        let bytes = [0u8; 9];
        assert_eq!(format_code(&bytes), "AAAA-AAAA-AAAA");
        let bytes = [0xffu8; 9];
        assert_eq!(format_code(&bytes), "7777-7777-7777");
    }

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code("  abcd-efgh-2345 "), "ABCD-EFGH-2345");
    }

    #[test]
    fn test_valid_code() {
        assert_eq!(code(5, 4, Some(now())).check(now()), Ok(()));
        assert_eq!(code(-1, 10_000, None).check(now()), Ok(()));
    }

    #[test]
    fn test_inactive_code() {
        let mut c = code(5, 0, None);
        c.active = false;
        assert_eq!(c.check(now()), Err(Rejection::Inactive));
    }

    #[test]
    fn test_expired_code() {
        let c = code(5, 0, Some(now() - Duration::seconds(1)));
        assert_eq!(c.check(now()), Err(Rejection::Expired));
    }

    #[test]
    fn test_exhausted_code() {
        assert_eq!(code(1, 1, None).check(now()), Err(Rejection::Exhausted));
    }

    #[test]
    fn test_max_uses_validation() {
        assert!(validate_max_uses(-1).is_ok());
        assert!(validate_max_uses(1).is_ok());
        assert!(validate_max_uses(0).is_err());
        assert!(validate_max_uses(-2).is_err());
    }

    #[test]
    fn test_expiry_change() {
        assert_eq!(expiry_change(now(), None).unwrap(), ExpiryChange::Keep);
        assert_eq!(expiry_change(now(), Some(0)).unwrap(), ExpiryChange::Clear);
        assert_eq!(
            expiry_change(now(), Some(7)).unwrap(),
            ExpiryChange::Set(now() + Duration::days(7))
        );
        assert!(expiry_change(now(), Some(-1)).is_err());
        assert_eq!(ExpiryChange::Clear.as_binds(), (true, None));
        assert_eq!(ExpiryChange::Keep.as_binds(), (false, None));
    }
}
