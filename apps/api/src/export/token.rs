//! Render tokens: the secret that lets the PDF renderer fetch resume data
//! back from `/export/:taskId`.
//!
//! A token is bound to one task and is accepted for ten minutes from task
//! creation. It is not consumed on use; the renderer fetches repeatedly.

use chrono::{DateTime, Duration, Utc};

use crate::identity::constant_time_eq;

pub fn token_ttl() -> Duration {
    Duration::minutes(10)
}

/// 128 random bits, hex encoded.
pub fn generate_token() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Inclusive at exactly ten minutes.
pub fn within_window(created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now <= created_at + token_ttl()
}

pub fn verify(expected: &str, presented: &str, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    !presented.is_empty()
        && constant_time_eq(expected.as_bytes(), presented.as_bytes())
        && within_window(created_at, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn created() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 2, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_token_shape() {
        let token = generate_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn test_accepted_at_exactly_ten_minutes() {
        let now = created() + Duration::minutes(10);
        assert!(within_window(created(), now));
    }

    #[test]
    fn test_rejected_one_second_after_window() {
        let now = created() + Duration::minutes(10) + Duration::seconds(1);
        assert!(!within_window(created(), now));
    }

    #[test]
    fn test_verify() {
        let token = generate_token();
        let now = created() + Duration::minutes(3);
        assert!(verify(&token, &token, created(), now));
        assert!(!verify(&token, "deadbeef", created(), now));
        assert!(!verify(&token, "", created(), now));
        assert!(!verify(&token, &token, created(), created() + Duration::minutes(11)));
    }
}
