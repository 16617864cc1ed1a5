use chrono::{DateTime, Duration, Utc};

use crate::models::AccountStatus;

/// Fallback backoff when a 429 arrives without a parseable Retry-After.
pub const DEFAULT_RATE_LIMIT_BACKOFF_SECS: i64 = 30 * 60;

/// Map one relay outcome onto the account lifecycle.
///
/// Any 2xx heals the account, including one that was rate limited: the
/// upstream has demonstrably served it, so waiting out the window would only
/// idle a working account. 429 enters the rate-limited state with an end
/// time taken from Retry-After when present. Every other error status marks
/// the account abnormal until a probe succeeds.
pub fn transition(
    status: u16,
    retry_after_secs: Option<i64>,
    now: DateTime<Utc>,
) -> (AccountStatus, Option<DateTime<Utc>>) {
    match status {
        200..=299 => (AccountStatus::Active, None),
        429 => {
            let backoff = retry_after_secs
                .filter(|s| *s > 0)
                .unwrap_or(DEFAULT_RATE_LIMIT_BACKOFF_SECS);
            (
                AccountStatus::RateLimited,
                Some(now + Duration::seconds(backoff)),
            )
        }
        _ => (AccountStatus::Abnormal, None),
    }
}
