use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Account, AccountStatus, ApiKey, TokenUsage};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// A relay log ready for insertion; the store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewLog {
    pub duration_ms: i64,
    pub user_id: i64,
    pub api_key_id: i64,
    pub account_id: i64,
    pub usage: TokenUsage,
    pub success: bool,
}

/// Persistence seam. Production uses `PgStore`; tests swap in `MemoryStore`
/// so forwarder and scheduler behavior can be exercised without a database.
#[async_trait]
pub trait Store: Send + Sync {
    /// Pick the active, healthy account that was used least recently, and
    /// mark it used. Returns `None` when no account qualifies.
    async fn pick_account(&self) -> anyhow::Result<Option<Account>>;

    async fn get_account(&self, id: i64) -> anyhow::Result<Option<Account>>;

    /// All administratively enabled accounts in the given health state.
    async fn accounts_with_status(&self, status: AccountStatus)
        -> anyhow::Result<Vec<Account>>;

    /// All enabled accounts whose platform carries an expiring credential.
    async fn accounts_needing_refresh(&self) -> anyhow::Result<Vec<Account>>;

    /// Transition an account's health state. `rate_limit_end_time` must be
    /// `Some` iff the new status is `RateLimited`.
    async fn set_account_status(
        &self,
        id: i64,
        status: AccountStatus,
        rate_limit_end_time: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()>;

    /// Store a freshly refreshed credential, the rotated refresh token, and
    /// the new expiry (epoch secs).
    async fn update_account_credential(
        &self,
        id: i64,
        secret_key: &str,
        refresh_token: &str,
        expires_at: i64,
    ) -> anyhow::Result<()>;

    async fn get_api_key(&self, key: &str) -> anyhow::Result<Option<ApiKey>>;

    /// Fold one relay's token usage into the account's lifetime and daily
    /// counters.
    async fn add_account_usage(&self, account_id: i64, usage: &TokenUsage)
        -> anyhow::Result<()>;

    async fn add_api_key_usage(&self, api_key_id: i64, usage: &TokenUsage)
        -> anyhow::Result<()>;

    async fn insert_log(&self, log: &NewLog) -> anyhow::Result<()>;

    /// Delete logs created before `cutoff`. Returns the number removed.
    async fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64>;

    /// Zero every account's and api key's daily counters. Returns rows
    /// touched. Idempotent within a day.
    async fn reset_daily_counters(&self) -> anyhow::Result<u64>;
}
