use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{Account, AccountStatus, ApiKey, Platform, TokenUsage};

use super::{NewLog, Store};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Raw account row. Platform and status are stored as text/smallint and
/// converted here so the schema stays decoupled from the Rust enums.
#[derive(sqlx::FromRow)]
struct AccountRow {
    id: i64,
    name: String,
    platform: String,
    request_url: String,
    secret_key: String,
    refresh_token: Option<String>,
    proxy_uri: Option<String>,
    expires_at: Option<i64>,
    active: bool,
    status: i16,
    rate_limit_end_time: Option<DateTime<Utc>>,
}

impl AccountRow {
    fn into_account(self) -> anyhow::Result<Account> {
        let platform = Platform::parse(&self.platform)
            .ok_or_else(|| anyhow::anyhow!("account {}: unknown platform {}", self.id, self.platform))?;
        let status = AccountStatus::from_i16(self.status)
            .ok_or_else(|| anyhow::anyhow!("account {}: unknown status {}", self.id, self.status))?;
        Ok(Account {
            id: self.id,
            name: self.name,
            platform,
            request_url: self.request_url,
            secret_key: self.secret_key,
            refresh_token: self.refresh_token,
            proxy_uri: self.proxy_uri,
            expires_at: self.expires_at,
            active: self.active,
            status,
            rate_limit_end_time: self.rate_limit_end_time,
        })
    }
}

const ACCOUNT_COLUMNS: &str = "id, name, platform, request_url, secret_key, refresh_token, \
     proxy_uri, expires_at, active, status, rate_limit_end_time";

#[async_trait]
impl Store for PgStore {
    async fn pick_account(&self) -> anyhow::Result<Option<Account>> {
        // Least-recently-used among healthy accounts; the UPDATE both claims
        // and timestamps the pick so concurrent relays spread across accounts.
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "UPDATE accounts SET last_used_at = NOW() \
             WHERE id = ( \
                 SELECT id FROM accounts \
                 WHERE active AND status = 1 \
                 ORDER BY last_used_at ASC NULLS FIRST \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.map(AccountRow::into_account).transpose()
    }

    async fn get_account(&self, id: i64) -> anyhow::Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(AccountRow::into_account).transpose()
    }

    async fn accounts_with_status(
        &self,
        status: AccountStatus,
    ) -> anyhow::Result<Vec<Account>> {
        let rows = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts \
             WHERE active AND status = $1 ORDER BY id ASC"
        ))
        .bind(status.as_i16())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AccountRow::into_account).collect()
    }

    async fn accounts_needing_refresh(&self) -> anyhow::Result<Vec<Account>> {
        let rows = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts \
             WHERE active AND platform = $1 ORDER BY id ASC"
        ))
        .bind(Platform::Claude.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AccountRow::into_account).collect()
    }

    async fn set_account_status(
        &self,
        id: i64,
        status: AccountStatus,
        rate_limit_end_time: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE accounts SET status = $2, rate_limit_end_time = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_i16())
        .bind(rate_limit_end_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_account_credential(
        &self,
        id: i64,
        secret_key: &str,
        refresh_token: &str,
        expires_at: i64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE accounts SET secret_key = $2, refresh_token = $3, expires_at = $4 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(secret_key)
        .bind(refresh_token)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_api_key(&self, key: &str) -> anyhow::Result<Option<ApiKey>> {
        let row = sqlx::query_as::<_, (i64, i64, String, bool)>(
            "SELECT id, user_id, key, active FROM api_keys WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, user_id, key, active)| ApiKey {
            id,
            user_id,
            key,
            active,
        }))
    }

    async fn add_account_usage(
        &self,
        account_id: i64,
        usage: &TokenUsage,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE accounts SET \
                 total_input_tokens = total_input_tokens + $2, \
                 total_output_tokens = total_output_tokens + $3, \
                 total_cache_read_input_tokens = total_cache_read_input_tokens + $4, \
                 total_cache_creation_input_tokens = total_cache_creation_input_tokens + $5, \
                 today_input_tokens = today_input_tokens + $2, \
                 today_output_tokens = today_output_tokens + $3, \
                 today_cache_read_input_tokens = today_cache_read_input_tokens + $4, \
                 today_cache_creation_input_tokens = today_cache_creation_input_tokens + $5, \
                 total_requests = total_requests + 1, \
                 today_requests = today_requests + 1 \
             WHERE id = $1",
        )
        .bind(account_id)
        .bind(usage.input_tokens as i64)
        .bind(usage.output_tokens as i64)
        .bind(usage.cache_read_input_tokens as i64)
        .bind(usage.cache_creation_input_tokens as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_api_key_usage(
        &self,
        api_key_id: i64,
        usage: &TokenUsage,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE api_keys SET \
                 total_input_tokens = total_input_tokens + $2, \
                 total_output_tokens = total_output_tokens + $3, \
                 total_cache_read_input_tokens = total_cache_read_input_tokens + $4, \
                 total_cache_creation_input_tokens = total_cache_creation_input_tokens + $5, \
                 today_input_tokens = today_input_tokens + $2, \
                 today_output_tokens = today_output_tokens + $3, \
                 today_cache_read_input_tokens = today_cache_read_input_tokens + $4, \
                 today_cache_creation_input_tokens = today_cache_creation_input_tokens + $5, \
                 total_requests = total_requests + 1, \
                 today_requests = today_requests + 1 \
             WHERE id = $1",
        )
        .bind(api_key_id)
        .bind(usage.input_tokens as i64)
        .bind(usage.output_tokens as i64)
        .bind(usage.cache_read_input_tokens as i64)
        .bind(usage.cache_creation_input_tokens as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_log(&self, log: &NewLog) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO request_logs
                   (duration_ms, user_id, api_key_id, account_id,
                    input_tokens, output_tokens,
                    cache_read_input_tokens, cache_creation_input_tokens, success)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
        )
        .bind(log.duration_ms)
        .bind(log.user_id)
        .bind(log.api_key_id)
        .bind(log.account_id)
        .bind(log.usage.input_tokens as i64)
        .bind(log.usage.output_tokens as i64)
        .bind(log.usage.cache_read_input_tokens as i64)
        .bind(log.usage.cache_creation_input_tokens as i64)
        .bind(log.success)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let res = sqlx::query("DELETE FROM request_logs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn reset_daily_counters(&self) -> anyhow::Result<u64> {
        let accounts = sqlx::query(
            "UPDATE accounts SET today_input_tokens = 0, today_output_tokens = 0, \
             today_cache_read_input_tokens = 0, today_cache_creation_input_tokens = 0, \
             today_requests = 0, today_cost = 0",
        )
        .execute(&self.pool)
        .await?;
        let keys = sqlx::query(
            "UPDATE api_keys SET today_input_tokens = 0, today_output_tokens = 0, \
             today_cache_read_input_tokens = 0, today_cache_creation_input_tokens = 0, \
             today_requests = 0, today_cost = 0",
        )
        .execute(&self.pool)
        .await?;
        Ok(accounts.rows_affected() + keys.rows_affected())
    }
}
