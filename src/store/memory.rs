use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Account, AccountStatus, ApiKey, TokenUsage};

use super::{NewLog, Store};

/// In-memory `Store` used by tests. Semantics mirror `PgStore`: LRU account
/// picking, status transitions, usage counters, and log retention.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    accounts: Vec<Account>,
    last_used: HashMap<i64, u64>,
    pick_seq: u64,
    api_keys: Vec<ApiKey>,
    account_usage: HashMap<i64, TokenUsage>,
    api_key_usage: HashMap<i64, TokenUsage>,
    daily_account_usage: HashMap<i64, TokenUsage>,
    daily_api_key_usage: HashMap<i64, TokenUsage>,
    logs: Vec<(DateTime<Utc>, NewLog)>,
}

fn fold(into: &mut TokenUsage, usage: &TokenUsage) {
    into.input_tokens += usage.input_tokens;
    into.output_tokens += usage.output_tokens;
    into.cache_read_input_tokens += usage.cache_read_input_tokens;
    into.cache_creation_input_tokens += usage.cache_creation_input_tokens;
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts(accounts: Vec<Account>) -> Self {
        let store = Self::new();
        store.inner.lock().unwrap().accounts = accounts;
        store
    }

    pub fn add_account(&self, account: Account) {
        self.inner.lock().unwrap().accounts.push(account);
    }

    pub fn add_api_key(&self, key: ApiKey) {
        self.inner.lock().unwrap().api_keys.push(key);
    }

    pub fn add_log_at(&self, created_at: DateTime<Utc>, log: NewLog) {
        self.inner.lock().unwrap().logs.push((created_at, log));
    }

    pub fn logs(&self) -> Vec<NewLog> {
        self.inner
            .lock()
            .unwrap()
            .logs
            .iter()
            .map(|(_, l)| l.clone())
            .collect()
    }

    pub fn account_usage(&self, id: i64) -> TokenUsage {
        self.inner
            .lock()
            .unwrap()
            .account_usage
            .get(&id)
            .copied()
            .unwrap_or_default()
    }

    pub fn api_key_usage(&self, id: i64) -> TokenUsage {
        self.inner
            .lock()
            .unwrap()
            .api_key_usage
            .get(&id)
            .copied()
            .unwrap_or_default()
    }

    pub fn daily_account_usage(&self, id: i64) -> TokenUsage {
        self.inner
            .lock()
            .unwrap()
            .daily_account_usage
            .get(&id)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn pick_account(&self) -> anyhow::Result<Option<Account>> {
        let mut inner = self.inner.lock().unwrap();
        let picked = inner
            .accounts
            .iter()
            .filter(|a| a.active && a.status == AccountStatus::Active)
            .min_by_key(|a| inner.last_used.get(&a.id).copied().unwrap_or(0))
            .cloned();
        if let Some(acct) = &picked {
            inner.pick_seq += 1;
            let seq = inner.pick_seq;
            inner.last_used.insert(acct.id, seq);
        }
        Ok(picked)
    }

    async fn get_account(&self, id: i64) -> anyhow::Result<Option<Account>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.accounts.iter().find(|a| a.id == id).cloned())
    }

    async fn accounts_with_status(
        &self,
        status: AccountStatus,
    ) -> anyhow::Result<Vec<Account>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .accounts
            .iter()
            .filter(|a| a.active && a.status == status)
            .cloned()
            .collect())
    }

    async fn accounts_needing_refresh(&self) -> anyhow::Result<Vec<Account>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .accounts
            .iter()
            .filter(|a| a.active && a.platform.credential_expires())
            .cloned()
            .collect())
    }

    async fn set_account_status(
        &self,
        id: i64,
        status: AccountStatus,
        rate_limit_end_time: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(acct) = inner.accounts.iter_mut().find(|a| a.id == id) {
            acct.status = status;
            acct.rate_limit_end_time = rate_limit_end_time;
        }
        Ok(())
    }

    async fn update_account_credential(
        &self,
        id: i64,
        secret_key: &str,
        refresh_token: &str,
        expires_at: i64,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(acct) = inner.accounts.iter_mut().find(|a| a.id == id) {
            acct.secret_key = secret_key.to_string();
            acct.refresh_token = Some(refresh_token.to_string());
            acct.expires_at = Some(expires_at);
        }
        Ok(())
    }

    async fn get_api_key(&self, key: &str) -> anyhow::Result<Option<ApiKey>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.api_keys.iter().find(|k| k.key == key).cloned())
    }

    async fn add_account_usage(
        &self,
        account_id: i64,
        usage: &TokenUsage,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        fold(inner.account_usage.entry(account_id).or_default(), usage);
        fold(
            inner.daily_account_usage.entry(account_id).or_default(),
            usage,
        );
        Ok(())
    }

    async fn add_api_key_usage(
        &self,
        api_key_id: i64,
        usage: &TokenUsage,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        fold(inner.api_key_usage.entry(api_key_id).or_default(), usage);
        fold(
            inner.daily_api_key_usage.entry(api_key_id).or_default(),
            usage,
        );
        Ok(())
    }

    async fn insert_log(&self, log: &NewLog) -> anyhow::Result<()> {
        self.inner
            .lock()
            .unwrap()
            .logs
            .push((Utc::now(), log.clone()));
        Ok(())
    }

    async fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.logs.len();
        inner.logs.retain(|(at, _)| *at >= cutoff);
        Ok((before - inner.logs.len()) as u64)
    }

    async fn reset_daily_counters(&self) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let touched = (inner.daily_account_usage.len() + inner.daily_api_key_usage.len()) as u64;
        inner.daily_account_usage.clear();
        inner.daily_api_key_usage.clear();
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Platform;

    fn account(id: i64, status: AccountStatus) -> Account {
        Account {
            id,
            name: format!("acct-{id}"),
            platform: Platform::ClaudeConsole,
            request_url: "https://api.example.com".into(),
            secret_key: "sk".into(),
            refresh_token: None,
            proxy_uri: None,
            expires_at: None,
            active: true,
            status,
            rate_limit_end_time: None,
        }
    }

    #[tokio::test]
    async fn picking_rotates_over_healthy_accounts() {
        let store = MemoryStore::with_accounts(vec![
            account(1, AccountStatus::Active),
            account(2, AccountStatus::Active),
            account(3, AccountStatus::Abnormal),
        ]);
        let first = store.pick_account().await.unwrap().unwrap().id;
        let second = store.pick_account().await.unwrap().unwrap().id;
        assert_ne!(first, second);
        assert!(first != 3 && second != 3);
    }

    #[tokio::test]
    async fn daily_reset_clears_only_daily_counters() {
        let store = MemoryStore::new();
        let usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 20,
            ..Default::default()
        };
        store.add_account_usage(1, &usage).await.unwrap();
        store.reset_daily_counters().await.unwrap();
        assert_eq!(store.daily_account_usage(1), TokenUsage::default());
        assert_eq!(store.account_usage(1).input_tokens, 10);
    }
}
