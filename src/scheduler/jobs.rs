use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Months, Utc};
use tracing::{info, warn};

use crate::config::Config;
use crate::errors::RelayError;
use crate::models::{Account, AccountStatus};
use crate::relay::probe;
use crate::relay::refresh::CredentialRefresher;
use crate::store::Store;

use super::{Cadence, Job};

/// Refresh tokens expiring within this window (matches the forwarder's
/// pre-flight check).
const REFRESH_WINDOW_SECS: i64 = 300;

/// Seam over the per-platform health probe so recovery sweeps are testable
/// without real upstreams.
#[async_trait]
pub trait AccountProber: Send + Sync {
    async fn probe(&self, account: &Account) -> Result<u16, RelayError>;
}

pub struct HttpProber {
    timeout: Duration,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl AccountProber for HttpProber {
    async fn probe(&self, account: &Account) -> Result<u16, RelayError> {
        probe::probe(account, self.timeout).await
    }
}

/// The production job set, wired in the fixed maintenance schedule.
pub fn standard_jobs(
    store: Arc<dyn Store>,
    refresher: Arc<dyn CredentialRefresher>,
    config: &Config,
) -> Vec<Arc<dyn Job>> {
    vec![
        Arc::new(StatsResetJob {
            store: store.clone(),
        }),
        Arc::new(LogRetentionJob {
            store: store.clone(),
            retention_months: config.log_retention_months,
        }),
        Arc::new(AbnormalRecoveryJob {
            store: store.clone(),
            prober: Arc::new(HttpProber::new(config.http_client_timeout())),
        }),
        Arc::new(RateLimitSweepJob {
            store: store.clone(),
        }),
        Arc::new(CredentialRefreshJob { store, refresher }),
    ]
}

/// Zeroes every daily usage counter at midnight UTC.
pub struct StatsResetJob {
    pub store: Arc<dyn Store>,
}

#[async_trait]
impl Job for StatsResetJob {
    fn name(&self) -> &'static str {
        "stats-reset"
    }

    fn cadence(&self) -> Cadence {
        Cadence::Daily { hour: 0, minute: 0 }
    }

    async fn run(&self) -> anyhow::Result<String> {
        let touched = self.store.reset_daily_counters().await?;
        Ok(format!("reset daily counters on {touched} rows"))
    }
}

/// Purges relay logs past the retention horizon.
pub struct LogRetentionJob {
    pub store: Arc<dyn Store>,
    pub retention_months: u32,
}

#[async_trait]
impl Job for LogRetentionJob {
    fn name(&self) -> &'static str {
        "log-retention"
    }

    fn cadence(&self) -> Cadence {
        Cadence::Daily { hour: 1, minute: 0 }
    }

    async fn run(&self) -> anyhow::Result<String> {
        let cutoff = Utc::now()
            .checked_sub_months(Months::new(self.retention_months))
            .ok_or_else(|| anyhow::anyhow!("retention cutoff underflow"))?;
        let deleted = self.store.delete_logs_before(cutoff).await?;
        Ok(format!(
            "deleted {deleted} logs older than {} months",
            self.retention_months
        ))
    }
}

/// Re-probes abnormal accounts; a successful answer puts them back in
/// rotation.
pub struct AbnormalRecoveryJob {
    pub store: Arc<dyn Store>,
    pub prober: Arc<dyn AccountProber>,
}

#[async_trait]
impl Job for AbnormalRecoveryJob {
    fn name(&self) -> &'static str {
        "abnormal-recovery"
    }

    fn cadence(&self) -> Cadence {
        Cadence::Every(Duration::from_secs(30 * 60))
    }

    async fn run(&self) -> anyhow::Result<String> {
        let accounts = self
            .store
            .accounts_with_status(AccountStatus::Abnormal)
            .await?;
        let total = accounts.len();
        let mut recovered = 0usize;

        for account in accounts {
            match self.prober.probe(&account).await {
                Ok(status) if (200..300).contains(&status) => {
                    self.store
                        .set_account_status(account.id, AccountStatus::Active, None)
                        .await?;
                    info!(account_id = account.id, "abnormal account recovered");
                    recovered += 1;
                }
                Ok(status) => {
                    info!(account_id = account.id, status, "abnormal account still failing");
                }
                Err(e) => {
                    warn!(account_id = account.id, "probe failed: {e}");
                }
            }
        }

        Ok(format!("probed {total} abnormal accounts, recovered {recovered}"))
    }
}

/// Releases accounts whose rate-limit window has elapsed.
pub struct RateLimitSweepJob {
    pub store: Arc<dyn Store>,
}

#[async_trait]
impl Job for RateLimitSweepJob {
    fn name(&self) -> &'static str {
        "rate-limit-sweep"
    }

    fn cadence(&self) -> Cadence {
        Cadence::Every(Duration::from_secs(10 * 60))
    }

    async fn run(&self) -> anyhow::Result<String> {
        let now = Utc::now();
        let accounts = self
            .store
            .accounts_with_status(AccountStatus::RateLimited)
            .await?;
        let total = accounts.len();
        let mut released = 0usize;

        for account in accounts {
            // A missing end time means the window was never recorded; treat
            // it as elapsed rather than stranding the account.
            let expired = account.rate_limit_end_time.map_or(true, |end| end <= now);
            if expired {
                self.store
                    .set_account_status(account.id, AccountStatus::Active, None)
                    .await?;
                info!(account_id = account.id, "rate limit window elapsed");
                released += 1;
            }
        }

        Ok(format!("checked {total} rate-limited accounts, released {released}"))
    }
}

/// Refreshes access tokens about to expire so relays never pay the
/// exchange latency inline.
pub struct CredentialRefreshJob {
    pub store: Arc<dyn Store>,
    pub refresher: Arc<dyn CredentialRefresher>,
}

#[async_trait]
impl Job for CredentialRefreshJob {
    fn name(&self) -> &'static str {
        "credential-refresh"
    }

    fn cadence(&self) -> Cadence {
        Cadence::Every(Duration::from_secs(15 * 60))
    }

    async fn run(&self) -> anyhow::Result<String> {
        let now = Utc::now().timestamp();
        let accounts = self.store.accounts_needing_refresh().await?;
        let total = accounts.len();
        let (mut refreshed, mut failed) = (0usize, 0usize);

        for account in accounts {
            if !account.token_expires_within(now, REFRESH_WINDOW_SECS) {
                continue;
            }
            match self.refresher.refresh(&account).await {
                Ok(cred) => {
                    self.store
                        .update_account_credential(
                            account.id,
                            &cred.access_token,
                            &cred.refresh_token,
                            cred.expires_at,
                        )
                        .await?;
                    info!(account_id = account.id, "credential refreshed");
                    refreshed += 1;
                }
                // Left for the next cycle; the account keeps its current
                // token until then.
                Err(e) => {
                    warn!(account_id = account.id, "credential refresh failed: {e:#}");
                    failed += 1;
                }
            }
        }

        Ok(format!(
            "checked {total} accounts, refreshed {refreshed}, failed {failed}"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Platform, TokenUsage};
    use crate::relay::refresh::RefreshedCredential;
    use crate::store::{MemoryStore, NewLog};
    use chrono::Duration as ChronoDuration;

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

    struct FixedProber(u16);

    #[async_trait]
    impl AccountProber for FixedProber {
        async fn probe(&self, _account: &Account) -> Result<u16, RelayError> {
            Ok(self.0)
        }
    }

    struct FixedRefresher;

    #[async_trait]
    impl CredentialRefresher for FixedRefresher {
        async fn refresh(&self, _account: &Account) -> anyhow::Result<RefreshedCredential> {
            Ok(RefreshedCredential {
                access_token: "new-access".into(),
                refresh_token: "new-refresh".into(),
                expires_at: Utc::now().timestamp() + 3600,
            })
        }
    }

    #[tokio::test]
    async fn recovery_sweep_heals_only_on_success_status() {
        let store = Arc::new(MemoryStore::with_accounts(vec![
            account(1, AccountStatus::Abnormal),
            account(2, AccountStatus::Active),
        ]));

        let job = AbnormalRecoveryJob {
            store: store.clone(),
            prober: Arc::new(FixedProber(200)),
        };
        job.run().await.unwrap();
        assert_eq!(
            store.get_account(1).await.unwrap().unwrap().status,
            AccountStatus::Active
        );

        // A still-failing probe leaves the account abnormal.
        store
            .set_account_status(1, AccountStatus::Abnormal, None)
            .await
            .unwrap();
        let job = AbnormalRecoveryJob {
            store: store.clone(),
            prober: Arc::new(FixedProber(500)),
        };
        job.run().await.unwrap();
        assert_eq!(
            store.get_account(1).await.unwrap().unwrap().status,
            AccountStatus::Abnormal
        );
    }

    #[tokio::test]
    async fn rate_limit_sweep_releases_only_elapsed_windows() {
        let mut expired = account(1, AccountStatus::RateLimited);
        expired.rate_limit_end_time = Some(Utc::now() - ChronoDuration::minutes(1));
        let mut pending = account(2, AccountStatus::RateLimited);
        pending.rate_limit_end_time = Some(Utc::now() + ChronoDuration::minutes(20));

        let store = Arc::new(MemoryStore::with_accounts(vec![expired, pending]));
        let job = RateLimitSweepJob {
            store: store.clone(),
        };
        let summary = job.run().await.unwrap();
        assert!(summary.contains("released 1"));

        let released = store.get_account(1).await.unwrap().unwrap();
        assert_eq!(released.status, AccountStatus::Active);
        assert!(released.rate_limit_end_time.is_none());
        assert_eq!(
            store.get_account(2).await.unwrap().unwrap().status,
            AccountStatus::RateLimited
        );
    }

    #[tokio::test]
    async fn refresh_job_targets_only_expiring_tokens() {
        let mut expiring = account(1, AccountStatus::Active);
        expiring.platform = Platform::Claude;
        expiring.refresh_token = Some("rt".into());
        expiring.expires_at = Some(Utc::now().timestamp() + 60);
        let mut fresh = account(2, AccountStatus::Active);
        fresh.platform = Platform::Claude;
        fresh.secret_key = "keep".into();
        fresh.expires_at = Some(Utc::now().timestamp() + 7200);

        let store = Arc::new(MemoryStore::with_accounts(vec![expiring, fresh]));
        let job = CredentialRefreshJob {
            store: store.clone(),
            refresher: Arc::new(FixedRefresher),
        };
        let summary = job.run().await.unwrap();
        assert!(summary.contains("refreshed 1"));

        let refreshed = store.get_account(1).await.unwrap().unwrap();
        assert_eq!(refreshed.secret_key, "new-access");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("new-refresh"));
        assert_eq!(
            store.get_account(2).await.unwrap().unwrap().secret_key,
            "keep"
        );
    }

    #[tokio::test]
    async fn retention_job_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let old = NewLog {
            duration_ms: 1,
            user_id: 1,
            api_key_id: 1,
            account_id: 1,
            usage: TokenUsage::default(),
            success: true,
        };
        store.add_log_at(Utc::now() - ChronoDuration::days(120), old.clone());
        store.add_log_at(Utc::now(), old);

        let job = LogRetentionJob {
            store: store.clone(),
            retention_months: 3,
        };
        let first = job.run().await.unwrap();
        assert!(first.contains("deleted 1"));
        let second = job.run().await.unwrap();
        assert!(second.contains("deleted 0"));
        assert_eq!(store.logs().len(), 1);
    }
}
