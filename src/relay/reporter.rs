use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::models::{ApiKey, TokenUsage};
use crate::relay::state;
use crate::store::{NewLog, Store};

/// Bounded queue depth for relay reports. Streams finalize from `Drop`, so
/// enqueueing must never block; when the worker falls this far behind,
/// reports are dropped with a warning rather than stalling response bodies.
const REPORT_QUEUE_CAPACITY: usize = 256;

/// How one relay attempt ended, as far as account health is concerned.
#[derive(Debug, Clone, Copy)]
pub enum RelayOutcome {
    /// The upstream answered with an HTTP status.
    Status {
        code: u16,
        retry_after_secs: Option<i64>,
    },
    /// The request never produced a status (timeout, connect failure).
    Transport,
}

/// Everything the worker needs to settle one relay: lifecycle transition,
/// usage counters, and the request log.
#[derive(Debug, Clone)]
pub struct RelayReport {
    pub account_id: i64,
    pub api_key: Option<ApiKey>,
    pub outcome: RelayOutcome,
    pub usage: Option<TokenUsage>,
    pub duration_ms: i64,
}

/// Cloneable enqueue side of the reporter.
#[derive(Clone)]
pub struct ReporterHandle {
    tx: mpsc::Sender<RelayReport>,
}

impl ReporterHandle {
    /// Enqueue without blocking; safe to call from `Drop`.
    pub fn report(&self, report: RelayReport) {
        if let Err(e) = self.tx.try_send(report) {
            tracing::warn!("relay report dropped: {e}");
        }
    }
}

/// Single worker that serializes all post-relay bookkeeping. Replaces
/// per-request fire-and-forget tasks so settlement survives load spikes in
/// bounded memory and store writes for one account don't interleave.
pub struct Reporter {
    handle: ReporterHandle,
    worker: JoinHandle<()>,
}

impl Reporter {
    pub fn spawn(store: Arc<dyn Store>) -> Self {
        let (tx, mut rx) = mpsc::channel::<RelayReport>(REPORT_QUEUE_CAPACITY);
        let worker = tokio::spawn(async move {
            while let Some(report) = rx.recv().await {
                if let Err(e) = settle(store.as_ref(), report).await {
                    tracing::error!("failed to settle relay report: {e:#}");
                }
            }
        });
        Self {
            handle: ReporterHandle { tx },
            worker,
        }
    }

    pub fn handle(&self) -> ReporterHandle {
        self.handle.clone()
    }

    /// Drop the enqueue side and wait for the worker to drain the queue.
    pub async fn shutdown(self) {
        drop(self.handle);
        if let Err(e) = self.worker.await {
            tracing::error!("reporter worker panicked: {e}");
        }
    }
}

async fn settle(store: &dyn Store, report: RelayReport) -> anyhow::Result<()> {
    let status_code = match report.outcome {
        RelayOutcome::Status {
            code,
            retry_after_secs,
        } => {
            let (status, rate_limit_end) = state::transition(code, retry_after_secs, Utc::now());
            store
                .set_account_status(report.account_id, status, rate_limit_end)
                .await?;
            Some(code)
        }
        // Transport failures say nothing about the account's standing with
        // the upstream; leave its lifecycle alone.
        RelayOutcome::Transport => {
            tracing::warn!(account_id = report.account_id, "relay transport failure");
            None
        }
    };

    let success = status_code.is_some_and(|c| (200..300).contains(&c));
    let usage = report.usage.filter(|u| !u.is_empty());

    let (Some(usage), true) = (usage, success) else {
        return Ok(());
    };

    // Account counters track every successful usage-bearing relay; the api
    // key counters and the log additionally need an attributable caller.
    store.add_account_usage(report.account_id, &usage).await?;

    let Some(api_key) = report.api_key else {
        return Ok(());
    };
    store.add_api_key_usage(api_key.id, &usage).await?;
    store
        .insert_log(&NewLog {
            duration_ms: report.duration_ms,
            user_id: api_key.user_id,
            api_key_id: api_key.id,
            account_id: report.account_id,
            usage,
            success: true,
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Account, AccountStatus, Platform};
    use crate::store::MemoryStore;

    fn account(id: i64) -> Account {
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
            status: AccountStatus::Active,
            rate_limit_end_time: None,
        }
    }

    fn api_key(id: i64) -> ApiKey {
        ApiKey {
            id,
            user_id: 7,
            key: format!("key-{id}"),
            active: true,
        }
    }

    #[tokio::test]
    async fn successful_relay_settles_counters_log_and_status() {
        let store = Arc::new(MemoryStore::with_accounts(vec![account(1)]));
        let reporter = Reporter::spawn(store.clone());
        reporter.handle().report(RelayReport {
            account_id: 1,
            api_key: Some(api_key(5)),
            outcome: RelayOutcome::Status {
                code: 200,
                retry_after_secs: None,
            },
            usage: Some(TokenUsage {
                input_tokens: 11,
                output_tokens: 22,
                ..Default::default()
            }),
            duration_ms: 321,
        });
        reporter.shutdown().await;

        assert_eq!(store.account_usage(1).output_tokens, 22);
        assert_eq!(store.api_key_usage(5).input_tokens, 11);
        let logs = store.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].duration_ms, 321);
        assert_eq!(logs[0].user_id, 7);
    }

    #[tokio::test]
    async fn rate_limit_report_sets_end_time_and_writes_no_log() {
        let store = Arc::new(MemoryStore::with_accounts(vec![account(1)]));
        let reporter = Reporter::spawn(store.clone());
        reporter.handle().report(RelayReport {
            account_id: 1,
            api_key: Some(api_key(5)),
            outcome: RelayOutcome::Status {
                code: 429,
                retry_after_secs: Some(90),
            },
            usage: None,
            duration_ms: 10,
        });
        reporter.shutdown().await;

        let acct = store.get_account(1).await.unwrap().unwrap();
        assert_eq!(acct.status, AccountStatus::RateLimited);
        assert!(acct.rate_limit_end_time.is_some());
        assert!(store.logs().is_empty());
    }

    #[tokio::test]
    async fn success_without_api_key_counts_account_usage_but_skips_log() {
        let store = Arc::new(MemoryStore::with_accounts(vec![{
            let mut a = account(1);
            a.status = AccountStatus::Abnormal;
            a
        }]));
        let reporter = Reporter::spawn(store.clone());
        reporter.handle().report(RelayReport {
            account_id: 1,
            api_key: None,
            outcome: RelayOutcome::Status {
                code: 200,
                retry_after_secs: None,
            },
            usage: Some(TokenUsage {
                input_tokens: 1,
                ..Default::default()
            }),
            duration_ms: 5,
        });
        reporter.shutdown().await;

        let acct = store.get_account(1).await.unwrap().unwrap();
        assert_eq!(acct.status, AccountStatus::Active);
        assert!(store.logs().is_empty());
        assert_eq!(store.account_usage(1).input_tokens, 1);
        assert!(store.api_key_usage(5).is_empty());
    }

    #[tokio::test]
    async fn transport_failure_leaves_lifecycle_alone() {
        let store = Arc::new(MemoryStore::with_accounts(vec![account(1)]));
        let reporter = Reporter::spawn(store.clone());
        reporter.handle().report(RelayReport {
            account_id: 1,
            api_key: None,
            outcome: RelayOutcome::Transport,
            usage: None,
            duration_ms: 120_000,
        });
        reporter.shutdown().await;

        let acct = store.get_account(1).await.unwrap().unwrap();
        assert_eq!(acct.status, AccountStatus::Active);
    }
}
