use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upstream platform an account belongs to. Closed set: dispatch on this is
/// centralized in `relay::probe` so adding a platform touches one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Direct provider API authenticated with a refreshable OAuth token.
    Claude,
    /// Console variant of the provider, authenticated with a static secret.
    ClaudeConsole,
    /// Second provider family (chat-completions wire format).
    OpenAi,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Claude => "claude",
            Platform::ClaudeConsole => "claude_console",
            Platform::OpenAi => "openai",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "claude" => Some(Platform::Claude),
            "claude_console" => Some(Platform::ClaudeConsole),
            "openai" => Some(Platform::OpenAi),
            _ => None,
        }
    }

    /// Whether this platform's credential expires and needs proactive refresh.
    pub fn credential_expires(self) -> bool {
        matches!(self, Platform::Claude)
    }
}

/// Health state of an account, driven exclusively by relay outcomes and the
/// scheduler's sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Abnormal,
    RateLimited,
}

impl AccountStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            AccountStatus::Active => 1,
            AccountStatus::Abnormal => 2,
            AccountStatus::RateLimited => 3,
        }
    }

    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            1 => Some(AccountStatus::Active),
            2 => Some(AccountStatus::Abnormal),
            3 => Some(AccountStatus::RateLimited),
            _ => None,
        }
    }
}

/// A configured upstream identity.
///
/// Invariant: `rate_limit_end_time.is_some()` iff `status == RateLimited`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub platform: Platform,
    /// Base URL; relays POST to `{request_url}/v1/messages`.
    pub request_url: String,
    /// Secret presented upstream: a static key, or the current access token
    /// for platforms whose credential expires.
    pub secret_key: String,
    /// OAuth refresh token; rotated on every successful refresh. `None` for
    /// platforms with static credentials.
    pub refresh_token: Option<String>,
    /// Optional outbound proxy for this account's upstream connections.
    pub proxy_uri: Option<String>,
    /// Access-token expiry (epoch secs); only meaningful when
    /// `platform.credential_expires()`.
    pub expires_at: Option<i64>,
    /// Administratively enabled. Inactive accounts are excluded from
    /// forwarding and from every scheduler sweep.
    pub active: bool,
    pub status: AccountStatus,
    pub rate_limit_end_time: Option<DateTime<Utc>>,
}

impl Account {
    /// True when the access token carries an expiry and it falls within
    /// `window_secs` seconds of `now`. Accounts without a recorded expiry
    /// are never refreshed.
    pub fn token_expires_within(&self, now: i64, window_secs: i64) -> bool {
        match self.expires_at {
            Some(at) if at > 0 => now >= at - window_secs,
            _ => false,
        }
    }
}
