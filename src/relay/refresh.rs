use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use crate::models::Account;

const OAUTH_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Result of one successful token exchange. The provider rotates the
/// refresh token on every exchange, so both halves must be persisted
/// together or the account is bricked at the next refresh.
#[derive(Debug, Clone)]
pub struct RefreshedCredential {
    pub access_token: String,
    pub refresh_token: String,
    /// New expiry, epoch seconds.
    pub expires_at: i64,
}

/// Seam over the provider's OAuth token endpoint so the refresh job and the
/// forwarder pre-flight can be tested without network access.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self, account: &Account) -> anyhow::Result<RefreshedCredential>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
}

/// Real token exchange against the provider.
pub struct OauthRefresher {
    client: reqwest::Client,
    token_url: String,
}

impl OauthRefresher {
    pub fn new(timeout: std::time::Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            token_url: OAUTH_TOKEN_URL.to_string(),
        })
    }

    #[cfg(test)]
    pub fn with_token_url(token_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token_url,
        }
    }
}

#[async_trait]
impl CredentialRefresher for OauthRefresher {
    async fn refresh(&self, account: &Account) -> anyhow::Result<RefreshedCredential> {
        let refresh_token = account
            .refresh_token
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("account {} has no refresh token", account.id))?;

        let resp = self
            .client
            .post(&self.token_url)
            .json(&serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
                "client_id": OAUTH_CLIENT_ID,
            }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("token endpoint returned {status} for account {}", account.id);
        }

        let token: TokenResponse = resp.json().await?;
        Ok(RefreshedCredential {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: Utc::now().timestamp() + token.expires_in,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountStatus, Platform};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn account(refresh_token: Option<&str>) -> Account {
        Account {
            id: 1,
            name: "a".into(),
            platform: Platform::Claude,
            request_url: "https://api.example.com".into(),
            secret_key: "old-access".into(),
            refresh_token: refresh_token.map(String::from),
            proxy_uri: None,
            expires_at: Some(Utc::now().timestamp() + 60),
            active: true,
            status: AccountStatus::Active,
            rate_limit_end_time: None,
        }
    }

    #[tokio::test]
    async fn exchanges_refresh_token_and_computes_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .and(body_partial_json(serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": "rt-1",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-2",
                "refresh_token": "rt-2",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let refresher = OauthRefresher::with_token_url(format!("{}/v1/oauth/token", server.uri()));
        let before = Utc::now().timestamp();
        let cred = refresher.refresh(&account(Some("rt-1"))).await.unwrap();
        assert_eq!(cred.access_token, "at-2");
        assert_eq!(cred.refresh_token, "rt-2");
        assert!(cred.expires_at >= before + 3600);
    }

    #[tokio::test]
    async fn missing_refresh_token_and_error_statuses_fail() {
        let refresher = OauthRefresher::with_token_url("http://unused.invalid".into());
        assert!(refresher.refresh(&account(None)).await.is_err());

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth/token"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;
        let refresher = OauthRefresher::with_token_url(format!("{}/v1/oauth/token", server.uri()));
        assert!(refresher.refresh(&account(Some("rt"))).await.is_err());
    }
}
