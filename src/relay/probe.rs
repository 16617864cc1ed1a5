use std::time::Duration;

use crate::errors::RelayError;
use crate::models::{Account, Platform};
use crate::relay::{client, headers};

/// Cheapest request each platform will meaningfully answer. All platform
/// dispatch for probing lives here; adding a platform means adding one arm.
fn probe_request(account: &Account) -> (String, serde_json::Value) {
    let base = account.request_url.trim_end_matches('/');
    match account.platform {
        Platform::Claude | Platform::ClaudeConsole => (
            format!("{base}/v1/messages"),
            serde_json::json!({
                "model": "claude-3-5-haiku-20241022",
                "max_tokens": 1,
                "messages": [{"role": "user", "content": "hi"}],
            }),
        ),
        Platform::OpenAi => (
            format!("{base}/v1/chat/completions"),
            serde_json::json!({
                "model": "gpt-4o-mini",
                "max_tokens": 1,
                "messages": [{"role": "user", "content": "hi"}],
            }),
        ),
    }
}

/// Fire one minimal request at the account's upstream and return the HTTP
/// status. Used by the recovery sweep to decide whether an abnormal account
/// has healed; the response body is irrelevant and dropped.
pub async fn probe(account: &Account, timeout: Duration) -> Result<u16, RelayError> {
    let client = client::build_client(account, timeout)?;
    let (url, body) = probe_request(account);
    let outbound =
        headers::build_outbound_headers(&axum::http::HeaderMap::new(), &account.secret_key);

    let resp = client
        .post(&url)
        .headers(outbound)
        .json(&body)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                RelayError::Timeout
            } else {
                RelayError::Network(e.to_string())
            }
        })?;

    Ok(resp.status().as_u16())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountStatus;

    fn account(platform: Platform) -> Account {
        Account {
            id: 1,
            name: "a".into(),
            platform,
            request_url: "https://api.example.com/".into(),
            secret_key: "sk".into(),
            refresh_token: None,
            proxy_uri: None,
            expires_at: None,
            active: true,
            status: AccountStatus::Abnormal,
            rate_limit_end_time: None,
        }
    }

    #[test]
    fn probe_targets_the_platform_endpoint() {
        let (url, body) = probe_request(&account(Platform::ClaudeConsole));
        assert_eq!(url, "https://api.example.com/v1/messages");
        assert_eq!(body["max_tokens"], 1);

        let (url, _) = probe_request(&account(Platform::OpenAi));
        assert_eq!(url, "https://api.example.com/v1/chat/completions");
    }
}
