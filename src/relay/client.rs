use std::time::Duration;

use crate::errors::RelayError;
use crate::models::Account;

/// Build the outbound client for one relay attempt. Per-account proxy and
/// the configured timeout force a fresh client per relay rather than a
/// shared pool. Upstream endpoints frequently sit behind self-signed
/// terminators, hence the certificate allowance.
pub fn build_client(account: &Account, timeout: Duration) -> Result<reqwest::Client, RelayError> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(true);

    if let Some(proxy_uri) = &account.proxy_uri {
        let proxy = reqwest::Proxy::all(proxy_uri)
            .map_err(|e| RelayError::ProxyConfiguration(format!("{proxy_uri}: {e}")))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| RelayError::Internal(anyhow::anyhow!("building http client: {e}")))
}
