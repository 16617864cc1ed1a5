use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    /// Identity stamped into outbound request metadata so upstreams can
    /// attribute traffic to this deployment.
    pub instance_id: String,
    /// Per-attempt upstream timeout in seconds. Covers the whole exchange
    /// including the streamed body.
    /// Set via HTTP_CLIENT_TIMEOUT env var. Default: 120.
    pub http_client_timeout_secs: u64,
    /// Age beyond which relay logs are purged by the retention job.
    /// Set via LOG_RETENTION_MONTHS env var. Default: 3.
    pub log_retention_months: u32,
}

impl Config {
    pub fn http_client_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.http_client_timeout_secs)
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    Ok(Config {
        port: std::env::var("RELAY_PORT")
            .unwrap_or_else(|_| "8080".into())
            .parse()
            .unwrap_or(8080),
        database_url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/relay".into()),
        instance_id: std::env::var("RELAY_INSTANCE_ID").unwrap_or_else(|_| "relay-gateway".into()),
        http_client_timeout_secs: std::env::var("HTTP_CLIENT_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(120),
        log_retention_months: std::env::var("LOG_RETENTION_MONTHS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3),
    })
}
