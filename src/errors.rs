use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Caller-visible relay failures. The `type` string in the JSON body is
/// stable for programmatic handling; underlying error text is carried in the
/// message for diagnosability.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to read request body: {0}")]
    RequestBody(String),

    #[error("invalid proxy URI: {0}")]
    ProxyConfiguration(String),

    #[error("request was canceled or timed out")]
    Timeout,

    #[error("failed to execute request: {0}")]
    Network(String),

    #[error("failed to create decompressor: {0}")]
    Decompression(String),

    /// Upstream replied with an error status; the raw payload is withheld
    /// from the caller but the status is recorded for health tracking.
    #[error("request failed with status {0}")]
    Response(u16),

    #[error("no account available for forwarding")]
    NoAccount,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RelayError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::RequestBody(_) => "request_body_error",
            RelayError::ProxyConfiguration(_) => "proxy_configuration_error",
            RelayError::Timeout => "timeout_error",
            RelayError::Network(_) => "network_error",
            RelayError::Decompression(_) => "decompression_error",
            RelayError::Response(_) => "response_error",
            RelayError::NoAccount => "response_error",
            RelayError::Internal(_) => "internal_server_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::RequestBody(_) => StatusCode::BAD_REQUEST,
            RelayError::Timeout => StatusCode::REQUEST_TIMEOUT,
            RelayError::Response(_) | RelayError::NoAccount => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::ProxyConfiguration(_)
            | RelayError::Network(_)
            | RelayError::Decompression(_)
            | RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        if matches!(self, RelayError::Internal(_)) {
            tracing::error!("relay internal error: {}", self);
        }
        let body = Json(json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
            }
        }));
        (self.status(), body).into_response()
    }
}
