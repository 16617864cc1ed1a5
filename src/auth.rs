use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::relay::RelayState;

/// Resolve the caller's key and stash it as a request extension for the
/// forwarder's usage attribution. Accepts `Authorization: Bearer` or
/// `x-api-key`.
pub async fn require_api_key(
    State(state): State<RelayState>,
    mut req: Request,
    next: Next,
) -> Response {
    let presented = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| {
            req.headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
        })
        .map(str::to_owned);

    let Some(presented) = presented else {
        return unauthorized("missing api key");
    };

    match state.store.get_api_key(&presented).await {
        Ok(Some(key)) if key.active => {
            req.extensions_mut().insert(key);
            next.run(req).await
        }
        Ok(_) => unauthorized("invalid api key"),
        Err(e) => {
            tracing::error!("api key lookup failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": {"type": "internal_server_error", "message": "internal error"}
                })),
            )
                .into_response()
        }
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": {"type": "authentication_error", "message": message}
        })),
    )
        .into_response()
}
