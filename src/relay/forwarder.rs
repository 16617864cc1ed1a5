use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{
    HeaderMap, HeaderValue, CACHE_CONTROL, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH,
    CONTENT_TYPE, TRANSFER_ENCODING,
};
use axum::response::Response;
use chrono::Utc;
use futures::StreamExt;
use tracing::{info, warn};

use crate::errors::RelayError;
use crate::models::{Account, ApiKey};
use crate::relay::reporter::{RelayOutcome, RelayReport};
use crate::relay::stream::{Coding, DecodeStream};
use crate::relay::tee::{FinalizeCtx, UsageTeeStream};
use crate::relay::{body, client, headers, RelayState};

/// Refresh the access token ahead of use when it expires within this window.
const PREFLIGHT_REFRESH_WINDOW_SECS: i64 = 300;

/// Relay one chat-completion request upstream and stream the response back.
///
/// The caller sees the upstream's status and headers mirrored (bodies of
/// upstream error statuses excepted), with compressed SSE bodies decoded
/// transparently. Usage extraction and account lifecycle updates happen on
/// the side and never delay body bytes.
pub async fn forward(
    State(state): State<RelayState>,
    req: Request,
) -> Result<Response, RelayError> {
    let started = Instant::now();
    let api_key = req.extensions().get::<ApiKey>().cloned();
    let inbound_headers = req.headers().clone();

    // Body read failures are the caller's problem; nothing goes upstream.
    let raw_body = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|e| RelayError::RequestBody(e.to_string()))?;

    let mut account = state
        .store
        .pick_account()
        .await?
        .ok_or(RelayError::NoAccount)?;

    preflight_refresh(&state, &mut account).await;

    let outbound_body = body::prepare_body(raw_body, &state.config.instance_id);
    let http = client::build_client(&account, state.config.http_client_timeout())?;
    let outbound_headers = headers::build_outbound_headers(&inbound_headers, &account.secret_key);
    // Catch a malformed account URL here; past send() every failure reads
    // as a transport error.
    let url = reqwest::Url::parse(&format!(
        "{}/v1/messages",
        account.request_url.trim_end_matches('/')
    ))
    .map_err(|e| {
        RelayError::Internal(anyhow::anyhow!(
            "account {} has an invalid request url: {e}",
            account.id
        ))
    })?;

    info!(account_id = account.id, account = %account.name, "forwarding relay request");

    let resp = match http
        .post(url)
        .headers(outbound_headers)
        .body(outbound_body)
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            state.reporter.report(RelayReport {
                account_id: account.id,
                api_key,
                outcome: RelayOutcome::Transport,
                usage: None,
                duration_ms: elapsed_ms(started),
            });
            return Err(if e.is_timeout() {
                RelayError::Timeout
            } else {
                RelayError::Network(e.to_string())
            });
        }
    };

    let status = resp.status();
    let retry_after_secs = parse_retry_after(resp.headers());

    if status.as_u16() >= 400 {
        warn!(account_id = account.id, status = status.as_u16(), "upstream error status");
        state.reporter.report(RelayReport {
            account_id: account.id,
            api_key,
            outcome: RelayOutcome::Status {
                code: status.as_u16(),
                retry_after_secs,
            },
            usage: None,
            duration_ms: elapsed_ms(started),
        });
        return Err(RelayError::Response(status.as_u16()));
    }

    let coding = Coding::from_content_encoding(
        resp.headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok()),
    );
    let mirrored = mirror_headers(resp.headers(), coding);
    let mut upstream = resp.bytes_stream();

    // For encoded bodies, the first chunk is validated before the response
    // is committed so a broken stream can still fail with a proper status.
    let decoded = if coding.is_identity() {
        DecodeStream::new(coding, upstream)
    } else {
        match upstream.next().await {
            Some(Ok(first)) => {
                if let Err(e) = coding.validate_first_chunk(&first) {
                    // A broken body after a 2xx says nothing about account
                    // health; fail the relay without a lifecycle report.
                    return Err(RelayError::Decompression(e));
                }
                DecodeStream::with_first_chunk(coding, first, upstream)
            }
            Some(Err(e)) => {
                state.reporter.report(RelayReport {
                    account_id: account.id,
                    api_key,
                    outcome: RelayOutcome::Transport,
                    usage: None,
                    duration_ms: elapsed_ms(started),
                });
                return Err(RelayError::Network(e.to_string()));
            }
            None => DecodeStream::new(coding, upstream),
        }
    };

    let tee = UsageTeeStream::new(
        decoded,
        FinalizeCtx {
            reporter: state.reporter.clone(),
            account_id: account.id,
            api_key,
            status: status.as_u16(),
            retry_after_secs,
            started,
        },
    );

    let mut builder = Response::builder().status(status);
    if let Some(h) = builder.headers_mut() {
        *h = mirrored;
    }
    builder
        .body(Body::from_stream(tee))
        .map_err(|e| RelayError::Internal(anyhow::anyhow!("assembling response: {e}")))
}

/// Refresh a near-expiry access token before using it. Failure is logged
/// and the relay proceeds with the current token; the upstream's verdict on
/// it is more informative than a guess here.
async fn preflight_refresh(state: &RelayState, account: &mut Account) {
    if !account.platform.credential_expires()
        || !account.token_expires_within(Utc::now().timestamp(), PREFLIGHT_REFRESH_WINDOW_SECS)
    {
        return;
    }
    match state.refresher.refresh(account).await {
        Ok(cred) => {
            if let Err(e) = state
                .store
                .update_account_credential(
                    account.id,
                    &cred.access_token,
                    &cred.refresh_token,
                    cred.expires_at,
                )
                .await
            {
                warn!(account_id = account.id, "failed to persist refreshed credential: {e:#}");
            }
            account.secret_key = cred.access_token;
            account.refresh_token = Some(cred.refresh_token);
            account.expires_at = Some(cred.expires_at);
        }
        Err(e) => {
            warn!(account_id = account.id, "pre-flight credential refresh failed: {e:#}");
        }
    }
}

/// Mirror upstream headers onto the caller response. Content-Length is
/// always dropped (the body is re-framed), Content-Encoding additionally
/// when the body is being decoded. SSE-friendly values are then enforced.
fn mirror_headers(upstream: &HeaderMap, coding: Coding) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in upstream {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING || name == CONNECTION {
            continue;
        }
        if name == CONTENT_ENCODING && !coding.is_identity() {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    out.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    out.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    if !out.contains_key(CONTENT_TYPE) {
        out.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    }
    out
}

fn parse_retry_after(headers: &HeaderMap) -> Option<i64> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
}

fn elapsed_ms(started: Instant) -> i64 {
    started.elapsed().as_millis().min(i64::MAX as u128) as i64
}
