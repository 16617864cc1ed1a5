use axum::http::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST,
    TRANSFER_ENCODING, USER_AGENT,
};

/// Fixed client fingerprint presented to the upstream. Inbound headers are
/// copied through first, then every one of these is overwritten so the
/// outbound request is indistinguishable from the approved client version
/// and the caller's own credentials never leak upstream.
const FINGERPRINT: &[(&str, &str)] = &[
    ("anthropic-version", "2023-06-01"),
    (
        "anthropic-beta",
        "claude-code-20250219,oauth-2025-04-20,interleaved-thinking-2025-05-14,fine-grained-tool-streaming-2025-05-14",
    ),
    ("anthropic-dangerous-direct-browser-access", "true"),
    ("x-stainless-retry-count", "0"),
    ("x-stainless-timeout", "600"),
    ("x-stainless-lang", "js"),
    ("x-stainless-package-version", "0.55.1"),
    ("x-stainless-os", "MacOS"),
    ("x-stainless-arch", "arm64"),
    ("x-stainless-runtime", "node"),
    ("x-stainless-runtime-version", "v20.18.1"),
    ("x-stainless-helper-method", "stream"),
    ("x-app", "cli"),
];

const FIXED_USER_AGENT: &str = "claude-cli/1.0.44 (external, cli)";

/// Build the outbound header set for one relay: inbound headers verbatim
/// (minus framing headers the transport owns), then the fingerprint and the
/// account's credential on top. The secret rides in both `x-api-key` and
/// `Authorization` so either auth scheme the upstream expects is satisfied.
pub fn build_outbound_headers(inbound: &HeaderMap, secret_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in inbound {
        if name == HOST || name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    for (name, value) in FINGERPRINT {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }

    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(USER_AGENT, HeaderValue::from_static(FIXED_USER_AGENT));

    if let Ok(v) = HeaderValue::from_str(secret_key) {
        headers.insert(HeaderName::from_static("x-api-key"), v);
    }
    if let Ok(v) = HeaderValue::from_str(&format!("Bearer {secret_key}")) {
        headers.insert(AUTHORIZATION, v);
    }

    // A caller-supplied Accept was copied above and stays; default to SSE
    // only when absent.
    if !headers.contains_key(ACCEPT) {
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_accept_and_overwrites_credentials() {
        let mut inbound = HeaderMap::new();
        inbound.insert(AUTHORIZATION, HeaderValue::from_static("Bearer caller-key"));
        inbound.insert("x-api-key", HeaderValue::from_static("caller-key"));

        let headers = build_outbound_headers(&inbound, "sk-test");
        assert_eq!(headers.get(ACCEPT).unwrap(), "text/event-stream");
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-test");
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer sk-test");
        assert_eq!(headers.get("anthropic-version").unwrap(), "2023-06-01");
        assert_eq!(headers.get(USER_AGENT).unwrap(), FIXED_USER_AGENT);
    }

    #[test]
    fn preserves_caller_accept_and_custom_headers() {
        let mut inbound = HeaderMap::new();
        inbound.insert(ACCEPT, HeaderValue::from_static("application/json"));
        inbound.insert("x-session-id", HeaderValue::from_static("abc123"));

        let headers = build_outbound_headers(&inbound, "sk");
        assert_eq!(headers.get(ACCEPT).unwrap(), "application/json");
        assert_eq!(headers.get("x-session-id").unwrap(), "abc123");
    }

    #[test]
    fn drops_transport_framing_headers() {
        let mut inbound = HeaderMap::new();
        inbound.insert(HOST, HeaderValue::from_static("relay.example.com"));
        inbound.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));

        let headers = build_outbound_headers(&inbound, "sk");
        assert!(headers.get(HOST).is_none());
        assert!(headers.get(CONTENT_LENGTH).is_none());
    }
}
