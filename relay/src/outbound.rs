//! Real outbound execution of relayed requests.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};
use unilink_shared::envelope::{RequestEnvelope, ResponseEnvelope};

/// Upper bound on one outbound call; a dead origin must not wedge the
/// channel forever.
pub const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(30);

/// Hop-by-hop and framing headers never forwarded to the origin.
const SKIPPED_REQUEST_HEADERS: [&str; 8] = [
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "proxy-connection",
    "keep-alive",
    "upgrade",
    "te",
];

/// Shared outbound client. Redirects are left to the requesting client to
/// follow; the relay reports them as-is.
pub fn build_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(OUTBOUND_TIMEOUT)
        .build()?)
}

/// Execute the envelope's request for real. Failures of any kind come back
/// as a synthetic 502 envelope carrying the reason, never as a raw fault.
pub async fn execute(client: &reqwest::Client, envelope: &RequestEnvelope) -> ResponseEnvelope {
    match try_execute(client, envelope).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!("{} {} failed: {e:#}", envelope.method, envelope.url);
            ResponseEnvelope::synthetic(502, &format!("upstream request failed: {e:#}"))
        }
    }
}

async fn try_execute(
    client: &reqwest::Client,
    envelope: &RequestEnvelope,
) -> Result<ResponseEnvelope> {
    let url =
        target_url(envelope).ok_or_else(|| anyhow::anyhow!("request has no Host header"))?;
    let method = reqwest::Method::from_bytes(envelope.method.as_bytes())?;
    let body = envelope.body_bytes()?;

    let mut req = client.request(method, url.as_str());
    for (name, value) in &envelope.headers {
        if SKIPPED_REQUEST_HEADERS.iter().any(|s| name.eq_ignore_ascii_case(s)) {
            continue;
        }
        req = req.header(name.as_str(), value.as_str());
    }
    if !body.is_empty() {
        req = req.body(body);
    }

    let resp = req.send().await?;
    let status = resp.status().as_u16();
    let mut headers = HashMap::new();
    for (name, value) in resp.headers() {
        if let Ok(v) = value.to_str() {
            headers.insert(name.to_string(), v.to_string());
        }
    }
    let bytes = resp.bytes().await?;
    debug!("{} {url} -> {status} ({} bytes)", envelope.method, bytes.len());
    Ok(ResponseEnvelope::new(status, headers, &bytes))
}

/// Rebuild the fully-qualified target. Absolute-form URLs pass through;
/// origin-form paths are qualified with the `Host` header on plain http.
pub fn target_url(envelope: &RequestEnvelope) -> Option<String> {
    if envelope.url.starts_with("http://") || envelope.url.starts_with("https://") {
        return Some(envelope.url.clone());
    }
    let host = envelope.header("host")?;
    if envelope.url.starts_with('/') {
        Some(format!("http://{}{}", host, envelope.url))
    } else {
        Some(format!("http://{}/{}", host, envelope.url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_form_passes_through() {
        let env = RequestEnvelope::new("GET", "http://example.com/a?b=c");
        assert_eq!(target_url(&env).unwrap(), "http://example.com/a?b=c");
        let env = RequestEnvelope::new("GET", "https://example.com/");
        assert_eq!(target_url(&env).unwrap(), "https://example.com/");
    }

    #[test]
    fn test_origin_form_qualified_with_host() {
        let mut env = RequestEnvelope::new("GET", "/index.html");
        env.headers.insert("Host".to_string(), "example.com:8080".to_string());
        assert_eq!(target_url(&env).unwrap(), "http://example.com:8080/index.html");
    }

    #[test]
    fn test_host_lookup_ignores_case() {
        let mut env = RequestEnvelope::new("GET", "/x");
        env.headers.insert("hOsT".to_string(), "example.com".to_string());
        assert_eq!(target_url(&env).unwrap(), "http://example.com/x");
    }

    #[test]
    fn test_missing_host_is_none() {
        let env = RequestEnvelope::new("GET", "/index.html");
        assert!(target_url(&env).is_none());
    }

    #[test]
    fn test_bare_target_gains_slash() {
        let mut env = RequestEnvelope::new("GET", "favicon.ico");
        env.headers.insert("Host".to_string(), "example.com".to_string());
        assert_eq!(target_url(&env).unwrap(), "http://example.com/favicon.ico");
    }

    #[tokio::test]
    async fn test_invalid_method_maps_to_502() {
        let client = build_client().unwrap();
        let env = RequestEnvelope::new("NOT A METHOD", "http://example.com/");
        let resp = execute(&client, &env).await;
        assert_eq!(resp.status_code, 502);
    }
}
