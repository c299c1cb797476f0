//! # HTTPS Demultiplexer
//!
//! Terminates public HTTPS with the configured wildcard certificate and
//! routes each request by the leftmost DNS label of `Host` to the owning
//! tunnel session. The request is serialized onto the control channel as
//! an `http_request` frame and the handler waits for the matching
//! `http_response` (or fails the exchange after a timeout). Requests and
//! responses are fully buffered; there is no streaming path.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tracing::{info, warn};

use tunnel_protocol::ids::generate_id;
use tunnel_protocol::message::ControlMessage;

use crate::state::{ClientSession, Core};

/// How long the demux waits for the client's `http_response`.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on a buffered request body.
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Runs the HTTPS listener. Callers only invoke this when a base domain
/// is configured; a missing certificate downgrades to a warning (HTTP
/// tunneling disabled, everything else unaffected).
pub async fn run_http_proxy(core: Arc<Core>) -> anyhow::Result<()> {
    let Some(domain) = core.config.http_domain.clone() else {
        return Ok(());
    };
    let Some((cert, key)) = core.config.http_cert.clone() else {
        warn!(
            "no wildcard certificate found for *.{}; http tunneling disabled",
            domain
        );
        return Ok(());
    };

    let tls = RustlsConfig::from_pem_file(&cert, &key)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load demux certificate: {}", e))?;

    let app = Router::new()
        .fallback(handle_public_request)
        .with_state(core.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], core.config.http_port));
    info!("https proxy listening on {} for *.{}", addr, domain);

    axum_server::bind_rustls(addr, tls)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;
    Ok(())
}

/// The demux handler: apex check, label extraction, session lookup,
/// tunnel round trip.
async fn handle_public_request(
    State(core): State<Arc<Core>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let domain = core.config.http_domain.as_deref().unwrap_or_default();
    let host = request_host(&req).unwrap_or_default().to_ascii_lowercase();
    let host = strip_port(&host);

    if host == domain || host == format!("www.{}", domain) {
        return landing_response();
    }

    let Some(label) = extract_subdomain(host, domain) else {
        return plain_response(StatusCode::BAD_REQUEST, "invalid subdomain".into());
    };

    if !core.rate_limits.allow_http_request(peer.ip()) {
        return plain_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded".into());
    }

    let Some(session) = core.subdomains.get(label).map(|e| e.value().clone()) else {
        return plain_response(
            StatusCode::BAD_GATEWAY,
            format!("tunnel not found for subdomain: {}", label),
        );
    };

    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers: HashMap<String, String> = req
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let body = match axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => {
            return plain_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "request body too large".into(),
            )
        }
    };

    forward_exchange(&session, method, path, headers, body).await
}

/// Sends one `http_request` down the tunnel and waits for its response.
async fn forward_exchange(
    session: &Arc<ClientSession>,
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
) -> Response {
    let id = generate_id();
    let (tx, rx) = tokio::sync::oneshot::channel();
    session.http_waiters.insert(id.clone(), tx);

    let msg = ControlMessage::HttpRequest {
        id: id.clone(),
        method,
        path,
        headers,
        body,
    };
    if session.send(&msg).await.is_err() {
        session.http_waiters.remove(&id);
        return plain_response(StatusCode::BAD_GATEWAY, "failed to forward request".into());
    }

    match tokio::time::timeout(RESPONSE_TIMEOUT, rx).await {
        Ok(Ok(exchange)) => {
            let status =
                StatusCode::from_u16(exchange.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut builder = Response::builder().status(status);
            for (name, value) in &exchange.headers {
                // Framing headers would conflict with the buffered body
                // hyper re-frames below.
                if name.eq_ignore_ascii_case("transfer-encoding")
                    || name.eq_ignore_ascii_case("connection")
                {
                    continue;
                }
                if let (Ok(name), Ok(value)) = (
                    HeaderName::try_from(name.as_str()),
                    HeaderValue::try_from(value.as_str()),
                ) {
                    builder = builder.header(name, value);
                }
            }
            builder
                .body(Body::from(exchange.body))
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
        }
        // Session torn down while we were waiting.
        Ok(Err(_)) => plain_response(StatusCode::BAD_GATEWAY, "tunnel closed".into()),
        Err(_) => {
            session.http_waiters.remove(&id);
            plain_response(StatusCode::BAD_GATEWAY, "tunnel response timeout".into())
        }
    }
}

fn request_host(req: &Request) -> Option<&str> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())
}

/// Drops a trailing `:port` when the suffix is numeric. IPv6 literals in
/// brackets never match a subdomain anyway.
fn strip_port(host: &str) -> &str {
    match host.rfind(':') {
        Some(idx) if host[idx + 1..].chars().all(|c| c.is_ascii_digit()) => &host[..idx],
        _ => host,
    }
}

/// Extracts the leftmost DNS label if `host` is exactly one valid label
/// under `domain`.
pub fn extract_subdomain<'a>(host: &'a str, domain: &str) -> Option<&'a str> {
    if domain.is_empty() {
        return None;
    }
    let label = host.strip_suffix(domain)?.strip_suffix('.')?;
    validate_label(label).then_some(label)
}

/// DNS label rules: `[a-z0-9-]`, 1..=63 chars, no leading or trailing
/// hyphen.
pub fn validate_label(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }
    if label.starts_with('-') || label.ends_with('-') {
        return false;
    }
    label
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

fn landing_response() -> Response {
    plain_response(StatusCode::OK, "tunnel server is running".into())
}

fn plain_response(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_subdomains_extract() {
        assert_eq!(
            extract_subdomain("ab12cd.example.test", "example.test"),
            Some("ab12cd")
        );
        assert_eq!(
            extract_subdomain("a-b-9.example.test", "example.test"),
            Some("a-b-9")
        );
    }

    #[test]
    fn apex_and_foreign_hosts_do_not_extract() {
        assert_eq!(extract_subdomain("example.test", "example.test"), None);
        assert_eq!(extract_subdomain("evil.other.test", "example.test"), None);
        assert_eq!(extract_subdomain("example.test.evil", "example.test"), None);
    }

    #[test]
    fn nested_labels_are_rejected() {
        // Only the single leftmost label routes; dots fail validation.
        assert_eq!(extract_subdomain("a.b.example.test", "example.test"), None);
    }

    #[test]
    fn label_rules() {
        assert!(validate_label("abc123"));
        assert!(validate_label("a"));
        assert!(!validate_label(""));
        assert!(!validate_label("-abc"));
        assert!(!validate_label("abc-"));
        assert!(!validate_label("ABC"));
        assert!(!validate_label("a_b"));
        assert!(!validate_label(&"x".repeat(64)));
        assert!(validate_label(&"x".repeat(63)));
    }

    #[test]
    fn ports_are_stripped() {
        assert_eq!(strip_port("ab12cd.example.test:443"), "ab12cd.example.test");
        assert_eq!(strip_port("example.test"), "example.test");
        assert_eq!(strip_port("weird:host:name"), "weird:host:name");
    }
}
