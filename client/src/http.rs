//! # Local HTTP Forwarding
//!
//! Answers `http_request` frames by replaying the request against the
//! local backend and echoing the response back as `http_response`. The
//! `Host` header is rewritten so VirtualHost-style backends match, and
//! failures come back as a 502 so the public side never hangs.

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::header::{HeaderName, HeaderValue, HOST};
use tracing::{debug, warn};

use tunnel_protocol::message::ControlMessage;

use crate::state::Connection;

/// Handles one tunneled HTTP exchange.
pub async fn handle_request(
    conn: Arc<Connection>,
    id: String,
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
) {
    let client = &conn.client;
    if client.config.protocol != "http" {
        debug!("http_request received while not in http mode");
        return;
    }

    // Port 443 backends get replayed over https.
    let scheme = if client.config.local_addr.ends_with(":443") {
        "https"
    } else {
        "http"
    };
    let url = format!("{}://{}{}", scheme, client.config.local_addr, path);

    let method = reqwest::Method::from_bytes(method.as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let mut request = client.http.request(method, &url);

    for (name, value) in &headers {
        if name.eq_ignore_ascii_case("host") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            request = request.header(name, value);
        }
    }

    // Rewrite Host so the backend's virtual host matches; browsers talk
    // to loopback services as "localhost".
    let host_value = if client.config.local_is_loopback {
        "localhost".to_string()
    } else {
        client.config.local_addr.clone()
    };
    if let Ok(value) = HeaderValue::try_from(host_value) {
        request = request.header(HOST, value);
    }

    let request_bytes = body.len() as u64;
    let response = request.body(body).send().await;

    let reply = match response {
        Ok(response) => {
            let status_code = response.status().as_u16();
            let headers: HashMap<String, String> = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            let body = match response.bytes().await {
                Ok(bytes) => bytes.to_vec(),
                Err(e) => {
                    warn!("failed to read backend response body: {}", e);
                    return;
                }
            };

            client.stats.add_down(request_bytes);
            client.stats.add_up(body.len() as u64);

            ControlMessage::HttpResponse {
                id,
                status_code,
                headers,
                body,
            }
        }
        Err(e) => {
            warn!("backend request to {} failed: {}", url, e);
            error_response(id, e.to_string())
        }
    };

    let _ = conn.send(&reply).await;
}

/// A plain-text 502 carried back through the tunnel.
fn error_response(id: String, message: String) -> ControlMessage {
    let mut headers = HashMap::new();
    headers.insert("Content-Type".to_string(), "text/plain".to_string());
    ControlMessage::HttpResponse {
        id,
        status_code: 502,
        headers,
        body: message.into_bytes(),
    }
}
