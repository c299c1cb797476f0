//! # Control-Plane Messages
//!
//! Defines all message types exchanged between the client and the server
//! over the TLS control channel. Messages are serialized as JSON objects
//! using serde's internally-tagged representation (`"type": "..."` field)
//! with snake_case names, one object per line.
//!
//! Producers omit absent fields; consumers ignore unknown fields, and an
//! unknown `type` value deserializes to [`ControlMessage::Unknown`] so a
//! peer speaking a newer dialect is skipped rather than disconnected.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// All control-channel messages.
///
/// The `#[serde(tag = "type")]` attribute means each variant is serialized
/// as a JSON object with a `"type"` field whose value is the snake_case
/// variant name. For example, `ControlMessage::Ping` serializes to
/// `{"type": "ping"}`.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    // ── Registration ──────────────────────────────────────────────

    /// Sent by a client as the first frame on a new control connection.
    /// `key` and `requested_port` are set on reconnect to recover the
    /// previous identity and sticky public port.
    Register {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requested_port: Option<u16>,
    },

    /// Server's acknowledgment carrying the assigned identity: the session
    /// key, the public port, the subdomain (http mode) and the base64
    /// UDP secret.
    Registered {
        key: String,
        client_id: String,
        remote_port: u16,
        protocol: String,
        version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subdomain: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_domain: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        udp_secret: Option<String>,
    },

    // ── Heartbeat ─────────────────────────────────────────────────

    /// Keepalive request, sent by the client at the ping interval.
    Ping,

    /// Keepalive response.
    Pong,

    // ── TCP proxy path ────────────────────────────────────────────

    /// On the control channel (server→client): "open a back-channel and
    /// tag it with this id". On a fresh TLS connection (client→server):
    /// tags that connection as the back-channel for `id`.
    Proxy {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Client failed to reach its local backend for proxy request `id`.
    ProxyError { id: String, error: String },

    // ── UDP flow lifecycle ────────────────────────────────────────

    /// Client announces a new UDP flow; the server dials `remote_addr`.
    UdpOpen {
        id: String,
        remote_addr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
    },

    /// Either side tears down the UDP flow `id`.
    UdpClose {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
    },

    /// Client reports that the backend stopped replying for flow `id`.
    UdpIdle {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
    },

    // ── HTTP tunneling ────────────────────────────────────────────

    /// A public HTTPS request forwarded through the tunnel. The body is
    /// base64 on the wire.
    HttpRequest {
        id: String,
        method: String,
        path: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(
            default,
            with = "base64_bytes",
            skip_serializing_if = "Vec::is_empty"
        )]
        body: Vec<u8>,
    },

    /// The client's answer to an `http_request` with the same `id`.
    HttpResponse {
        id: String,
        status_code: u16,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(
            default,
            with = "base64_bytes",
            skip_serializing_if = "Vec::is_empty"
        )]
        body: Vec<u8>,
    },

    // ── Errors ────────────────────────────────────────────────────

    /// Human-readable rejection, e.g. a failed registration.
    Error { error: String },

    /// Catch-all for message types this build does not know about.
    #[serde(other)]
    Unknown,
}

/// Serde helper encoding `Vec<u8>` as a base64 string, matching how the
/// wire format transports HTTP bodies inside JSON.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        BASE64.decode(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_wire_shape() {
        let msg = ControlMessage::Register {
            key: None,
            client_id: Some("c1".into()),
            target: Some("127.0.0.1:8080".into()),
            protocol: Some("tcp".into()),
            requested_port: None,
        };
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains(r#""type":"register""#));
        assert!(text.contains(r#""client_id":"c1""#));
        // Absent optionals must be omitted, not null.
        assert!(!text.contains("key"));
        assert!(!text.contains("requested_port"));
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let msg: ControlMessage =
            serde_json::from_str(r#"{"type":"quantum_entangle","id":"x"}"#).unwrap();
        assert!(matches!(msg, ControlMessage::Unknown));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let msg: ControlMessage =
            serde_json::from_str(r#"{"type":"ping","shiny":true}"#).unwrap();
        assert!(matches!(msg, ControlMessage::Ping));
    }

    #[test]
    fn http_body_travels_as_base64() {
        let msg = ControlMessage::HttpResponse {
            id: "r1".into(),
            status_code: 200,
            headers: HashMap::new(),
            body: b"hello".to_vec(),
        };
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains(r#""body":"aGVsbG8=""#));

        let back: ControlMessage = serde_json::from_str(&text).unwrap();
        match back {
            ControlMessage::HttpResponse { body, .. } => assert_eq!(body, b"hello"),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
