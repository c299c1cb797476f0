//! Wire-format conformance tests: the JSON control frames and binary UDP
//! datagrams must keep their exact on-wire shape, since older clients
//! and servers interoperate across versions.

use std::collections::HashMap;

use tunnel_protocol::codec::{FrameReader, FrameWriter};
use tunnel_protocol::crypto;
use tunnel_protocol::frame::{self, UdpMsgType};
use tunnel_protocol::message::ControlMessage;

fn to_json(msg: &ControlMessage) -> serde_json::Value {
    serde_json::to_value(msg).unwrap()
}

#[test]
fn control_type_tags_are_snake_case() {
    let cases: Vec<(ControlMessage, &str)> = vec![
        (ControlMessage::Ping, "ping"),
        (ControlMessage::Pong, "pong"),
        (
            ControlMessage::Proxy {
                id: "x".into(),
                key: None,
                client_id: None,
            },
            "proxy",
        ),
        (
            ControlMessage::ProxyError {
                id: "x".into(),
                error: "nope".into(),
            },
            "proxy_error",
        ),
        (
            ControlMessage::UdpOpen {
                id: "x".into(),
                remote_addr: "1.2.3.4:5".into(),
                protocol: Some("udp".into()),
            },
            "udp_open",
        ),
        (
            ControlMessage::UdpClose {
                id: "x".into(),
                protocol: None,
            },
            "udp_close",
        ),
        (
            ControlMessage::UdpIdle {
                id: "x".into(),
                protocol: None,
            },
            "udp_idle",
        ),
        (
            ControlMessage::Error {
                error: "bad".into(),
            },
            "error",
        ),
    ];
    for (msg, tag) in cases {
        assert_eq!(to_json(&msg)["type"], tag, "tag for {:?}", msg);
    }
}

#[test]
fn register_and_registered_field_names() {
    let register = ControlMessage::Register {
        key: Some("k".into()),
        client_id: Some("c1".into()),
        target: Some("127.0.0.1:8080".into()),
        protocol: Some("tcp".into()),
        requested_port: Some(10_000),
    };
    let value = to_json(&register);
    assert_eq!(value["type"], "register");
    assert_eq!(value["client_id"], "c1");
    assert_eq!(value["requested_port"], 10_000);

    let registered = ControlMessage::Registered {
        key: "k".into(),
        client_id: "c1".into(),
        remote_port: 10_000,
        protocol: "tcp".into(),
        version: "1.0".into(),
        subdomain: Some("ab12cd".into()),
        base_domain: Some("example.test".into()),
        udp_secret: Some("c2VjcmV0".into()),
    };
    let value = to_json(&registered);
    assert_eq!(value["remote_port"], 10_000);
    assert_eq!(value["base_domain"], "example.test");
    assert_eq!(value["udp_secret"], "c2VjcmV0");
}

#[test]
fn http_request_round_trips_through_text() {
    let mut headers = HashMap::new();
    headers.insert("Content-Type".to_string(), "text/plain".to_string());
    let msg = ControlMessage::HttpRequest {
        id: "r1".into(),
        method: "POST".into(),
        path: "/hello?x=1".into(),
        headers,
        body: b"ping<>&".to_vec(),
    };

    let text = serde_json::to_string(&msg).unwrap();
    // HTML characters must survive unescaped inside the base64 payload.
    let back: ControlMessage = serde_json::from_str(&text).unwrap();
    match back {
        ControlMessage::HttpRequest {
            id,
            method,
            path,
            headers,
            body,
        } => {
            assert_eq!(id, "r1");
            assert_eq!(method, "POST");
            assert_eq!(path, "/hello?x=1");
            assert_eq!(headers["Content-Type"], "text/plain");
            assert_eq!(body, b"ping<>&");
        }
        other => panic!("unexpected message: {:?}", other),
    }
}

#[test]
fn frames_from_a_future_dialect_are_skipped_not_fatal() {
    let msg: ControlMessage =
        serde_json::from_str(r#"{"type":"stream_migrate","id":"z","hops":3}"#).unwrap();
    assert!(matches!(msg, ControlMessage::Unknown));
}

#[tokio::test]
async fn framing_survives_interleaved_message_sizes() {
    let (client, server) = tokio::io::duplex(1 << 16);
    let mut writer = FrameWriter::new(client);
    let mut reader = FrameReader::new(server);

    let big_body = vec![0xAB; 100_000];
    let messages = vec![
        ControlMessage::Ping,
        ControlMessage::HttpResponse {
            id: "r".into(),
            status_code: 200,
            headers: HashMap::new(),
            body: big_body.clone(),
        },
        ControlMessage::Pong,
    ];
    // The big frame exceeds the duplex buffer, so write concurrently.
    let producer = tokio::spawn(async move {
        for msg in &messages {
            writer.write_frame(msg).await.unwrap();
        }
    });

    assert!(matches!(
        reader.read_frame().await.unwrap(),
        Some(ControlMessage::Ping)
    ));
    match reader.read_frame().await.unwrap() {
        Some(ControlMessage::HttpResponse { body, .. }) => assert_eq!(body, big_body),
        other => panic!("unexpected frame: {:?}", other),
    }
    assert!(matches!(
        reader.read_frame().await.unwrap(),
        Some(ControlMessage::Pong)
    ));
    producer.await.unwrap();
    assert!(reader.read_frame().await.unwrap().is_none());
}

#[test]
fn udp_golden_bytes() {
    // HANDSHAKE: type | key_len | key, nothing else.
    assert_eq!(
        frame::encode(UdpMsgType::Handshake, "ab", "", b""),
        vec![1, 0, 2, b'a', b'b']
    );
    // DATA: type | key_len | key | id_len | id | payload.
    assert_eq!(
        frame::encode(UdpMsgType::Data, "ab", "cd", b"\x01\x02"),
        vec![2, 0, 2, b'a', b'b', 0, 2, b'c', b'd', 1, 2]
    );
    // CLOSE with empty payload still carries the id field.
    assert_eq!(
        frame::encode(UdpMsgType::Close, "ab", "cd", b""),
        vec![3, 0, 2, b'a', b'b', 0, 2, b'c', b'd']
    );
}

#[test]
fn udp_ping_timestamp_echoes_back_as_pong() {
    let ts: u64 = 1_700_000_000_123_456_789;
    let ping = frame::encode(UdpMsgType::Ping, "key", "", &ts.to_be_bytes());
    let decoded = frame::decode(&ping).unwrap();
    assert_eq!(decoded.msg_type, UdpMsgType::Ping);

    // A peer answers by mirroring the payload under the same key.
    let pong = frame::encode(UdpMsgType::Pong, decoded.key, "", decoded.payload);
    let decoded = frame::decode(&pong).unwrap();
    assert_eq!(decoded.msg_type, UdpMsgType::Pong);
    let mut sent = [0u8; 8];
    sent.copy_from_slice(&decoded.payload[..8]);
    assert_eq!(u64::from_be_bytes(sent), ts);
}

#[test]
fn sealed_datagram_layout_and_tamper_rejection() {
    let secret = crypto::generate_secret();
    let sealed = crypto::seal(&secret, b"\xde\xad\xbe\xef").unwrap();

    // nonce | ciphertext | 16-byte tag
    assert_eq!(sealed.len(), crypto::NONCE_LEN + 4 + 16);
    assert_eq!(crypto::open(&secret, &sealed).unwrap(), b"\xde\xad\xbe\xef");

    let mut tampered = sealed.clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x80;
    assert!(crypto::open(&secret, &tampered).is_err());
}

#[test]
fn decoded_frame_rejects_binary_keys() {
    // A key that is not UTF-8 cannot name a session.
    let mut packet = vec![2, 0, 2, 0xFF, 0xFE, 0, 0];
    packet.extend_from_slice(b"payload");
    assert!(frame::decode(&packet).is_err());
}
