//! # UDP Datagram Framing
//!
//! The UDP datapath uses a fixed binary layout, big-endian throughout:
//!
//! ```text
//! msg_type:u8 | key_len:u16 | key | [id_len:u16 | id] | payload
//! ```
//!
//! The `id` field is omitted for HANDSHAKE and present (possibly empty)
//! for every other type. PING/PONG payloads are 8-byte big-endian
//! nanosecond timestamps.

/// UDP message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UdpMsgType {
    Handshake = 1,
    Data = 2,
    Close = 3,
    Ping = 4,
    Pong = 5,
}

impl UdpMsgType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Handshake),
            2 => Some(Self::Data),
            3 => Some(Self::Close),
            4 => Some(Self::Ping),
            5 => Some(Self::Pong),
            _ => None,
        }
    }

    /// Whether frames of this type carry the `id` field.
    fn has_id(self) -> bool {
        !matches!(self, Self::Handshake)
    }
}

/// A decoded UDP frame borrowing from the received datagram.
#[derive(Debug, PartialEq, Eq)]
pub struct UdpFrame<'a> {
    pub msg_type: UdpMsgType,
    pub key: &'a str,
    /// Flow ID; empty for types that do not carry one.
    pub id: &'a str,
    pub payload: &'a [u8],
}

/// Errors surfaced when decoding a UDP datagram.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("datagram too short")]
    Truncated,
    #[error("unknown udp message type {0}")]
    UnknownType(u8),
    #[error("frame field is not valid utf-8")]
    BadField,
}

/// Encodes a UDP frame into a fresh buffer.
pub fn encode(msg_type: UdpMsgType, key: &str, id: &str, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 2 + key.len() + 2 + id.len() + payload.len());
    buf.push(msg_type as u8);
    buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
    buf.extend_from_slice(key.as_bytes());
    if msg_type.has_id() {
        buf.extend_from_slice(&(id.len() as u16).to_be_bytes());
        buf.extend_from_slice(id.as_bytes());
    }
    buf.extend_from_slice(payload);
    buf
}

/// Decodes a received datagram. The frame borrows from `packet`.
pub fn decode(packet: &[u8]) -> Result<UdpFrame<'_>, FrameError> {
    if packet.len() < 3 {
        return Err(FrameError::Truncated);
    }
    let msg_type = UdpMsgType::from_byte(packet[0]).ok_or(FrameError::UnknownType(packet[0]))?;
    let (key, rest) = take_field(&packet[1..])?;
    let (id, payload) = if msg_type.has_id() {
        take_field(rest)?
    } else {
        ("", rest)
    };
    Ok(UdpFrame {
        msg_type,
        key,
        id,
        payload,
    })
}

fn take_field(buf: &[u8]) -> Result<(&str, &[u8]), FrameError> {
    if buf.len() < 2 {
        return Err(FrameError::Truncated);
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let rest = &buf[2..];
    if rest.len() < len {
        return Err(FrameError::Truncated);
    }
    let field = std::str::from_utf8(&rest[..len]).map_err(|_| FrameError::BadField)?;
    Ok((field, &rest[len..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_layout() {
        let buf = encode(UdpMsgType::Data, "k1", "flow9", b"\xde\xad");
        // type, key_len=2, "k1", id_len=5, "flow9", payload
        assert_eq!(buf[0], 2);
        assert_eq!(&buf[1..3], &[0, 2]);
        assert_eq!(&buf[3..5], b"k1");
        assert_eq!(&buf[5..7], &[0, 5]);
        assert_eq!(&buf[7..12], b"flow9");
        assert_eq!(&buf[12..], b"\xde\xad");

        let frame = decode(&buf).unwrap();
        assert_eq!(frame.msg_type, UdpMsgType::Data);
        assert_eq!(frame.key, "k1");
        assert_eq!(frame.id, "flow9");
        assert_eq!(frame.payload, b"\xde\xad");
    }

    #[test]
    fn handshake_omits_id() {
        let buf = encode(UdpMsgType::Handshake, "secret", "ignored", b"");
        let frame = decode(&buf).unwrap();
        assert_eq!(frame.msg_type, UdpMsgType::Handshake);
        assert_eq!(frame.key, "secret");
        assert_eq!(frame.id, "");
    }

    #[test]
    fn ping_carries_an_empty_id_and_opaque_payload() {
        let ts = 123_456_789_u64.to_be_bytes();
        let buf = encode(UdpMsgType::Ping, "k", "", &ts);
        // type, key_len=1, "k", id_len=0, payload
        assert_eq!(&buf[..6], &[4, 0, 1, b'k', 0, 0]);
        let frame = decode(&buf).unwrap();
        assert_eq!(frame.msg_type, UdpMsgType::Ping);
        assert_eq!(frame.id, "");
        assert_eq!(frame.payload, ts);
    }

    #[test]
    fn truncated_and_unknown_frames_are_rejected() {
        assert_eq!(decode(&[2, 0]), Err(FrameError::Truncated));
        // key_len says 10 bytes but only 2 follow
        assert_eq!(decode(&[2, 0, 10, b'a', b'b']), Err(FrameError::Truncated));
        assert_eq!(decode(&[99, 0, 0]), Err(FrameError::UnknownType(99)));
    }
}
