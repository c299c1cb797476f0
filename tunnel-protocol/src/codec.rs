//! # Control-Channel Framing
//!
//! One JSON object per frame, frames separated by `\n`. A session owns one
//! [`FrameReader`] and one [`FrameWriter`]; concurrent writers must
//! serialize access to the writer (the server and client both keep it
//! behind an async mutex held across the full encode+flush).

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::message::ControlMessage;

/// Upper bound on a single control frame. HTTP bodies travel inline, so
/// the cap is generous; anything above it is a protocol error.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors surfaced by the control-channel codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed control frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("control frame exceeds {MAX_FRAME_LEN} bytes")]
    Oversize,
}

/// Reads newline-delimited control messages from an async stream.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            line: String::new(),
        }
    }

    /// Reads the next frame. Returns `Ok(None)` on a clean EOF.
    pub async fn read_frame(&mut self) -> Result<Option<ControlMessage>, CodecError> {
        self.line.clear();
        let n = (&mut self.inner)
            .take(MAX_FRAME_LEN as u64 + 1)
            .read_line(&mut self.line)
            .await?;
        if n == 0 {
            return Ok(None);
        }
        if n > MAX_FRAME_LEN {
            return Err(CodecError::Oversize);
        }
        let msg = serde_json::from_str(&self.line)?;
        Ok(Some(msg))
    }

    /// Unwraps the buffered reader, preserving any bytes already read
    /// past the last frame. Back-channel dispatch relies on this: payload
    /// bytes that followed the handshake frame stay in the buffer.
    pub fn into_inner(self) -> BufReader<R> {
        self.inner
    }
}

/// Writes control messages as newline-terminated JSON.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_frame(&mut self, msg: &ControlMessage) -> Result<(), CodecError> {
        let mut buf = serde_json::to_vec(msg)?;
        buf.push(b'\n');
        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Half-closes the underlying stream.
    pub async fn shutdown(&mut self) -> Result<(), CodecError> {
        self.inner.shutdown().await?;
        Ok(())
    }

    /// Unwraps the underlying writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip_in_order() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer.write_frame(&ControlMessage::Ping).await.unwrap();
        writer
            .write_frame(&ControlMessage::Proxy {
                id: "abc".into(),
                key: None,
                client_id: None,
            })
            .await
            .unwrap();
        drop(writer);

        assert!(matches!(
            reader.read_frame().await.unwrap(),
            Some(ControlMessage::Ping)
        ));
        match reader.read_frame().await.unwrap() {
            Some(ControlMessage::Proxy { id, .. }) => assert_eq!(id, "abc"),
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_is_a_malformed_frame() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"not json\n").await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server);
        assert!(matches!(
            reader.read_frame().await,
            Err(CodecError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn into_inner_preserves_buffered_payload() {
        let (mut client, server) = tokio::io::duplex(4096);
        let frame = serde_json::to_vec(&ControlMessage::Pong).unwrap();
        client.write_all(&frame).await.unwrap();
        client.write_all(b"\nRAW-PAYLOAD").await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server);
        reader.read_frame().await.unwrap();
        let mut rest = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader.into_inner(), &mut rest)
            .await
            .unwrap();
        assert_eq!(rest, b"RAW-PAYLOAD");
    }
}
