//! Frame reading and writing (`§4.4`): `tag ‖ payload_length ‖ payload`.
//!
//! The header carries two independent little-endian `i32` fields, which
//! does not fit `tokio_util`'s `LengthDelimitedCodec` cleanly in both
//! directions (its encoder always prepends a single length field it
//! computes itself). Both directions are hand-rolled here instead; the
//! field vocabulary (`max_frame_length`, fixed header width) is the same
//! one `codecs::common::length_delimited` uses.

use bytes::{Bytes, BytesMut};
use frostbox_common::CoreError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Payload ceiling from `§4.4`: `payload_length > 1 MiB` is rejected.
pub const MAX_PAYLOAD_LEN: usize = 1 << 20;

const HEADER_LEN: usize = 8;

/// Reads frames off an `AsyncRead` one at a time.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Reads the next frame, or `None` on a clean EOF between frames.
    pub async fn read_frame(&mut self) -> Result<Option<(i32, Bytes)>, CoreError> {
        let mut header = [0u8; HEADER_LEN];
        if let Err(err) = self.inner.read_exact(&mut header).await {
            return if err.kind() == std::io::ErrorKind::UnexpectedEof {
                Ok(None)
            } else {
                Err(CoreError::io(err))
            };
        }

        let tag = i32::from_le_bytes(header[0..4].try_into().unwrap());
        let payload_length = i32::from_le_bytes(header[4..8].try_into().unwrap());
        if payload_length < 0 {
            return Err(CoreError::MalformedFrame {
                reason: "negative payload_length".into(),
            });
        }
        let payload_length = payload_length as usize;
        if payload_length > MAX_PAYLOAD_LEN {
            return Err(CoreError::FrameTooLarge {
                size: payload_length,
                limit: MAX_PAYLOAD_LEN,
            });
        }

        let mut payload = vec![0u8; payload_length];
        self.inner
            .read_exact(&mut payload)
            .await
            .map_err(CoreError::io)?;
        Ok(Some((tag, Bytes::from(payload))))
    }
}

/// Writes frames to an `AsyncWrite`, reusing one scratch buffer per writer
/// (the `§9` "thread-static scratch buffer" contract: steady-state frames
/// under the ceiling cost no further heap allocation once warmed up).
pub struct FrameWriter<W> {
    inner: W,
    scratch: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            scratch: BytesMut::with_capacity(HEADER_LEN + 4096),
        }
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub async fn write_frame(&mut self, tag: i32, payload: &[u8]) -> Result<(), CoreError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(CoreError::FrameTooLarge {
                size: payload.len(),
                limit: MAX_PAYLOAD_LEN,
            });
        }
        self.scratch.clear();
        self.scratch.reserve(HEADER_LEN + payload.len());
        self.scratch.extend_from_slice(&tag.to_le_bytes());
        self.scratch
            .extend_from_slice(&(payload.len() as i32).to_le_bytes());
        self.scratch.extend_from_slice(payload);
        self.inner
            .write_all(&self.scratch)
            .await
            .map_err(CoreError::io)?;
        self.inner.flush().await.map_err(CoreError::io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_and_reads_back_a_frame() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer.write_frame(6, b"hello").await.unwrap();
        let (tag, payload) = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(tag, 6);
        assert_eq!(&payload[..], b"hello");
    }

    #[tokio::test]
    async fn empty_payload_is_valid() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer.write_frame(1, b"").await.unwrap();
        let (tag, payload) = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(tag, 1);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_before_writing() {
        let (client, _server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let oversized = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(matches!(
            writer.write_frame(6, &oversized).await,
            Err(CoreError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn clean_eof_between_frames_yields_none() {
        let (client, server) = tokio::io::duplex(4096);
        drop(client);
        let mut reader = FrameReader::new(server);
        assert!(reader.read_frame().await.unwrap().is_none());
    }
}
