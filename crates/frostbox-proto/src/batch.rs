//! Feed batch codec (`§4.5`): used only inside an accepted `BeginFeed`
//! stream, never wrapped in the `§4.4` frame header.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use frostbox_common::CoreError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::primitive::malformed;

/// Target bytes-per-batch the producer side aims for; consumers accept any
/// batch up to `max_batch_bytes` passed to [`read_batch`].
pub const DEFAULT_BATCH_BYTES_CAP: usize = 1 << 20;
pub const DEFAULT_BATCH_ITEM_CAP: usize = 5_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub keys: Vec<i64>,
    pub data: Vec<u8>,
}

impl BatchItem {
    fn header_len(&self) -> usize {
        4 + 8 * self.keys.len()
    }

    fn encoded_len(&self) -> usize {
        self.header_len() + self.data.len()
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.encoded_len() as i32);
        buf.put_i32_le(self.keys.len() as i32);
        for k in &self.keys {
            buf.put_i64_le(*k);
        }
        buf.extend_from_slice(&self.data);
    }

    fn decode_from(buf: &mut Bytes) -> Result<Self, CoreError> {
        if buf.remaining() < 8 {
            return Err(malformed("truncated feed item header"));
        }
        let item_size = buf.get_i32_le();
        let keys_count = buf.get_i32_le();
        if item_size < 0 || keys_count < 0 {
            return Err(malformed("negative feed item field"));
        }
        let keys_count = keys_count as usize;
        let header_len = 4 + 8 * keys_count;
        if (item_size as usize) < header_len {
            return Err(malformed("feed item size smaller than its own header"));
        }
        if buf.remaining() < keys_count * 8 {
            return Err(malformed("truncated feed item keys"));
        }
        let keys: Vec<i64> = (0..keys_count).map(|_| buf.get_i64_le()).collect();
        let data_len = item_size as usize - header_len;
        if buf.remaining() < data_len {
            return Err(malformed("truncated feed item data"));
        }
        let data = buf.copy_to_bytes(data_len).to_vec();
        Ok(BatchItem { keys, data })
    }
}

/// Encodes a non-empty batch frame. Pass `&[]` batches to [`write_batch`]
/// instead, which emits the empty-batch terminator.
fn encode_batch(items: &[BatchItem]) -> BytesMut {
    let mut body = BytesMut::new();
    for item in items {
        item.encode_into(&mut body);
    }
    let mut framed = BytesMut::with_capacity(8 + body.len());
    framed.put_i32_le(body.len() as i32);
    framed.put_i32_le(items.len() as i32);
    framed.extend_from_slice(&body);
    framed
}

fn encode_end_of_batch() -> BytesMut {
    let mut framed = BytesMut::with_capacity(8);
    framed.put_i32_le(0);
    framed.put_i32_le(0);
    framed
}

pub async fn write_batch<W: AsyncWrite + Unpin>(
    writer: &mut W,
    items: &[BatchItem],
) -> Result<(), CoreError> {
    let framed = if items.is_empty() {
        encode_end_of_batch()
    } else {
        encode_batch(items)
    };
    writer.write_all(&framed).await.map_err(CoreError::io)?;
    writer.flush().await.map_err(CoreError::io)
}

/// Reads one batch. Returns an empty `Vec` for the stream terminator.
pub async fn read_batch<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_batch_bytes: usize,
) -> Result<Vec<BatchItem>, CoreError> {
    let batch_bytes_len = read_i32(reader).await?;
    let item_count = read_i32(reader).await?;
    if batch_bytes_len == 0 && item_count == 0 {
        return Ok(Vec::new());
    }
    if batch_bytes_len < 0 || item_count < 0 {
        return Err(malformed("negative feed batch header field"));
    }
    let batch_bytes_len = batch_bytes_len as usize;
    if batch_bytes_len > max_batch_bytes {
        return Err(CoreError::FrameTooLarge {
            size: batch_bytes_len,
            limit: max_batch_bytes,
        });
    }

    let mut body = vec![0u8; batch_bytes_len];
    reader.read_exact(&mut body).await.map_err(CoreError::io)?;
    let mut body = Bytes::from(body);

    let mut items = Vec::with_capacity(item_count as usize);
    for _ in 0..item_count {
        items.push(BatchItem::decode_from(&mut body)?);
    }
    Ok(items)
}

async fn read_i32<R: AsyncRead + Unpin>(reader: &mut R) -> Result<i32, CoreError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).await.map_err(CoreError::io)?;
    Ok(i32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batch_round_trips() {
        let items = vec![
            BatchItem {
                keys: vec![1, 200],
                data: vec![7u8; 1000],
            },
            BatchItem {
                keys: vec![2, 300],
                data: vec![9u8; 100],
            },
        ];
        let (mut client, mut server) = tokio::io::duplex(1 << 16);
        write_batch(&mut client, &items).await.unwrap();
        let decoded = read_batch(&mut server, DEFAULT_BATCH_BYTES_CAP).await.unwrap();
        assert_eq!(decoded, items);
    }

    #[tokio::test]
    async fn empty_batch_terminates_the_stream() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        write_batch(&mut client, &[]).await.unwrap();
        let decoded = read_batch(&mut server, DEFAULT_BATCH_BYTES_CAP).await.unwrap();
        assert!(decoded.is_empty());
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1 << 16);
        let items = vec![BatchItem {
            keys: vec![1],
            data: vec![0u8; 2048],
        }];
        write_batch(&mut client, &items).await.unwrap();
        assert!(matches!(
            read_batch(&mut server, 16).await,
            Err(CoreError::FrameTooLarge { .. })
        ));
    }
}
