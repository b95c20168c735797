//! The wire protocol: frame codec (`§4.4`), message payload codec, and feed
//! batch codec (`§4.5`). Shared by `frostbox-server` and `frostbox-client`
//! so both ends decode the exact same tags and field layout.

mod batch;
mod frame;
mod message;
mod primitive;

pub use batch::{read_batch, write_batch, BatchItem, DEFAULT_BATCH_BYTES_CAP, DEFAULT_BATCH_ITEM_CAP};
pub use frame::{FrameReader, FrameWriter, MAX_PAYLOAD_LEN};
pub use message::{tag, CollectionDescriptor, Message};

use frostbox_common::CoreError;
use tokio::io::{AsyncRead, AsyncWrite};

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Encodes and writes a whole [`Message`] in one call.
    pub async fn send(&mut self, message: &Message) -> Result<(), CoreError> {
        let payload = message.encode_payload();
        self.write_frame(message.tag(), &payload).await
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Reads one frame and decodes it as a [`Message`].
    pub async fn recv(&mut self) -> Result<Option<Message>, CoreError> {
        match self.read_frame().await? {
            None => Ok(None),
            Some((frame_tag, payload)) => Message::decode(frame_tag, &payload).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sends_and_receives_a_message() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let message = Message::BeginFeed {
            collection: "persons".into(),
            version: "001".into(),
        };
        writer.send(&message).await.unwrap();
        let received = reader.recv().await.unwrap().unwrap();
        assert_eq!(received, message);
    }
}
