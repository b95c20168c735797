//! A single client connection (`§4.7`): strictly serialized requests, a
//! latency-bounded `ping`, and an `is_healthy` flag that flips on the first
//! stream error.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use frostbox_common::CoreError;
use frostbox_proto::{write_batch, BatchItem, CollectionDescriptor, FrameReader, FrameWriter, Message};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tracing::instrument;

/// Round-trip budget for `ping` (`§4.7`, `§5`).
const PING_TIMEOUT: Duration = Duration::from_millis(100);

fn protocol_mismatch(expected: &str, got: &Message) -> CoreError {
    CoreError::MalformedFrame {
        reason: format!("expected {expected}, got tag {}", got.tag()),
    }
}

fn eof_error() -> CoreError {
    CoreError::io(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"))
}

fn status_to_result(message: Message) -> Result<(), CoreError> {
    match message {
        Message::StatusResponse { success: true, .. } => Ok(()),
        Message::StatusResponse { success: false, error } => Err(CoreError::Remote {
            message: error.unwrap_or_else(|| "no error detail provided".into()),
        }),
        other => Err(protocol_mismatch("StatusResponse", &other)),
    }
}

/// One TCP connection to one server. Every method takes `&mut self`: the
/// type itself enforces the "one outstanding request at a time" rule since
/// there is no way to issue a second request while the first's `&mut`
/// borrow is still live.
pub struct Connector {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    addr: SocketAddr,
    healthy: bool,
}

impl Connector {
    /// Resolves `host:port`, preferring an IPv4 address when both families
    /// are returned (`§4.7`), and connects.
    #[instrument(skip_all, fields(host, port))]
    pub async fn connect(host: &str, port: u16) -> Result<Self, CoreError> {
        let mut addrs: Vec<SocketAddr> = lookup_host((host, port)).await.map_err(CoreError::io)?.collect();
        addrs.sort_by_key(|addr| !addr.is_ipv4());
        let addr = *addrs
            .first()
            .ok_or_else(|| CoreError::io(io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")))?;
        Self::connect_addr(addr).await
    }

    pub async fn connect_addr(addr: SocketAddr) -> Result<Self, CoreError> {
        let stream = TcpStream::connect(addr).await.map_err(CoreError::io)?;
        stream.set_nodelay(true).map_err(CoreError::io)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: FrameReader::new(read_half),
            writer: FrameWriter::new(write_half),
            addr,
            healthy: true,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    async fn request(&mut self, message: &Message) -> Result<Message, CoreError> {
        if let Err(error) = self.writer.send(message).await {
            self.healthy = false;
            return Err(error);
        }
        match self.reader.recv().await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => {
                self.healthy = false;
                Err(eof_error())
            }
            Err(error) => {
                self.healthy = false;
                Err(error)
            }
        }
    }

    /// `≤100ms` round trip; any failure (timeout, I/O error, unexpected
    /// reply) marks the connector unhealthy and returns `false`.
    pub async fn ping(&mut self) -> bool {
        match tokio::time::timeout(PING_TIMEOUT, self.request(&Message::Ping)).await {
            Ok(Ok(Message::Ping)) => true,
            _ => {
                self.healthy = false;
                false
            }
        }
    }

    pub async fn create_collection(
        &mut self,
        collection: &str,
        primary_key_name: &str,
        other_index_names: Vec<String>,
    ) -> Result<(), CoreError> {
        let reply = self
            .request(&Message::CreateCollection {
                collection: collection.to_string(),
                primary_key_name: primary_key_name.to_string(),
                other_index_names,
            })
            .await?;
        status_to_result(reply)
    }

    pub async fn drop_collection(&mut self, collection: &str) -> Result<(), CoreError> {
        let reply = self
            .request(&Message::DropCollection {
                collection: collection.to_string(),
            })
            .await?;
        status_to_result(reply)
    }

    pub async fn get_collections_description(&mut self) -> Result<Vec<CollectionDescriptor>, CoreError> {
        match self.request(&Message::GetCollectionsDescription).await? {
            Message::CollectionsDescription { collections } => Ok(collections),
            other => Err(protocol_mismatch("CollectionsDescription", &other)),
        }
    }

    pub async fn query_by_primary_key(
        &mut self,
        collection: &str,
        primary_key_values: Vec<i64>,
    ) -> Result<Vec<Vec<u8>>, CoreError> {
        match self
            .request(&Message::QueryByPrimaryKey {
                collection: collection.to_string(),
                primary_key_values,
            })
            .await?
        {
            Message::QueryResponse { objects_data, .. } => Ok(objects_data),
            other => Err(protocol_mismatch("QueryResponse", &other)),
        }
    }

    /// Begins a streamed feed (`§4.5`): on success the server has already
    /// replied, so subsequent batches can be written immediately.
    pub async fn begin_feed(&mut self, collection: &str, version: &str) -> Result<FeedStream<'_>, CoreError> {
        let reply = self
            .request(&Message::BeginFeed {
                collection: collection.to_string(),
                version: version.to_string(),
            })
            .await?;
        status_to_result(reply)?;
        Ok(FeedStream { connector: self })
    }
}

/// A feed accepted by [`Connector::begin_feed`]. Items are written as
/// batches; [`FeedStream::finish`] sends the empty-batch terminator and
/// waits for the server's final status.
pub struct FeedStream<'a> {
    connector: &'a mut Connector,
}

impl<'a> FeedStream<'a> {
    pub async fn send_batch(&mut self, items: &[BatchItem]) -> Result<(), CoreError> {
        if let Err(error) = write_batch(self.connector.writer.get_mut(), items).await {
            self.connector.healthy = false;
            return Err(error);
        }
        Ok(())
    }

    pub async fn finish(self) -> Result<(), CoreError> {
        if let Err(error) = write_batch(self.connector.writer.get_mut(), &[]).await {
            self.connector.healthy = false;
            return Err(error);
        }
        match self.connector.reader.recv().await {
            Ok(Some(message)) => status_to_result(message),
            Ok(None) => {
                self.connector.healthy = false;
                Err(eof_error())
            }
            Err(error) => {
                self.connector.healthy = false;
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use frostbox_server::{bind_listener, serve, ServerConfig};
    use frostbox_store::DataStore;
    use tokio::sync::watch;

    use super::*;

    async fn spawn_server() -> SocketAddr {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DataStore::new(dir.path()));
        store.open().unwrap();
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        tokio::spawn(serve(listener, store, Arc::new(ServerConfig::default()), shutdown_rx));
        std::mem::forget(dir);
        std::mem::forget(shutdown_tx);
        addr
    }

    #[tokio::test]
    async fn ping_succeeds_against_a_live_server() {
        let addr = spawn_server().await;
        let mut connector = Connector::connect_addr(addr).await.unwrap();
        assert!(connector.ping().await);
        assert!(connector.is_healthy());
    }

    #[tokio::test]
    async fn ping_fails_and_marks_unhealthy_once_the_peer_is_gone() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut connector = Connector::connect_addr(addr).await.unwrap();
        assert!(!connector.ping().await);
        assert!(!connector.is_healthy());
    }

    #[tokio::test]
    async fn feed_then_query_round_trips() {
        let addr = spawn_server().await;
        let mut connector = Connector::connect_addr(addr).await.unwrap();
        connector
            .create_collection("persons", "id", vec!["client_id".into()])
            .await
            .unwrap();

        let mut feed = connector.begin_feed("persons", "001").await.unwrap();
        feed.send_batch(&[
            BatchItem { keys: vec![1, 200], data: vec![1u8; 100] },
            BatchItem { keys: vec![2, 300], data: vec![2u8; 1000] },
        ])
        .await
        .unwrap();
        feed.finish().await.unwrap();

        let results = connector
            .query_by_primary_key("persons", vec![2])
            .await
            .unwrap();
        assert_eq!(results, vec![vec![2u8; 1000]]);
    }
}
