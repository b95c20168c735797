//! Per-connection dispatch loop (`§4.6`).

use std::sync::Arc;

use frostbox_common::CoreError;
use frostbox_proto::{read_batch, CollectionDescriptor, FrameReader, FrameWriter, Message};
use frostbox_store::{CollectionMetadata, DataStore, IndexDescriptor, Item};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, instrument, warn};

use crate::config::ServerConfig;

/// Drives one accepted connection until EOF, cancellation, or a
/// protocol-fatal error.
#[instrument(skip(stream, store, config, shutdown), fields(peer = %stream.peer_addr().map(|a| a.to_string()).unwrap_or_default()))]
pub async fn handle_connection(
    stream: TcpStream,
    store: Arc<DataStore>,
    config: Arc<ServerConfig>,
    mut shutdown: watch::Receiver<()>,
) {
    if let Err(error) = stream.set_nodelay(true) {
        warn!(%error, "failed to set TCP_NODELAY on accepted connection");
    }
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                debug!("connection observing server shutdown");
                break;
            }
            received = reader.recv() => received,
        };

        let message = match received {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(error) => {
                warn!(%error, "closing connection after a framing error");
                break;
            }
        };

        if let Err(error) = dispatch(message, &store, &config, &mut reader, &mut writer).await {
            warn!(%error, "closing connection after a protocol-fatal error");
            break;
        }
    }
}

/// Handles one request. Returns `Err` only for errors that must close the
/// connection (`CoreError::is_protocol_fatal`); every other failure is
/// translated into a `StatusResponse` and the loop continues.
async fn dispatch<R, W>(
    message: Message,
    store: &Arc<DataStore>,
    config: &Arc<ServerConfig>,
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
) -> Result<(), CoreError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match message {
        Message::Ping => writer.send(&Message::Ping).await,

        Message::CreateCollection {
            collection,
            primary_key_name,
            other_index_names,
        } => {
            if primary_key_name.is_empty() {
                return reply_error(writer, CoreError::InvalidRequest {
                    reason: "primary_key_name must not be empty".into(),
                })
                .await;
            }
            let mut indexes = vec![IndexDescriptor {
                name: primary_key_name,
                unique: true,
            }];
            indexes.extend(
                other_index_names
                    .into_iter()
                    .map(|name| IndexDescriptor { name, unique: false }),
            );
            let metadata = CollectionMetadata {
                name: collection,
                indexes,
                max_items_per_segment: config.max_items_per_segment,
                segment_data_capacity_bytes: config.segment_data_capacity_bytes,
                max_versions_to_keep: config.max_versions_to_keep,
            };
            match store.create_collection(metadata) {
                Ok(()) => writer.send(&Message::ok_status()).await,
                Err(error) => reply_error(writer, error).await,
            }
        }

        Message::DropCollection { collection } => {
            if collection.is_empty() {
                return reply_error(writer, CoreError::InvalidRequest {
                    reason: "collection must not be empty".into(),
                })
                .await;
            }
            match store.drop_collection(&collection) {
                Ok(()) => writer.send(&Message::ok_status()).await,
                Err(error) => reply_error(writer, error).await,
            }
        }

        Message::GetCollectionsDescription => match store.get_collections_information() {
            Ok(infos) => {
                let collections = infos
                    .into_iter()
                    .map(|info| CollectionDescriptor {
                        name: info.metadata.name,
                        count: info.object_count as i64,
                        size_in_bytes: info.total_size_in_bytes as i64,
                        last_version: info.last_version,
                        key_names: info.metadata.indexes.into_iter().map(|d| d.name).collect(),
                        segment_file_size: info.metadata.segment_data_capacity_bytes as i64,
                        max_objects_per_segment: info.metadata.max_items_per_segment as i64,
                    })
                    .collect();
                writer.send(&Message::CollectionsDescription { collections }).await
            }
            Err(error) => reply_error(writer, error).await,
        },

        Message::QueryByPrimaryKey {
            collection,
            primary_key_values,
        } => {
            if collection.is_empty() {
                return reply_error(writer, CoreError::InvalidRequest {
                    reason: "collection must not be empty".into(),
                })
                .await;
            }
            if primary_key_values.is_empty() {
                return reply_error(writer, CoreError::InvalidRequest {
                    reason: "primary_key_values must not be empty".into(),
                })
                .await;
            }
            let mut objects_data = Vec::new();
            for key in primary_key_values {
                match store.get_by_primary_key(&collection, key) {
                    Ok(matches) => objects_data.extend(matches),
                    Err(error) => return reply_error(writer, error).await,
                }
            }
            writer
                .send(&Message::QueryResponse {
                    single_answer: true,
                    objects_data,
                    collection: Some(collection),
                })
                .await
        }

        Message::BeginFeed { collection, version } => {
            handle_begin_feed(collection, version, store, config, reader, writer).await
        }

        other @ (Message::StatusResponse { .. }
        | Message::QueryResponse { .. }
        | Message::CollectionsDescription { .. }) => {
            reply_error(
                writer,
                CoreError::InvalidRequest {
                    reason: format!("'{}' is a server-to-client message", other.tag()),
                },
            )
            .await
        }
    }
}

async fn reply_error<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    error: CoreError,
) -> Result<(), CoreError> {
    writer.send(&Message::error_status(error.to_string())).await
}

/// `BeginFeed` (`§4.3`, `§4.6`): validate and create the staging version on
/// a dedicated feeder task, reply success, then pump batches off the wire
/// into a bounded channel until the empty-batch terminator, and finally
/// reply with the feeder's outcome.
async fn handle_begin_feed<R, W>(
    collection: String,
    version: String,
    store: &Arc<DataStore>,
    config: &Arc<ServerConfig>,
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
) -> Result<(), CoreError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), CoreError>>();
    let (item_tx, mut item_rx) = mpsc::channel::<Item>(config.feed_queue_capacity);
    let (done_tx, done_rx) = oneshot::channel::<Result<(), CoreError>>();

    let feeder_store = Arc::clone(store);
    tokio::spawn(async move {
        let mut session = match feeder_store.begin_feed(&collection, &version) {
            Ok(session) => {
                if ready_tx.send(Ok(())).is_err() {
                    return;
                }
                session
            }
            Err(error) => {
                let _ = ready_tx.send(Err(error));
                return;
            }
        };

        let mut failure = None;
        while let Some(item) = item_rx.recv().await {
            if let Err(error) = session.store(item) {
                failure = Some(error);
                break;
            }
        }

        let outcome = match failure {
            Some(error) => {
                session.abort();
                Err(error)
            }
            None => session.end_feed().map(|_stats| ()),
        };
        let _ = done_tx.send(outcome);
    });

    match ready_rx.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => return reply_error(writer, error).await,
        Err(_) => {
            return reply_error(
                writer,
                CoreError::Io {
                    path: None,
                    source: std::io::Error::other("feeder task terminated early"),
                },
            )
            .await
        }
    }
    writer.send(&Message::ok_status()).await?;

    loop {
        let batch = read_batch(reader.get_mut(), config.max_feed_batch_bytes).await;
        match batch {
            Ok(items) if items.is_empty() => {
                drop(item_tx);
                break;
            }
            Ok(items) => {
                for batch_item in items {
                    let item = Item::new(batch_item.data, batch_item.keys);
                    if item_tx.send(item).await.is_err() {
                        // Feeder already gave up; keep draining the socket
                        // until the terminator so framing stays aligned.
                        break;
                    }
                }
            }
            Err(error) => {
                drop(item_tx);
                let _ = done_rx.await;
                return Err(error);
            }
        }
    }

    let outcome = done_rx.await.map_err(|_| CoreError::Io {
        path: None,
        source: std::io::Error::other("feeder task terminated early"),
    })?;
    match outcome {
        Ok(()) => writer.send(&Message::ok_status()).await,
        Err(error) => reply_error(writer, error).await,
    }
}
