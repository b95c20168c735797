//! Fan-out over N replica pools (`§4.8`): round-robin query, parallel feed,
//! and the version string the aggregator itself chooses.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use frostbox_common::CoreError;
use frostbox_proto::BatchItem;
use tokio::sync::mpsc;
use tracing::{instrument, warn};

use crate::pool::ConnectorPool;

/// Target bytes/items per feed batch (`§4.5`); the aggregator packs items
/// into batches of this shape before handing them to each replica channel.
const FEED_CHANNEL_CAPACITY: usize = 10_000;

/// One item queued for a fan-out feed.
#[derive(Debug, Clone)]
pub struct FeedItem {
    pub keys: Vec<i64>,
    pub data: Vec<u8>,
}

impl From<FeedItem> for BatchItem {
    fn from(item: FeedItem) -> Self {
        BatchItem { keys: item.keys, data: item.data }
    }
}

/// Client-side fan-out over replica connector pools.
///
/// Holds one [`ConnectorPool`] per replica. A query is served by any single
/// connected pool, chosen round-robin; a feed is fanned out to every
/// connected pool in parallel, and one replica's failure does not prevent
/// the others from completing (`§4.8`).
pub struct Aggregator {
    pools: Vec<ConnectorPool>,
    next: AtomicUsize,
}

impl Aggregator {
    /// Connects one pool per `(host, port)` replica address.
    pub async fn connect(
        replicas: impl IntoIterator<Item = (String, u16)>,
        pool_capacity: usize,
        watchdog_period: Duration,
    ) -> Self {
        let mut pools = Vec::new();
        for (host, port) in replicas {
            pools.push(ConnectorPool::connect(host, port, pool_capacity, watchdog_period).await);
        }
        Self { pools, next: AtomicUsize::new(0) }
    }

    pub fn replica_count(&self) -> usize {
        self.pools.len()
    }

    pub fn connected_replica_count(&self) -> usize {
        self.pools.iter().filter(|p| p.connected()).count()
    }

    /// The version string this aggregator assigns to the next feed: a UTC
    /// timestamp formatted `YYYYMMDD_HHmmss` (`§4.8`). Monotonic across
    /// replicas without any cross-replica coordination, provided feeds are
    /// not started within the same wall-clock second.
    pub fn next_feed_version(&self) -> String {
        Utc::now().format("%Y%m%d_%H%M%S").to_string()
    }

    /// Round-robin query across connected replicas, skipping disconnected
    /// pools and retrying on another replica when the chosen one returns a
    /// socket error (`§4.8`, `§7`).
    #[instrument(skip(self, primary_key_values), fields(collection))]
    pub async fn query_by_primary_key(
        &self,
        collection: &str,
        primary_key_values: Vec<i64>,
    ) -> Result<Vec<Vec<u8>>, CoreError> {
        if self.pools.is_empty() {
            return Err(CoreError::RemoteUnavailable);
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let mut last_err = CoreError::RemoteUnavailable;
        for offset in 0..self.pools.len() {
            let pool = &self.pools[(start + offset) % self.pools.len()];
            if !pool.connected() {
                continue;
            }
            let mut connector = match pool.get().await {
                Ok(connector) => connector,
                Err(error) => {
                    last_err = error;
                    continue;
                }
            };
            match connector
                .query_by_primary_key(collection, primary_key_values.clone())
                .await
            {
                Ok(results) => {
                    pool.put_back(connector).await;
                    return Ok(results);
                }
                Err(error) => {
                    warn!(%error, host = pool.host(), port = pool.port(), "replica query failed, trying another");
                    last_err = error;
                }
            }
        }
        Err(last_err)
    }

    /// `CreateCollection` requires every currently-connected replica to
    /// succeed (`§4.8`). Disconnected replicas are skipped, not failed —
    /// they will observe the schema once reconnected via a later feed.
    #[instrument(skip(self))]
    pub async fn create_collection(
        &self,
        collection: &str,
        primary_key_name: &str,
        other_index_names: Vec<String>,
    ) -> Result<(), CoreError> {
        for pool in &self.pools {
            if !pool.connected() {
                continue;
            }
            let mut connector = pool.get().await?;
            let result = connector
                .create_collection(collection, primary_key_name, other_index_names.clone())
                .await;
            pool.put_back(connector).await;
            result?;
        }
        Ok(())
    }

    /// `DropCollection` requires every currently-connected replica to
    /// succeed (`§4.8`).
    #[instrument(skip(self))]
    pub async fn drop_collection(&self, collection: &str) -> Result<(), CoreError> {
        for pool in &self.pools {
            if !pool.connected() {
                continue;
            }
            let mut connector = pool.get().await?;
            let result = connector.drop_collection(collection).await;
            pool.put_back(connector).await;
            result?;
        }
        Ok(())
    }

    /// Fans a feed out to every connected replica: one channel and one
    /// consumer task per replica, a single producer that packs each item
    /// once and writes it into every channel. Failure of one replica's
    /// consumer does not stop the others (`§4.8`, `§5`); the first *logical*
    /// error (e.g. `VersionNotNewer`) observed on any replica is returned
    /// to the caller once all consumers have finished, but every
    /// independently-connected replica still gets its own complete attempt.
    #[instrument(skip(self, items), fields(collection))]
    pub async fn feed(
        &self,
        collection: &str,
        version: &str,
        items: impl IntoIterator<Item = FeedItem>,
    ) -> Result<(), CoreError> {
        let connected: Vec<&ConnectorPool> = self.pools.iter().filter(|p| p.connected()).collect();
        if connected.is_empty() {
            return Err(CoreError::RemoteUnavailable);
        }

        let mut senders = Vec::with_capacity(connected.len());
        let mut consumers = Vec::with_capacity(connected.len());
        for pool in &connected {
            let (tx, rx) = mpsc::channel::<FeedItem>(FEED_CHANNEL_CAPACITY);
            senders.push(tx);
            consumers.push(tokio::spawn(feed_one_replica(
                replica_label(pool),
                pool_connect_args(pool),
                collection.to_string(),
                version.to_string(),
                rx,
            )));
        }

        for item in items {
            for sender in &senders {
                // Each replica gets its own clone of the item; a full
                // channel backpressures the producer, which is the
                // intended throttle (`§5`).
                if sender.send(item.clone()).await.is_err() {
                    // That replica's consumer already gave up; the others
                    // keep going.
                }
            }
        }
        drop(senders);

        let mut first_logical_error = None;
        for consumer in consumers {
            match consumer.await {
                Ok(Ok(())) => {}
                Ok(Err(CoreError::RemoteUnavailable)) => {
                    // Connection-level failure: already logged inside the
                    // consumer; does not fail the whole fan-out.
                }
                Ok(Err(error)) => {
                    if first_logical_error.is_none() {
                        first_logical_error = Some(error);
                    }
                }
                Err(join_error) => {
                    warn!(%join_error, "feed consumer task panicked");
                }
            }
        }

        match first_logical_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn replica_label(pool: &ConnectorPool) -> String {
    format!("{}:{}", pool.host(), pool.port())
}

fn pool_connect_args(pool: &ConnectorPool) -> (String, u16) {
    (pool.host().to_string(), pool.port())
}

/// One replica's feed consumer: opens its own connector (outside the pool,
/// since a feed holds the connection exclusively for the stream's whole
/// duration rather than one request), streams batches, and reports the
/// outcome.
async fn feed_one_replica(
    label: String,
    (host, port): (String, u16),
    collection: String,
    version: String,
    mut items: mpsc::Receiver<FeedItem>,
) -> Result<(), CoreError> {
    let mut connector = match crate::connector::Connector::connect(&host, port).await {
        Ok(connector) => connector,
        Err(error) => {
            warn!(%error, replica = %label, "feed could not connect to replica");
            return Err(CoreError::RemoteUnavailable);
        }
    };

    let mut stream = match connector.begin_feed(&collection, &version).await {
        Ok(stream) => stream,
        Err(error) => {
            warn!(%error, replica = %label, "replica rejected begin_feed");
            return Err(error);
        }
    };

    let mut batch = Vec::with_capacity(frostbox_proto::DEFAULT_BATCH_ITEM_CAP);
    let mut batch_bytes = 0usize;
    while let Some(item) = items.recv().await {
        batch_bytes += item.data.len();
        batch.push(BatchItem::from(item));
        if batch.len() >= frostbox_proto::DEFAULT_BATCH_ITEM_CAP
            || batch_bytes >= frostbox_proto::DEFAULT_BATCH_BYTES_CAP
        {
            if let Err(error) = stream.send_batch(&batch).await {
                warn!(%error, replica = %label, "feed batch failed");
                return Err(CoreError::RemoteUnavailable);
            }
            batch.clear();
            batch_bytes = 0;
        }
    }
    if !batch.is_empty() {
        if let Err(error) = stream.send_batch(&batch).await {
            warn!(%error, replica = %label, "feed batch failed");
            return Err(CoreError::RemoteUnavailable);
        }
    }

    stream.finish().await
}
