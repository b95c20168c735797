//! Client-side LRU cache over an [`Aggregator`] (`§1`, `SPEC_FULL §4.7`).
//!
//! The core's primary spec places this interface out of scope; it is
//! implemented here as a thin wrapper so callers get the bounded, read-heavy
//! cache their workload calls for without every caller having to build one.

use std::num::NonZeroUsize;

use frostbox_common::CoreError;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::aggregator::{Aggregator, FeedItem};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    collection: String,
    primary_key: i64,
}

/// Wraps an [`Aggregator`] with a bounded, least-recently-used cache keyed
/// on `(collection, primary key)`.
///
/// Populated only for single-key lookups that come back with exactly one
/// match (the common case this cache is for); multi-key batch queries pass
/// through uncached, since caching a partial multi-key result would be
/// observably wrong on a later single-key hit. Invalidated wholesale for a
/// collection whenever a feed through this same handle publishes a new
/// version for it — a version swap can make every cached payload for that
/// collection stale in one step, so there is no cheaper correct
/// invalidation than dropping the whole collection's entries.
pub struct CachingAggregator {
    inner: Aggregator,
    cache: Mutex<LruCache<CacheKey, Vec<u8>>>,
}

impl CachingAggregator {
    pub fn new(inner: Aggregator, capacity: NonZeroUsize) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn inner(&self) -> &Aggregator {
        &self.inner
    }

    /// Single-key lookup with caching. Falls back to the aggregator and
    /// populates the cache on a unique hit; bypasses the cache for zero or
    /// multiple matches (nothing useful to remember by primary key alone).
    pub async fn get_by_primary_key(&self, collection: &str, key: i64) -> Result<Vec<Vec<u8>>, CoreError> {
        let cache_key = CacheKey { collection: collection.to_string(), primary_key: key };
        if let Some(hit) = self.cache.lock().get(&cache_key).cloned() {
            debug!(collection, key, "cache hit");
            return Ok(vec![hit]);
        }

        let results = self.inner.query_by_primary_key(collection, vec![key]).await?;
        if results.len() == 1 {
            self.cache.lock().put(cache_key, results[0].clone());
        }
        Ok(results)
    }

    /// Batch lookup bypasses the cache entirely; see the type-level doc.
    pub async fn query_by_primary_key(
        &self,
        collection: &str,
        primary_key_values: Vec<i64>,
    ) -> Result<Vec<Vec<u8>>, CoreError> {
        self.inner.query_by_primary_key(collection, primary_key_values).await
    }

    /// Feeds through the wrapped aggregator, then invalidates every cached
    /// entry for `collection` — a new version may have changed or removed
    /// any of them.
    pub async fn feed(
        &self,
        collection: &str,
        version: &str,
        items: impl IntoIterator<Item = FeedItem>,
    ) -> Result<(), CoreError> {
        let result = self.inner.feed(collection, version, items).await;
        self.invalidate_collection(collection);
        result
    }

    fn invalidate_collection(&self, collection: &str) {
        let mut cache = self.cache.lock();
        let stale: Vec<CacheKey> = cache
            .iter()
            .filter(|(k, _)| k.collection == collection)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            cache.pop(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use frostbox_server::{bind_listener, serve, ServerConfig};
    use frostbox_store::DataStore;
    use tokio::sync::watch;

    use super::*;

    async fn spawn_server() -> std::net::SocketAddr {
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
    async fn single_key_hits_populate_and_serve_from_cache() {
        let addr = spawn_server().await;
        let aggregator = Aggregator::connect(
            std::iter::once((addr.ip().to_string(), addr.port())),
            2,
            Duration::from_secs(60),
        )
        .await;
        let caching = CachingAggregator::new(aggregator, NonZeroUsize::new(16).unwrap());

        caching
            .inner()
            .create_collection("persons", "id", vec![])
            .await
            .unwrap();
        caching
            .feed("persons", "001", vec![FeedItem { keys: vec![1], data: vec![9u8; 10] }])
            .await
            .unwrap();

        let first = caching.get_by_primary_key("persons", 1).await.unwrap();
        assert_eq!(first, vec![vec![9u8; 10]]);
        assert_eq!(caching.cache.lock().len(), 1);

        let second = caching.get_by_primary_key("persons", 1).await.unwrap();
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn feed_invalidates_the_collections_cached_entries() {
        let addr = spawn_server().await;
        let aggregator = Aggregator::connect(
            std::iter::once((addr.ip().to_string(), addr.port())),
            2,
            Duration::from_secs(60),
        )
        .await;
        let caching = CachingAggregator::new(aggregator, NonZeroUsize::new(16).unwrap());

        caching.inner().create_collection("persons", "id", vec![]).await.unwrap();
        caching
            .feed("persons", "001", vec![FeedItem { keys: vec![1], data: vec![1u8; 4] }])
            .await
            .unwrap();
        caching.get_by_primary_key("persons", 1).await.unwrap();
        assert_eq!(caching.cache.lock().len(), 1);

        caching
            .feed("persons", "002", vec![FeedItem { keys: vec![1], data: vec![2u8; 4] }])
            .await
            .unwrap();
        assert_eq!(caching.cache.lock().len(), 0);

        let refreshed = caching.get_by_primary_key("persons", 1).await.unwrap();
        assert_eq!(refreshed, vec![vec![2u8; 4]]);
    }
}
