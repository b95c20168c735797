//! Collections directory, metadata persistence, version directories, and
//! the Open/Feed/Swap lifecycle (`§4.3`).

use std::collections::HashMap;
use std::path::PathBuf;

use frostbox_common::{CoreError, CoreResult};
use frostbox_segment::SegmentCaps;
use parking_lot::RwLock;
use tracing::{info, instrument, warn};

use crate::collection_store::{CollectionStore, FeedStats};
use crate::model::{CollectionInfo, CollectionMetadata, Item};

const METADATA_FILE: &str = "metadata.json";

struct CollectionEntry {
    metadata: CollectionMetadata,
    active: Option<CollectionStore>,
    feeding: bool,
}

/// The directory tree of collections, versions, and segments (`§6.1`).
///
/// `open()`/`create_collection`/`drop_collection`/the atomic swap at the end
/// of a feed are all serialized per collection name through a single
/// `RwLock` around the collection map, per the shared-resource policy in
/// `§5`.
pub struct DataStore {
    root: PathBuf,
    opened: std::sync::atomic::AtomicBool,
    collections: RwLock<HashMap<String, CollectionEntry>>,
}

impl DataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            opened: std::sync::atomic::AtomicBool::new(false),
            collections: RwLock::new(HashMap::new()),
        }
    }

    fn collection_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn caps_for(metadata: &CollectionMetadata) -> SegmentCaps {
        SegmentCaps {
            max_items_per_segment: metadata.max_items_per_segment,
            segment_data_capacity_bytes: metadata.segment_data_capacity_bytes,
            k: metadata.key_count(),
        }
    }

    /// Lists version directory names for a collection, sorted
    /// lexicographically (the teacher's pattern of scanning a directory for
    /// numbered files, adapted to version strings instead of segment
    /// indices).
    fn list_versions(&self, name: &str) -> CoreResult<Vec<String>> {
        let dir = self.collection_dir(name);
        let mut versions: Vec<String> = std::fs::read_dir(&dir)
            .map_err(|e| CoreError::io_at(&dir, e))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        versions.sort();
        Ok(versions)
    }

    fn read_metadata(&self, name: &str) -> CoreResult<CollectionMetadata> {
        let path = self.collection_dir(name).join(METADATA_FILE);
        let bytes = std::fs::read(&path).map_err(|e| CoreError::io_at(&path, e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::MalformedFrame { reason: e.to_string() })
    }

    /// Creates a collection: writes its metadata, no segments yet.
    #[instrument(skip(self, metadata), fields(name = %metadata.name))]
    pub fn create_collection(&self, metadata: CollectionMetadata) -> CoreResult<()> {
        let dir = self.collection_dir(&metadata.name);
        std::fs::create_dir(&dir).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                CoreError::AlreadyExists { name: metadata.name.clone() }
            } else {
                CoreError::io_at(&dir, e)
            }
        })?;
        let path = dir.join(METADATA_FILE);
        let bytes = serde_json::to_vec_pretty(&metadata)
            .expect("CollectionMetadata always serializes");
        std::fs::write(&path, bytes).map_err(|e| CoreError::io_at(&path, e))?;

        self.collections.write().insert(
            metadata.name.clone(),
            CollectionEntry { metadata, active: None, feeding: false },
        );
        info!("collection created");
        Ok(())
    }

    /// Removes a collection's directory recursively, closing its active
    /// store first if one is open.
    #[instrument(skip(self))]
    pub fn drop_collection(&self, name: &str) -> CoreResult<()> {
        {
            let mut collections = self.collections.write();
            if collections.remove(name).is_none() {
                let dir = self.collection_dir(name);
                if !dir.exists() {
                    return Err(CoreError::NotFound { what: format!("collection '{name}'") });
                }
            }
        }
        let dir = self.collection_dir(name);
        std::fs::remove_dir_all(&dir).map_err(|e| CoreError::io_at(&dir, e))?;
        info!(name, "collection dropped");
        Ok(())
    }

    /// Enumerates collections, reading metadata and deriving `last_version`
    /// from the directory listing.
    pub fn get_collections_information(&self) -> CoreResult<Vec<CollectionInfo>> {
        let names: Vec<String> = match std::fs::read_dir(&self.root) {
            Ok(read_dir) => read_dir
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .filter_map(|e| e.file_name().into_string().ok())
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(CoreError::io_at(&self.root, e)),
        };

        let collections = self.collections.read();
        let mut infos = Vec::with_capacity(names.len());
        for name in names {
            let metadata = self.read_metadata(&name)?;
            let versions = self.list_versions(&name)?;
            let last_version = versions.last().cloned();

            let (object_count, total_size_in_bytes) = collections
                .get(&name)
                .and_then(|entry| entry.active.as_ref())
                .map(|store| (store.object_count(), store.total_size_in_bytes()))
                .unwrap_or((0, 0));

            infos.push(CollectionInfo {
                metadata,
                last_version,
                object_count,
                total_size_in_bytes,
            });
        }
        Ok(infos)
    }

    /// Idempotent-guarded open: rebuilds every collection's active store
    /// from its greatest-named version directory, if one exists.
    #[instrument(skip(self))]
    pub fn open(&self) -> CoreResult<()> {
        if self.opened.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return Err(CoreError::AlreadyOpen);
        }

        let names: Vec<String> = match std::fs::read_dir(&self.root) {
            Ok(read_dir) => read_dir
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .filter_map(|e| e.file_name().into_string().ok())
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir_all(&self.root).map_err(|e| CoreError::io_at(&self.root, e))?;
                Vec::new()
            }
            Err(e) => return Err(CoreError::io_at(&self.root, e)),
        };

        let mut collections = self.collections.write();
        for name in names {
            let metadata = self.read_metadata(&name)?;
            let versions = self.list_versions(&name)?;
            let active = match versions.last() {
                Some(version) => {
                    let dir = self.collection_dir(&name).join(version);
                    Some(CollectionStore::open(&dir, Self::caps_for(&metadata))?)
                }
                None => None,
            };
            collections.insert(name, CollectionEntry { metadata, active, feeding: false });
        }
        Ok(())
    }

    fn require_open(&self) -> CoreResult<()> {
        if self.opened.load(std::sync::atomic::Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoreError::NotOpen)
        }
    }

    /// Delegates to the collection's active store; empty if the collection
    /// has no active version yet.
    pub fn get_by_primary_key(&self, name: &str, key: i64) -> CoreResult<Vec<Vec<u8>>> {
        self.require_open()?;
        let collections = self.collections.read();
        let entry = collections
            .get(name)
            .ok_or_else(|| CoreError::NotFound { what: format!("collection '{name}'") })?;
        Ok(entry
            .active
            .as_ref()
            .map(|store| store.get_by_primary(key))
            .unwrap_or_default())
    }

    fn version_is_newer(candidate: &str, current: &str) -> bool {
        candidate.to_lowercase() > current.to_lowercase()
    }

    /// Begins a new version feed: validates state, creates the version
    /// directory, and returns a [`FeedSession`] for streaming items in.
    #[instrument(skip(self))]
    pub fn begin_feed(&self, name: &str, version: &str) -> CoreResult<FeedSession<'_>> {
        self.require_open()?;

        let caps = {
            let mut collections = self.collections.write();
            let entry = collections
                .get_mut(name)
                .ok_or_else(|| CoreError::NotFound { what: format!("collection '{name}'") })?;
            if entry.feeding {
                return Err(CoreError::InvalidRequest {
                    reason: format!("collection '{name}' already has a feed in progress"),
                });
            }

            let versions = self.list_versions(name)?;
            if versions.iter().any(|v| v == version) {
                return Err(CoreError::VersionExists {
                    collection: name.to_string(),
                    version: version.to_string(),
                });
            }
            if let Some(current) = versions.last() {
                if !Self::version_is_newer(version, current) {
                    return Err(CoreError::VersionNotNewer {
                        version: version.to_string(),
                        current: current.clone(),
                    });
                }
            }

            entry.feeding = true;
            Self::caps_for(&entry.metadata)
        };

        let version_dir = self.collection_dir(name).join(version);
        if let Err(e) = std::fs::create_dir(&version_dir) {
            if let Some(entry) = self.collections.write().get_mut(name) {
                entry.feeding = false;
            }
            return Err(CoreError::io_at(&version_dir, e));
        }

        let staging = match CollectionStore::open(&version_dir, caps) {
            Ok(store) => store,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&version_dir);
                if let Some(entry) = self.collections.write().get_mut(name) {
                    entry.feeding = false;
                }
                return Err(e);
            }
        };

        Ok(FeedSession {
            store: self,
            collection: name.to_string(),
            version: version.to_string(),
            version_dir,
            staging: Some(staging),
            max_versions_to_keep: {
                let collections = self.collections.read();
                collections.get(name).map(|e| e.metadata.max_versions_to_keep).unwrap_or(1)
            },
            finished: false,
        })
    }

    /// One-shot convenience wrapper over `begin_feed`/`store`/`end_feed`,
    /// used by tests and by the simple (non-streaming) client path.
    pub fn feed(&self, name: &str, version: &str, items: impl IntoIterator<Item = Item>) -> CoreResult<FeedStats> {
        let mut session = self.begin_feed(name, version)?;
        for item in items {
            if let Err(e) = session.store(item) {
                session.abort();
                return Err(e);
            }
        }
        session.end_feed()
    }

    fn finish_feed(
        &self,
        name: &str,
        version: &str,
        version_dir: &std::path::Path,
        mut staging: CollectionStore,
        max_versions_to_keep: usize,
    ) -> CoreResult<FeedStats> {
        let stats = staging.end_of_feed();

        let mut collections = self.collections.write();
        if let Some(entry) = collections.get_mut(name) {
            entry.active = Some(staging);
            entry.feeding = false;
        }
        drop(collections);

        self.apply_retention(name, version, version_dir, max_versions_to_keep)?;
        info!(name, version, objects = stats.object_count, "feed completed, version swapped in");
        Ok(stats)
    }

    /// Deletes version directories older than the `max_versions_to_keep`
    /// most recent, never the one just swapped in as active (`§4.2`'s open
    /// question — retention is implemented; see DESIGN.md).
    fn apply_retention(
        &self,
        name: &str,
        active_version: &str,
        _active_version_dir: &std::path::Path,
        max_versions_to_keep: usize,
    ) -> CoreResult<()> {
        let mut versions = self.list_versions(name)?;
        versions.retain(|v| v != active_version);
        versions.sort();
        let keep_old = max_versions_to_keep.saturating_sub(1);
        if versions.len() > keep_old {
            let to_delete = versions.len() - keep_old;
            for version in &versions[..to_delete] {
                let dir = self.collection_dir(name).join(version);
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    warn!(%version, error = %e, "failed to prune old version");
                }
            }
        }
        Ok(())
    }

    fn abort_feed(&self, name: &str, version_dir: &std::path::Path) {
        let _ = std::fs::remove_dir_all(version_dir);
        if let Some(entry) = self.collections.write().get_mut(name) {
            entry.feeding = false;
        }
    }
}

/// A feed in progress: `Idle -> Feeding -> Swapping -> Idle` (`§4.3`).
///
/// Dropping a session that was never finished aborts it, deleting the
/// staging version directory — the required cleanup-on-error behavior from
/// `§4.3`, enforced even if a caller forgets to call [`FeedSession::abort`]
/// explicitly.
pub struct FeedSession<'a> {
    store: &'a DataStore,
    collection: String,
    version: String,
    version_dir: PathBuf,
    staging: Option<CollectionStore>,
    max_versions_to_keep: usize,
    finished: bool,
}

impl<'a> FeedSession<'a> {
    pub fn store(&mut self, item: Item) -> CoreResult<()> {
        self.staging
            .as_mut()
            .expect("feed session used after completion")
            .store(item)
    }

    /// Finalizes the staging store and atomically swaps it in as the
    /// collection's active version.
    pub fn end_feed(mut self) -> CoreResult<FeedStats> {
        let staging = self.staging.take().expect("feed session used after completion");
        self.finished = true;
        self.store.finish_feed(
            &self.collection,
            &self.version,
            &self.version_dir,
            staging,
            self.max_versions_to_keep,
        )
    }

    /// Aborts the feed, disposing the staging store and deleting its
    /// version directory.
    pub fn abort(mut self) {
        self.finished = true;
        self.staging = None;
        self.store.abort_feed(&self.collection, &self.version_dir);
    }
}

impl<'a> Drop for FeedSession<'a> {
    fn drop(&mut self) {
        if !self.finished {
            self.staging = None;
            self.store.abort_feed(&self.collection, &self.version_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IndexDescriptor;

    fn metadata(name: &str) -> CollectionMetadata {
        CollectionMetadata {
            name: name.to_string(),
            indexes: vec![
                IndexDescriptor { name: "id".to_string(), unique: true },
                IndexDescriptor { name: "client_id".to_string(), unique: false },
            ],
            max_items_per_segment: 1_000,
            segment_data_capacity_bytes: 1 << 20,
            max_versions_to_keep: 2,
        }
    }

    #[test]
    fn empty_store_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::new(dir.path());
        store.open().unwrap();
        assert!(store.get_collections_information().unwrap().is_empty());
    }

    #[test]
    fn create_feed_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::new(dir.path());
        store.open().unwrap();
        store.create_collection(metadata("persons")).unwrap();

        store
            .feed(
                "persons",
                "001",
                vec![
                    Item::new(vec![0u8; 100], vec![1, 200]),
                    Item::new(vec![0u8; 1000], vec![2, 300]),
                ],
            )
            .unwrap();

        assert_eq!(store.get_by_primary_key("persons", 2).unwrap()[0].len(), 1000);
        let info = store.get_collections_information().unwrap();
        assert_eq!(info[0].last_version.as_deref(), Some("001"));
    }

    #[test]
    fn version_must_strictly_increase() {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::new(dir.path());
        store.open().unwrap();
        store.create_collection(metadata("persons")).unwrap();
        store.feed("persons", "v1", vec![]).unwrap();
        store.feed("persons", "v2", vec![]).unwrap();

        assert!(matches!(
            store.begin_feed("persons", "v0"),
            Err(CoreError::VersionNotNewer { .. })
        ));
        assert!(matches!(
            store.begin_feed("persons", "v2"),
            Err(CoreError::VersionExists { .. })
        ));
    }

    #[test]
    fn create_and_drop_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::new(dir.path());
        store.open().unwrap();
        store.create_collection(metadata("persons")).unwrap();
        assert_eq!(store.get_collections_information().unwrap().len(), 1);

        store.drop_collection("persons").unwrap();
        assert!(store.get_collections_information().unwrap().is_empty());
        assert!(matches!(store.drop_collection("persons"), Err(CoreError::NotFound { .. })));
    }

    #[test]
    fn open_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::new(dir.path());
        store.open().unwrap();
        assert!(matches!(store.open(), Err(CoreError::AlreadyOpen)));
    }

    #[test]
    fn retention_prunes_old_versions_but_keeps_active() {
        let dir = tempfile::tempdir().unwrap();
        let mut meta = metadata("persons");
        meta.max_versions_to_keep = 1;
        let store = DataStore::new(dir.path());
        store.open().unwrap();
        store.create_collection(meta).unwrap();
        store.feed("persons", "v1", vec![]).unwrap();
        store.feed("persons", "v2", vec![]).unwrap();
        store.feed("persons", "v3", vec![]).unwrap();

        let versions = store.list_versions("persons").unwrap();
        assert_eq!(versions, vec!["v3".to_string()]);
    }
}
