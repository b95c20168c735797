//! The data model shared between the collection store and the data store
//! (`§3`): items, index descriptors, and collection metadata.

use serde::{Deserialize, Serialize};

/// One document: an opaque byte payload plus its ordered index keys.
/// `keys[0]` is the primary key.
#[derive(Debug, Clone)]
pub struct Item {
    pub data: Vec<u8>,
    pub keys: Vec<i64>,
}

impl Item {
    pub fn new(data: Vec<u8>, keys: Vec<i64>) -> Self {
        Self { data, keys }
    }

    pub fn primary_key(&self) -> i64 {
        self.keys[0]
    }
}

/// `(name, unique)` — the first descriptor in a collection's index list is
/// the primary index and must be declared unique. Uniqueness is a hint, not
/// enforced (`§3`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub name: String,
    pub unique: bool,
}

/// Everything about a collection that is not tied to a particular version:
/// its schema and its storage/retention knobs. Persisted as `metadata.json`
/// (`§4.3`), excluding `last_version`, which is derived from the directory
/// listing at read time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionMetadata {
    pub name: String,
    pub indexes: Vec<IndexDescriptor>,
    pub max_items_per_segment: usize,
    pub segment_data_capacity_bytes: usize,
    pub max_versions_to_keep: usize,
}

impl CollectionMetadata {
    /// Number of index keys attached to each item in this collection.
    pub fn key_count(&self) -> usize {
        self.indexes.len()
    }
}

/// A `CollectionMetadata` together with the `last_version` derived from the
/// directory listing, and aggregate counts — the shape returned by
/// `get_collections_information()` and serialized for the wire
/// `CollectionsDescription` response (`SPEC_FULL §3`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub metadata: CollectionMetadata,
    pub last_version: Option<String>,
    pub object_count: usize,
    pub total_size_in_bytes: u64,
}
