//! One collection version: ordered segments plus the in-memory primary-key
//! index (`§4.2`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use frostbox_common::{CoreError, CoreResult};
use frostbox_segment::{ObjectHeader, Segment, SegmentCaps};
use tracing::{debug, instrument};

use crate::model::Item;

/// An in-memory index entry: everything needed to locate and re-read an
/// item without re-reading its primary key (`§3`).
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub other_keys: Vec<i64>,
    pub file_index: i32,
    pub offset_in_file: i32,
    pub length: i32,
}

impl IndexEntry {
    fn from_header(file_index: i32, header: &ObjectHeader) -> Self {
        Self {
            other_keys: header.index_keys[1..].to_vec(),
            file_index,
            offset_in_file: header.offset_in_file,
            length: header.length,
        }
    }
}

/// Aggregate counts computed once at `end_of_feed` (`§4.2`).
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedStats {
    pub object_count: usize,
    pub non_unique_keys: usize,
    pub total_size_in_bytes: u64,
}

/// One version of one collection: its ordered segments and the primary-key
/// index built on top of them.
pub struct CollectionStore {
    dir: PathBuf,
    caps: SegmentCaps,
    segments: Vec<Segment>,
    unique_index: HashMap<i64, IndexEntry>,
    dup_index: HashMap<i64, Vec<IndexEntry>>,
    total_size_in_bytes: u64,
    finalized: bool,
}

impl CollectionStore {
    /// Constructs a store from an existing directory of segments, or from an
    /// empty directory for a fresh feed. Existing segments have their
    /// header tables scanned and every entry inserted, reproducing the
    /// finalized in-memory index (`§4.2`).
    #[instrument(skip(caps), fields(dir = %dir.display()))]
    pub fn open(dir: &Path, caps: SegmentCaps) -> CoreResult<Self> {
        let mut file_indexes: Vec<i32> = std::fs::read_dir(dir)
            .map_err(|e| CoreError::io_at(dir, e))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                let stem = name.strip_suffix(".bin")?;
                stem.parse::<i32>().ok()
            })
            .collect();
        file_indexes.sort_unstable();

        let mut store = Self {
            dir: dir.to_path_buf(),
            caps,
            segments: Vec::new(),
            unique_index: HashMap::new(),
            dup_index: HashMap::new(),
            total_size_in_bytes: 0,
            finalized: !file_indexes.is_empty(),
        };

        for file_index in file_indexes {
            let (segment, headers) = Segment::open(dir, file_index, caps)?;
            for header in &headers {
                store.index_header(file_index, header);
            }
            store.segments.push(segment);
        }

        if store.finalized {
            store.normalize_index();
        }

        debug!(segments = store.segments.len(), "collection store opened");
        Ok(store)
    }

    fn index_header(&mut self, file_index: i32, header: &ObjectHeader) {
        let pk = header.primary_key();
        let entry = IndexEntry::from_header(file_index, header);
        self.total_size_in_bytes += header.length as u64;
        self.apply_index_update(pk, entry);
    }

    /// The incremental index-update rule from `§4.2`: first sighting of a
    /// key goes into `unique_index`; a second sighting moves the existing
    /// entry into `dup_index` and appends the new one; further sightings
    /// just append.
    fn apply_index_update(&mut self, primary_key: i64, entry: IndexEntry) {
        if let Some(existing) = self.unique_index.remove(&primary_key) {
            self.dup_index
                .entry(primary_key)
                .or_default()
                .extend([existing, entry]);
        } else if let Some(list) = self.dup_index.get_mut(&primary_key) {
            list.push(entry);
        } else {
            self.unique_index.insert(primary_key, entry);
        }
    }

    /// Restores the disjointness invariant: any key observed in both maps
    /// (possible right after a raw header scan, before incremental updates
    /// have had a chance to normalize it) is removed from `unique_index`.
    fn normalize_index(&mut self) {
        for key in self.dup_index.keys().copied().collect::<Vec<_>>() {
            self.unique_index.remove(&key);
        }
    }

    fn current_segment_index(&self) -> Option<usize> {
        if self.segments.is_empty() {
            None
        } else {
            Some(self.segments.len() - 1)
        }
    }

    /// Ensures there is a current segment able to hold `data_len` more
    /// bytes and one more item, rolling over as needed (`§3`, `§4.2`).
    fn ensure_room(&mut self, data_len: usize) -> CoreResult<()> {
        loop {
            match self.current_segment_index() {
                None => {
                    let next = self.segments.len() as i32 + 1;
                    self.segments.push(Segment::create(&self.dir, next, self.caps)?);
                }
                Some(idx) => {
                    let segment = &mut self.segments[idx];
                    if segment.can_fit(data_len) {
                        return Ok(());
                    }
                    // Byte capacity (not item count) forced the rollover:
                    // close this segment with an END-MARKER first (`§4.1`).
                    if segment.item_count() < self.caps.max_items_per_segment {
                        segment.write_end_marker();
                    }
                    let next = self.segments.len() as i32 + 1;
                    self.segments.push(Segment::create(&self.dir, next, self.caps)?);
                }
            }
        }
    }

    /// Appends an item to the current segment, creating or rolling over
    /// segments as needed, and updates the in-memory index incrementally.
    #[instrument(skip(self, item), fields(data_len = item.data.len()))]
    pub fn store(&mut self, item: Item) -> CoreResult<()> {
        if item.data.len() > self.caps.data_area_len() {
            return Err(CoreError::ItemTooLarge {
                size: item.data.len(),
                capacity: self.caps.data_area_len(),
            });
        }

        self.ensure_room(item.data.len())?;
        let idx = self.current_segment_index().expect("ensure_room created a segment");
        let file_index = self.segments[idx].file_index;
        let header = self.segments[idx].store(&item.data, &item.keys);

        self.total_size_in_bytes += header.length as u64;
        let pk = header.primary_key();
        let entry = IndexEntry::from_header(file_index, &header);
        self.apply_index_update(pk, entry);

        Ok(())
    }

    /// Finalizes the index, restoring the disjointness invariant, and
    /// returns the aggregate stats for this version (`§4.2`).
    pub fn end_of_feed(&mut self) -> FeedStats {
        self.normalize_index();
        self.finalized = true;
        FeedStats {
            object_count: self.unique_index.len()
                + self.dup_index.values().map(Vec::len).sum::<usize>(),
            non_unique_keys: self.dup_index.len(),
            total_size_in_bytes: self.total_size_in_bytes,
        }
    }

    fn read_entry(&self, entry: &IndexEntry) -> Vec<u8> {
        let segment = self
            .segments
            .iter()
            .find(|s| s.file_index == entry.file_index)
            .expect("index entry must reference a live segment");
        let header = ObjectHeader {
            offset_in_file: entry.offset_in_file,
            length: entry.length,
            index_keys: Vec::new(),
        };
        segment.read_data(&header).to_vec()
    }

    /// Returns every item whose primary key equals `key`, in insertion order
    /// (`§4.2`): a single hit from `unique_index`, all matches from
    /// `dup_index`, or nothing.
    pub fn get_by_primary(&self, key: i64) -> Vec<Vec<u8>> {
        if let Some(entry) = self.unique_index.get(&key) {
            return vec![self.read_entry(entry)];
        }
        if let Some(entries) = self.dup_index.get(&key) {
            return entries.iter().map(|e| self.read_entry(e)).collect();
        }
        Vec::new()
    }

    pub fn object_count(&self) -> usize {
        self.unique_index.len() + self.dup_index.values().map(Vec::len).sum::<usize>()
    }

    pub fn total_size_in_bytes(&self) -> u64 {
        self.total_size_in_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> SegmentCaps {
        SegmentCaps {
            max_items_per_segment: 2,
            segment_data_capacity_bytes: 4096,
            k: 1,
        }
    }

    #[test]
    fn store_and_lookup_single_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CollectionStore::open(dir.path(), caps()).unwrap();
        store.store(Item::new(b"alpha".to_vec(), vec![1])).unwrap();
        store.store(Item::new(b"beta".to_vec(), vec![2])).unwrap();
        store.end_of_feed();

        assert_eq!(store.get_by_primary(1), vec![b"alpha".to_vec()]);
        assert_eq!(store.get_by_primary(2), vec![b"beta".to_vec()]);
        assert!(store.get_by_primary(3).is_empty());
    }

    #[test]
    fn duplicate_primary_keys_all_resolve_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CollectionStore::open(dir.path(), caps()).unwrap();
        store.store(Item::new(b"a1".to_vec(), vec![7])).unwrap();
        store.store(Item::new(b"a2".to_vec(), vec![7])).unwrap();
        store.store(Item::new(b"a3".to_vec(), vec![7])).unwrap();
        let stats = store.end_of_feed();

        assert_eq!(stats.non_unique_keys, 1);
        assert_eq!(
            store.get_by_primary(7),
            vec![b"a1".to_vec(), b"a2".to_vec(), b"a3".to_vec()]
        );
    }

    #[test]
    fn item_too_large_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CollectionStore::open(dir.path(), caps()).unwrap();
        let big = vec![0u8; 5000];
        let err = store.store(Item::new(big, vec![1])).unwrap_err();
        assert!(matches!(err, CoreError::ItemTooLarge { .. }));
    }

    #[test]
    fn item_larger_than_the_data_area_but_not_the_full_segment_is_rejected() {
        // header_width(1) = 16, header table = 2 * 16 = 32 bytes, data area
        // = 4096 - 32 = 4064 bytes. An item of 4080 bytes is smaller than
        // `segment_data_capacity_bytes` but bigger than any segment's usable
        // data area, and must be rejected rather than sent into an
        // unbounded rollover loop (each iteration creating an empty,
        // END-MARKER-only segment that still can't fit it).
        let dir = tempfile::tempdir().unwrap();
        let mut store = CollectionStore::open(dir.path(), caps()).unwrap();
        let item = vec![0u8; 4080];
        let err = store.store(Item::new(item, vec![1])).unwrap_err();
        assert!(matches!(err, CoreError::ItemTooLarge { .. }));
    }

    #[test]
    fn rollover_creates_additional_segments_and_reopens_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let caps = SegmentCaps {
            max_items_per_segment: 1,
            segment_data_capacity_bytes: 64,
            k: 1,
        };
        {
            let mut store = CollectionStore::open(dir.path(), caps).unwrap();
            for i in 0..5 {
                store.store(Item::new(vec![i as u8; 4], vec![i])).unwrap();
            }
            store.end_of_feed();
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 5);

        let store = CollectionStore::open(dir.path(), caps).unwrap();
        for i in 0..5 {
            assert_eq!(store.get_by_primary(i), vec![vec![i as u8; 4]]);
        }
    }
}
