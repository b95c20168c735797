//! Memory-mapped segment files (`§4.1`, `§6.1`, `§6.2`).
//!
//! A segment is a fixed-size file: a zero-filled header table reserved up
//! front, followed by a data area that items are appended into. The header
//! table is scanned sequentially on open to rebuild the in-memory index; the
//! data area is never scanned, only addressed by the offsets the headers
//! record.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use frostbox_common::{CoreError, CoreResult};
use memmap2::MmapMut;

use crate::header::{header_width, ObjectHeader};

/// Per-collection capacities that govern segment sizing and rollover.
#[derive(Debug, Clone, Copy)]
pub struct SegmentCaps {
    pub max_items_per_segment: usize,
    pub segment_data_capacity_bytes: usize,
    /// Number of index keys carried by every item in this collection.
    pub k: usize,
}

impl SegmentCaps {
    fn header_table_len(&self) -> usize {
        self.max_items_per_segment * header_width(self.k)
    }

    /// Usable data-area size: the total segment size minus the header
    /// table reserved up front. This, not `segment_data_capacity_bytes`
    /// itself, is the real ceiling on a single item's length (`§4.1`).
    pub fn data_area_len(&self) -> usize {
        self.segment_data_capacity_bytes
            .saturating_sub(self.header_table_len())
    }
}

/// Formats a segment's file name: zero-padded 4-digit decimal, `.bin` suffix
/// (`§6.1`). `file_index` is 1-based, matching the teacher's own 4-digit
/// rolling data-file naming scheme.
pub fn segment_file_name(file_index: i32) -> String {
    format!("{file_index:04}.bin")
}

/// One memory-mapped segment file, opened for both reading and appending.
///
/// The collection store is the only writer; readers only ever observe
/// segments through its in-memory index (`§5`), so a `Segment` itself does
/// no internal locking.
pub struct Segment {
    pub file_index: i32,
    path: PathBuf,
    mmap: MmapMut,
    caps: SegmentCaps,
    header_table_len: usize,
    item_count: usize,
    next_data_offset: usize,
}

impl Segment {
    /// Creates a brand-new, zero-filled segment file of
    /// `caps.segment_data_capacity_bytes` total bytes.
    pub fn create(dir: &Path, file_index: i32, caps: SegmentCaps) -> CoreResult<Self> {
        let path = dir.join(segment_file_name(file_index));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| CoreError::io_at(&path, e))?;
        file.set_len(caps.segment_data_capacity_bytes as u64)
            .map_err(|e| CoreError::io_at(&path, e))?;
        let mmap = unsafe { MmapMut::map_mut(&file).map_err(|e| CoreError::io_at(&path, e))? };
        let header_table_len = caps.header_table_len();
        Ok(Self {
            file_index,
            path,
            mmap,
            caps,
            header_table_len,
            item_count: 0,
            next_data_offset: header_table_len,
        })
    }

    /// Opens an existing segment file, scanning its header table to rebuild
    /// item count and the data-area write cursor. The returned headers are
    /// in on-disk order, which is also insertion order (`§4.2` tie-break
    /// rule).
    pub fn open(dir: &Path, file_index: i32, caps: SegmentCaps) -> CoreResult<(Self, Vec<ObjectHeader>)> {
        let path = dir.join(segment_file_name(file_index));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| CoreError::io_at(&path, e))?;
        let mmap = unsafe { MmapMut::map_mut(&file).map_err(|e| CoreError::io_at(&path, e))? };
        let header_table_len = caps.header_table_len();

        let width = header_width(caps.k);
        let mut headers = Vec::new();
        let mut next_data_offset = header_table_len;
        for slot in 0..caps.max_items_per_segment {
            let start = slot * width;
            let header = ObjectHeader::decode(&mmap[start..start + width], caps.k);
            if header.is_end_marker() {
                break;
            }
            let end = header.offset_in_file as usize + header.length as usize;
            next_data_offset = next_data_offset.max(end);
            headers.push(header);
        }
        let item_count = headers.len();

        Ok((
            Self {
                file_index,
                path,
                mmap,
                caps,
                header_table_len,
                item_count,
                next_data_offset,
            },
            headers,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn item_count(&self) -> usize {
        self.item_count
    }

    fn data_area_len(&self) -> usize {
        self.caps.data_area_len()
    }

    fn remaining_bytes(&self) -> usize {
        let used = self.next_data_offset - self.header_table_len;
        self.data_area_len().saturating_sub(used)
    }

    /// Whether an item of `data_len` bytes can be appended to this segment
    /// without exceeding either the item-count or byte-capacity cap.
    pub fn can_fit(&self, data_len: usize) -> bool {
        self.item_count < self.caps.max_items_per_segment && data_len <= self.remaining_bytes()
    }

    /// Appends `data` and its header, returning the written header.
    ///
    /// Callers must have already checked [`Segment::can_fit`] and that
    /// `data.len()` does not exceed [`SegmentCaps::data_area_len`] overall
    /// (the latter is an `ItemTooLarge` condition the collection store
    /// checks once, independent of any particular segment's free space).
    pub fn store(&mut self, data: &[u8], keys: &[i64]) -> ObjectHeader {
        let offset = self.next_data_offset;
        self.mmap[offset..offset + data.len()].copy_from_slice(data);

        let header = ObjectHeader::new(offset as i32, data.len() as i32, keys.to_vec());
        let width = header_width(self.caps.k);
        let header_start = self.item_count * width;
        header.encode_into(&mut self.mmap[header_start..header_start + width]);

        self.item_count += 1;
        self.next_data_offset += data.len();
        header
    }

    /// Writes an END-MARKER at the next unused header slot, closing this
    /// segment short of its item-count cap (`§3`, `§4.1`). A no-op if the
    /// header table is already full — in that case there is no slot left
    /// for a marker and readers correctly stop at `max_items_per_segment`.
    pub fn write_end_marker(&mut self) {
        if self.item_count >= self.caps.max_items_per_segment {
            return;
        }
        let marker = ObjectHeader::end_marker(self.caps.k);
        let width = header_width(self.caps.k);
        let header_start = self.item_count * width;
        marker.encode_into(&mut self.mmap[header_start..header_start + width]);
    }

    /// Reads the raw data bytes for a header previously returned by
    /// [`Segment::store`] or by the header-table scan in [`Segment::open`].
    pub fn read_data(&self, header: &ObjectHeader) -> &[u8] {
        let start = header.offset_in_file as usize;
        let end = start + header.length as usize;
        &self.mmap[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> SegmentCaps {
        SegmentCaps {
            max_items_per_segment: 4,
            segment_data_capacity_bytes: 4 * header_width(1) + 64,
            k: 1,
        }
    }

    #[test]
    fn store_and_reopen_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let caps = caps();
        {
            let mut seg = Segment::create(dir.path(), 1, caps).unwrap();
            let h1 = seg.store(b"hello", &[1]);
            assert_eq!(h1.primary_key(), 1);
            seg.store(b"world!", &[2]);
        }

        let (seg, headers) = Segment::open(dir.path(), 1, caps).unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(seg.read_data(&headers[0]), b"hello");
        assert_eq!(seg.read_data(&headers[1]), b"world!");
    }

    #[test]
    fn end_marker_stops_the_scan() {
        let dir = tempfile::tempdir().unwrap();
        let caps = caps();
        {
            let mut seg = Segment::create(dir.path(), 1, caps).unwrap();
            seg.store(b"a", &[1]);
            seg.store(b"b", &[2]);
            seg.write_end_marker();
        }
        let (_seg, headers) = Segment::open(dir.path(), 1, caps).unwrap();
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn can_fit_respects_item_and_byte_caps() {
        let dir = tempfile::tempdir().unwrap();
        let caps = SegmentCaps {
            max_items_per_segment: 1,
            segment_data_capacity_bytes: header_width(1) + 4,
            k: 1,
        };
        let mut seg = Segment::create(dir.path(), 1, caps).unwrap();
        assert!(seg.can_fit(4));
        seg.store(b"abcd", &[1]);
        assert!(!seg.can_fit(1));
    }
}
