//! The fixed-layout per-document header record (`§4.1`, `§6.2`).
//!
//! Encoding is little-endian throughout:
//! `offset_in_file (i32) ‖ length (i32) ‖ key_0 (i64) … key_{k-1} (i64)`.
//! A `length == 0` header is the END-MARKER: it terminates the header table
//! scan for its segment and carries no keys worth reading.

/// Width, in bytes, of a header for a collection with `k` index keys per
/// item. This is `4 + 4 + 8·k`, per `§4.1` — not the `8·(1+k)` layout used by
/// an older, unsupported generation of the format (`§9`).
pub const fn header_width(k: usize) -> usize {
    8 + 8 * k
}

/// A decoded [`ObjectHeader`].
///
/// `file_index` is not part of the on-disk record; callers fill it in after
/// decoding for in-memory bookkeeping ([`crate::IndexEntry`] and friends). It
/// must never be persisted back into a header's bytes (`§9`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHeader {
    pub offset_in_file: i32,
    pub length: i32,
    pub index_keys: Vec<i64>,
}

impl ObjectHeader {
    /// Builds a header for a freshly-written item.
    pub fn new(offset_in_file: i32, length: i32, index_keys: Vec<i64>) -> Self {
        Self {
            offset_in_file,
            length,
            index_keys,
        }
    }

    /// Builds the END-MARKER header for a collection with `k` keys.
    pub fn end_marker(k: usize) -> Self {
        Self {
            offset_in_file: 0,
            length: 0,
            index_keys: vec![0; k],
        }
    }

    /// An END-MARKER signals "no further documents in this segment".
    pub fn is_end_marker(&self) -> bool {
        self.length == 0
    }

    /// Primary key for this item, i.e. `index_keys[0]`.
    pub fn primary_key(&self) -> i64 {
        self.index_keys[0]
    }

    /// Encodes this header into `out`, which must be exactly
    /// `header_width(self.index_keys.len())` bytes long.
    pub fn encode_into(&self, out: &mut [u8]) {
        let k = self.index_keys.len();
        debug_assert_eq!(out.len(), header_width(k));
        out[0..4].copy_from_slice(&self.offset_in_file.to_le_bytes());
        out[4..8].copy_from_slice(&self.length.to_le_bytes());
        for (i, key) in self.index_keys.iter().enumerate() {
            let start = 8 + i * 8;
            out[start..start + 8].copy_from_slice(&key.to_le_bytes());
        }
    }

    /// Decodes a header with `k` keys from the first `header_width(k)` bytes
    /// of `buf`.
    pub fn decode(buf: &[u8], k: usize) -> Self {
        let width = header_width(k);
        debug_assert!(buf.len() >= width);
        let offset_in_file = i32::from_le_bytes(buf[0..4].try_into().unwrap());
        let length = i32::from_le_bytes(buf[4..8].try_into().unwrap());
        let mut index_keys = Vec::with_capacity(k);
        for i in 0..k {
            let start = 8 + i * 8;
            index_keys.push(i64::from_le_bytes(buf[start..start + 8].try_into().unwrap()));
        }
        Self {
            offset_in_file,
            length,
            index_keys,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn header_width_matches_formula() {
        assert_eq!(header_width(0), 8);
        assert_eq!(header_width(1), 16);
        assert_eq!(header_width(3), 32);
    }

    proptest! {
        #[test]
        fn round_trip(offset in any::<i32>(), length in 1i32..i32::MAX, keys in proptest::collection::vec(any::<i64>(), 0..6)) {
            let k = keys.len();
            let header = ObjectHeader::new(offset, length, keys);
            let mut buf = vec![0u8; header_width(k)];
            header.encode_into(&mut buf);
            let decoded = ObjectHeader::decode(&buf, k);
            prop_assert_eq!(decoded, header);
        }
    }

    #[test]
    fn end_marker_has_zero_length() {
        let marker = ObjectHeader::end_marker(2);
        assert!(marker.is_end_marker());
        let mut buf = vec![0u8; header_width(2)];
        marker.encode_into(&mut buf);
        let decoded = ObjectHeader::decode(&buf, 2);
        assert!(decoded.is_end_marker());
    }
}
