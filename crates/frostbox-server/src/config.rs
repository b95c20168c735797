//! Defaults applied when a collection is declared over the wire (`§4.4`'s
//! `CreateCollection` carries no segment-sizing fields; those are a
//! deployment knob, not a per-request one).

/// Sizing and retention defaults for collections created via
/// [`crate::Message::CreateCollection`]. Collections created directly
/// through [`frostbox_store::DataStore::create_collection`] (e.g. by a
/// local CLI) may pick their own values instead.
///
/// Deserializable so a deployment can load it from a TOML settings file
/// (`serve --config`); any field omitted from the file falls back to
/// [`Default::default`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub max_items_per_segment: usize,
    pub segment_data_capacity_bytes: usize,
    pub max_versions_to_keep: usize,
    /// Upper bound accepted for a single feed batch frame (`§4.5`); batches
    /// bigger than this are rejected as `FrameTooLarge` rather than buffered
    /// wholesale.
    pub max_feed_batch_bytes: usize,
    /// Capacity of the bounded channel between the socket reader and the
    /// feeder task during a streamed feed (`§4.6`, `§5`).
    pub feed_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_items_per_segment: 1_000_000,
            segment_data_capacity_bytes: 1_000_000_000,
            max_versions_to_keep: 2,
            max_feed_batch_bytes: 8 * frostbox_proto::DEFAULT_BATCH_BYTES_CAP,
            feed_queue_capacity: 1_000_000,
        }
    }
}
