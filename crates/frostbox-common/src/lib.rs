//! Shared error types for the frostbox workspace.
//!
//! Every crate in the workspace maps its failures onto [`CoreError`] so that
//! the server has a single place to translate a failure into a wire
//! `StatusResponse`. Subsystems that need additional, crate-local error
//! variants (e.g. a framing error that must close the connection rather than
//! reply with a status) wrap [`CoreError`] in their own `snafu` enum instead
//! of growing this one further.

use std::io;
use std::path::PathBuf;

use snafu::Snafu;

/// The error kinds distinguished by the core, as catalogued in the protocol
/// design (`§7 ERROR HANDLING DESIGN`).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CoreError {
    /// Lifecycle misuse: an operation that requires `open()` was called
    /// before it.
    #[snafu(display("data store has not been opened"))]
    NotOpen,

    /// Lifecycle misuse: `open()` was called twice.
    #[snafu(display("data store is already open"))]
    AlreadyOpen,

    /// `create_collection` was called for a name that already exists.
    #[snafu(display("collection '{name}' already exists"))]
    AlreadyExists { name: String },

    /// A collection, version, or key lookup target was not found.
    #[snafu(display("'{what}' was not found"))]
    NotFound { what: String },

    /// `begin_feed` was called with a version directory that already
    /// exists on disk.
    #[snafu(display("version '{version}' already exists for collection '{collection}'"))]
    VersionExists { collection: String, version: String },

    /// `begin_feed` was called with a version that does not strictly
    /// dominate the current `last_version`, case-insensitively.
    #[snafu(display(
        "version '{version}' is not newer than the current version '{current}'"
    ))]
    VersionNotNewer { version: String, current: String },

    /// An item's data was larger than a segment's usable data-area size
    /// (`segment_data_capacity_bytes` minus the reserved header table).
    #[snafu(display("item of {size} bytes exceeds segment data-area capacity of {capacity} bytes"))]
    ItemTooLarge { size: usize, capacity: usize },

    /// A request was missing a required field.
    #[snafu(display("invalid request: {reason}"))]
    InvalidRequest { reason: String },

    /// A frame's declared payload length exceeded the protocol ceiling.
    #[snafu(display("frame of {size} bytes exceeds the {limit}-byte ceiling"))]
    FrameTooLarge { size: usize, limit: usize },

    /// A frame could not be decoded; the connection must be closed.
    #[snafu(display("malformed frame: {reason}"))]
    MalformedFrame { reason: String },

    /// A filesystem or socket operation failed.
    #[snafu(display("I/O error at {path:?}: {source}"))]
    Io {
        path: Option<PathBuf>,
        source: io::Error,
    },

    /// No connected replica pool could serve a query.
    #[snafu(display("no connected replica is available"))]
    RemoteUnavailable,

    /// The server replied with `StatusResponse` with success=false, or with
    /// a message type the caller did not expect.
    #[snafu(display("remote error: {message}"))]
    Remote { message: String },
}

impl CoreError {
    /// Wraps a bare [`io::Error`] with no path context.
    pub fn io(source: io::Error) -> Self {
        CoreError::Io { path: None, source }
    }

    /// Wraps an [`io::Error`] with the path that triggered it.
    pub fn io_at(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CoreError::Io {
            path: Some(path.into()),
            source,
        }
    }

    /// True for errors that should close the underlying connection rather
    /// than be reported as a `StatusResponse` with success=false.
    pub fn is_protocol_fatal(&self) -> bool {
        matches!(self, CoreError::FrameTooLarge { .. } | CoreError::MalformedFrame { .. })
    }
}

impl From<io::Error> for CoreError {
    fn from(source: io::Error) -> Self {
        CoreError::io(source)
    }
}

/// Convenience alias used throughout the workspace.
pub type CoreResult<T> = Result<T, CoreError>;
