//! Shared data model for the justsyncit core.
//!
//! This crate has no I/O of its own; it only defines the entities
//! described in the data model (chunks, files, snapshots, edges) plus
//! the error taxonomy surfaced at the public API boundary. Every other
//! crate in the workspace depends on this one.

mod digest;
mod error;
mod snapshot;

pub use digest::Digest;
pub use error::JsiError;
pub use snapshot::{
    ChunkInfo, ChunkerPolicy, FileKind, FileRecord, ScanError, Snapshot, SnapshotId,
    SnapshotStatus, SymlinkPolicy,
};
