use serde::{Deserialize, Serialize};

use crate::Digest;

/// Unique, opaque identifier of a snapshot. The human-readable `name` on
/// [`Snapshot`] is assignable, but this id is the actual identity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub String);

impl SnapshotId {
    pub fn generate() -> Self {
        Self(proxmox_uuid::Uuid::generate().to_string())
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SnapshotId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Pending,
    Completed,
    Failed,
}

impl std::fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            SnapshotStatus::Pending => "pending",
            SnapshotStatus::Completed => "completed",
            SnapshotStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Which chunking policy produced a snapshot's chunks. Recorded per
/// snapshot so a verifier or restorer never has to guess.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkerPolicy {
    FixedSize { chunk_size: usize },
    ContentDefined {
        min_size: usize,
        avg_size: usize,
        max_size: usize,
    },
}

impl ChunkerPolicy {
    pub fn fixed(chunk_size: usize) -> Self {
        ChunkerPolicy::FixedSize { chunk_size }
    }
}

impl Default for ChunkerPolicy {
    fn default() -> Self {
        ChunkerPolicy::FixedSize {
            chunk_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: SnapshotId,
    pub name: String,
    pub description: String,
    pub created_at: i64,
    pub status: SnapshotStatus,
    pub file_count: u64,
    pub total_size: u64,
    pub chunk_count: u64,
    pub chunker: ChunkerPolicy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Regular,
    Symlink,
}

/// A file belonging to exactly one snapshot; immutable once committed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: i64,
    pub snapshot_id: SnapshotId,
    pub path: String,
    pub size: u64,
    pub mtime_ns: i64,
    pub mode: String,
    pub kind: FileKind,
    pub symlink_target: Option<String>,
    pub content_digest: Digest,
    pub chunks: Vec<Digest>,
}

impl FileRecord {
    /// Invariant check from §3: sum of chunk sizes matches declared size
    /// for regular files; symlinks carry no chunks.
    pub fn chunk_sizes_consistent(&self, chunk_sizes: &[u64]) -> bool {
        match self.kind {
            FileKind::Symlink => self.chunks.is_empty() && self.size == 0,
            FileKind::Regular => chunk_sizes.iter().sum::<u64>() == self.size,
        }
    }
}

/// A chunk as seen from the metadata/query side (not the CAS byte owner).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub digest: Digest,
    pub size: u64,
    pub first_seen_at: i64,
    pub refcount: u64,
    pub last_refcount_change: i64,
}

/// How the scanner should treat symlinks it encounters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymlinkPolicy {
    /// Traverse through the symlink, treating the target's content as the
    /// entry's content.
    Follow,
    /// Record the link target string without traversing it.
    Record,
    /// Omit the symlink entirely.
    Skip,
}

impl Default for SymlinkPolicy {
    fn default() -> Self {
        SymlinkPolicy::Record
    }
}

/// A per-entry error collected during a scan; does not abort the walk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanError {
    pub path: String,
    pub kind: String,
}
