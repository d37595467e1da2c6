//! Garbage collection (§3, §4.4): reclaim chunks whose refcount has been
//! zero for at least `gc_grace` seconds. A two-phase scan the way the
//! teacher's own GC is two-phase (`mark_used_chunks` / `sweep_unused_chunks`
//! in `datastore.rs`), except the candidate set here comes from the
//! `chunks.refcount` index rather than an atime mark pass, because
//! refcounts are tracked explicitly in the metadata store instead of
//! inferred from file access time.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Error;

use crate::chunk_store::ChunkStore;
use crate::metadata::MetadataStore;

#[derive(Debug, Default, Clone, Copy)]
pub struct GcResult {
    pub removed: u64,
    pub reclaimed_bytes: u64,
}

/// A coarse "no-reap" lease (§4.9, §4 Concurrency): while any lease is
/// held, `gc()` skips its sweep phase entirely rather than trying to
/// reason about which chunks an in-flight verifier or transfer is
/// currently holding open.
#[derive(Default)]
pub struct NoReapLease {
    holders: AtomicU64,
}

pub struct NoReapGuard<'a> {
    lease: &'a NoReapLease,
}

impl Drop for NoReapGuard<'_> {
    fn drop(&mut self) {
        self.lease.holders.fetch_sub(1, Ordering::SeqCst);
    }
}

impl NoReapLease {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> NoReapGuard<'_> {
        self.holders.fetch_add(1, Ordering::SeqCst);
        NoReapGuard { lease: self }
    }

    pub fn is_held(&self) -> bool {
        self.holders.load(Ordering::SeqCst) > 0
    }
}

/// Reaps chunks with `refcount = 0` whose `last_refcount_change` is at
/// least `grace_seconds` in the past. Phase 1 reads the candidate set
/// from the metadata store; phase 2 re-checks each candidate inside a
/// transaction before unlinking, so a chunk that picked up a fresh
/// reference between the two phases survives.
pub fn gc(store: &ChunkStore, metadata: &mut MetadataStore, grace_seconds: i64, lease: &NoReapLease) -> Result<GcResult, Error> {
    let mut result = GcResult::default();

    if lease.is_held() {
        return Ok(result);
    }

    let now = proxmox_time::epoch_i64();
    let candidates = metadata.unreferenced_chunks()?;

    for candidate in candidates {
        if lease.is_held() {
            break;
        }
        if now - candidate.last_refcount_change < grace_seconds {
            continue;
        }

        // Re-check under the metadata store's own locking: a fresh
        // incref between phase 1 and here means `get_chunk_info` now
        // reports refcount > 0, so skip it.
        let current = metadata.get_chunk_info(&candidate.digest)?;
        let still_unreferenced = matches!(&current, Some(info) if info.refcount == 0);
        if !still_unreferenced {
            continue;
        }

        store.remove(&candidate.digest)?;
        metadata.forget_chunk(&candidate.digest)?;

        result.removed += 1;
        result.reclaimed_bytes += candidate.size;
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsi_api_types::{ChunkerPolicy, Digest, FileKind, FileRecord, SnapshotId};

    fn file_record(snapshot_id: &SnapshotId, digest: Digest) -> FileRecord {
        FileRecord {
            file_id: 0,
            snapshot_id: snapshot_id.clone(),
            path: "a.bin".to_string(),
            size: 4,
            mtime_ns: 0,
            mode: "100644".to_string(),
            kind: FileKind::Regular,
            symlink_target: None,
            content_digest: digest,
            chunks: vec![digest],
        }
    }

    #[test]
    fn test_gc_reaps_after_grace_elapses() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::create(dir.path()).unwrap();
        let mut metadata = MetadataStore::open_in_memory().unwrap();
        let lease = NoReapLease::new();

        let data = b"gone soon";
        let digest = crate::hasher::hash_bytes(data);
        store.put(&digest, data, false).unwrap();

        let snapshot_id = metadata.create_snapshot_pending("s", "", ChunkerPolicy::default()).unwrap();
        let edge = crate::metadata::ChunkEdge {
            order_index: 0,
            digest,
            size: data.len() as u64,
        };
        metadata.add_file(&snapshot_id, &file_record(&snapshot_id, digest), &[edge]).unwrap();
        metadata.delete_snapshot(&snapshot_id).unwrap();

        let result = gc(&store, &mut metadata, 3600, &lease).unwrap();
        assert_eq!(result.removed, 0, "grace period has not elapsed yet");
        assert!(store.has(&digest));

        let result = gc(&store, &mut metadata, 0, &lease).unwrap();
        assert_eq!(result.removed, 1);
        assert_eq!(result.reclaimed_bytes, data.len() as u64);
        assert!(!store.has(&digest));
    }

    #[test]
    fn test_gc_skips_entirely_while_lease_held() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::create(dir.path()).unwrap();
        let mut metadata = MetadataStore::open_in_memory().unwrap();
        let lease = NoReapLease::new();

        let data = b"held open";
        let digest = crate::hasher::hash_bytes(data);
        store.put(&digest, data, false).unwrap();
        let snapshot_id = metadata.create_snapshot_pending("s", "", ChunkerPolicy::default()).unwrap();
        let edge = crate::metadata::ChunkEdge {
            order_index: 0,
            digest,
            size: data.len() as u64,
        };
        metadata.add_file(&snapshot_id, &file_record(&snapshot_id, digest), &[edge]).unwrap();
        metadata.delete_snapshot(&snapshot_id).unwrap();

        let _guard = lease.acquire();
        let result = gc(&store, &mut metadata, 0, &lease).unwrap();
        assert_eq!(result.removed, 0);
        assert!(store.has(&digest));
    }
}
