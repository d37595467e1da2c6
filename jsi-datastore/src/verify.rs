//! C9: integrity verification, chunk-level and snapshot-level (§4.9).
//!
//! Read-only by design: safe to run alongside ingestion since it never
//! mutates the chunk store or metadata store. A chunk that disappears
//! mid-verify because GC raced past the `NoReapLease` is reported as a
//! benign concurrent-GC event, not corruption — callers are expected to
//! hold a [`crate::gc::NoReapLease`] guard for the duration of a run if
//! they want that race closed instead.

use anyhow::Error;

use jsi_api_types::{Digest, FileRecord, SnapshotId};

use crate::chunk_store::ChunkStore;
use crate::hasher::StreamingHasher;
use crate::metadata::MetadataStore;

#[derive(Debug, Default)]
pub struct ChunkVerifyReport {
    pub verified: u64,
    pub corrupted: Vec<Digest>,
    pub reaped_concurrently: Vec<Digest>,
}

/// Iterates every digest physically present in the store, re-reads it,
/// and recomputes its digest.
pub fn verify_all_chunks(store: &ChunkStore) -> Result<ChunkVerifyReport, Error> {
    let mut report = ChunkVerifyReport::default();

    for digest in store.iter_digests()? {
        match store.get(&digest) {
            Ok(chunk) => {
                let recomputed = crate::hasher::hash_bytes(&chunk.data);
                if recomputed == digest {
                    report.verified += 1;
                } else {
                    report.corrupted.push(digest);
                }
            }
            Err(_) if !store.has(&digest) => {
                report.reaped_concurrently.push(digest);
            }
            Err(_) => {
                report.corrupted.push(digest);
            }
        }
    }

    Ok(report)
}

#[derive(Debug)]
pub struct FileVerifyResult {
    pub path: String,
    pub ok: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Default)]
pub struct SnapshotVerifyReport {
    pub files: Vec<FileVerifyResult>,
}

impl SnapshotVerifyReport {
    pub fn all_ok(&self) -> bool {
        self.files.iter().all(|f| f.ok)
    }
}

/// For each file in the snapshot, streams its chunks in order
/// (verifying each against the chunk store), accumulates a digest of
/// the concatenation, and compares it to the recorded `content_digest`.
pub fn verify_snapshot(store: &ChunkStore, metadata: &MetadataStore, snapshot_id: &SnapshotId) -> Result<SnapshotVerifyReport, Error> {
    let files = metadata.list_files(snapshot_id)?;
    let mut report = SnapshotVerifyReport::default();

    for file in &files {
        report.files.push(verify_file(store, file));
    }

    Ok(report)
}

fn verify_file(store: &ChunkStore, file: &FileRecord) -> FileVerifyResult {
    let mut hasher = StreamingHasher::new();

    for digest in &file.chunks {
        match store.get(digest) {
            Ok(chunk) => {
                let recomputed = crate::hasher::hash_bytes(&chunk.data);
                if recomputed != *digest {
                    return FileVerifyResult {
                        path: file.path.clone(),
                        ok: false,
                        reason: Some(format!("chunk {digest} failed content verification")),
                    };
                }
                hasher.update(&chunk.data);
            }
            Err(err) if !store.has(digest) => {
                return FileVerifyResult {
                    path: file.path.clone(),
                    ok: false,
                    reason: Some(format!("chunk {digest} missing (likely reaped by concurrent gc): {err}")),
                };
            }
            Err(err) => {
                return FileVerifyResult {
                    path: file.path.clone(),
                    ok: false,
                    reason: Some(err.to_string()),
                };
            }
        }
    }

    let content_digest = hasher.finalize();
    if content_digest != file.content_digest {
        return FileVerifyResult {
            path: file.path.clone(),
            ok: false,
            reason: Some(format!(
                "recomputed content digest {content_digest} does not match recorded {}",
                file.content_digest
            )),
        };
    }

    FileVerifyResult {
        path: file.path.clone(),
        ok: true,
        reason: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsi_api_types::{ChunkerPolicy, FileKind};

    #[test]
    fn test_verify_all_chunks_on_clean_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::create(dir.path()).unwrap();
        let data = b"intact";
        let digest = crate::hasher::hash_bytes(data);
        store.put(&digest, data, false).unwrap();

        let report = verify_all_chunks(&store).unwrap();
        assert_eq!(report.verified, 1);
        assert!(report.corrupted.is_empty());
    }

    #[test]
    fn test_verify_snapshot_detects_content_digest_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::create(dir.path()).unwrap();
        let mut metadata = MetadataStore::open_in_memory().unwrap();

        let data = b"abcd";
        let digest = crate::hasher::hash_bytes(data);
        store.put(&digest, data, false).unwrap();

        let snapshot_id = metadata.create_snapshot_pending("s", "", ChunkerPolicy::default()).unwrap();
        let wrong_digest = Digest::new([0xffu8; 32]);
        let record = FileRecord {
            file_id: 0,
            snapshot_id: snapshot_id.clone(),
            path: "f.bin".to_string(),
            size: 4,
            mtime_ns: 0,
            mode: "100644".to_string(),
            kind: FileKind::Regular,
            symlink_target: None,
            content_digest: wrong_digest,
            chunks: vec![digest],
        };
        let edge = crate::metadata::ChunkEdge {
            order_index: 0,
            digest,
            size: 4,
        };
        metadata.add_file(&snapshot_id, &record, &[edge]).unwrap();
        metadata.complete_snapshot(&snapshot_id, 1, 4, 1).unwrap();

        let report = verify_snapshot(&store, &metadata, &snapshot_id).unwrap();
        assert!(!report.all_ok());
        assert!(report.files[0].reason.as_ref().unwrap().contains("content digest"));
    }
}
