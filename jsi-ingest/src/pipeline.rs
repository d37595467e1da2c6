//! C7: the ingestion pipeline (§4.7).
//!
//! Worker pools are built the same way the teacher's
//! `src/tools/parallel_handler.rs` builds its thread pool — a bounded
//! `crossbeam_channel` per stage boundary, one thread per worker slot,
//! shared abort state guarded by a `Mutex` — generalized here to a
//! four-stage pipeline (walk → read/chunk/hash → dedup/persist → commit)
//! instead of one flat fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use anyhow::{format_err, Error};
use crossbeam_channel::bounded;

use jsi_api_types::{Digest, FileKind, FileRecord};
use jsi_datastore::chunker::{ChunkBoundary, Chunker};
use jsi_datastore::{hash_bytes, ChunkStore, MetadataStore, StreamingHasher};
use jsi_api_types::{ChunkerPolicy, SnapshotId};

use crate::scanner::ScanEntry;

/// Process-wide per-digest write lock (§4.7 "per-digest guard"): at most
/// one worker physically writes a given digest at a time; others wait
/// for it, then re-check `has` instead of writing redundantly.
#[derive(Default)]
pub struct InflightLatches {
    table: Mutex<HashMap<Digest, Arc<(Mutex<bool>, Condvar)>>>,
}

impl InflightLatches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `write` at most once per digest across all concurrent
    /// callers; callers that lose the race wait for the winner and then
    /// return without writing.
    fn with_latch(&self, digest: &Digest, write: impl FnOnce() -> Result<(), Error>) -> Result<(), Error> {
        let latch = {
            let mut table = self.table.lock().unwrap();
            Arc::clone(table.entry(*digest).or_insert_with(|| Arc::new((Mutex::new(false), Condvar::new()))))
        };

        let (done_mutex, condvar) = &*latch;
        let mut done = done_mutex.lock().unwrap();

        if !*done {
            // First arrival for this digest (or we raced and lost the
            // table insert but not the write): do the write ourselves.
            drop(done);
            let result = write();
            let mut done = done_mutex.lock().unwrap();
            *done = true;
            condvar.notify_all();
            drop(done);
            self.table.lock().unwrap().remove(digest);
            return result;
        }

        while !*done {
            done = condvar.wait(done).unwrap();
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct IngestConfig {
    pub q_walk: usize,
    pub q_chunks: usize,
    pub w_read: usize,
    pub w_store: usize,
    pub strict: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            q_walk: 64,
            q_chunks: 64,
            w_read: 4,
            w_store: 4,
            strict: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct IngestSummary {
    pub snapshot_id: Option<SnapshotId>,
    pub file_count: u64,
    pub total_size: u64,
    pub chunk_count: u64,
    pub failed_files: HashMap<String, String>,
    pub cancelled: bool,
}

struct ChunkedFile {
    entry: ScanEntry,
    content_digest: Digest,
    chunks: Vec<(Digest, Vec<u8>)>,
}

fn chunk_and_hash(root: &std::path::Path, entry: &ScanEntry, policy: ChunkerPolicy) -> Result<(Digest, Vec<(Digest, Vec<u8>)>), Error> {
    let full_path = root.join(entry.path.trim_start_matches('/'));
    let data = std::fs::read(&full_path).map_err(|err| format_err!("reading {:?} failed - {err}", full_path))?;

    let mut chunker = Chunker::from_policy(policy);
    let mut chunks = Vec::new();
    let mut hasher = StreamingHasher::new();
    let mut pos = 0;

    while pos < data.len() {
        let k = chunker.scan(&data[pos..]);
        if k == 0 {
            break;
        }
        let piece = &data[pos..pos + k];
        hasher.update(piece);
        chunks.push((hash_bytes(piece), piece.to_vec()));
        pos += k;
    }
    if pos < data.len() {
        let piece = &data[pos..];
        hasher.update(piece);
        chunks.push((hash_bytes(piece), piece.to_vec()));
    }

    Ok((hasher.finalize(), chunks))
}

/// Runs the full ingestion pipeline for `root` into a new snapshot named
/// `name`. Cancellation is cooperative via `cancel`: set it from another
/// thread to stop starting new files; files already in flight still
/// either commit or abort their own transaction.
#[allow(clippy::too_many_arguments)]
pub fn ingest(
    root: &std::path::Path,
    entries: Vec<ScanEntry>,
    store: Arc<ChunkStore>,
    metadata: Arc<Mutex<MetadataStore>>,
    inflight: Arc<InflightLatches>,
    policy: ChunkerPolicy,
    config: &IngestConfig,
    name: &str,
    description: &str,
    cancel: Arc<AtomicBool>,
) -> Result<IngestSummary, Error> {
    let snapshot_id = metadata.lock().unwrap().create_snapshot_pending(name, description, policy)?;

    let (entry_tx, entry_rx) = bounded::<ScanEntry>(config.q_walk);
    let (chunked_tx, chunked_rx) = bounded::<ChunkedFile>(config.q_chunks);

    let failed_files: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));
    let committed: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new())); // (size, chunk_count) per file

    let root_owned = root.to_path_buf();
    let feeder_cancel = Arc::clone(&cancel);
    let feeder = std::thread::spawn(move || {
        for entry in entries {
            if feeder_cancel.load(Ordering::SeqCst) {
                break;
            }
            if entry_tx.send(entry).is_err() {
                break;
            }
        }
    });

    let mut read_workers = Vec::new();
    for _ in 0..config.w_read {
        let entry_rx = entry_rx.clone();
        let chunked_tx = chunked_tx.clone();
        let root = root_owned.clone();
        let failed_files = Arc::clone(&failed_files);
        let cancel = Arc::clone(&cancel);
        read_workers.push(std::thread::spawn(move || {
            while let Ok(entry) = entry_rx.recv() {
                if cancel.load(Ordering::SeqCst) {
                    break;
                }
                match entry.kind {
                    FileKind::Symlink => {
                        // Symlinks carry no chunks; content_digest is unused for
                        // them (see FileRecord::chunk_sizes_consistent).
                        let _ = chunked_tx.send(ChunkedFile {
                            entry,
                            content_digest: Digest::new([0u8; 32]),
                            chunks: Vec::new(),
                        });
                    }
                    FileKind::Regular => match chunk_and_hash(&root, &entry, policy) {
                        Ok((content_digest, chunks)) => {
                            if chunked_tx
                                .send(ChunkedFile {
                                    entry,
                                    content_digest,
                                    chunks,
                                })
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(err) => {
                            failed_files.lock().unwrap().insert(entry.path.clone(), err.to_string());
                        }
                    },
                }
            }
        }));
    }
    drop(chunked_tx);
    drop(entry_rx);

    let mut store_workers = Vec::new();
    for _ in 0..config.w_store {
        let chunked_rx = chunked_rx.clone();
        let store = Arc::clone(&store);
        let metadata = Arc::clone(&metadata);
        let inflight = Arc::clone(&inflight);
        let failed_files = Arc::clone(&failed_files);
        let committed = Arc::clone(&committed);
        let snapshot_id = snapshot_id.clone();
        let cancel = Arc::clone(&cancel);

        store_workers.push(std::thread::spawn(move || {
            while let Ok(chunked) = chunked_rx.recv() {
                if cancel.load(Ordering::SeqCst) {
                    break;
                }

                let path = chunked.entry.path.clone();
                let result = commit_file(&store, &metadata, &inflight, &snapshot_id, &chunked);
                match result {
                    Ok((size, chunk_count)) => {
                        committed.lock().unwrap().push((size, chunk_count));
                    }
                    Err(err) => {
                        failed_files.lock().unwrap().insert(path, err.to_string());
                    }
                }
            }
        }));
    }

    feeder.join().map_err(|_| format_err!("walk feeder thread panicked"))?;
    for handle in read_workers {
        handle.join().map_err(|_| format_err!("read worker thread panicked"))?;
    }
    for handle in store_workers {
        handle.join().map_err(|_| format_err!("store worker thread panicked"))?;
    }

    let failed_files = Arc::try_unwrap(failed_files).unwrap().into_inner().unwrap();
    let committed = Arc::try_unwrap(committed).unwrap().into_inner().unwrap();

    let file_count = committed.len() as u64;
    let total_size: u64 = committed.iter().map(|(size, _)| size).sum();
    let chunk_count: u64 = committed.iter().map(|(_, count)| count).sum();

    let mut metadata = metadata.lock().unwrap();
    if cancel.load(Ordering::SeqCst) {
        metadata.fail_snapshot(&snapshot_id)?;
        return Ok(IngestSummary {
            snapshot_id: Some(snapshot_id),
            file_count,
            total_size,
            chunk_count,
            failed_files,
            cancelled: true,
        });
    }

    if config.strict && !failed_files.is_empty() {
        metadata.fail_snapshot(&snapshot_id)?;
        return Ok(IngestSummary {
            snapshot_id: Some(snapshot_id),
            file_count,
            total_size,
            chunk_count,
            failed_files,
            cancelled: false,
        });
    }

    metadata.complete_snapshot(&snapshot_id, file_count, total_size, chunk_count)?;

    Ok(IngestSummary {
        snapshot_id: Some(snapshot_id),
        file_count,
        total_size,
        chunk_count,
        failed_files,
        cancelled: false,
    })
}

fn commit_file(
    store: &ChunkStore,
    metadata: &Mutex<MetadataStore>,
    inflight: &InflightLatches,
    snapshot_id: &SnapshotId,
    chunked: &ChunkedFile,
) -> Result<(u64, u64), Error> {
    let mut edges = Vec::with_capacity(chunked.chunks.len());

    for (order_index, (digest, bytes)) in chunked.chunks.iter().enumerate() {
        if !store.has(digest) {
            inflight.with_latch(digest, || {
                if !store.has(digest) {
                    store.put(digest, bytes, true)?;
                }
                Ok(())
            })?;
        }
        edges.push(jsi_datastore::ChunkEdge {
            order_index: order_index as i64,
            digest: *digest,
            size: bytes.len() as u64,
        });
    }

    let record = FileRecord {
        file_id: 0,
        snapshot_id: snapshot_id.clone(),
        path: chunked.entry.path.clone(),
        size: chunked.entry.size,
        mtime_ns: chunked.entry.mtime_ns,
        mode: chunked.entry.mode.clone(),
        kind: chunked.entry.kind,
        symlink_target: chunked.entry.symlink_target.clone(),
        content_digest: chunked.content_digest,
        chunks: edges.iter().map(|e| e.digest).collect(),
    };

    metadata.lock().unwrap().add_file(snapshot_id, &record, &edges)?;

    Ok((chunked.entry.size, edges.len() as u64))
}
