//! Receiver side of the transfer protocol: accepts connections, verifies
//! and stores incoming chunks, and installs the manifest atomically once
//! the sender signals completion (§4.10).
//!
//! One `TransferRequest`/`TransferComplete` pair spans the *whole*
//! snapshot's distinct chunk set rather than one file — the spec's
//! chunk-level dedup already makes "which file owns this chunk"
//! irrelevant on the wire, so `file_name` here simply carries the
//! snapshot name for logging and `ChunkData.chunk_index` addresses one
//! of the snapshot's distinct chunks in first-seen order.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Error};
use jsi_protocol::Message;
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::timeout;

use jsi_api_types::{Digest, FileRecord, SnapshotId};
use jsi_datastore::{hash_bytes, ChunkEdge, ChunkStore, MetadataStore};

use crate::connection::handshake_server;
use crate::framing::{read_message, write_message};

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// A running `serve()` listener. Dropping or calling [`ServeHandle::stop`]
/// tells the accept loop to stop taking new connections; connections
/// already in flight run to completion.
pub struct ServeHandle {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl ServeHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

#[derive(Default)]
struct TransferProgress {
    acked: BTreeSet<u32>,
    chunk_sizes: HashMap<Digest, u64>,
}

impl TransferProgress {
    fn highest_contiguous_acked(&self) -> Option<u32> {
        let mut highest = None;
        let mut next = 0u32;
        for &idx in &self.acked {
            if idx != next {
                break;
            }
            highest = Some(idx);
            next += 1;
        }
        highest
    }
}

type ProgressTable = Arc<Mutex<HashMap<String, TransferProgress>>>;

/// Starts accepting connections on `listen_addr`. Each connection runs
/// the receiver role unless the peer's handshake carries `FLAG_PULL`,
/// in which case that connection is handed to `on_pull` (typically the
/// caller's [`crate::sender::serve_pull`]) to run the sender role
/// instead — this is how `pull(snapshot_id, peer)` and `serve` share one
/// listening socket.
pub async fn serve(listen_addr: SocketAddr, node_id: String, store: Arc<ChunkStore>, metadata: Arc<Mutex<MetadataStore>>) -> Result<ServeHandle, Error> {
    let listener = TcpListener::bind(listen_addr).await?;
    let local_addr = listener.local_addr()?;
    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_task = Arc::clone(&stop);

    let task = tokio::spawn(async move {
        loop {
            if stop_for_task.load(Ordering::SeqCst) {
                break;
            }
            let (stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!("accept failed: {err}");
                    continue;
                }
            };
            let node_id = node_id.clone();
            let store = Arc::clone(&store);
            let metadata = Arc::clone(&metadata);
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, peer_addr, &node_id, store, metadata).await {
                    warn!("connection from {peer_addr} ended with error: {err:#}");
                }
            });
        }
    });

    Ok(ServeHandle { local_addr, stop, task })
}

/// Retry budget used when `serve()` finds itself pushed into the
/// sender role by an incoming pull request; a puller that wants a
/// different budget should connect directly with `push`/`pull` instead
/// of going through a shared listener.
const PULL_SERVE_MAX_RETRIES: u32 = 5;

async fn handle_connection<S>(mut stream: S, peer_addr: SocketAddr, node_id: &str, store: Arc<ChunkStore>, metadata: Arc<Mutex<MetadataStore>>) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (peer, pull_requested) = handshake_server(&mut stream, node_id).await?;
    debug!("handshake with {peer} from {peer_addr} complete (pull={pull_requested})");

    if pull_requested {
        let (_header, msg) = read_message(&mut stream).await?;
        let snapshot_id = match msg {
            Message::ResumeQuery { transfer_id } => SnapshotId::from(transfer_id),
            other => bail!("expected ResumeQuery naming the pulled snapshot, got {other:?}"),
        };
        return crate::sender::run_sender_role(&mut stream, &snapshot_id, store, metadata, PULL_SERVE_MAX_RETRIES)
            .await
            .map(|_| ());
    }

    run_receiver_role(&mut stream, store, metadata).await
}

/// Drives the receiver side of one transfer-capable connection until
/// the peer closes it or an idle timeout elapses.
pub async fn run_receiver_role<S>(stream: &mut S, store: Arc<ChunkStore>, metadata: Arc<Mutex<MetadataStore>>) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let progress: ProgressTable = Arc::new(Mutex::new(HashMap::new()));
    let pending_manifests: Arc<Mutex<HashMap<String, (SnapshotId, String, String, i64, jsi_api_types::ChunkerPolicy, Vec<FileRecord>)>>> = Arc::new(Mutex::new(HashMap::new()));

    loop {
        let next = timeout(DEFAULT_IDLE_TIMEOUT, read_message(stream)).await;
        let (header, msg) = match next {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => return Err(err),
            Err(_) => bail!("peer idle timeout after {DEFAULT_IDLE_TIMEOUT:?}"),
        };

        match msg {
            Message::Ping { timestamp_ms } => {
                write_message(stream, header.message_id, &Message::Pong { timestamp_ms }).await?;
            }
            Message::TransferRequest {
                transfer_id,
                file_name,
                file_size,
                chunk_size: _,
            } => {
                info!("accepting transfer '{transfer_id}' ({file_name}, {file_size} bytes)");
                progress.lock().unwrap().entry(transfer_id.clone()).or_default();
                write_message(
                    stream,
                    header.message_id,
                    &Message::TransferResponse {
                        transfer_id,
                        accepted: true,
                        reason: String::new(),
                    },
                )
                .await?;
            }
            Message::ResumeQuery { transfer_id } => {
                let highest = progress.lock().unwrap().get(&transfer_id).and_then(|p| p.highest_contiguous_acked());
                write_message(
                    stream,
                    header.message_id,
                    &Message::ResumeResponse {
                        transfer_id,
                        highest_contiguous_acked: highest,
                    },
                )
                .await?;
            }
            Message::ChunkData {
                transfer_id,
                chunk_index,
                checksum,
                data,
            } => {
                let recomputed = hash_bytes(&data);
                if recomputed != checksum {
                    write_message(
                        stream,
                        header.message_id,
                        &Message::ChunkAck {
                            transfer_id,
                            chunk_index,
                            success: false,
                            error_message: "checksum".to_string(),
                        },
                    )
                    .await?;
                    continue;
                }

                let store_for_write = Arc::clone(&store);
                let data_len = data.len() as u64;
                let write_result = tokio::task::spawn_blocking(move || store_for_write.put(&checksum, &data, true)).await;

                let ack = match write_result {
                    Ok(Ok(_)) => {
                        let mut table = progress.lock().unwrap();
                        let entry = table.entry(transfer_id.clone()).or_default();
                        entry.acked.insert(chunk_index);
                        entry.chunk_sizes.insert(checksum, data_len);
                        Message::ChunkAck {
                            transfer_id,
                            chunk_index,
                            success: true,
                            error_message: String::new(),
                        }
                    }
                    Ok(Err(err)) => Message::ChunkAck {
                        transfer_id,
                        chunk_index,
                        success: false,
                        error_message: err.to_string(),
                    },
                    Err(join_err) => Message::ChunkAck {
                        transfer_id,
                        chunk_index,
                        success: false,
                        error_message: join_err.to_string(),
                    },
                };
                write_message(stream, header.message_id, &ack).await?;
            }
            Message::Manifest { transfer_id, payload } => {
                pending_manifests.lock().unwrap().insert(
                    transfer_id,
                    (
                        payload.snapshot.snapshot_id.clone(),
                        payload.snapshot.name.clone(),
                        payload.snapshot.description.clone(),
                        payload.snapshot.created_at,
                        payload.snapshot.chunker,
                        payload.files,
                    ),
                );
            }
            Message::TransferComplete {
                transfer_id,
                success,
                error_message,
            } => {
                if !success {
                    warn!("sender reported transfer '{transfer_id}' failed: {error_message}");
                    progress.lock().unwrap().remove(&transfer_id);
                    pending_manifests.lock().unwrap().remove(&transfer_id);
                    continue;
                }

                let manifest = pending_manifests.lock().unwrap().remove(&transfer_id);
                let chunk_sizes = progress.lock().unwrap().remove(&transfer_id).map(|p| p.chunk_sizes).unwrap_or_default();

                if let Some((snapshot_id, name, description, created_at, chunker, files)) = manifest {
                    install_manifest(&metadata, &snapshot_id, &name, &description, created_at, chunker, files, &chunk_sizes)?;
                    info!("installed snapshot '{snapshot_id}' from transfer '{transfer_id}'");
                } else {
                    warn!("transfer '{transfer_id}' completed without a preceding Manifest message");
                }
            }
            other => bail!("unexpected message in receiver role: {other:?}"),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn install_manifest(
    metadata: &Mutex<MetadataStore>,
    snapshot_id: &SnapshotId,
    name: &str,
    description: &str,
    created_at: i64,
    chunker: jsi_api_types::ChunkerPolicy,
    files: Vec<FileRecord>,
    chunk_sizes: &HashMap<Digest, u64>,
) -> Result<(), Error> {
    let mut entries = Vec::with_capacity(files.len());
    for file in files {
        let edges: Vec<ChunkEdge> = file
            .chunks
            .iter()
            .enumerate()
            .map(|(order_index, digest)| ChunkEdge {
                order_index: order_index as i64,
                digest: *digest,
                size: *chunk_sizes.get(digest).unwrap_or(&0),
            })
            .collect();
        entries.push((file, edges));
    }

    metadata.lock().unwrap().install_snapshot(snapshot_id, name, description, created_at, chunker, &entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsi_api_types::{ChunkerPolicy, FileKind};
    use jsi_protocol::ManifestPayload;

    fn sample_store() -> (tempfile::TempDir, Arc<ChunkStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ChunkStore::create(dir.path()).unwrap());
        (dir, store)
    }

    #[tokio::test]
    async fn test_receiver_installs_manifest_after_transfer_complete() {
        let (_dir, store) = sample_store();
        let metadata = Arc::new(Mutex::new(MetadataStore::open_in_memory().unwrap()));

        let (mut client, mut server) = tokio::io::duplex(1 << 20);
        let store_for_server = Arc::clone(&store);
        let metadata_for_server = Arc::clone(&metadata);
        let server_task = tokio::spawn(async move { run_receiver_role(&mut server, store_for_server, metadata_for_server).await });

        let data = b"hello world".to_vec();
        let digest = hash_bytes(&data);

        write_message(
            &mut client,
            1,
            &Message::TransferRequest {
                transfer_id: "t1".to_string(),
                file_name: "snap".to_string(),
                file_size: data.len() as u64,
                chunk_size: data.len() as u32,
            },
        )
        .await
        .unwrap();
        let (_h, resp) = read_message(&mut client).await.unwrap();
        assert!(matches!(resp, Message::TransferResponse { accepted: true, .. }));

        write_message(
            &mut client,
            2,
            &Message::ChunkData {
                transfer_id: "t1".to_string(),
                chunk_index: 0,
                checksum: digest,
                data: data.clone(),
            },
        )
        .await
        .unwrap();
        let (_h, ack) = read_message(&mut client).await.unwrap();
        assert!(matches!(ack, Message::ChunkAck { success: true, .. }));

        let snapshot_id = SnapshotId::from("snap-xyz".to_string());
        let file = FileRecord {
            file_id: 0,
            snapshot_id: snapshot_id.clone(),
            path: "a.txt".to_string(),
            size: data.len() as u64,
            mtime_ns: 0,
            mode: "100644".to_string(),
            kind: FileKind::Regular,
            symlink_target: None,
            content_digest: digest,
            chunks: vec![digest],
        };
        let snapshot = jsi_api_types::Snapshot {
            snapshot_id: snapshot_id.clone(),
            name: "nightly".to_string(),
            description: "".to_string(),
            created_at: 1234,
            status: jsi_api_types::SnapshotStatus::Completed,
            file_count: 1,
            total_size: data.len() as u64,
            chunk_count: 1,
            chunker: ChunkerPolicy::fixed(4 * 1024 * 1024),
        };
        write_message(
            &mut client,
            3,
            &Message::Manifest {
                transfer_id: "t1".to_string(),
                payload: ManifestPayload { snapshot, files: vec![file] },
            },
        )
        .await
        .unwrap();

        write_message(
            &mut client,
            4,
            &Message::TransferComplete {
                transfer_id: "t1".to_string(),
                success: true,
                error_message: String::new(),
            },
        )
        .await
        .unwrap();

        // Give the server task a beat to process TransferComplete, then drop
        // the client side to end the receiver loop cleanly.
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(client);
        let _ = server_task.await;

        let installed = metadata.lock().unwrap().get_snapshot(&snapshot_id).unwrap();
        assert_eq!(installed.status, jsi_api_types::SnapshotStatus::Completed);
        assert!(store.has(&digest));
    }

    #[test]
    fn test_highest_contiguous_acked() {
        let mut progress = TransferProgress::default();
        assert_eq!(progress.highest_contiguous_acked(), None);
        progress.acked.insert(0);
        progress.acked.insert(1);
        progress.acked.insert(3);
        assert_eq!(progress.highest_contiguous_acked(), Some(1));
    }
}
