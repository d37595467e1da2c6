//! Sender side of the transfer protocol: drives the "Transfer state
//! machine (sender-side)" from §4.10 — offer, stream chunks with
//! per-chunk retry, install the manifest, complete.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Error};
use log::{info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

use jsi_api_types::{ChunkerPolicy, Digest, FileRecord, SnapshotId};
use jsi_datastore::{ChunkStore, MetadataStore};
use jsi_protocol::{ManifestPayload, Message};

use crate::connection::handshake_client;
use crate::framing::{read_message, write_message};
use crate::retry::Backoff;

const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Default)]
pub struct PushSummary {
    pub transfer_id: String,
    pub chunks_sent: u64,
    pub chunks_skipped_on_resume: u64,
}

/// How long the sender waits for a chunk's `ChunkAck` before treating it
/// as lost and retrying. Deliberately much shorter than the peer
/// [`crate::receiver`] idle timeout: a silently dropped ack (no nack, no
/// frame at all) is exactly as retry-able as an explicit nack (§7
/// "network faults ... recovered via retry with bounded attempts").
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Pushes `snapshot_id`'s distinct chunks and manifest to `peer_addr`.
pub async fn push(
    snapshot_id: &SnapshotId,
    peer_addr: SocketAddr,
    node_id: &str,
    store: Arc<ChunkStore>,
    metadata: Arc<Mutex<MetadataStore>>,
    max_retries: u32,
) -> Result<PushSummary, Error> {
    let mut stream = TcpStream::connect(peer_addr).await?;
    handshake_client(&mut stream, node_id, false).await?;
    run_sender_role_with_ack_timeout(&mut stream, snapshot_id, store, metadata, max_retries, DEFAULT_ACK_TIMEOUT).await
}

/// Drives the sender role over an already-connected, already-handshaken
/// stream. Split out from [`push`] so tests (and an eventual QUIC
/// transport) can supply any `AsyncRead + AsyncWrite`.
pub async fn run_sender_role<S>(
    stream: &mut S,
    snapshot_id: &SnapshotId,
    store: Arc<ChunkStore>,
    metadata: Arc<Mutex<MetadataStore>>,
    max_retries: u32,
) -> Result<PushSummary, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    run_sender_role_with_ack_timeout(stream, snapshot_id, store, metadata, max_retries, DEFAULT_ACK_TIMEOUT).await
}

/// Like [`run_sender_role`] but with an explicit per-chunk ack timeout —
/// exposed so tests can exercise the dropped-ack retry path without
/// waiting out [`DEFAULT_ACK_TIMEOUT`].
pub async fn run_sender_role_with_ack_timeout<S>(
    stream: &mut S,
    snapshot_id: &SnapshotId,
    store: Arc<ChunkStore>,
    metadata: Arc<Mutex<MetadataStore>>,
    max_retries: u32,
    ack_timeout: Duration,
) -> Result<PushSummary, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (snapshot, files) = {
        let metadata = metadata.lock().unwrap();
        (metadata.get_snapshot(snapshot_id)?, metadata.list_files(snapshot_id)?)
    };

    let distinct = distinct_chunks(&files);
    let transfer_id = snapshot_id.to_string();

    write_message(stream, 1, &Message::ResumeQuery { transfer_id: transfer_id.clone() }).await?;
    let (_h, resume) = read_application_message(stream).await?;
    let start_index = match resume {
        Message::ResumeResponse { highest_contiguous_acked, .. } => highest_contiguous_acked.map(|i| i + 1).unwrap_or(0),
        other => bail!("unexpected reply to ResumeQuery: {other:?}"),
    };

    let total_size = sum_chunk_sizes(&metadata, &distinct)?;
    let chunk_size = match snapshot.chunker {
        ChunkerPolicy::FixedSize { chunk_size } => chunk_size as u32,
        ChunkerPolicy::ContentDefined { .. } => 0,
    };

    write_message(
        stream,
        2,
        &Message::TransferRequest {
            transfer_id: transfer_id.clone(),
            file_name: snapshot.name.clone(),
            file_size: total_size,
            chunk_size,
        },
    )
    .await?;
    let (_h, response) = read_application_message(stream).await?;
    match response {
        Message::TransferResponse { accepted: true, .. } => {}
        Message::TransferResponse { accepted: false, reason, .. } => bail!("peer rejected transfer: {reason}"),
        other => bail!("unexpected reply to TransferRequest: {other:?}"),
    }

    let backoff = Backoff::new(max_retries);
    let mut chunks_sent = 0u64;

    for (chunk_index, digest) in distinct.iter().enumerate().skip(start_index as usize) {
        send_chunk_with_retry(stream, &store, &transfer_id, chunk_index as u32, digest, &backoff, ack_timeout).await?;
        chunks_sent += 1;
    }

    write_message(
        stream,
        3,
        &Message::Manifest {
            transfer_id: transfer_id.clone(),
            payload: ManifestPayload { snapshot, files },
        },
    )
    .await?;

    write_message(
        stream,
        4,
        &Message::TransferComplete {
            transfer_id: transfer_id.clone(),
            success: true,
            error_message: String::new(),
        },
    )
    .await?;

    info!("transfer '{transfer_id}' complete: {chunks_sent} chunks sent, {start_index} skipped on resume");
    Ok(PushSummary {
        transfer_id,
        chunks_sent,
        chunks_skipped_on_resume: start_index as u64,
    })
}

#[allow(clippy::too_many_arguments)]
async fn send_chunk_with_retry<S>(stream: &mut S, store: &Arc<ChunkStore>, transfer_id: &str, chunk_index: u32, digest: &Digest, backoff: &Backoff, ack_timeout: Duration) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let store_for_read = Arc::clone(store);
    let digest_owned = *digest;
    let data = tokio::task::spawn_blocking(move || store_for_read.get(&digest_owned)).await??.data;

    let mut attempt = 0u32;
    loop {
        write_message(
            stream,
            1000 + chunk_index,
            &Message::ChunkData {
                transfer_id: transfer_id.to_string(),
                chunk_index,
                checksum: *digest,
                data: data.clone(),
            },
        )
        .await?;

        // A dropped ack (no frame ever arrives) is as retry-able as an
        // explicit nack — §7 makes no distinction between the two.
        let reply = match timeout(ack_timeout, read_application_message(stream)).await {
            Ok(result) => Some(result?),
            Err(_elapsed) => None,
        };

        let retry_reason = match reply {
            Some((_h, Message::ChunkAck { success: true, .. })) => return Ok(()),
            Some((_h, Message::ChunkAck { success: false, error_message, .. })) => error_message,
            Some((_h, other)) => bail!("unexpected reply to ChunkData: {other:?}"),
            None => format!("no ack within {ack_timeout:?}"),
        };

        attempt += 1;
        if attempt > backoff.max_retries() {
            bail!("chunk {chunk_index} failed after {attempt} attempts: {retry_reason}");
        }
        warn!("chunk {chunk_index} unacked ({retry_reason}), retrying (attempt {attempt})");
        tokio::time::sleep(backoff.delay_for(attempt)).await;
    }
}

/// Reads the next message, transparently answering any `Ping` frames
/// the peer interleaves with keepalive `Pong`s instead of surfacing
/// them to the caller.
async fn read_application_message<S>(stream: &mut S) -> Result<(jsi_protocol::FrameHeader, Message), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let (header, msg) = timeout(IDLE_TIMEOUT, read_message(stream)).await.map_err(|_| anyhow::anyhow!("peer idle timeout after {IDLE_TIMEOUT:?}"))??;
        match msg {
            Message::Ping { timestamp_ms } => {
                write_message(stream, header.message_id, &Message::Pong { timestamp_ms }).await?;
            }
            other => return Ok((header, other)),
        }
    }
}

fn distinct_chunks(files: &[FileRecord]) -> Vec<Digest> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for file in files {
        for digest in &file.chunks {
            if seen.insert(*digest) {
                out.push(*digest);
            }
        }
    }
    out
}

fn sum_chunk_sizes(metadata: &Mutex<MetadataStore>, digests: &[Digest]) -> Result<u64, Error> {
    let metadata = metadata.lock().unwrap();
    let mut total = 0u64;
    for digest in digests {
        if let Some(info) = metadata.get_chunk_info(digest)? {
            total += info.size;
        }
    }
    Ok(total)
}

/// Pulls `snapshot_id` from `peer_addr`: connects, handshakes with
/// [`crate::connection::FLAG_PULL`] set, names the wanted snapshot via
/// a `ResumeQuery` (repurposing its `transfer_id` field, since this
/// implementation's `transfer_id` convention is already the snapshot
/// id being transferred — see [`push`]), then assumes the *receiver*
/// role. The peer's `serve()` loop recognizes the pull flag, reads
/// that same `ResumeQuery` to learn which snapshot to send, and runs
/// [`run_sender_role`] for the rest of the connection.
pub async fn pull(snapshot_id: &SnapshotId, peer_addr: SocketAddr, node_id: &str, store: Arc<ChunkStore>, metadata: Arc<Mutex<MetadataStore>>) -> Result<(), Error> {
    let mut stream = TcpStream::connect(peer_addr).await?;
    handshake_client(&mut stream, node_id, true).await?;
    write_message(&mut stream, 1, &Message::ResumeQuery { transfer_id: snapshot_id.to_string() }).await?;
    crate::receiver::run_receiver_role(&mut stream, store, metadata).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsi_api_types::{ChunkerPolicy as CP, FileKind, SnapshotStatus};
    use jsi_datastore::{hash_bytes, ChunkEdge};

    fn sample_store() -> (tempfile::TempDir, Arc<ChunkStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ChunkStore::create(dir.path()).unwrap());
        (dir, store)
    }

    #[tokio::test]
    async fn test_push_then_receive_installs_snapshot_on_peer() {
        let (_src_dir, src_store) = sample_store();
        let src_metadata = Arc::new(Mutex::new(MetadataStore::open_in_memory().unwrap()));

        let data = b"payload bytes".to_vec();
        let digest = hash_bytes(&data);
        src_store.put(&digest, &data, true).unwrap();

        let snapshot_id = {
            let mut metadata = src_metadata.lock().unwrap();
            let snapshot_id = metadata.create_snapshot_pending("nightly", "", CP::fixed(4 * 1024 * 1024)).unwrap();
            let record = FileRecord {
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
            metadata
                .add_file(
                    &snapshot_id,
                    &record,
                    &[ChunkEdge {
                        order_index: 0,
                        digest,
                        size: data.len() as u64,
                    }],
                )
                .unwrap();
            metadata.complete_snapshot(&snapshot_id, 1, data.len() as u64, 1).unwrap();
            snapshot_id
        };

        let (_dst_dir, dst_store) = sample_store();
        let dst_metadata = Arc::new(Mutex::new(MetadataStore::open_in_memory().unwrap()));

        let (mut client, mut server) = tokio::io::duplex(1 << 20);
        let dst_store_for_server = Arc::clone(&dst_store);
        let dst_metadata_for_server = Arc::clone(&dst_metadata);
        let server_task = tokio::spawn(async move { crate::receiver::run_receiver_role(&mut server, dst_store_for_server, dst_metadata_for_server).await });

        let summary = run_sender_role(&mut client, &snapshot_id, src_store, src_metadata, 3).await.unwrap();
        assert_eq!(summary.chunks_sent, 1);

        drop(client);
        let _ = server_task.await;

        let installed = dst_metadata.lock().unwrap().get_snapshot(&snapshot_id).unwrap();
        assert_eq!(installed.status, SnapshotStatus::Completed);
        assert!(dst_store.has(&digest));
    }

    /// Scenario E ("transfer with loss"): a proxy between sender and
    /// receiver drops the first `ChunkAck` for chunk index 2. The
    /// sender must retry that chunk and succeed on the second attempt.
    #[tokio::test]
    async fn test_scenario_e_retries_chunk_after_dropped_ack() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (_src_dir, src_store) = sample_store();
        let src_metadata = Arc::new(Mutex::new(MetadataStore::open_in_memory().unwrap()));

        let mut files = Vec::new();
        let mut chunks = Vec::new();
        for i in 0..3u8 {
            let data = vec![i; 16];
            let digest = hash_bytes(&data);
            src_store.put(&digest, &data, true).unwrap();
            chunks.push(digest);
            files.push((format!("f{i}.bin"), data.len() as u64, digest));
        }

        let snapshot_id = {
            let mut metadata = src_metadata.lock().unwrap();
            let snapshot_id = metadata.create_snapshot_pending("scenario-e", "", CP::fixed(4 * 1024 * 1024)).unwrap();
            for (path, size, digest) in &files {
                let record = FileRecord {
                    file_id: 0,
                    snapshot_id: snapshot_id.clone(),
                    path: path.clone(),
                    size: *size,
                    mtime_ns: 0,
                    mode: "100644".to_string(),
                    kind: FileKind::Regular,
                    symlink_target: None,
                    content_digest: *digest,
                    chunks: vec![*digest],
                };
                metadata
                    .add_file(&snapshot_id, &record, &[ChunkEdge { order_index: 0, digest: *digest, size: *size }])
                    .unwrap();
            }
            metadata.complete_snapshot(&snapshot_id, 3, 48, 3).unwrap();
            snapshot_id
        };

        let (_dst_dir, dst_store) = sample_store();
        let dst_metadata = Arc::new(Mutex::new(MetadataStore::open_in_memory().unwrap()));

        // client <-> proxy <-> server, with the proxy dropping the first
        // ChunkAck it sees for chunk_index == 2.
        let (mut client, client_proxy_end) = tokio::io::duplex(1 << 20);
        let (proxy_server_end, mut server) = tokio::io::duplex(1 << 20);

        let (mut cpe_r, mut cpe_w) = tokio::io::split(client_proxy_end);
        let (mut pse_r, mut pse_w) = tokio::io::split(proxy_server_end);

        let c2s = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match cpe_r.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if pse_w.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        let s2c = tokio::spawn(async move {
            let mut dropped = false;
            loop {
                let (header, msg) = match read_message(&mut pse_r).await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                if !dropped && matches!(&msg, Message::ChunkAck { chunk_index: 2, success: true, .. }) {
                    dropped = true;
                    continue;
                }
                let framed = jsi_protocol::encode_frame(header.message_id, &msg);
                if cpe_w.write_all(&framed).await.is_err() {
                    break;
                }
            }
        });

        let dst_store_for_server = Arc::clone(&dst_store);
        let dst_metadata_for_server = Arc::clone(&dst_metadata);
        let server_task = tokio::spawn(async move { crate::receiver::run_receiver_role(&mut server, dst_store_for_server, dst_metadata_for_server).await });

        let summary = run_sender_role_with_ack_timeout(&mut client, &snapshot_id, src_store, src_metadata, 3, Duration::from_millis(200)).await.unwrap();
        assert_eq!(summary.chunks_sent, 3);

        drop(client);
        let _ = server_task.await;
        let _ = c2s.await;
        let _ = s2c.await;

        let installed = dst_metadata.lock().unwrap().get_snapshot(&snapshot_id).unwrap();
        assert_eq!(installed.status, SnapshotStatus::Completed);
        for digest in &chunks {
            assert!(dst_store.has(digest));
        }
    }
}
