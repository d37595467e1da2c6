//! Message types 0x01–0x21 (§4.10), encoded/decoded as a single tagged
//! enum rather than the teacher's one-struct-per-packet-type module
//! layout (`proxmox-protocol::protocol::{server, client}`) — there are
//! few enough message shapes here that one `match` covers encode and
//! decode symmetrically.

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use jsi_api_types::{Digest, FileRecord, Snapshot};

use crate::frame::{read_digest, read_len_prefixed, read_string, read_u32, read_u64, read_u8, write_len_prefixed, write_string};

pub mod msg_type {
    pub const HANDSHAKE: u8 = 0x01;
    pub const HANDSHAKE_RESPONSE: u8 = 0x02;
    pub const TRANSFER_REQUEST: u8 = 0x10;
    pub const TRANSFER_RESPONSE: u8 = 0x11;
    pub const CHUNK_DATA: u8 = 0x12;
    pub const CHUNK_ACK: u8 = 0x13;
    pub const TRANSFER_COMPLETE: u8 = 0x14;
    pub const ERROR: u8 = 0x15;
    pub const MANIFEST: u8 = 0x16;
    pub const PING: u8 = 0x20;
    pub const PONG: u8 = 0x21;
    pub const RESUME_QUERY: u8 = 0x17;
    pub const RESUME_RESPONSE: u8 = 0x18;
}

/// Carried inside a `Manifest` message: the snapshot record plus its
/// file/edge records, installed atomically by the receiver once every
/// chunk referenced by `files` has been acked. Encoded as JSON (the
/// teacher's own manifest, `pbs-datastore::manifest::BackupManifest`,
/// is `serde_json` too) rather than a bespoke binary layout — the
/// record shape nests enough that a hand-packed format would just be
/// length-prefixed JSON with extra steps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManifestPayload {
    pub snapshot: Snapshot,
    pub files: Vec<FileRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Handshake {
        node_id: String,
        version: String,
    },
    HandshakeResponse {
        node_id: String,
        version: String,
        accepted: bool,
        reason: String,
    },
    TransferRequest {
        transfer_id: String,
        file_name: String,
        file_size: u64,
        chunk_size: u32,
    },
    TransferResponse {
        transfer_id: String,
        accepted: bool,
        reason: String,
    },
    ChunkData {
        transfer_id: String,
        chunk_index: u32,
        checksum: Digest,
        data: Vec<u8>,
    },
    ChunkAck {
        transfer_id: String,
        chunk_index: u32,
        success: bool,
        error_message: String,
    },
    TransferComplete {
        transfer_id: String,
        success: bool,
        error_message: String,
    },
    Error {
        code: u32,
        message: String,
    },
    /// Sent once chunk transfer completes; JSON-encoded [`ManifestPayload`].
    Manifest {
        transfer_id: String,
        payload: ManifestPayload,
    },
    /// Sent by a resuming sender right after a successful handshake.
    ResumeQuery {
        transfer_id: String,
    },
    /// Reply to [`Message::ResumeQuery`]; `-1` (encoded as `u64::MAX`)
    /// means no chunk of this transfer has been acked yet.
    ResumeResponse {
        transfer_id: String,
        highest_contiguous_acked: Option<u32>,
    },
    Ping {
        timestamp_ms: u64,
    },
    Pong {
        timestamp_ms: u64,
    },
}

fn bool_to_u8(b: bool) -> u8 {
    if b {
        1
    } else {
        0
    }
}

fn u8_to_bool(v: u8) -> bool {
    v != 0
}

impl Message {
    pub fn msg_type(&self) -> u8 {
        match self {
            Message::Handshake { .. } => msg_type::HANDSHAKE,
            Message::HandshakeResponse { .. } => msg_type::HANDSHAKE_RESPONSE,
            Message::TransferRequest { .. } => msg_type::TRANSFER_REQUEST,
            Message::TransferResponse { .. } => msg_type::TRANSFER_RESPONSE,
            Message::ChunkData { .. } => msg_type::CHUNK_DATA,
            Message::ChunkAck { .. } => msg_type::CHUNK_ACK,
            Message::TransferComplete { .. } => msg_type::TRANSFER_COMPLETE,
            Message::Error { .. } => msg_type::ERROR,
            Message::Manifest { .. } => msg_type::MANIFEST,
            Message::ResumeQuery { .. } => msg_type::RESUME_QUERY,
            Message::ResumeResponse { .. } => msg_type::RESUME_RESPONSE,
            Message::Ping { .. } => msg_type::PING,
            Message::Pong { .. } => msg_type::PONG,
        }
    }

    pub fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Message::Handshake { node_id, version } => {
                write_string(&mut out, node_id);
                write_string(&mut out, version);
            }
            Message::HandshakeResponse {
                node_id,
                version,
                accepted,
                reason,
            } => {
                write_string(&mut out, node_id);
                write_string(&mut out, version);
                out.push(bool_to_u8(*accepted));
                write_string(&mut out, reason);
            }
            Message::TransferRequest {
                transfer_id,
                file_name,
                file_size,
                chunk_size,
            } => {
                write_string(&mut out, transfer_id);
                write_string(&mut out, file_name);
                out.extend_from_slice(&file_size.to_be_bytes());
                out.extend_from_slice(&chunk_size.to_be_bytes());
            }
            Message::TransferResponse {
                transfer_id,
                accepted,
                reason,
            } => {
                write_string(&mut out, transfer_id);
                out.push(bool_to_u8(*accepted));
                write_string(&mut out, reason);
            }
            Message::ChunkData {
                transfer_id,
                chunk_index,
                checksum,
                data,
            } => {
                write_string(&mut out, transfer_id);
                out.extend_from_slice(&chunk_index.to_be_bytes());
                out.extend_from_slice(checksum.as_bytes());
                write_len_prefixed(&mut out, data);
            }
            Message::ChunkAck {
                transfer_id,
                chunk_index,
                success,
                error_message,
            } => {
                write_string(&mut out, transfer_id);
                out.extend_from_slice(&chunk_index.to_be_bytes());
                out.push(bool_to_u8(*success));
                write_string(&mut out, error_message);
            }
            Message::TransferComplete {
                transfer_id,
                success,
                error_message,
            } => {
                write_string(&mut out, transfer_id);
                out.push(bool_to_u8(*success));
                write_string(&mut out, error_message);
            }
            Message::Error { code, message } => {
                out.extend_from_slice(&code.to_be_bytes());
                write_string(&mut out, message);
            }
            Message::Manifest { transfer_id, payload } => {
                write_string(&mut out, transfer_id);
                let json = serde_json::to_vec(payload).expect("ManifestPayload always serializes");
                write_len_prefixed(&mut out, &json);
            }
            Message::ResumeQuery { transfer_id } => {
                write_string(&mut out, transfer_id);
            }
            Message::ResumeResponse {
                transfer_id,
                highest_contiguous_acked,
            } => {
                write_string(&mut out, transfer_id);
                out.extend_from_slice(&highest_contiguous_acked.unwrap_or(u32::MAX).to_be_bytes());
            }
            Message::Ping { timestamp_ms } | Message::Pong { timestamp_ms } => {
                out.extend_from_slice(&timestamp_ms.to_be_bytes());
            }
        }
        out
    }

    pub fn decode_body(msg_type: u8, body: &[u8]) -> Result<Self, Error> {
        let mut pos = 0;
        let msg = match msg_type {
            msg_type::HANDSHAKE => Message::Handshake {
                node_id: read_string(body, &mut pos)?,
                version: read_string(body, &mut pos)?,
            },
            msg_type::HANDSHAKE_RESPONSE => Message::HandshakeResponse {
                node_id: read_string(body, &mut pos)?,
                version: read_string(body, &mut pos)?,
                accepted: u8_to_bool(read_u8(body, &mut pos)?),
                reason: read_string(body, &mut pos)?,
            },
            msg_type::TRANSFER_REQUEST => Message::TransferRequest {
                transfer_id: read_string(body, &mut pos)?,
                file_name: read_string(body, &mut pos)?,
                file_size: read_u64(body, &mut pos)?,
                chunk_size: read_u32(body, &mut pos)?,
            },
            msg_type::TRANSFER_RESPONSE => Message::TransferResponse {
                transfer_id: read_string(body, &mut pos)?,
                accepted: u8_to_bool(read_u8(body, &mut pos)?),
                reason: read_string(body, &mut pos)?,
            },
            msg_type::CHUNK_DATA => {
                let transfer_id = read_string(body, &mut pos)?;
                let chunk_index = read_u32(body, &mut pos)?;
                let checksum = read_digest(body, &mut pos)?;
                let data = read_len_prefixed(body, &mut pos)?.to_vec();
                Message::ChunkData {
                    transfer_id,
                    chunk_index,
                    checksum,
                    data,
                }
            }
            msg_type::CHUNK_ACK => Message::ChunkAck {
                transfer_id: read_string(body, &mut pos)?,
                chunk_index: read_u32(body, &mut pos)?,
                success: u8_to_bool(read_u8(body, &mut pos)?),
                error_message: read_string(body, &mut pos)?,
            },
            msg_type::TRANSFER_COMPLETE => Message::TransferComplete {
                transfer_id: read_string(body, &mut pos)?,
                success: u8_to_bool(read_u8(body, &mut pos)?),
                error_message: read_string(body, &mut pos)?,
            },
            msg_type::ERROR => Message::Error {
                code: read_u32(body, &mut pos)?,
                message: read_string(body, &mut pos)?,
            },
            msg_type::MANIFEST => {
                let transfer_id = read_string(body, &mut pos)?;
                let json = read_len_prefixed(body, &mut pos)?;
                let payload: ManifestPayload = serde_json::from_slice(json)?;
                Message::Manifest { transfer_id, payload }
            }
            msg_type::RESUME_QUERY => Message::ResumeQuery {
                transfer_id: read_string(body, &mut pos)?,
            },
            msg_type::RESUME_RESPONSE => {
                let transfer_id = read_string(body, &mut pos)?;
                let raw = read_u32(body, &mut pos)?;
                Message::ResumeResponse {
                    transfer_id,
                    highest_contiguous_acked: if raw == u32::MAX { None } else { Some(raw) },
                }
            }
            msg_type::PING => Message::Ping {
                timestamp_ms: read_u64(body, &mut pos)?,
            },
            msg_type::PONG => Message::Pong {
                timestamp_ms: read_u64(body, &mut pos)?,
            },
            other => bail!("unknown message type 0x{other:02x}"),
        };
        Ok(msg)
    }
}
