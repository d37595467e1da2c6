//! Connection-level handshake (§4.10 "Connection state machine").
//!
//! `Closed -> WaitHandshake -> Established` on both sides; anything
//! other than a matching protocol version gets `0x15 Error{code=1001}`
//! and the socket is dropped, exactly as §6 "Wire protocol" mandates.

use anyhow::{bail, Error};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use jsi_protocol::{encode_frame_with_flags, Message, VERSION};

use crate::framing::{read_message, write_message};

pub const PROTOCOL_VERSION_STR: &str = "1";
const VERSION_MISMATCH_ERROR_CODE: u32 = 1001;

/// Bit on the `Handshake` frame's reserved header `flags` byte: set by
/// a puller to ask the accepting side to act as sender for this
/// connection instead of the usual receiver role.
pub const FLAG_PULL: u8 = 0x01;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub node_id: String,
    pub version: String,
}

impl std::fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} (protocol {})", self.node_id, self.version)
    }
}

/// Client side of the handshake: send `Handshake`, expect
/// `HandshakeResponse{accepted: true}`. `pull` sets [`FLAG_PULL`].
pub async fn handshake_client<S>(stream: &mut S, node_id: &str, pull: bool) -> Result<PeerInfo, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let msg = Message::Handshake {
        node_id: node_id.to_string(),
        version: PROTOCOL_VERSION_STR.to_string(),
    };
    let flags = if pull { FLAG_PULL } else { 0 };
    let framed = encode_frame_with_flags(0, &msg, flags);
    stream.write_all(&framed).await?;
    stream.flush().await?;

    let (_header, response) = read_message(stream).await?;
    match response {
        Message::HandshakeResponse {
            node_id,
            version,
            accepted: true,
            ..
        } => Ok(PeerInfo { node_id, version }),
        Message::HandshakeResponse { reason, accepted: false, .. } => {
            bail!("peer rejected handshake: {reason}")
        }
        Message::Error { code, message } => bail!("peer returned error {code}: {message}"),
        other => bail!("unexpected message during handshake: {other:?}"),
    }
}

/// Server side: read `Handshake`, validate `version`, reply. Returns
/// the peer info plus whether `FLAG_PULL` was set.
pub async fn handshake_server<S>(stream: &mut S, local_node_id: &str) -> Result<(PeerInfo, bool), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (header, request) = read_message(stream).await?;
    let (node_id, version) = match request {
        Message::Handshake { node_id, version } => (node_id, version),
        other => bail!("expected Handshake, got {other:?}"),
    };

    if version != PROTOCOL_VERSION_STR {
        write_message(
            stream,
            header.message_id,
            &Message::Error {
                code: VERSION_MISMATCH_ERROR_CODE,
                message: format!("unsupported protocol version '{version}', expected '{PROTOCOL_VERSION_STR}' (frame version {VERSION})"),
            },
        )
        .await?;
        bail!("peer '{node_id}' sent unsupported protocol version '{version}'");
    }

    write_message(
        stream,
        header.message_id,
        &Message::HandshakeResponse {
            node_id: local_node_id.to_string(),
            version: PROTOCOL_VERSION_STR.to_string(),
            accepted: true,
            reason: String::new(),
        },
    )
    .await?;

    Ok((PeerInfo { node_id, version }, header.flags & FLAG_PULL != 0))
}
