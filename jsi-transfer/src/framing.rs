//! Async read/write of one complete C10 frame (header + body) over any
//! `AsyncRead`/`AsyncWrite` stream. Grounded on the teacher's own split
//! between framing and transport in `pbs-client::http_client` — the
//! wire format module knows nothing about sockets, only about bytes in
//! and bytes out.

use anyhow::{Context, Error};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use jsi_protocol::{encode_frame, FrameHeader, Message, HEADER_LEN};

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message_id: u32, msg: &Message) -> Result<(), Error> {
    let framed = encode_frame(message_id, msg);
    writer.write_all(&framed).await.context("writing frame")?;
    writer.flush().await.context("flushing frame")?;
    Ok(())
}

/// Reads one frame off the wire and decodes its body. Returns the raw
/// header too, since `message_id` correlates request/response pairs.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(FrameHeader, Message), Error> {
    let mut header_buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut header_buf).await.context("reading frame header")?;
    let header = FrameHeader::decode(&header_buf)?;

    let mut payload = vec![0u8; header.payload_len as usize];
    reader.read_exact(&mut payload).await.context("reading frame payload")?;

    let msg = jsi_protocol::decode_frame(&header, &payload)?;
    Ok((header, msg))
}
