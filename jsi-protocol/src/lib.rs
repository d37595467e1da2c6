//! Wire protocol for node-to-node transfer (component C10).

pub mod frame;
pub mod messages;

pub use frame::{FrameHeader, HEADER_LEN, MAGIC, MAX_PAYLOAD_LEN, VERSION};
pub use messages::{msg_type, ManifestPayload, Message};

use anyhow::Error;

/// Encodes a [`Message`] into a full frame: header followed by body.
pub fn encode_frame(message_id: u32, msg: &Message) -> Vec<u8> {
    encode_frame_with_flags(message_id, msg, 0)
}

/// Like [`encode_frame`] but sets the header's reserved `flags` byte.
/// The byte is unused by the spec's message bodies; jsi-transfer uses
/// bit 0x01 on a `Handshake` frame to mark a pull request without
/// inventing a new message type for it.
pub fn encode_frame_with_flags(message_id: u32, msg: &Message, flags: u8) -> Vec<u8> {
    let body = msg.encode_body();
    let mut header = FrameHeader::new(msg.msg_type(), message_id, body.len() as u32);
    header.flags = flags;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&body);
    out
}

/// Decodes a header plus the raw payload bytes into a [`Message`].
pub fn decode_frame(header: &FrameHeader, payload: &[u8]) -> Result<Message, Error> {
    Message::decode_body(header.msg_type, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_frame_roundtrip() {
        let msg = Message::Ping { timestamp_ms: 1000 };
        let framed = encode_frame(7, &msg);
        let header = FrameHeader::decode(&framed[..HEADER_LEN]).unwrap();
        assert_eq!(header.message_id, 7);
        let payload = &framed[HEADER_LEN..HEADER_LEN + header.payload_len as usize];
        let decoded = decode_frame(&header, payload).unwrap();
        assert_eq!(decoded, msg);
    }
}
