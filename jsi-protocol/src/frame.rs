//! C10 wire framing (§4.10): a 16-byte header followed by a payload.
//!
//! The teacher's own wire format, `proxmox-protocol`, builds packets
//! with `endian_trait`'s `Endian` derive and an unsafe
//! `std::slice::from_raw_parts` cast over a `#[repr(C, packed)]`
//! struct (`PacketBuilder::write_data_noswap`). That crate is not part
//! of this workspace's build (it predates the anyhow/thiserror
//! migration the rest of the teacher uses), and its struct-cast trick
//! does not extend cleanly to this header's required byte order —
//! §4.10 mandates big-endian throughout, the opposite of the teacher's
//! `to_le()` packets — so the header here is encoded/decoded with
//! plain `to_be_bytes`/`from_be_bytes` instead of a transmuted struct.

use anyhow::{bail, Error};

pub const MAGIC: [u8; 4] = *b"JSTN";
pub const VERSION: u16 = 1;
pub const HEADER_LEN: usize = 16;
pub const MAX_PAYLOAD_LEN: u32 = 1024 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u16,
    pub msg_type: u8,
    pub flags: u8,
    pub message_id: u32,
    pub payload_len: u32,
}

impl FrameHeader {
    pub fn new(msg_type: u8, message_id: u32, payload_len: u32) -> Self {
        Self {
            version: VERSION,
            msg_type,
            flags: 0,
            message_id,
            payload_len,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_be_bytes());
        buf[6] = self.msg_type;
        buf[7] = self.flags;
        buf[8..12].copy_from_slice(&self.message_id.to_be_bytes());
        buf[12..16].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    /// Validates magic, version, and the payload-length ceiling before
    /// any allocation proportional to `payload_len` happens, per §4.10.
    pub fn decode(raw: &[u8]) -> Result<Self, Error> {
        if raw.len() < HEADER_LEN {
            bail!("frame header too short ({} bytes)", raw.len());
        }
        if raw[0..4] != MAGIC {
            bail!("bad frame magic");
        }
        let version = u16::from_be_bytes(raw[4..6].try_into().unwrap());
        if version != VERSION {
            bail!("unsupported protocol version {version}");
        }
        let payload_len = u32::from_be_bytes(raw[12..16].try_into().unwrap());
        if payload_len > MAX_PAYLOAD_LEN {
            bail!("payload length {payload_len} exceeds maximum {MAX_PAYLOAD_LEN}");
        }

        Ok(Self {
            version,
            msg_type: raw[6],
            flags: raw[7],
            message_id: u32::from_be_bytes(raw[8..12].try_into().unwrap()),
            payload_len,
        })
    }
}

/// Reads a 4-byte big-endian length prefix followed by that many bytes.
/// Used for both UTF-8 strings and raw byte payloads.
pub fn read_len_prefixed<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a [u8], Error> {
    if buf.len() < *pos + 4 {
        bail!("truncated length prefix at offset {pos}");
    }
    let len = u32::from_be_bytes(buf[*pos..*pos + 4].try_into().unwrap()) as usize;
    *pos += 4;
    if buf.len() < *pos + len {
        bail!("truncated payload: need {len} bytes at offset {pos}, have {}", buf.len() - *pos);
    }
    let slice = &buf[*pos..*pos + len];
    *pos += len;
    Ok(slice)
}

pub fn read_string(buf: &[u8], pos: &mut usize) -> Result<String, Error> {
    let bytes = read_len_prefixed(buf, pos)?;
    Ok(String::from_utf8(bytes.to_vec())?)
}

pub fn write_len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

pub fn write_string(out: &mut Vec<u8>, s: &str) {
    write_len_prefixed(out, s.as_bytes());
}

pub fn read_u8(buf: &[u8], pos: &mut usize) -> Result<u8, Error> {
    if buf.len() < *pos + 1 {
        bail!("truncated u8 at offset {pos}");
    }
    let v = buf[*pos];
    *pos += 1;
    Ok(v)
}

pub fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32, Error> {
    if buf.len() < *pos + 4 {
        bail!("truncated u32 at offset {pos}");
    }
    let v = u32::from_be_bytes(buf[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    Ok(v)
}

pub fn read_u64(buf: &[u8], pos: &mut usize) -> Result<u64, Error> {
    if buf.len() < *pos + 8 {
        bail!("truncated u64 at offset {pos}");
    }
    let v = u64::from_be_bytes(buf[*pos..*pos + 8].try_into().unwrap());
    *pos += 8;
    Ok(v)
}

pub fn read_digest(buf: &[u8], pos: &mut usize) -> Result<jsi_api_types::Digest, Error> {
    if buf.len() < *pos + 32 {
        bail!("truncated digest at offset {pos}");
    }
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&buf[*pos..*pos + 32]);
    *pos += 32;
    Ok(jsi_api_types::Digest::new(bytes))
}
