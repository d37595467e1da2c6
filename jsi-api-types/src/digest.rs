use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

/// A 256 bit BLAKE3 content digest.
///
/// Digests are compared as fixed-width byte strings; hex encoding is used
/// only for persistence and display.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(#[serde(with = "hex::serde")] pub [u8; 32]);

impl Digest {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex: &str) -> Result<Self, Error> {
        if hex.len() != 64 {
            bail!("digest '{hex}' has wrong length {} (expected 64)", hex.len());
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex, &mut bytes)
            .map_err(|err| anyhow::format_err!("invalid hex digest '{hex}' - {err}"))?;
        Ok(Self(bytes))
    }

    /// First two hex characters, used as the on-disk chunk directory prefix.
    pub fn dir_prefix(&self) -> String {
        hex::encode(&self.0[0..1])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Self::from_hex(s)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[test]
fn test_digest_roundtrip() {
    let bytes = [7u8; 32];
    let digest = Digest::new(bytes);
    let hex = digest.to_hex();
    assert_eq!(hex.len(), 64);
    assert_eq!(Digest::from_hex(&hex).unwrap(), digest);
}

#[test]
fn test_digest_rejects_bad_length() {
    assert!(Digest::from_hex("abcd").is_err());
}
