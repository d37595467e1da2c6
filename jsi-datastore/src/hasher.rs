//! C1: content hashing.
//!
//! The core is hard-wired to BLAKE3 (§4.1) rather than the CryptMode
//! dispatch the teacher used for SHA-256/encrypted digests: there is only
//! one digest algorithm, so there is no mode to negotiate.

use jsi_api_types::Digest;

/// One-shot digest of a complete buffer.
pub fn hash_bytes(data: &[u8]) -> Digest {
    Digest::new(*blake3::hash(data).as_bytes())
}

/// Streaming hasher for data that arrives in pieces (read from a file in
/// chunk-sized windows, or reassembled during restore for verification).
#[derive(Default)]
pub struct StreamingHasher {
    inner: blake3::Hasher,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self {
            inner: blake3::Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update(data);
        self
    }

    pub fn finalize(&self) -> Digest {
        Digest::new(*self.inner.finalize().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_bytes_matches_blake3() {
        let data = b"justsyncit";
        let expected = Digest::new(*blake3::hash(data).as_bytes());
        assert_eq!(hash_bytes(data), expected);
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut streaming = StreamingHasher::new();
        for chunk in data.chunks(7) {
            streaming.update(chunk);
        }
        assert_eq!(streaming.finalize(), hash_bytes(data));
    }

    #[test]
    fn test_empty_input_is_stable() {
        assert_eq!(hash_bytes(b""), hash_bytes(b""));
        assert_ne!(hash_bytes(b""), hash_bytes(b"x"));
    }
}
