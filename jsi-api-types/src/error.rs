use crate::Digest;

/// Error taxonomy surfaced to callers of the core (§6). Internal plumbing
/// still mostly threads `anyhow::Error`; this is the stable, matchable
/// shape handed back across the public API boundary.
#[derive(thiserror::Error, Debug)]
pub enum JsiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("i/o error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("hash mismatch for {digest}: expected data to hash to this digest but it did not")]
    HashMismatch { digest: Digest },

    #[error("corruption detected in chunk {digest}: {detail}")]
    Corruption { digest: Digest, detail: String },

    #[error("refcount underflow for chunk {digest}: tried to decref below zero")]
    RefcountUnderflow { digest: Digest },

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("peer rejected request: {0}")]
    PeerRejected(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl JsiError {
    pub fn not_found(what: impl Into<String>) -> Self {
        JsiError::NotFound(what.into())
    }

    pub fn invalid_argument(what: impl Into<String>) -> Self {
        JsiError::InvalidArgument(what.into())
    }
}
