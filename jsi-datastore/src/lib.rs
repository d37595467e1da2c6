//! Content-addressed chunk store and transactional metadata store
//! (components C1–C5, C9). Mirrors the teacher's `pbs-datastore` in
//! shape — a handful of focused modules re-exported flat from the
//! crate root — but the CAS semantics underneath are BLAKE3-keyed and
//! refcount-driven rather than SHA-256-keyed and atime-driven.

pub mod buffer_pool;
pub mod chunk_store;
pub mod chunker;
pub mod gc;
pub mod hasher;
pub mod metadata;
pub mod verify;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use chunk_store::{ChunkStore, Compression, StoredChunk};
pub use chunker::{ChunkBoundary, Chunker, ContentDefinedChunker, FixedSizeChunker};
pub use gc::{gc, GcResult, NoReapLease};
pub use hasher::{hash_bytes, StreamingHasher};
pub use metadata::{ChunkEdge, MetadataStore, SnapshotSort, Stats};
pub use verify::{verify_all_chunks, verify_snapshot, ChunkVerifyReport, FileVerifyResult, SnapshotVerifyReport};
