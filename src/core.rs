//! Explicit construction graph for the core (§9 "global service factory"
//! redesign flag): a small wiring function that takes [`crate::config::Config`]
//! and returns a single [`CoreHandle`] owning the stores, pools, and
//! shared worker state. No global singleton; lifetime is bounded by the
//! handle, same as the teacher's `DataStore::lookup_datastore` returns
//! an owned `Arc<DataStore>` rather than reaching into a process-wide
//! registry for every call.

use std::sync::{Arc, Mutex};

use anyhow::Error;

use jsi_datastore::{ChunkStore, MetadataStore, NoReapLease};
use jsi_ingest::InflightLatches;

use crate::config::Config;

/// Owns every piece of long-lived state a node needs: the chunk store,
/// the metadata store, the per-digest inflight latch table, and the
/// no-reap lease GC consults. Construct one per process (or per test)
/// with [`CoreHandle::open`]; everything in `ops` takes a `&CoreHandle`.
pub struct CoreHandle {
    pub config: Config,
    pub store: Arc<ChunkStore>,
    pub metadata: Arc<Mutex<MetadataStore>>,
    pub inflight: Arc<InflightLatches>,
    pub gc_lease: Arc<NoReapLease>,
}

impl CoreHandle {
    /// Opens (creating if absent) the on-disk layout described in §6
    /// under `config.home`, and wires up the stores.
    pub fn open(config: Config) -> Result<Self, Error> {
        crate::config::ensure_layout(&config.home)?;
        let home = std::fs::canonicalize(&config.home)?;
        let store = Arc::new(ChunkStore::open(home.clone()).or_else(|_| ChunkStore::create(home))?);
        let metadata = MetadataStore::open(&config.metadata_path())?;
        Ok(Self {
            config,
            store,
            metadata: Arc::new(Mutex::new(metadata)),
            inflight: Arc::new(InflightLatches::new()),
            gc_lease: Arc::new(NoReapLease::new()),
        })
    }

    /// Opens an ephemeral, in-process-only core for tests: a temp-dir
    /// chunk store plus an in-memory metadata store.
    #[cfg(test)]
    pub fn open_ephemeral(dir: &std::path::Path) -> Result<Self, Error> {
        let store = Arc::new(ChunkStore::create(dir)?);
        let metadata = MetadataStore::open_in_memory()?;
        Ok(Self {
            config: Config::with_home(dir),
            store,
            metadata: Arc::new(Mutex::new(metadata)),
            inflight: Arc::new(InflightLatches::new()),
            gc_lease: Arc::new(NoReapLease::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_layout_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home");
        let core = CoreHandle::open(Config::with_home(home.as_path())).unwrap();
        assert!(home.join("data").is_dir());
        assert!(home.join("metadata").join("store.db").exists());
        drop(core);

        let reopened = CoreHandle::open(Config::with_home(home.as_path()));
        assert!(reopened.is_ok());
    }
}
