//! Ambient construction config for [`crate::core::CoreHandle`].
//!
//! Kept deliberately small: a home directory plus the handful of knobs
//! the pipeline and ingest/restore layers already accept as `Options`
//! structs of their own. Resolved from environment variables the way
//! the teacher's `buildcfg.rs` resolves its compiled-in paths, rather
//! than from a config file format the spec never asked for.

use std::path::{Path, PathBuf};

use jsi_api_types::ChunkerPolicy;

/// Env var naming the node's home directory. Defaults to `./jsi-home`.
pub const ENV_HOME: &str = "JSI_HOME";
/// Env var naming this node's id, sent in the transfer handshake.
pub const ENV_NODE_ID: &str = "JSI_NODE_ID";

#[derive(Clone, Debug)]
pub struct Config {
    pub home: PathBuf,
    pub node_id: String,
    pub chunker: ChunkerPolicy,
    pub ingest: jsi_ingest::IngestConfig,
}

impl Config {
    /// Resolves configuration from the process environment, falling
    /// back to sane defaults for anything unset.
    pub fn from_env() -> Self {
        let home = std::env::var(ENV_HOME).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("jsi-home"));
        let node_id = std::env::var(ENV_NODE_ID).unwrap_or_else(|_| proxmox_uuid::Uuid::generate().to_string());
        Self {
            home,
            node_id,
            chunker: ChunkerPolicy::default(),
            ingest: jsi_ingest::IngestConfig::default(),
        }
    }

    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into(), ..Self::from_env() }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.home.join("data")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.home.join("metadata").join("store.db")
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.home.join("metadata")
    }
}

/// Creates `home` and its `metadata/` subdirectory. `data/` is left to
/// [`jsi_datastore::ChunkStore::create`], which owns laying out its own
/// 256 hex-prefix subdirectories and must not find a partial `data/`
/// dir left behind by us.
pub fn ensure_layout(home: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(home)?;
    std::fs::create_dir_all(home.join("metadata"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_home_overrides_only_home() {
        let cfg = Config::with_home("/tmp/example-home");
        assert_eq!(cfg.home, PathBuf::from("/tmp/example-home"));
        assert_eq!(cfg.data_dir(), PathBuf::from("/tmp/example-home/data"));
        assert_eq!(cfg.metadata_path(), PathBuf::from("/tmp/example-home/metadata/store.db"));
    }
}
