//! Consumer-facing operations (§6): thin, typed wrappers over the
//! `jsi-*` crates, each taking a [`crate::core::CoreHandle`] the way the
//! teacher's `api2` handlers take a `&DataStore` — except these are
//! plain async/sync functions instead of REST endpoints, since the
//! spec asks for operations to be "exposed by whichever front-end
//! wraps the core," not for a specific HTTP surface.

pub mod backup;
pub mod gc;
pub mod restore;
pub mod snapshot;
pub mod transfer;

pub use backup::{backup, BackupOptions, BackupReport};
pub use gc::run_gc;
pub use restore::restore;
pub use snapshot::{delete_snapshot, info_snapshot, list_snapshots, verify_snapshot, SnapshotInfo, VerifyOptions, VerifyReport};
pub use transfer::{pull, push, serve};
