//! Transfer operations (§6): `push`, `pull`, `serve`, wiring
//! `jsi-transfer`'s connection/sender/receiver state machines to a
//! [`crate::core::CoreHandle`]'s store and metadata.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Error;

use jsi_api_types::SnapshotId;
use jsi_transfer::{PushSummary, ServeHandle};

use crate::core::CoreHandle;

const DEFAULT_MAX_RETRIES: u32 = 5;

pub async fn push(core: &CoreHandle, snapshot_id: &SnapshotId, peer: SocketAddr) -> Result<PushSummary, Error> {
    jsi_transfer::push(snapshot_id, peer, &core.config.node_id, Arc::clone(&core.store), Arc::clone(&core.metadata), DEFAULT_MAX_RETRIES).await
}

pub async fn pull(core: &CoreHandle, snapshot_id: &SnapshotId, peer: SocketAddr) -> Result<(), Error> {
    jsi_transfer::pull(snapshot_id, peer, &core.config.node_id, Arc::clone(&core.store), Arc::clone(&core.metadata)).await
}

/// Starts accepting incoming push/pull connections on `listen_addr` in
/// the background; returns a handle the caller can later `stop()`.
pub async fn serve(core: &CoreHandle, listen_addr: SocketAddr) -> Result<ServeHandle, Error> {
    jsi_transfer::serve(listen_addr, core.config.node_id.clone(), Arc::clone(&core.store), Arc::clone(&core.metadata)).await
}
