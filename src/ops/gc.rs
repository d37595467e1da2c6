//! Garbage collection operation (§6): `gc(grace_seconds)`.

use anyhow::Error;

use jsi_datastore::GcResult;

use crate::core::CoreHandle;

pub fn run_gc(core: &CoreHandle, grace_seconds: i64) -> Result<GcResult, Error> {
    let mut metadata = core.metadata.lock().unwrap();
    jsi_datastore::gc(&core.store, &mut metadata, grace_seconds, &core.gc_lease)
}
