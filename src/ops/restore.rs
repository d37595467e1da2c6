//! Restore operation (§6): fetch a snapshot's files from the chunk
//! store into a target directory, optionally verifying as it goes.

use std::path::Path;
use std::sync::Arc;

use anyhow::Error;
use jsi_api_types::SnapshotId;
use jsi_ingest::{RestoreOptions, RestoreReport};

use crate::core::CoreHandle;

/// Restores `snapshot_id` to `target_path`. `options.verify` additionally
/// re-verifies the snapshot's chunks before copying any bytes out.
pub fn restore(core: &CoreHandle, snapshot_id: &SnapshotId, target_path: &Path, options: &RestoreOptions, verify: bool) -> Result<RestoreReport, Error> {
    let files = {
        let metadata = core.metadata.lock().unwrap();
        metadata.list_files(snapshot_id)?
    };

    let mut report = jsi_ingest::restore(Arc::clone(&core.store), files, target_path, options)?;

    if verify {
        let metadata = core.metadata.lock().unwrap();
        let verify_report = jsi_datastore::verify_snapshot(&core.store, &metadata, snapshot_id)?;
        report.verified = verify_report.all_ok();
        for file in verify_report.files.iter().filter(|f| !f.ok) {
            report
                .failed
                .entry(file.path.clone())
                .or_insert_with(|| file.reason.clone().unwrap_or_else(|| "verification failed".to_string()));
        }
    }

    Ok(report)
}
