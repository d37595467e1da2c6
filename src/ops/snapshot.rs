//! Snapshot management operations (§6): list, info, delete, verify.

use anyhow::Error;

use jsi_api_types::{FileRecord, Snapshot, SnapshotId};
use jsi_datastore::{ChunkVerifyReport, SnapshotSort};

use crate::core::CoreHandle;

pub fn list_snapshots(core: &CoreHandle, sort: SnapshotSort) -> Result<Vec<Snapshot>, Error> {
    core.metadata.lock().unwrap().list_snapshots(sort)
}

#[derive(Debug)]
pub struct SnapshotInfo {
    pub snapshot: Snapshot,
    pub files: Vec<FileRecord>,
}

/// Fetches a snapshot plus, unconditionally, its file list — callers
/// that only need the header can ignore `files`.
pub fn info_snapshot(core: &CoreHandle, snapshot_id: &SnapshotId) -> Result<SnapshotInfo, Error> {
    let metadata = core.metadata.lock().unwrap();
    let snapshot = metadata.get_snapshot(snapshot_id)?;
    let files = metadata.list_files(snapshot_id)?;
    Ok(SnapshotInfo { snapshot, files })
}

pub fn delete_snapshot(core: &CoreHandle, snapshot_id: &SnapshotId) -> Result<(), Error> {
    core.metadata.lock().unwrap().delete_snapshot(snapshot_id)
}

#[derive(Clone, Copy, Debug, Default)]
pub struct VerifyOptions {
    pub chunk_verify: bool,
    pub file_hash_verify: bool,
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub verified: bool,
    pub issues: Vec<String>,
    pub chunk_report: Option<ChunkVerifyReport>,
}

/// Verifies `snapshot_id` per `options`. With neither flag set, verifies
/// both (the conservative default), matching §4.9's "verifier soundness"
/// property, which is defined over the full chunk-and-file check.
pub fn verify_snapshot(core: &CoreHandle, snapshot_id: &SnapshotId, options: VerifyOptions) -> Result<VerifyReport, Error> {
    let run_chunks = options.chunk_verify || !options.file_hash_verify;
    let run_files = options.file_hash_verify || !options.chunk_verify;

    let mut report = VerifyReport::default();
    let mut verified = true;

    if run_chunks {
        let chunk_report = jsi_datastore::verify_all_chunks(&core.store)?;
        for digest in &chunk_report.corrupted {
            verified = false;
            report.issues.push(format!("corrupt chunk {}", digest.to_hex()));
        }
        report.chunk_report = Some(chunk_report);
    }

    if run_files {
        let metadata = core.metadata.lock().unwrap();
        let file_report = jsi_datastore::verify_snapshot(&core.store, &metadata, snapshot_id)?;
        for file in file_report.files.iter().filter(|f| !f.ok) {
            verified = false;
            report.issues.push(format!("{}: {}", file.path, file.reason.clone().unwrap_or_default()));
        }
    }

    report.verified = verified;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::backup::{backup, BackupOptions};

    fn core_with_one_backup() -> (tempfile::TempDir, CoreHandle, SnapshotId) {
        let home_dir = tempfile::tempdir().unwrap();
        let core = CoreHandle::open_ephemeral(home_dir.path()).unwrap();
        let src_dir = tempfile::tempdir().unwrap();
        std::fs::write(src_dir.path().join("f.txt"), b"abc").unwrap();
        let report = backup(&core, src_dir.path(), "snap", "", &BackupOptions::default()).unwrap();
        (home_dir, core, report.snapshot_id)
    }

    #[test]
    fn test_list_info_delete_round_trip() {
        let (_home, core, snapshot_id) = core_with_one_backup();

        let listed = list_snapshots(&core, SnapshotSort::CreatedDesc).unwrap();
        assert_eq!(listed.len(), 1);

        let info = info_snapshot(&core, &snapshot_id).unwrap();
        assert_eq!(info.files.len(), 1);

        delete_snapshot(&core, &snapshot_id).unwrap();
        assert!(list_snapshots(&core, SnapshotSort::CreatedDesc).unwrap().is_empty());
    }

    #[test]
    fn test_verify_snapshot_reports_clean() {
        let (_home, core, snapshot_id) = core_with_one_backup();
        let report = verify_snapshot(&core, &snapshot_id, VerifyOptions::default()).unwrap();
        assert!(report.verified);
        assert!(report.issues.is_empty());
    }
}
