//! Backup operation (§6): scan, ingest, optionally verify.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Error;
use jsi_api_types::SnapshotId;
use jsi_ingest::{scan, IngestConfig, ScanOptions};

use crate::core::CoreHandle;

#[derive(Clone, Debug, Default)]
pub struct BackupOptions {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub include_hidden: bool,
    pub symlink_policy: jsi_api_types::SymlinkPolicy,
    pub chunk_size: Option<usize>,
    pub verify_after: bool,
}

#[derive(Debug)]
pub struct BackupReport {
    pub snapshot_id: SnapshotId,
    pub files: u64,
    pub bytes: u64,
    pub chunks: u64,
    pub failed_files: std::collections::HashMap<String, String>,
    pub verified: Option<bool>,
}

/// Backs up `source_path` as a new snapshot named `name`.
pub fn backup(core: &CoreHandle, source_path: &Path, name: &str, description: &str, options: &BackupOptions) -> Result<BackupReport, Error> {
    let scan_options = ScanOptions {
        include: options.include.clone(),
        exclude: options.exclude.clone(),
        include_hidden: options.include_hidden,
        symlink_policy: options.symlink_policy,
        max_depth: None,
    };
    let scanned = scan(source_path, &scan_options)?;

    let policy = match options.chunk_size {
        Some(size) => jsi_api_types::ChunkerPolicy::fixed(size),
        None => core.config.chunker,
    };

    let ingest_config: IngestConfig = core.config.ingest.clone();
    let cancel = Arc::new(AtomicBool::new(false));

    let summary = jsi_ingest::ingest(
        source_path,
        scanned.entries,
        Arc::clone(&core.store),
        Arc::clone(&core.metadata),
        Arc::clone(&core.inflight),
        policy,
        &ingest_config,
        name,
        description,
        cancel,
    )?;

    let snapshot_id = summary.snapshot_id.ok_or_else(|| anyhow::anyhow!("backup did not produce a completed snapshot"))?;

    let verified = if options.verify_after {
        let metadata = core.metadata.lock().unwrap();
        Some(jsi_datastore::verify_snapshot(&core.store, &metadata, &snapshot_id)?.all_ok())
    } else {
        None
    };

    Ok(BackupReport {
        snapshot_id,
        files: summary.file_count,
        bytes: summary.total_size,
        chunks: summary.chunk_count,
        failed_files: summary.failed_files,
        verified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CoreHandle;

    #[test]
    fn test_backup_round_trips_through_restore() {
        let home_dir = tempfile::tempdir().unwrap();
        let core = CoreHandle::open_ephemeral(home_dir.path()).unwrap();

        let src_dir = tempfile::tempdir().unwrap();
        std::fs::write(src_dir.path().join("hello.txt"), b"hello world").unwrap();

        let report = backup(&core, src_dir.path(), "nightly", "", &BackupOptions::default()).unwrap();
        assert_eq!(report.files, 1);
        assert_eq!(report.bytes, 11);

        let restore_dir = tempfile::tempdir().unwrap();
        let files = core.metadata.lock().unwrap().list_files(&report.snapshot_id).unwrap();
        let restore_report = jsi_ingest::restore(Arc::clone(&core.store), files, restore_dir.path(), &jsi_ingest::RestoreOptions::default()).unwrap();
        assert_eq!(restore_report.restored, 1);
        assert_eq!(std::fs::read(restore_dir.path().join("hello.txt")).unwrap(), b"hello world");
    }

    #[test]
    fn test_backup_with_verify_after_reports_verified() {
        let home_dir = tempfile::tempdir().unwrap();
        let core = CoreHandle::open_ephemeral(home_dir.path()).unwrap();

        let src_dir = tempfile::tempdir().unwrap();
        std::fs::write(src_dir.path().join("a.bin"), vec![0x41u8; 128]).unwrap();

        let options = BackupOptions { verify_after: true, ..Default::default() };
        let report = backup(&core, src_dir.path(), "verified-snap", "", &options).unwrap();
        assert_eq!(report.verified, Some(true));
    }
}
