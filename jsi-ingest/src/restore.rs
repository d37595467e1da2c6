//! C8: restore pipeline (§4.8).
//!
//! Per-file writes are sequential (fetch each chunk in order, write to a
//! temp path, atomic-rename into place) with the same temp-write-then-
//! rename discipline `ChunkStore::put` uses; parallelism is across
//! files, driven by a worker pool in the shape of `ParallelHandler`.

use std::collections::HashMap;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{format_err, Error};
use crossbeam_channel::bounded;
use pathpatterns::{MatchEntry, MatchList, MatchType, PatternFlag};

use jsi_api_types::{FileKind, FileRecord};
use jsi_datastore::{hash_bytes, ChunkStore, StreamingHasher};

#[derive(Clone, Debug, Default)]
pub struct RestoreOptions {
    pub overwrite_existing: bool,
    pub backup_existing: bool,
    pub preserve_attributes: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub workers: usize,
}

#[derive(Debug, Default)]
pub struct RestoreReport {
    pub restored: u64,
    pub skipped: u64,
    pub failed: HashMap<String, String>,
    pub verified: bool,
}

fn build_match_list(options: &RestoreOptions) -> Result<Vec<MatchEntry>, Error> {
    let mut patterns = Vec::new();
    for pattern in &options.include {
        patterns.push(MatchEntry::parse_pattern(pattern, PatternFlag::PATH_NAME, MatchType::Include)?);
    }
    for pattern in &options.exclude {
        patterns.push(MatchEntry::parse_pattern(pattern, PatternFlag::PATH_NAME, MatchType::Exclude)?);
    }
    Ok(patterns)
}

/// Restores every file record to `target_dir`, in scanner order.
pub fn restore(store: Arc<ChunkStore>, files: Vec<FileRecord>, target_dir: &Path, options: &RestoreOptions) -> Result<RestoreReport, Error> {
    let patterns = build_match_list(options)?;
    std::fs::create_dir_all(target_dir)?;

    let workers = options.workers.max(1);
    let (tx, rx) = bounded::<FileRecord>(files.len().max(1));

    let mut skipped = 0u64;
    for file in files {
        let match_path = Path::new("/").join(&file.path);
        let excluded = matches!(
            patterns.matches(match_path.as_os_str().to_string_lossy().as_bytes(), || Ok::<_, std::convert::Infallible>(0)),
            Ok(Some(MatchType::Exclude))
        );
        if excluded {
            skipped += 1;
            continue;
        }
        tx.send(file).map_err(|_| format_err!("restore queue unexpectedly closed"))?;
    }
    drop(tx);

    let restored = Arc::new(Mutex::new(0u64));
    let failed: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));
    let all_verified = Arc::new(Mutex::new(true));

    let mut handles = Vec::new();
    for _ in 0..workers {
        let rx = rx.clone();
        let store = Arc::clone(&store);
        let target_dir = target_dir.to_path_buf();
        let options = options.clone();
        let restored = Arc::clone(&restored);
        let failed = Arc::clone(&failed);
        let all_verified = Arc::clone(&all_verified);

        handles.push(std::thread::spawn(move || {
            while let Ok(file) = rx.recv() {
                match restore_file(&store, &file, &target_dir, &options) {
                    Ok(true) => *restored.lock().unwrap() += 1,
                    Ok(false) => *all_verified.lock().unwrap() = false,
                    Err(err) => {
                        failed.lock().unwrap().insert(file.path.clone(), err.to_string());
                        *all_verified.lock().unwrap() = false;
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.join().map_err(|_| format_err!("restore worker thread panicked"))?;
    }

    let restored = *restored.lock().unwrap();
    let failed = Arc::try_unwrap(failed).unwrap().into_inner().unwrap();
    let verified = *all_verified.lock().unwrap() && failed.is_empty();

    Ok(RestoreReport {
        restored,
        skipped,
        failed,
        verified,
    })
}

/// Restores one file. Returns `Ok(true)` on a fully verified write,
/// `Ok(false)` if the write completed but post-write verification
/// failed (not itself an error — surfaced via `RestoreReport::verified`).
fn restore_file(store: &ChunkStore, file: &FileRecord, target_dir: &Path, options: &RestoreOptions) -> Result<bool, Error> {
    let target_path = target_dir.join(file.path.trim_start_matches('/'));
    if let Some(parent) = target_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if target_path.exists() {
        if options.backup_existing {
            let backup_path = target_path.with_extension(format!("bak.{}", proxmox_time::epoch_i64()));
            std::fs::rename(&target_path, backup_path)?;
        } else if !options.overwrite_existing {
            return Err(format_err!("{:?} already exists and overwrite_existing is false", target_path));
        }
    }

    match file.kind {
        FileKind::Symlink => {
            let target = file
                .symlink_target
                .as_ref()
                .ok_or_else(|| format_err!("symlink file record for {} has no target", file.path))?;
            if target_path.exists() || target_path.symlink_metadata().is_ok() {
                std::fs::remove_file(&target_path).ok();
            }
            symlink(target, &target_path)?;
            Ok(true)
        }
        FileKind::Regular => {
            let tmp_path = target_path.with_extension("jsi-restore-tmp");
            let mut hasher = StreamingHasher::new();
            {
                let mut out = std::fs::File::create(&tmp_path)?;
                use std::io::Write;
                for digest in &file.chunks {
                    let chunk = store.get(digest)?;
                    hasher.update(&chunk.data);
                    out.write_all(&chunk.data)?;
                }
            }
            std::fs::rename(&tmp_path, &target_path)?;

            if options.preserve_attributes {
                apply_attributes(&target_path, file)?;
            }

            let recomputed = hasher.finalize();
            Ok(recomputed == file.content_digest)
        }
    }
}

fn apply_attributes(path: &Path, file: &FileRecord) -> Result<(), Error> {
    if let Ok(mode) = u32::from_str_radix(&file.mode, 8) {
        let perms = std::fs::Permissions::from_mode(mode & 0o7777);
        std::fs::set_permissions(path, perms)?;
    }

    let mtime_ns = file.mtime_ns.max(0);
    let times: [libc::timespec; 2] = [
        libc::timespec {
            tv_sec: 0,
            tv_nsec: (1 << 30) - 1, // UTIME_NOW: leave access time alone
        },
        libc::timespec {
            tv_sec: mtime_ns / 1_000_000_000,
            tv_nsec: mtime_ns % 1_000_000_000,
        },
    ];

    use nix::NixPath;
    let res = path.with_nix_path(|cstr| unsafe { libc::utimensat(libc::AT_FDCWD, cstr.as_ptr(), &times[0], 0) })?;
    nix::errno::Errno::result(res).map_err(|err| format_err!("setting mtime on {path:?} failed - {err}"))?;

    Ok(())
}

use std::os::unix::fs::PermissionsExt;

#[cfg(test)]
mod tests {
    use super::*;
    use jsi_api_types::{ChunkerPolicy, SnapshotId};
    use jsi_datastore::{ChunkEdge, MetadataStore};

    fn setup_one_file_snapshot() -> (tempfile::TempDir, Arc<ChunkStore>, FileRecord) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ChunkStore::create(dir.path()).unwrap());
        let data = b"restore me";
        let digest = hash_bytes(data);
        store.put(&digest, data, false).unwrap();

        let mut metadata = MetadataStore::open_in_memory().unwrap();
        let snapshot_id: SnapshotId = metadata.create_snapshot_pending("s", "", ChunkerPolicy::default()).unwrap();
        let record = FileRecord {
            file_id: 0,
            snapshot_id: snapshot_id.clone(),
            path: "greeting.txt".to_string(),
            size: data.len() as u64,
            mtime_ns: 0,
            mode: "100644".to_string(),
            kind: FileKind::Regular,
            symlink_target: None,
            content_digest: digest,
            chunks: vec![digest],
        };
        let edge = ChunkEdge {
            order_index: 0,
            digest,
            size: data.len() as u64,
        };
        metadata.add_file(&snapshot_id, &record, &[edge]).unwrap();

        (dir, store, record)
    }

    #[test]
    fn test_restore_writes_and_verifies_file() {
        let (_store_dir, store, record) = setup_one_file_snapshot();
        let target_dir = tempfile::tempdir().unwrap();

        let report = restore(store, vec![record], target_dir.path(), &RestoreOptions::default()).unwrap();
        assert_eq!(report.restored, 1);
        assert!(report.verified);
        assert_eq!(std::fs::read(target_dir.path().join("greeting.txt")).unwrap(), b"restore me");
    }

    #[test]
    fn test_restore_refuses_overwrite_without_flag() {
        let (_store_dir, store, record) = setup_one_file_snapshot();
        let target_dir = tempfile::tempdir().unwrap();
        std::fs::write(target_dir.path().join("greeting.txt"), b"existing").unwrap();

        let report = restore(store, vec![record], target_dir.path(), &RestoreOptions::default()).unwrap();
        assert_eq!(report.restored, 0);
        assert_eq!(report.failed.len(), 1);
    }

    #[test]
    fn test_restore_excludes_matching_paths() {
        let (_store_dir, store, record) = setup_one_file_snapshot();
        let target_dir = tempfile::tempdir().unwrap();

        let options = RestoreOptions {
            exclude: vec!["**/greeting.txt".to_string()],
            ..RestoreOptions::default()
        };
        let report = restore(store, vec![record], target_dir.path(), &options).unwrap();
        assert_eq!(report.skipped, 1);
        assert!(!target_dir.path().join("greeting.txt").exists());
    }
}
