//! End-to-end scenarios and testable properties exercised through the
//! public `ops` API against a real on-disk [`justsyncit::core::CoreHandle`].

use std::path::Path;
use std::sync::Arc;

use justsyncit::config::Config;
use justsyncit::core::CoreHandle;
use justsyncit::ops::backup::{backup, BackupOptions};
use justsyncit::ops::gc::run_gc;
use justsyncit::ops::restore::restore;
use justsyncit::ops::snapshot::{delete_snapshot, list_snapshots, verify_snapshot, VerifyOptions};

use jsi_datastore::SnapshotSort;
use jsi_ingest::RestoreOptions;

const CHUNK_SIZE: usize = 64;

fn open_core() -> (tempfile::TempDir, CoreHandle) {
    let home = tempfile::tempdir().unwrap();
    let core = CoreHandle::open(Config::with_home(home.path())).unwrap();
    (home, core)
}

fn chunk_path(home: &Path, digest: &jsi_api_types::Digest) -> std::path::PathBuf {
    let canonical = std::fs::canonicalize(home).unwrap();
    let hex = digest.to_hex();
    canonical.join("data").join(&hex[0..2]).join(&hex)
}

fn write_pattern_file(dir: &Path, name: &str, byte: u8, len: usize) {
    std::fs::write(dir.join(name), vec![byte; len]).unwrap();
}

#[test]
fn property_round_trip_preserves_bytes_and_order() {
    let (_home, core) = open_core();
    let src = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(src.path().join("sub")).unwrap();
    std::fs::write(src.path().join("a.txt"), b"alpha").unwrap();
    std::fs::write(src.path().join("sub/b.txt"), b"beta").unwrap();
    std::fs::write(src.path().join("empty.txt"), b"").unwrap();

    let report = backup(&core, src.path(), "rt", "", &BackupOptions::default()).unwrap();

    let files = core.metadata.lock().unwrap().list_files(&report.snapshot_id).unwrap();
    // Property 9 (ordering): scanner emits in sorted path order, and
    // list_files must preserve it.
    let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
    let mut sorted = paths.clone();
    sorted.sort();
    assert_eq!(paths, sorted);

    // Property 10 (empty file).
    let empty = files.iter().find(|f| f.path == "empty.txt").unwrap();
    assert!(empty.chunks.is_empty());
    assert_eq!(empty.size, 0);
    assert_eq!(empty.content_digest, jsi_datastore::hash_bytes(b""));

    let dest = tempfile::tempdir().unwrap();
    let restore_report = restore(&core, &report.snapshot_id, dest.path(), &RestoreOptions::default(), true).unwrap();
    assert_eq!(restore_report.restored, 3);
    assert!(restore_report.verified);
    assert_eq!(std::fs::read(dest.path().join("a.txt")).unwrap(), b"alpha");
    assert_eq!(std::fs::read(dest.path().join("sub/b.txt")).unwrap(), b"beta");
    assert_eq!(std::fs::read(dest.path().join("empty.txt")).unwrap(), b"");
}

#[test]
fn scenario_a_identical_files_dedup() {
    let (_home, core) = open_core();
    let src = tempfile::tempdir().unwrap();
    for name in ["f1.bin", "f2.bin", "f3.bin"] {
        write_pattern_file(src.path(), name, b'A', 4 * CHUNK_SIZE);
    }

    let options = BackupOptions { chunk_size: Some(CHUNK_SIZE), ..Default::default() };
    let report = backup(&core, src.path(), "scenario-a", "", &options).unwrap();
    assert_eq!(report.files, 3);

    let metadata = core.metadata.lock().unwrap();
    let files = metadata.list_files(&report.snapshot_id).unwrap();
    let distinct: std::collections::HashSet<_> = files.iter().flat_map(|f| f.chunks.iter().copied()).collect();
    assert_eq!(distinct.len(), 4);
    for digest in &distinct {
        let info = metadata.get_chunk_info(digest).unwrap().unwrap();
        assert_eq!(info.refcount, 3);
    }
}

#[test]
fn scenario_b_partial_overlap_refcounts() {
    let (_home, core) = open_core();
    let src = tempfile::tempdir().unwrap();

    let k = 2;
    let shared: Vec<u8> = (0..k * CHUNK_SIZE).map(|_| b'X').collect();
    for (name, unique_byte) in [("f1.bin", b'1'), ("f2.bin", b'2'), ("f3.bin", b'3')] {
        let mut content = shared.clone();
        content.extend(std::iter::repeat(unique_byte).take(CHUNK_SIZE));
        std::fs::write(src.path().join(name), content).unwrap();
    }

    let options = BackupOptions { chunk_size: Some(CHUNK_SIZE), ..Default::default() };
    let report = backup(&core, src.path(), "scenario-b", "", &options).unwrap();

    let metadata = core.metadata.lock().unwrap();
    let files = metadata.list_files(&report.snapshot_id).unwrap();
    let distinct: std::collections::HashSet<_> = files.iter().flat_map(|f| f.chunks.iter().copied()).collect();
    assert_eq!(distinct.len(), k + 3);

    let mut shared_count = 0;
    let mut unique_count = 0;
    for digest in &distinct {
        let refcount = metadata.get_chunk_info(digest).unwrap().unwrap().refcount;
        if refcount == 3 {
            shared_count += 1;
        } else {
            assert_eq!(refcount, 1);
            unique_count += 1;
        }
    }
    assert_eq!(shared_count, k);
    assert_eq!(unique_count, 3);
}

#[test]
fn scenario_c_delete_cascade_and_gc() {
    let (_home, core) = open_core();
    let src = tempfile::tempdir().unwrap();

    let k = 2;
    let shared: Vec<u8> = (0..k * CHUNK_SIZE).map(|_| b'X').collect();
    for (name, unique_byte) in [("f1.bin", b'1'), ("f2.bin", b'2'), ("f3.bin", b'3')] {
        let mut content = shared.clone();
        content.extend(std::iter::repeat(unique_byte).take(CHUNK_SIZE));
        std::fs::write(src.path().join(name), content).unwrap();
    }

    let options = BackupOptions { chunk_size: Some(CHUNK_SIZE), ..Default::default() };
    let report = backup(&core, src.path(), "scenario-c", "", &options).unwrap();

    delete_snapshot(&core, &report.snapshot_id).unwrap();
    assert!(list_snapshots(&core, SnapshotSort::CreatedAsc).unwrap().is_empty());

    let gc_result = run_gc(&core, 0).unwrap();
    assert_eq!(gc_result.removed, (k + 3) as u64);
    assert!(core.metadata.lock().unwrap().unreferenced_chunks().unwrap().is_empty());
}

#[test]
fn scenario_d_corruption_detection() {
    let (home, core) = open_core();
    let src = tempfile::tempdir().unwrap();
    for name in ["f1.bin", "f2.bin", "f3.bin"] {
        write_pattern_file(src.path(), name, b'A', 4 * CHUNK_SIZE);
    }
    let options = BackupOptions { chunk_size: Some(CHUNK_SIZE), ..Default::default() };
    let report = backup(&core, src.path(), "scenario-d", "", &options).unwrap();

    let digest = {
        let metadata = core.metadata.lock().unwrap();
        let files = metadata.list_files(&report.snapshot_id).unwrap();
        files[0].chunks[0]
    };

    let path = chunk_path(home.path(), &digest);
    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&path, bytes).unwrap();

    let verify_report = verify_snapshot(&core, &report.snapshot_id, VerifyOptions::default()).unwrap();
    assert!(!verify_report.verified);
    let corrupted = verify_report.chunk_report.as_ref().unwrap();
    assert_eq!(corrupted.corrupted.len(), 1);
    assert_eq!(corrupted.corrupted[0], digest);

    let dest = tempfile::tempdir().unwrap();
    let restore_report = restore(&core, &report.snapshot_id, dest.path(), &RestoreOptions::default(), true).unwrap();
    assert!(!restore_report.verified);
    assert!(!restore_report.failed.is_empty());
}

#[test]
fn scenario_f_concurrent_identical_ingestion() {
    let home = tempfile::tempdir().unwrap();
    let core = Arc::new(CoreHandle::open(Config::with_home(home.path())).unwrap());
    let src = tempfile::tempdir().unwrap();
    write_pattern_file(src.path(), "only.bin", b'A', 4 * CHUNK_SIZE);

    let options = BackupOptions { chunk_size: Some(CHUNK_SIZE), ..Default::default() };

    let core1 = Arc::clone(&core);
    let src1 = src.path().to_path_buf();
    let options1 = options.clone();
    let t1 = std::thread::spawn(move || backup(&core1, &src1, "concurrent-1", "", &options1).unwrap());

    let core2 = Arc::clone(&core);
    let src2 = src.path().to_path_buf();
    let options2 = options.clone();
    let t2 = std::thread::spawn(move || backup(&core2, &src2, "concurrent-2", "", &options2).unwrap());

    let r1 = t1.join().unwrap();
    let r2 = t2.join().unwrap();
    assert_ne!(r1.snapshot_id.to_string(), r2.snapshot_id.to_string());

    let metadata = core.metadata.lock().unwrap();
    let files = metadata.list_files(&r1.snapshot_id).unwrap();
    for digest in &files[0].chunks {
        assert_eq!(metadata.get_chunk_info(digest).unwrap().unwrap().refcount, 2);
    }

    let snapshots = metadata.list_snapshots(SnapshotSort::Name).unwrap();
    assert_eq!(snapshots.len(), 2);
}
