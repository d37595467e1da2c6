//! C5: transactional metadata store (§4.5).
//!
//! The teacher has no relational store of its own — `BackupGroup`/
//! `BackupDir` identity and the manifest (`manifest.rs`) live as flat
//! files and JSON blobs under a directory convention. §4.5 explicitly
//! requires ACID transactions, secondary indexes, and foreign-key
//! cascade from snapshot to file to edge, none of which a flat-file
//! layout gives for free, so this module reaches for `rusqlite`
//! (bundled SQLite) instead. See DESIGN.md for the justification.

use anyhow::{bail, format_err, Context, Error};
use rusqlite::{params, Connection, OptionalExtension};

use jsi_api_types::{ChunkInfo, ChunkerPolicy, Digest, FileKind, FileRecord, Snapshot, SnapshotId, SnapshotStatus};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_SQL: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS schema (
    version INTEGER NOT NULL,
    applied_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS snapshots (
    snapshot_id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    status TEXT NOT NULL,
    file_count INTEGER NOT NULL,
    total_size INTEGER NOT NULL,
    chunk_count INTEGER NOT NULL,
    chunker_policy TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS files (
    file_id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_id TEXT NOT NULL REFERENCES snapshots(snapshot_id) ON DELETE CASCADE,
    path TEXT NOT NULL,
    size INTEGER NOT NULL,
    mtime_ns INTEGER NOT NULL,
    mode TEXT NOT NULL,
    kind TEXT NOT NULL,
    symlink_target TEXT,
    content_digest TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_files_snapshot_path ON files(snapshot_id, path);
CREATE INDEX IF NOT EXISTS idx_files_content_digest ON files(content_digest);

CREATE TABLE IF NOT EXISTS file_chunks (
    file_id INTEGER NOT NULL REFERENCES files(file_id) ON DELETE CASCADE,
    order_index INTEGER NOT NULL,
    chunk_digest TEXT NOT NULL,
    PRIMARY KEY (file_id, order_index)
);
CREATE INDEX IF NOT EXISTS idx_file_chunks_digest ON file_chunks(chunk_digest);

CREATE TABLE IF NOT EXISTS chunks (
    digest TEXT PRIMARY KEY,
    size INTEGER NOT NULL,
    first_seen_at INTEGER NOT NULL,
    refcount INTEGER NOT NULL,
    last_refcount_change INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chunks_refcount ON chunks(refcount);
CREATE INDEX IF NOT EXISTS idx_chunks_last_refcount_change ON chunks(last_refcount_change);
"#;

/// A chunk edge produced by the ingestion pipeline for one file, in
/// stream order.
#[derive(Clone, Debug)]
pub struct ChunkEdge {
    pub order_index: i64,
    pub digest: Digest,
    pub size: u64,
}

pub struct Stats {
    pub snapshot_count: u64,
    pub file_count: u64,
    pub chunk_count: u64,
    pub total_logical_bytes: u64,
}

/// Sort order for `list_snapshots`.
#[derive(Clone, Copy, Debug)]
pub enum SnapshotSort {
    CreatedAsc,
    CreatedDesc,
    Name,
}

pub struct MetadataStore {
    conn: Connection,
}

impl MetadataStore {
    pub fn open(path: &std::path::Path) -> Result<Self, Error> {
        let conn = Connection::open(path).with_context(|| format!("opening metadata store at {path:?}"))?;
        conn.execute_batch(SCHEMA_SQL)?;

        let current: Option<i64> = conn
            .query_row("SELECT version FROM schema ORDER BY version DESC LIMIT 1", [], |row| row.get(0))
            .optional()?;

        match current {
            None => {
                conn.execute(
                    "INSERT INTO schema (version, applied_at) VALUES (?1, ?2)",
                    params![SCHEMA_VERSION, now()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) if v < SCHEMA_VERSION => {
                bail!("metadata store schema {v} is older than supported version {SCHEMA_VERSION}; no migration defined yet");
            }
            Some(v) => bail!("metadata store schema {v} is newer than this build supports ({SCHEMA_VERSION})"),
        }

        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        conn.execute(
            "INSERT INTO schema (version, applied_at) VALUES (?1, ?2)",
            params![SCHEMA_VERSION, now()],
        )?;
        Ok(Self { conn })
    }

    /// Inserts a new snapshot row with `status = pending`. The row stays
    /// invisible to `list_snapshots` until `complete_snapshot` flips it.
    pub fn create_snapshot_pending(&mut self, name: &str, description: &str, chunker: ChunkerPolicy) -> Result<SnapshotId, Error> {
        let snapshot_id = SnapshotId::generate();
        let chunker_json = serde_json::to_string(&chunker)?;
        self.conn
            .execute(
                "INSERT INTO snapshots (snapshot_id, name, description, created_at, status, file_count, total_size, chunk_count, chunker_policy)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, 0, ?6)",
                params![snapshot_id.0, name, description, now(), SnapshotStatus::Pending.to_string(), chunker_json],
            )
            .map_err(|err| format_err!("creating snapshot '{name}' failed - {err}"))?;
        Ok(snapshot_id)
    }

    /// Adds one file and its chunk edges inside a single transaction:
    /// inserts the file row, inserts edges, increfs each referenced
    /// chunk (upserting new `chunks` rows with `first_seen_at` set once).
    pub fn add_file(&mut self, snapshot_id: &SnapshotId, record: &FileRecord, edges: &[ChunkEdge]) -> Result<i64, Error> {
        let tx = self.conn.transaction()?;
        let ts = now();

        tx.execute(
            "INSERT INTO files (snapshot_id, path, size, mtime_ns, mode, kind, symlink_target, content_digest)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                snapshot_id.0,
                record.path,
                record.size as i64,
                record.mtime_ns,
                record.mode,
                file_kind_str(record.kind),
                record.symlink_target,
                record.content_digest.to_hex(),
            ],
        )
        .map_err(|err| format_err!("inserting file '{}' failed - {err}", record.path))?;

        let file_id = tx.last_insert_rowid();

        for edge in edges {
            tx.execute(
                "INSERT INTO file_chunks (file_id, order_index, chunk_digest) VALUES (?1, ?2, ?3)",
                params![file_id, edge.order_index, edge.digest.to_hex()],
            )?;

            let updated = tx.execute(
                "UPDATE chunks SET refcount = refcount + 1, last_refcount_change = ?2 WHERE digest = ?1",
                params![edge.digest.to_hex(), ts],
            )?;
            if updated == 0 {
                tx.execute(
                    "INSERT INTO chunks (digest, size, first_seen_at, refcount, last_refcount_change) VALUES (?1, ?2, ?3, 1, ?3)",
                    params![edge.digest.to_hex(), edge.size as i64, ts],
                )?;
            }
        }

        tx.commit()?;
        Ok(file_id)
    }

    /// Flips a snapshot from `pending` to `completed` and stamps its
    /// aggregate counters, in one transaction.
    pub fn complete_snapshot(&mut self, snapshot_id: &SnapshotId, file_count: u64, total_size: u64, chunk_count: u64) -> Result<(), Error> {
        let changed = self.conn.execute(
            "UPDATE snapshots SET status = ?2, file_count = ?3, total_size = ?4, chunk_count = ?5 WHERE snapshot_id = ?1",
            params![
                snapshot_id.0,
                SnapshotStatus::Completed.to_string(),
                file_count as i64,
                total_size as i64,
                chunk_count as i64,
            ],
        )?;
        if changed == 0 {
            bail!("no such snapshot '{snapshot_id}'");
        }
        Ok(())
    }

    pub fn fail_snapshot(&mut self, snapshot_id: &SnapshotId) -> Result<(), Error> {
        self.conn.execute(
            "UPDATE snapshots SET status = ?2 WHERE snapshot_id = ?1",
            params![snapshot_id.0, SnapshotStatus::Failed.to_string()],
        )?;
        Ok(())
    }

    /// Deletes a snapshot and cascades: edges and file rows vanish via
    /// `ON DELETE CASCADE`; each referenced chunk is decref'd explicitly
    /// first, since SQLite cascade cannot run application-level refcount
    /// logic.
    pub fn delete_snapshot(&mut self, snapshot_id: &SnapshotId) -> Result<(), Error> {
        let tx = self.conn.transaction()?;
        let ts = now();

        {
            let mut stmt = tx.prepare(
                "SELECT fc.chunk_digest FROM file_chunks fc
                 JOIN files f ON f.file_id = fc.file_id
                 WHERE f.snapshot_id = ?1",
            )?;
            let digests: Vec<String> = stmt
                .query_map(params![snapshot_id.0], |row| row.get(0))?
                .collect::<Result<_, _>>()?;
            drop(stmt);

            for digest in digests {
                let updated = tx.execute(
                    "UPDATE chunks SET refcount = refcount - 1, last_refcount_change = ?2 WHERE digest = ?1 AND refcount > 0",
                    params![digest, ts],
                )?;
                if updated == 0 {
                    bail!("refcount underflow for chunk {digest} while deleting snapshot {snapshot_id}");
                }
            }
        }

        let changed = tx.execute("DELETE FROM snapshots WHERE snapshot_id = ?1", params![snapshot_id.0])?;
        if changed == 0 {
            bail!("no such snapshot '{snapshot_id}'");
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get_snapshot(&self, snapshot_id: &SnapshotId) -> Result<Snapshot, Error> {
        self.conn
            .query_row(
                "SELECT snapshot_id, name, description, created_at, status, file_count, total_size, chunk_count, chunker_policy
                 FROM snapshots WHERE snapshot_id = ?1",
                params![snapshot_id.0],
                row_to_snapshot,
            )
            .optional()?
            .ok_or_else(|| format_err!("no such snapshot '{snapshot_id}'"))
    }

    /// Only `completed` snapshots are visible here, per §4.5's isolation
    /// requirement that listings never show partial file sets.
    pub fn list_snapshots(&self, sort: SnapshotSort) -> Result<Vec<Snapshot>, Error> {
        let order_by = match sort {
            SnapshotSort::CreatedAsc => "created_at ASC",
            SnapshotSort::CreatedDesc => "created_at DESC",
            SnapshotSort::Name => "name ASC",
        };
        let sql = format!(
            "SELECT snapshot_id, name, description, created_at, status, file_count, total_size, chunk_count, chunker_policy
             FROM snapshots WHERE status = 'completed' ORDER BY {order_by}"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_snapshot)?;
        rows.collect::<Result<_, _>>().map_err(Error::from)
    }

    pub fn list_files(&self, snapshot_id: &SnapshotId) -> Result<Vec<FileRecord>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT file_id, snapshot_id, path, size, mtime_ns, mode, kind, symlink_target, content_digest
             FROM files WHERE snapshot_id = ?1 ORDER BY path ASC",
        )?;
        let files: Vec<(i64, String, i64, i64, String, String, Option<String>, String)> = stmt
            .query_map(params![snapshot_id.0], |row| {
                Ok((
                    row.get(0)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                ))
            })?
            .collect::<Result<_, _>>()?;

        let mut out = Vec::with_capacity(files.len());
        for (file_id, path, size, mtime_ns, mode, kind, symlink_target, content_digest) in files {
            let chunks = self.file_chunks(file_id)?;
            out.push(FileRecord {
                file_id,
                snapshot_id: snapshot_id.clone(),
                path,
                size: size as u64,
                mtime_ns,
                mode,
                kind: file_kind_from_str(&kind)?,
                symlink_target,
                content_digest: Digest::from_hex(&content_digest)?,
                chunks,
            });
        }
        Ok(out)
    }

    fn file_chunks(&self, file_id: i64) -> Result<Vec<Digest>, Error> {
        let mut stmt = self
            .conn
            .prepare("SELECT chunk_digest FROM file_chunks WHERE file_id = ?1 ORDER BY order_index ASC")?;
        let digests: Vec<String> = stmt.query_map(params![file_id], |row| row.get(0))?.collect::<Result<_, _>>()?;
        digests.iter().map(|d| Digest::from_hex(d)).collect()
    }

    pub fn get_chunk_info(&self, digest: &Digest) -> Result<Option<ChunkInfo>, Error> {
        self.conn
            .query_row(
                "SELECT digest, size, first_seen_at, refcount, last_refcount_change FROM chunks WHERE digest = ?1",
                params![digest.to_hex()],
                row_to_chunk_info,
            )
            .optional()
            .map_err(Error::from)
    }

    /// All chunks with `refcount = 0`, the GC sweep candidate set.
    pub fn unreferenced_chunks(&self) -> Result<Vec<ChunkInfo>, Error> {
        let mut stmt = self
            .conn
            .prepare("SELECT digest, size, first_seen_at, refcount, last_refcount_change FROM chunks WHERE refcount = 0")?;
        let rows = stmt.query_map([], row_to_chunk_info)?;
        rows.collect::<Result<_, _>>().map_err(Error::from)
    }

    pub fn forget_chunk(&mut self, digest: &Digest) -> Result<(), Error> {
        self.conn.execute("DELETE FROM chunks WHERE digest = ?1 AND refcount = 0", params![digest.to_hex()])?;
        Ok(())
    }

    /// Installs a snapshot received over the transfer protocol (§4.10):
    /// unlike `create_snapshot_pending`, the snapshot id and creation
    /// timestamp come from the sender's manifest rather than being
    /// generated locally, so replicated snapshots keep a stable identity
    /// across peers. Runs as one transaction so a crash mid-install
    /// leaves no partial snapshot visible.
    pub fn install_snapshot(
        &mut self,
        snapshot_id: &SnapshotId,
        name: &str,
        description: &str,
        created_at: i64,
        chunker: ChunkerPolicy,
        files: &[(FileRecord, Vec<ChunkEdge>)],
    ) -> Result<(), Error> {
        let tx = self.conn.transaction()?;
        let ts = now();
        let chunker_json = serde_json::to_string(&chunker)?;

        tx.execute(
            "INSERT INTO snapshots (snapshot_id, name, description, created_at, status, file_count, total_size, chunk_count, chunker_policy)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, 0, ?6)",
            params![snapshot_id.0, name, description, created_at, SnapshotStatus::Pending.to_string(), chunker_json],
        )
        .map_err(|err| format_err!("installing snapshot '{name}' failed - {err}"))?;

        let mut total_size = 0u64;
        let mut edge_count = 0u64;

        for (record, edges) in files {
            tx.execute(
                "INSERT INTO files (snapshot_id, path, size, mtime_ns, mode, kind, symlink_target, content_digest)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    snapshot_id.0,
                    record.path,
                    record.size as i64,
                    record.mtime_ns,
                    record.mode,
                    file_kind_str(record.kind),
                    record.symlink_target,
                    record.content_digest.to_hex(),
                ],
            )
            .map_err(|err| format_err!("installing file '{}' failed - {err}", record.path))?;
            let file_id = tx.last_insert_rowid();

            for edge in edges {
                tx.execute(
                    "INSERT INTO file_chunks (file_id, order_index, chunk_digest) VALUES (?1, ?2, ?3)",
                    params![file_id, edge.order_index, edge.digest.to_hex()],
                )?;

                let updated = tx.execute(
                    "UPDATE chunks SET refcount = refcount + 1, last_refcount_change = ?2 WHERE digest = ?1",
                    params![edge.digest.to_hex(), ts],
                )?;
                if updated == 0 {
                    tx.execute(
                        "INSERT INTO chunks (digest, size, first_seen_at, refcount, last_refcount_change) VALUES (?1, ?2, ?3, 1, ?3)",
                        params![edge.digest.to_hex(), edge.size as i64, ts],
                    )?;
                }
                edge_count += 1;
            }
            total_size += record.size;
        }

        tx.execute(
            "UPDATE snapshots SET status = ?2, file_count = ?3, total_size = ?4, chunk_count = ?5 WHERE snapshot_id = ?1",
            params![
                snapshot_id.0,
                SnapshotStatus::Completed.to_string(),
                files.len() as i64,
                total_size as i64,
                edge_count as i64,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn stats(&self) -> Result<Stats, Error> {
        let snapshot_count: i64 = self.conn.query_row("SELECT COUNT(*) FROM snapshots WHERE status = 'completed'", [], |row| row.get(0))?;
        let file_count: i64 = self.conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        let chunk_count: i64 = self.conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        let total_logical_bytes: i64 = self
            .conn
            .query_row("SELECT COALESCE(SUM(total_size), 0) FROM snapshots WHERE status = 'completed'", [], |row| row.get(0))?;
        Ok(Stats {
            snapshot_count: snapshot_count as u64,
            file_count: file_count as u64,
            chunk_count: chunk_count as u64,
            total_logical_bytes: total_logical_bytes as u64,
        })
    }
}

fn file_kind_str(kind: FileKind) -> &'static str {
    match kind {
        FileKind::Regular => "regular",
        FileKind::Symlink => "symlink",
    }
}

fn file_kind_from_str(s: &str) -> Result<FileKind, Error> {
    match s {
        "regular" => Ok(FileKind::Regular),
        "symlink" => Ok(FileKind::Symlink),
        other => bail!("unknown file kind '{other}' in metadata store"),
    }
}

fn row_to_snapshot(row: &rusqlite::Row) -> rusqlite::Result<Snapshot> {
    let status: String = row.get(4)?;
    let chunker_json: String = row.get(8)?;
    Ok(Snapshot {
        snapshot_id: SnapshotId(row.get(0)?),
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: row.get(3)?,
        status: status_from_str(&status),
        file_count: row.get::<_, i64>(5)? as u64,
        total_size: row.get::<_, i64>(6)? as u64,
        chunk_count: row.get::<_, i64>(7)? as u64,
        chunker: serde_json::from_str(&chunker_json).unwrap_or_default(),
    })
}

fn status_from_str(s: &str) -> SnapshotStatus {
    match s {
        "completed" => SnapshotStatus::Completed,
        "failed" => SnapshotStatus::Failed,
        _ => SnapshotStatus::Pending,
    }
}

fn row_to_chunk_info(row: &rusqlite::Row) -> rusqlite::Result<ChunkInfo> {
    let digest: String = row.get(0)?;
    Ok(ChunkInfo {
        digest: Digest::from_hex(&digest).map_err(|_| rusqlite::Error::InvalidQuery)?,
        size: row.get::<_, i64>(1)? as u64,
        first_seen_at: row.get(2)?,
        refcount: row.get::<_, i64>(3)? as u64,
        last_refcount_change: row.get(4)?,
    })
}

fn now() -> i64 {
    proxmox_time::epoch_i64()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file(snapshot_id: &SnapshotId, path: &str, digest: Digest) -> FileRecord {
        FileRecord {
            file_id: 0,
            snapshot_id: snapshot_id.clone(),
            path: path.to_string(),
            size: 8,
            mtime_ns: 0,
            mode: "100644".to_string(),
            kind: FileKind::Regular,
            symlink_target: None,
            content_digest: digest,
            chunks: vec![digest],
        }
    }

    #[test]
    fn test_pending_snapshot_hidden_until_completed() {
        let mut store = MetadataStore::open_in_memory().unwrap();
        let snapshot_id = store.create_snapshot_pending("nightly", "", ChunkerPolicy::default()).unwrap();
        assert!(store.list_snapshots(SnapshotSort::Name).unwrap().is_empty());

        store.complete_snapshot(&snapshot_id, 0, 0, 0).unwrap();
        let listed = store.list_snapshots(SnapshotSort::Name).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, SnapshotStatus::Completed);
    }

    #[test]
    fn test_add_file_increfs_shared_chunk() {
        let mut store = MetadataStore::open_in_memory().unwrap();
        let snapshot_id = store.create_snapshot_pending("s1", "", ChunkerPolicy::default()).unwrap();
        let digest = Digest::new([9u8; 32]);
        let edge = ChunkEdge {
            order_index: 0,
            digest,
            size: 8,
        };

        store.add_file(&snapshot_id, &sample_file(&snapshot_id, "a.txt", digest), &[edge.clone()]).unwrap();
        store.add_file(&snapshot_id, &sample_file(&snapshot_id, "b.txt", digest), &[edge]).unwrap();

        let info = store.get_chunk_info(&digest).unwrap().unwrap();
        assert_eq!(info.refcount, 2);
    }

    #[test]
    fn test_delete_snapshot_decrefs_and_cascades() {
        let mut store = MetadataStore::open_in_memory().unwrap();
        let snapshot_id = store.create_snapshot_pending("s1", "", ChunkerPolicy::default()).unwrap();
        let digest = Digest::new([3u8; 32]);
        let edge = ChunkEdge {
            order_index: 0,
            digest,
            size: 8,
        };
        store.add_file(&snapshot_id, &sample_file(&snapshot_id, "a.txt", digest), &[edge]).unwrap();
        store.complete_snapshot(&snapshot_id, 1, 8, 1).unwrap();

        store.delete_snapshot(&snapshot_id).unwrap();

        assert!(store.get_snapshot(&snapshot_id).is_err());
        let info = store.get_chunk_info(&digest).unwrap().unwrap();
        assert_eq!(info.refcount, 0);
    }

    #[test]
    fn test_unreferenced_chunks_lists_zero_refcount() {
        let mut store = MetadataStore::open_in_memory().unwrap();
        let snapshot_id = store.create_snapshot_pending("s1", "", ChunkerPolicy::default()).unwrap();
        let digest = Digest::new([1u8; 32]);
        let edge = ChunkEdge {
            order_index: 0,
            digest,
            size: 8,
        };
        store.add_file(&snapshot_id, &sample_file(&snapshot_id, "a.txt", digest), &[edge]).unwrap();
        store.delete_snapshot(&snapshot_id).unwrap();

        let unreferenced = store.unreferenced_chunks().unwrap();
        assert_eq!(unreferenced.len(), 1);
        assert_eq!(unreferenced[0].digest, digest);
    }

    #[test]
    fn test_install_snapshot_is_immediately_completed() {
        let mut store = MetadataStore::open_in_memory().unwrap();
        let snapshot_id = SnapshotId::from("remote-snap-1".to_string());
        let digest = Digest::new([5u8; 32]);
        let file = sample_file(&snapshot_id, "a.txt", digest);
        let edge = ChunkEdge {
            order_index: 0,
            digest,
            size: 8,
        };

        store
            .install_snapshot(&snapshot_id, "nightly", "", 1000, ChunkerPolicy::default(), &[(file, vec![edge])])
            .unwrap();

        let snapshot = store.get_snapshot(&snapshot_id).unwrap();
        assert_eq!(snapshot.status, SnapshotStatus::Completed);
        assert_eq!(snapshot.file_count, 1);
        let info = store.get_chunk_info(&digest).unwrap().unwrap();
        assert_eq!(info.refcount, 1);
    }
}
