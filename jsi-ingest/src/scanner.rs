//! C6: filesystem scanner (§4.6).
//!
//! The teacher walks directories with `walkdir` wherever a single
//! linear pass is enough (`list_images` in `pbs-datastore/src/datastore.rs`,
//! the GC directory sweep). Here each entry's continuation depends on
//! its own `SymlinkPolicy` — `follow` recurses through a symlink,
//! `record`/`skip` never do — so the walk is a small hand-rolled
//! recursion instead of a single `WalkDir` iterator, while include/
//! exclude matching still goes through `pathpatterns`, same as the
//! teacher's pxar archiver.

use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use pathpatterns::{MatchEntry, MatchList, MatchType, PatternFlag};

use jsi_api_types::{FileKind, ScanError, SymlinkPolicy};

#[derive(Clone, Debug)]
pub struct ScanOptions {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub include_hidden: bool,
    pub symlink_policy: SymlinkPolicy,
    pub max_depth: Option<usize>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            include_hidden: false,
            symlink_policy: SymlinkPolicy::default(),
            max_depth: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ScanEntry {
    pub path: String,
    pub size: u64,
    pub mtime_ns: i64,
    pub mode: String,
    pub kind: FileKind,
    pub symlink_target: Option<String>,
}

#[derive(Default)]
pub struct ScanResult {
    pub entries: Vec<ScanEntry>,
    pub errors: Vec<ScanError>,
}

fn build_match_list(options: &ScanOptions) -> Result<Vec<MatchEntry>, Error> {
    let mut patterns = Vec::new();
    for pattern in &options.include {
        patterns.push(MatchEntry::parse_pattern(pattern, PatternFlag::PATH_NAME, MatchType::Include)?);
    }
    // Exclude patterns are pushed after includes so they win on conflict,
    // matching pathpatterns's last-match-wins evaluation order.
    for pattern in &options.exclude {
        patterns.push(MatchEntry::parse_pattern(pattern, PatternFlag::PATH_NAME, MatchType::Exclude)?);
    }
    Ok(patterns)
}

/// Walks `root`, producing entries in lexicographic order by normalized
/// path. Per-entry I/O failures are collected as [`ScanError`] rather
/// than aborting the scan.
pub fn scan(root: &Path, options: &ScanOptions) -> Result<ScanResult, Error> {
    let patterns = build_match_list(options)?;
    let mut result = ScanResult::default();
    let mut ancestors = HashSet::new();

    if let Ok(canonical) = std::fs::canonicalize(root) {
        ancestors.insert(canonical);
    }

    walk_dir(root, root, &patterns, options, 0, &mut ancestors, &mut result);
    result.entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(result)
}

fn walk_dir(
    root: &Path,
    dir: &Path,
    patterns: &[MatchEntry],
    options: &ScanOptions,
    depth: usize,
    ancestors: &mut HashSet<PathBuf>,
    result: &mut ScanResult,
) {
    if let Some(max_depth) = options.max_depth {
        if depth > max_depth {
            return;
        }
    }

    let read_dir = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(err) => {
            result.errors.push(ScanError {
                path: dir.display().to_string(),
                kind: err.to_string(),
            });
            return;
        }
    };

    let mut names: Vec<PathBuf> = Vec::new();
    for entry in read_dir {
        match entry {
            Ok(entry) => names.push(entry.path()),
            Err(err) => result.errors.push(ScanError {
                path: dir.display().to_string(),
                kind: err.to_string(),
            }),
        }
    }
    names.sort();

    for path in names {
        let file_name = path.file_name().unwrap_or_default().to_string_lossy().into_owned();
        if !options.include_hidden && file_name.starts_with('.') {
            continue;
        }

        let rel_path = path.strip_prefix(root).unwrap_or(&path);
        let match_path = Path::new("/").join(rel_path);

        let meta = match std::fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(err) => {
                result.errors.push(ScanError {
                    path: path.display().to_string(),
                    kind: err.to_string(),
                });
                continue;
            }
        };

        let is_excluded = matches!(
            patterns.matches(match_path.as_os_str().to_string_lossy().as_bytes(), || Ok::<_, std::convert::Infallible>(meta.mode())),
            Ok(Some(MatchType::Exclude))
        );
        if is_excluded {
            continue;
        }

        if meta.file_type().is_symlink() {
            handle_symlink(root, &path, &match_path, patterns, options, depth, ancestors, result);
        } else if meta.is_dir() {
            walk_dir(root, &path, patterns, options, depth + 1, ancestors, result);
        } else if meta.is_file() {
            result.entries.push(regular_entry(&match_path, &meta));
        }
    }
}

fn regular_entry(match_path: &Path, meta: &std::fs::Metadata) -> ScanEntry {
    ScanEntry {
        path: match_path.to_string_lossy().into_owned(),
        size: meta.len(),
        mtime_ns: meta.mtime() * 1_000_000_000 + meta.mtime_nsec(),
        mode: format!("{:o}", meta.mode()),
        kind: FileKind::Regular,
        symlink_target: None,
    }
}

fn handle_symlink(
    root: &Path,
    path: &Path,
    match_path: &Path,
    patterns: &[MatchEntry],
    options: &ScanOptions,
    depth: usize,
    ancestors: &mut HashSet<PathBuf>,
    result: &mut ScanResult,
) {
    match options.symlink_policy {
        SymlinkPolicy::Skip => {}
        SymlinkPolicy::Record => match std::fs::read_link(path) {
            Ok(target) => result.entries.push(ScanEntry {
                path: match_path.to_string_lossy().into_owned(),
                size: 0,
                mtime_ns: 0,
                mode: "120777".to_string(),
                kind: FileKind::Symlink,
                symlink_target: Some(target.to_string_lossy().into_owned()),
            }),
            Err(err) => result.errors.push(ScanError {
                path: path.display().to_string(),
                kind: err.to_string(),
            }),
        },
        SymlinkPolicy::Follow => {
            let canonical = match std::fs::canonicalize(path) {
                Ok(c) => c,
                Err(err) => {
                    result.errors.push(ScanError {
                        path: path.display().to_string(),
                        kind: err.to_string(),
                    });
                    return;
                }
            };

            if ancestors.contains(&canonical) {
                result.errors.push(ScanError {
                    path: path.display().to_string(),
                    kind: "symlink cycle detected".to_string(),
                });
                return;
            }

            let target_meta = match std::fs::metadata(&canonical) {
                Ok(meta) => meta,
                Err(err) => {
                    result.errors.push(ScanError {
                        path: path.display().to_string(),
                        kind: err.to_string(),
                    });
                    return;
                }
            };

            if target_meta.is_dir() {
                ancestors.insert(canonical.clone());
                walk_dir(root, path, patterns, options, depth + 1, ancestors, result);
                ancestors.remove(&canonical);
            } else if target_meta.is_file() {
                result.entries.push(regular_entry(match_path, &target_meta));
            }
        }
    }
}

pub fn canonical_root(root: &Path) -> Result<PathBuf, Error> {
    std::fs::canonicalize(root).with_context(|| format!("resolving scan root {root:?}"))
}
