//! Walks an index root and brings the record table up to date.
//!
//! Cheap metadata (size, mtime) decides whether a file needs hashing; only new
//! or changed files are read. The new table replaces the old one in a single
//! atomic write while `scan.lock` is held.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use rayon::prelude::*;
use serde::Serialize;
use walkdir::{DirEntry, WalkDir};

use crate::errorlog::ErrorEntry;
use crate::errors::{IndexError, Result};
use crate::index::Index;
use crate::lock::{FileLock, SCAN_LOCK};
use crate::manifest::ScanCounts;
use crate::records::{normalize_extension, ExtensionFilter, FileRecord, Fingerprint, RecordTable};

#[derive(Clone, Debug, Default)]
pub struct ScanOptions {
    /// Extensions to index; the configured defaults when `None`
    pub extensions: Option<Vec<String>>,
    pub allow_all: bool,
    /// Storage directory outside the root
    pub storage_dir: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScanReport {
    pub files_scanned: usize,
    pub total_size: u64,
    pub index_path: PathBuf,
    #[serde(flatten)]
    pub counts: ScanCounts,
}

/// A file seen during the walk.
struct Observed {
    path: String,
    absolute: PathBuf,
    size: u64,
    mtime_ns: i64,
    extension: String,
}

fn mtime_ns(modified: SystemTime) -> i64 {
    match modified.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_nanos().min(i64::MAX as u128) as i64,
        Err(before) => -(before.duration().as_nanos().min(i64::MAX as u128) as i64),
    }
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

/// Scan `root`, creating its index on first use.
pub fn scan(root: &Path, options: &ScanOptions) -> Result<ScanReport> {
    let index = Index::create(root, options.storage_dir.as_deref())?;
    let filter = ExtensionFilter::from_request(
        options.extensions.as_deref(),
        options.allow_all,
        &index.config().scan.extensions,
    );
    scan_index(&index, &filter)
}

pub fn scan_index(index: &Index, filter: &ExtensionFilter) -> Result<ScanReport> {
    let _lock = FileLock::try_acquire(index.dir(), SCAN_LOCK).map_err(IndexError::from_lock)?;
    let started = std::time::Instant::now();

    let previous = index.load_records()?;
    if previous.dropped > 0 {
        log::warn!("scan: {} stored record(s) were unreadable and will be rebuilt", previous.dropped);
    }
    let previous = previous.table;

    let (observed, mut failures) = walk(index, filter);

    let now = Utc::now();
    let mut counts = ScanCounts::default();
    let mut table = RecordTable::default();
    let mut to_hash = vec![];

    for file in observed {
        match previous.get(&file.path) {
            Some(prev) if prev.size == file.size && prev.mtime_ns == file.mtime_ns => {
                counts.unchanged += 1;
                table.insert(FileRecord {
                    last_seen: now,
                    extension: file.extension,
                    ..prev.clone()
                });
            }
            _ => to_hash.push(file),
        }
    }

    let hashed: Vec<(Observed, std::io::Result<Fingerprint>)> = to_hash
        .into_par_iter()
        .map(|file| {
            let fingerprint = Fingerprint::of_file(&file.absolute);
            (file, fingerprint)
        })
        .collect();

    for (file, fingerprint) in hashed {
        let fingerprint = match fingerprint {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                failures.push((Some(file.path), e.to_string()));
                continue;
            }
        };
        counts.hashed += 1;

        let first_seen = match previous.get(&file.path) {
            Some(prev) if prev.fingerprint == fingerprint => {
                counts.unchanged += 1;
                prev.first_seen
            }
            Some(prev) => {
                counts.modified += 1;
                prev.first_seen
            }
            None => {
                counts.added += 1;
                now
            }
        };

        table.insert(FileRecord {
            path: file.path,
            size: file.size,
            mtime_ns: file.mtime_ns,
            extension: file.extension,
            fingerprint,
            first_seen,
            last_seen: now,
        });
    }

    let current: HashSet<&String> = table.paths().collect();
    counts.removed = previous.paths().filter(|p| !current.contains(p)).count();
    counts.errors = failures.len();

    index.records().commit(&table)?;

    if !failures.is_empty() {
        let entries = failures
            .iter()
            .map(|(path, message)| ErrorEntry::new("scan", path.as_deref(), message.clone()))
            .collect();
        if let Err(e) = index.error_log().append(entries) {
            log::warn!("failed to record scan errors: {e}");
        }
    }

    index.refresh_manifest(Some((filter, counts)))?;

    log::info!(
        "scan root={} files={} added={} modified={} removed={} unchanged={} hashed={} errors={} took={:?}",
        index.root().display(),
        table.len(),
        counts.added,
        counts.modified,
        counts.removed,
        counts.unchanged,
        counts.hashed,
        counts.errors,
        started.elapsed()
    );

    Ok(ScanReport {
        files_scanned: table.len(),
        total_size: table.total_bytes(),
        index_path: index.dir().to_path_buf(),
        counts,
    })
}

/// Collect matching files and the entries that could not be read.
fn walk(index: &Index, filter: &ExtensionFilter) -> (Vec<Observed>, Vec<(Option<String>, String)>) {
    let root = index.root();
    let settings = &index.config().scan;
    let storage_dir = index.dir();
    let excluded: HashSet<&str> = settings.excluded_dirs.iter().map(String::as_str).collect();

    let keep = |entry: &DirEntry| -> bool {
        if entry.depth() == 0 {
            return true;
        }
        if entry.path() == storage_dir {
            return false;
        }
        let name = entry.file_name().to_string_lossy();
        if !settings.include_hidden && name.starts_with('.') {
            return false;
        }
        !(entry.file_type().is_dir() && excluded.contains(name.as_ref()))
    };

    let mut observed = vec![];
    let mut failures = vec![];

    let walker = WalkDir::new(root)
        .follow_links(settings.follow_links)
        .into_iter()
        .filter_entry(keep);

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().and_then(|p| relative_path(root, p));
                log::warn!("scan: skipping unreadable entry: {e}");
                failures.push((path, e.to_string()));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let Some(path) = relative_path(root, entry.path()) else {
            failures.push((
                None,
                format!("{}: path is not valid UTF-8", entry.path().display()),
            ));
            continue;
        };

        let extension = entry
            .path()
            .extension()
            .map(|e| normalize_extension(&e.to_string_lossy()))
            .unwrap_or_default();
        if !filter.matches(&extension) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                failures.push((Some(path), e.to_string()));
                continue;
            }
        };
        let mtime_ns = metadata.modified().map(mtime_ns).unwrap_or(0);

        observed.push(Observed {
            path,
            absolute: entry.into_path(),
            size: metadata.len(),
            mtime_ns,
            extension,
        });
    }

    (observed, failures)
}
