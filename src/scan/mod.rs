//! Concurrent file-tree scanning.
//!
//! The scanner traverses one or more roots, never follows symlinks,
//! deduplicates directories by resolved path, and emits file batches to
//! an abstract sink. Permission errors are counted; only the first few
//! are logged in full.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{format_err, Error};
use pathpatterns::{MatchEntry, MatchList, MatchType, PatternFlag};

use tbk_api_types::FileEntry;
use tbk_tools::CancelToken;

mod concurrent;
pub use concurrent::ConcurrentDirScanner;

mod single;
pub use single::scan_directory_tree_single;

/// How many permission errors are logged in full before suppression.
pub const PERMISSION_ERROR_LOG_LIMIT: u64 = 20;

/// Abstract `Put(batch)` hook; lets the scanner feed a local buffer or an
/// inter-thread queue without knowing which.
pub trait BatchSink: Send + Sync {
    fn put(&self, batch: Vec<FileEntry>) -> Result<(), Error>;
}

impl BatchSink for crossbeam_channel::Sender<Vec<FileEntry>> {
    fn put(&self, batch: Vec<FileEntry>) -> Result<(), Error> {
        self.send(batch)
            .map_err(|_| format_err!("scan batch queue disconnected"))
    }
}

/// Sink collecting everything in memory (single-consumer mode, tests).
#[derive(Default)]
pub struct CollectSink {
    entries: Mutex<Vec<FileEntry>>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_entries(self) -> Vec<FileEntry> {
        self.entries.into_inner().unwrap_or_default()
    }
}

impl BatchSink for CollectSink {
    fn put(&self, batch: Vec<FileEntry>) -> Result<(), Error> {
        self.entries
            .lock()
            .map_err(|_| format_err!("collect sink lock poisoned"))?
            .extend(batch);
        Ok(())
    }
}

/// Scan parameters; the defaults match the production deployment.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub batch_threshold: usize,
    pub batch_flush_interval: Duration,
    pub log_interval: Duration,
    pub worker_count: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            batch_threshold: 1000,
            batch_flush_interval: Duration::from_secs(1200),
            log_interval: Duration::from_secs(60),
            worker_count: 4,
        }
    }
}

/// Shared scan statistics, updated by the workers, read by the logger.
#[derive(Debug, Default)]
pub struct ScanCounters {
    pub dirs_scanned: AtomicU64,
    pub files_found: AtomicU64,
    pub bytes_found: AtomicU64,
    pub permission_errors: AtomicU64,
}

impl ScanCounters {
    pub fn note_permission_error(&self, path: &Path, err: &dyn std::fmt::Display) {
        let count = self.permission_errors.fetch_add(1, Ordering::SeqCst) + 1;
        if count <= PERMISSION_ERROR_LOG_LIMIT {
            let shown: String = path.display().to_string().chars().take(200).collect();
            log::warn!("unable to open directory {}: {}", shown, err);
        }
    }
}

/// Compiled exclude patterns of one task.
pub struct ExcludeList {
    entries: Vec<MatchEntry>,
}

impl ExcludeList {
    pub fn new(patterns: &[String]) -> Result<Self, Error> {
        let mut entries = Vec::new();
        for pattern in patterns {
            let entry = MatchEntry::parse_pattern(pattern, PatternFlag::PATH_NAME, MatchType::Exclude)
                .map_err(|err| format_err!("invalid exclude pattern '{}' - {}", pattern, err))?;
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    pub fn is_excluded(&self, path: &Path, file_mode: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        use std::os::unix::ffi::OsStrExt;
        matches!(
            self.entries.matches(path.as_os_str().as_bytes(), file_mode),
            Ok(Some(MatchType::Exclude))
        )
    }
}

/// Resolved-path cache and visit set shared between workers.
#[derive(Default)]
pub struct VisitSet {
    resolved: Mutex<std::collections::HashMap<PathBuf, String>>,
    visited: Mutex<HashSet<String>>,
}

impl VisitSet {
    /// Resolve a path, memoizing the result. Falls back to the literal
    /// path when resolution fails.
    pub fn resolve(&self, path: &Path) -> String {
        if let Some(hit) = self.resolved.lock().unwrap().get(path) {
            return hit.clone();
        }
        let resolved = match std::fs::canonicalize(path) {
            Ok(resolved) => resolved.display().to_string(),
            Err(_) => path.display().to_string(),
        };
        self.resolved
            .lock()
            .unwrap()
            .insert(path.to_owned(), resolved.clone());
        resolved
    }

    /// Mark a directory visited; false when it already was.
    pub fn mark_visited(&self, resolved: &str) -> bool {
        self.visited.lock().unwrap().insert(resolved.to_string())
    }

    pub fn is_visited(&self, resolved: &str) -> bool {
        self.visited.lock().unwrap().contains(resolved)
    }
}

/// Read one directory level: subdirectories and files, symlinks skipped.
pub(crate) fn read_directory(
    dir: &Path,
    excludes: &ExcludeList,
) -> Result<(Vec<PathBuf>, Vec<FileEntry>), std::io::Error> {
    use std::os::unix::fs::MetadataExt;

    let mut subdirs = Vec::new();
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(_) => continue,
        };
        if file_type.is_symlink() {
            continue;
        }
        let path = entry.path();
        if file_type.is_dir() {
            subdirs.push(path);
        } else if file_type.is_file() {
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            if excludes.is_excluded(&path, metadata.mode()) {
                continue;
            }
            files.push(FileEntry {
                path,
                size: metadata.len(),
                mtime: metadata.mtime(),
            });
        }
    }
    Ok((subdirs, files))
}

/// Scan one root, batching files into the sink.
///
/// Dispatches to the worker-pool scanner or the sequential walker; both
/// have the same externally observable behavior. Returns the number of
/// files found.
pub fn scan_tree(
    root: &Path,
    sink: &dyn BatchSink,
    options: &ScanOptions,
    excludes: &ExcludeList,
    counters: &ScanCounters,
    cancel: &CancelToken,
    multithreaded: bool,
) -> Result<u64, Error> {
    if multithreaded {
        let scanner = ConcurrentDirScanner::new(options.worker_count);
        scanner.scan_directory_tree(root, sink, options, excludes, counters, cancel)
    } else {
        scan_directory_tree_single(root, sink, options, excludes, counters, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn testdir(name: &str) -> PathBuf {
        let mut dir: PathBuf = String::from("./target/testout").into();
        dir.push(module_path!());
        dir.push(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn build_tree(root: &Path) {
        std::fs::create_dir_all(root.join("sub/inner")).unwrap();
        std::fs::write(root.join("a.txt"), vec![0u8; 100]).unwrap();
        std::fs::write(root.join("b.log"), vec![0u8; 200]).unwrap();
        std::fs::write(root.join("sub/c.txt"), vec![0u8; 300]).unwrap();
        std::fs::write(root.join("sub/inner/d.bin"), vec![0u8; 400]).unwrap();
        std::os::unix::fs::symlink(root.join("a.txt"), root.join("link.txt")).unwrap();
        std::os::unix::fs::symlink(root.join("sub"), root.join("sublink")).unwrap();
    }

    fn run_scan(root: &Path, multithreaded: bool, excludes: &[String]) -> (Vec<FileEntry>, u64) {
        let sink = CollectSink::new();
        let counters = ScanCounters::default();
        let found = scan_tree(
            root,
            &sink,
            &ScanOptions {
                batch_threshold: 2,
                ..Default::default()
            },
            &ExcludeList::new(excludes).unwrap(),
            &counters,
            &CancelToken::new(),
            multithreaded,
        )
        .unwrap();
        let mut entries = sink.into_entries();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        (entries, found)
    }

    #[test]
    fn test_scan_finds_files_and_skips_symlinks() {
        let root = testdir("symlinks");
        build_tree(&root);
        let (entries, found) = run_scan(&root, true, &[]);
        assert_eq!(found, 4);
        assert_eq!(entries.len(), 4);
        assert!(entries.iter().all(|e| !e.path.to_string_lossy().contains("link")));
    }

    #[test]
    fn test_single_threaded_matches_concurrent() {
        let root = testdir("modes");
        build_tree(&root);
        let (multi, multi_found) = run_scan(&root, true, &[]);
        let (single, single_found) = run_scan(&root, false, &[]);
        assert_eq!(multi_found, single_found);
        assert_eq!(multi, single);
    }

    #[test]
    fn test_exclude_patterns_filter_files() {
        let root = testdir("excludes");
        build_tree(&root);
        let (entries, found) = run_scan(&root, true, &["*.log".to_string()]);
        assert_eq!(found, 3);
        assert!(entries.iter().all(|e| !e.path.to_string_lossy().ends_with(".log")));
    }

    #[test]
    fn test_cancel_stops_early() {
        let root = testdir("cancel");
        build_tree(&root);
        let cancel = CancelToken::new();
        cancel.cancel();
        let sink = CollectSink::new();
        let counters = ScanCounters::default();
        let found = scan_tree(
            &root,
            &sink,
            &ScanOptions::default(),
            &ExcludeList::new(&[]).unwrap(),
            &counters,
            &cancel,
            true,
        )
        .unwrap();
        assert_eq!(found, 0);
    }

    #[test]
    fn test_missing_root_counts_permission_error() {
        let root = testdir("missing_root").join("nope");
        let sink = CollectSink::new();
        let counters = ScanCounters::default();
        let found = scan_tree(
            &root,
            &sink,
            &ScanOptions::default(),
            &ExcludeList::new(&[]).unwrap(),
            &counters,
            &CancelToken::new(),
            true,
        )
        .unwrap();
        assert_eq!(found, 0);
        assert_eq!(counters.permission_errors.load(Ordering::SeqCst), 1);
    }
}
