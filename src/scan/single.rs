//! Sequential traversal with the same observable behavior as the
//! worker-pool scanner.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Instant;

use anyhow::Error;

use tbk_api_types::FileEntry;
use tbk_tools::CancelToken;

use super::{read_directory, BatchSink, ExcludeList, ScanCounters, ScanOptions, VisitSet};

pub fn scan_directory_tree_single(
    root: &Path,
    sink: &dyn BatchSink,
    options: &ScanOptions,
    excludes: &ExcludeList,
    counters: &ScanCounters,
    cancel: &CancelToken,
) -> Result<u64, Error> {
    let visit = VisitSet::default();
    let mut pending = VecDeque::new();
    pending.push_back(root.to_owned());

    let mut batch: Vec<FileEntry> = Vec::new();
    let mut files_found: u64 = 0;
    let mut last_flush = Instant::now();

    while let Some(dir) = pending.pop_front() {
        if cancel.is_cancelled() {
            log::warn!("scan cancelled, stopping traversal");
            break;
        }
        let resolved = visit.resolve(&dir);
        if !visit.mark_visited(&resolved) {
            continue;
        }
        counters.dirs_scanned.fetch_add(1, Ordering::SeqCst);

        match read_directory(&dir, excludes) {
            Ok((subdirs, files)) => {
                for subdir in subdirs {
                    let resolved = visit.resolve(&subdir);
                    if !visit.is_visited(&resolved) {
                        pending.push_back(subdir);
                    }
                }
                if !files.is_empty() {
                    let bytes: u64 = files.iter().map(|f| f.size).sum();
                    files_found += files.len() as u64;
                    counters
                        .files_found
                        .fetch_add(files.len() as u64, Ordering::SeqCst);
                    counters.bytes_found.fetch_add(bytes, Ordering::SeqCst);
                    batch.extend(files);
                    if batch.len() >= options.batch_threshold
                        || last_flush.elapsed() >= options.batch_flush_interval
                    {
                        sink.put(std::mem::take(&mut batch))?;
                        last_flush = Instant::now();
                    }
                }
            }
            Err(err) => counters.note_permission_error(&dir, &err),
        }
    }

    if !batch.is_empty() {
        sink.put(batch)?;
    }

    Ok(files_found)
}
