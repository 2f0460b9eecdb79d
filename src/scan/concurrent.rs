//! Worker-pool directory scanner.
//!
//! A fixed pool of workers reads directory levels; the coordinating loop
//! owns the pending FIFO, the visit set and the current batch. Directory
//! reads are the only work done off-thread, so dedup and batching need no
//! locking beyond the shared caches.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::{format_err, Error};
use crossbeam_channel::RecvTimeoutError;
use proxmox_human_byte::HumanByte;

use tbk_api_types::FileEntry;
use tbk_tools::CancelToken;

use super::{read_directory, BatchSink, ExcludeList, ScanCounters, ScanOptions, VisitSet};

type DirResult = (PathBuf, std::io::Result<(Vec<PathBuf>, Vec<FileEntry>)>);

pub struct ConcurrentDirScanner {
    workers: usize,
}

impl ConcurrentDirScanner {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Scan the tree under `root`, emitting batches into `sink`.
    ///
    /// A batch is emitted when it reaches the threshold or the flush
    /// interval elapsed; the residual batch is emitted on completion.
    /// Returns the number of files found.
    pub fn scan_directory_tree(
        &self,
        root: &Path,
        sink: &dyn BatchSink,
        options: &ScanOptions,
        excludes: &ExcludeList,
        counters: &ScanCounters,
        cancel: &CancelToken,
    ) -> Result<u64, Error> {
        let visit = VisitSet::default();
        let started = Instant::now();

        std::thread::scope(|scope| -> Result<u64, Error> {
            let (job_tx, job_rx) = crossbeam_channel::unbounded::<PathBuf>();
            let (result_tx, result_rx) = crossbeam_channel::unbounded::<DirResult>();

            for _ in 0..self.workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    while let Ok(dir) = job_rx.recv() {
                        let result = read_directory(&dir, excludes);
                        if result_tx.send((dir, result)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            let mut pending: VecDeque<PathBuf> = VecDeque::new();
            pending.push_back(root.to_owned());
            let mut in_flight = 0usize;

            let mut batch: Vec<FileEntry> = Vec::new();
            let mut files_found: u64 = 0;
            let mut last_flush = Instant::now();
            let mut last_log = Instant::now();

            loop {
                if cancel.is_cancelled() {
                    log::warn!("scan cancelled, stopping directory submission");
                    break;
                }

                // fill the pool up to the worker budget
                while in_flight < self.workers {
                    let dir = match pending.pop_front() {
                        Some(dir) => dir,
                        None => break,
                    };
                    let resolved = visit.resolve(&dir);
                    if !visit.mark_visited(&resolved) {
                        continue;
                    }
                    counters.dirs_scanned.fetch_add(1, Ordering::SeqCst);
                    job_tx
                        .send(dir)
                        .map_err(|_| format_err!("scan worker pool terminated early"))?;
                    in_flight += 1;
                }

                if in_flight == 0 && pending.is_empty() {
                    break;
                }

                // await the next completion; tick so logging and the
                // forced flush keep running on an idle pool
                match result_rx.recv_timeout(Duration::from_secs(1)) {
                    Ok((dir, result)) => {
                        in_flight -= 1;
                        match result {
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
                                    if batch.len() >= options.batch_threshold {
                                        sink.put(std::mem::take(&mut batch))?;
                                        last_flush = Instant::now();
                                    }
                                }
                            }
                            Err(err) => counters.note_permission_error(&dir, &err),
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }

                if last_log.elapsed() >= options.log_interval {
                    log::info!(
                        "scan progress: {} directories, {} files ({}), {} errors, {} queued, elapsed {:?}",
                        counters.dirs_scanned.load(Ordering::SeqCst),
                        counters.files_found.load(Ordering::SeqCst),
                        HumanByte::from(counters.bytes_found.load(Ordering::SeqCst)),
                        counters.permission_errors.load(Ordering::SeqCst),
                        pending.len(),
                        started.elapsed(),
                    );
                    last_log = Instant::now();
                }

                if !batch.is_empty() && last_flush.elapsed() >= options.batch_flush_interval {
                    sink.put(std::mem::take(&mut batch))?;
                    last_flush = Instant::now();
                }
            }

            drop(job_tx);

            // residual batch
            if !batch.is_empty() {
                sink.put(batch)?;
            }

            Ok(files_found)
        })
    }
}
