//! Final-directory monitor and the tape writer.
//!
//! A dedicated worker thread polls the staging `final/` subtree every
//! 10 s and moves finished archives to tape strictly one at a time -
//! independent of, and never blocked by, the compressor. Every processed
//! path is remembered so a file is attempted at most once.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{format_err, Error};
use proxmox_human_byte::HumanByte;
use walkdir::WalkDir;

use tbk_catalog::CatalogStore;
use tbk_config::BackupConfig;
use tbk_tools::fs::copy_with_fsync;

use crate::tape::TapeManager;

/// Poll cadence of the monitor thread.
const SCAN_INTERVAL: Duration = Duration::from_secs(10);
/// Stop budget: the worker finishes its current transfer and exits
/// within this window.
const STOP_JOIN_BUDGET: Duration = Duration::from_secs(30);
/// Failures logged in full before suppression.
const FAILURE_LOG_LIMIT: u64 = 20;

/// Archive container suffixes handled by the monitor.
pub fn is_archive_candidate(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return false,
    };
    name.ends_with(".7z")
        || name.ends_with(".gz")
        || name.ends_with(".tar")
        || name.ends_with(".zst")
        || name.ends_with(".tar.gz")
}

/// Moves one archive onto the tape and reports the tape-relative path.
pub struct TapeWriter {
    config: BackupConfig,
    manager: Option<Arc<TapeManager>>,
}

impl TapeWriter {
    pub fn new(config: BackupConfig, manager: Option<Arc<TapeManager>>) -> Self {
        Self { config, manager }
    }

    /// Write one archive to the tape mount.
    ///
    /// In the direct-to-tape layout the file already lives on the mount
    /// and this is a pure path-resolution step. In the stage-then-copy
    /// layout the file is copied with fsync and the staged source
    /// removed before cartridge counters are updated.
    pub fn write_to_tape(&self, source: &Path, set_id: &str) -> Result<PathBuf, Error> {
        let mount = self.config.tape_mount_point();
        let file_name = source
            .file_name()
            .ok_or_else(|| format_err!("archive path {:?} has no file name", source))?;
        let relative = PathBuf::from(set_id).join(file_name);

        let bytes = if self.config.compress_directly_to_tape && source.starts_with(&mount) {
            std::fs::metadata(source)?.len()
        } else {
            let target_dir = mount.join(set_id);
            std::fs::create_dir_all(&target_dir)
                .map_err(|err| format_err!("unable to create {:?} - {}", target_dir, err))?;
            let target = target_dir.join(file_name);
            let bytes = copy_with_fsync(source, &target)?;
            std::fs::remove_file(source)
                .map_err(|err| format_err!("unable to remove staged {:?} - {}", source, err))?;
            bytes
        };

        if let Some(ref manager) = self.manager {
            manager.record_write(bytes)?;
        }
        Ok(relative)
    }
}

struct MonitorShared {
    config: BackupConfig,
    catalog: Arc<CatalogStore>,
    writer: TapeWriter,
    running: AtomicBool,
    busy: AtomicBool,
    processed: Mutex<HashSet<PathBuf>>,
    processed_count: AtomicU64,
    failure_count: AtomicU64,
}

/// The final-directory monitor thread.
pub struct FinalDirMonitor {
    shared: Arc<MonitorShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FinalDirMonitor {
    pub fn new(
        config: BackupConfig,
        catalog: Arc<CatalogStore>,
        manager: Option<Arc<TapeManager>>,
    ) -> Self {
        let writer = TapeWriter::new(config.clone(), manager);
        Self {
            shared: Arc::new(MonitorShared {
                config,
                catalog,
                writer,
                running: AtomicBool::new(false),
                busy: AtomicBool::new(false),
                processed: Mutex::new(HashSet::new()),
                processed_count: AtomicU64::new(0),
                failure_count: AtomicU64::new(0),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Start the worker thread. A second start is a no-op.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            log::warn!("final-dir monitor already running");
            return;
        }
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("final-dir-monitor".to_string())
            .spawn(move || monitor_loop(shared))
            .expect("unable to spawn final-dir monitor thread");
        *self.handle.lock().unwrap() = Some(handle);
        log::info!("final-dir monitor started (10 s poll)");
    }

    /// Stop the worker; it finishes the current transfer first.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let deadline = Instant::now() + STOP_JOIN_BUDGET;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(100));
            }
            if handle.is_finished() {
                let _ = handle.join();
                log::info!("final-dir monitor stopped");
            } else {
                log::warn!("final-dir monitor did not stop within the join budget");
            }
        }
    }

    /// No compressed archive waiting under `final/`.
    pub fn is_final_dir_empty(&self) -> bool {
        final_dir_is_empty(&self.shared.config.final_dir())
    }

    /// Not currently moving a file.
    pub fn is_idle(&self) -> bool {
        !self.shared.busy.load(Ordering::SeqCst)
    }

    pub fn processed_count(&self) -> u64 {
        self.shared.processed_count.load(Ordering::SeqCst)
    }

    pub fn failure_count(&self) -> u64 {
        self.shared.failure_count.load(Ordering::SeqCst)
    }
}

impl Drop for FinalDirMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn final_dir_is_empty(final_dir: &Path) -> bool {
    if !final_dir.exists() {
        return true;
    }
    !WalkDir::new(final_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .any(|entry| entry.file_type().is_file() && is_archive_candidate(entry.path()))
}

/// Derive the backup-set id from an archive path.
///
/// The first path segment under `final/` names the set; the
/// `backup_<setid>_...` filename prefix is the fallback.
fn extract_set_id(final_dir: &Path, path: &Path) -> Option<String> {
    if let Ok(relative) = path.strip_prefix(final_dir) {
        if let Some(first) = relative.components().next() {
            let first = first.as_os_str().to_string_lossy();
            if relative.components().count() > 1 {
                return Some(first.into_owned());
            }
        }
    }
    let name = path.file_name()?.to_string_lossy();
    let rest = name.strip_prefix("backup_")?;
    let set_id = rest.split('_').next()?;
    if set_id.is_empty() {
        None
    } else {
        Some(set_id.to_string())
    }
}

fn sleep_while_running(shared: &MonitorShared, duration: Duration) {
    let deadline = Instant::now() + duration;
    while shared.running.load(Ordering::SeqCst) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(200));
    }
}

fn monitor_loop(shared: Arc<MonitorShared>) {
    log::info!("final-dir monitor thread running");
    while shared.running.load(Ordering::SeqCst) {
        let final_dir = shared.config.final_dir();
        if !final_dir.exists() {
            sleep_while_running(&shared, SCAN_INTERVAL);
            continue;
        }

        let candidates: Vec<PathBuf> = {
            let processed = shared.processed.lock().unwrap();
            WalkDir::new(&final_dir)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .filter(|path| is_archive_candidate(path))
                .filter(|path| !processed.contains(path))
                .collect()
        };

        if candidates.is_empty() {
            sleep_while_running(&shared, SCAN_INTERVAL);
            continue;
        }

        log::info!("{} new archive(s) waiting for tape", candidates.len());
        for path in candidates {
            if !shared.running.load(Ordering::SeqCst) {
                break;
            }
            // move one, then next
            shared.busy.store(true, Ordering::SeqCst);
            process_one(&shared, &final_dir, &path);
            shared.busy.store(false, Ordering::SeqCst);
        }
    }
    log::info!("final-dir monitor thread exiting");
}

fn process_one(shared: &MonitorShared, final_dir: &Path, path: &Path) {
    let mark_processed = |success: bool| {
        shared.processed.lock().unwrap().insert(path.to_owned());
        shared.processed_count.fetch_add(1, Ordering::SeqCst);
        if !success {
            let failures = shared.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
            if failures <= FAILURE_LOG_LIMIT {
                log::error!("archive transfer failed: {:?}", path);
            }
        }
    };

    // source removed under the monitor: skip and remember
    let size = match std::fs::metadata(path) {
        Ok(metadata) => metadata.len(),
        Err(_) => {
            log::debug!("archive {:?} vanished, skipping", path);
            mark_processed(true);
            return;
        }
    };

    let set_id = match extract_set_id(final_dir, path) {
        Some(set_id) => set_id,
        None => {
            log::warn!("unable to derive backup set from {:?}", path);
            "unknown".to_string()
        }
    };

    log::info!(
        "moving archive to tape: {:?} ({})",
        path.file_name().unwrap_or_default(),
        HumanByte::from(size)
    );

    match shared.writer.write_to_tape(path, &set_id) {
        Ok(tape_path) => {
            let tape_id = shared
                .writer
                .manager
                .as_ref()
                .and_then(|m| m.current_tape())
                .map(|tape| tape.tape_id);
            if let Err(err) = shared.catalog.record_archive(
                &set_id,
                &tape_path.display().to_string(),
                size,
                tape_id.as_deref(),
            ) {
                log::warn!("archive record update failed for {:?}: {}", path, err);
            }
            log::info!("archive on tape: {:?}", tape_path);
            mark_processed(true);
        }
        Err(err) => {
            // tape-write failures do not abort the task; next candidate
            log::error!("tape write of {:?} failed: {}", path, err);
            mark_processed(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_suffixes() {
        assert!(is_archive_candidate(Path::new("/x/backup_1_0.7z")));
        assert!(is_archive_candidate(Path::new("/x/backup_1_0.tar")));
        assert!(is_archive_candidate(Path::new("/x/backup_1_0.tar.gz")));
        assert!(is_archive_candidate(Path::new("/x/backup_1_0.tar.zst")));
        assert!(!is_archive_candidate(Path::new("/x/backup_1_0.partial")));
        assert!(!is_archive_candidate(Path::new("/x/notes.txt")));
    }

    #[test]
    fn test_set_id_from_path_layout() {
        let final_dir = Path::new("/tmp/compress/final");
        assert_eq!(
            extract_set_id(final_dir, Path::new("/tmp/compress/final/set42/backup_set42_0.tar")),
            Some("set42".to_string())
        );
        // file directly under final/: fall back to the name prefix
        assert_eq!(
            extract_set_id(final_dir, Path::new("/tmp/compress/final/backup_77_3.tar.zst")),
            Some("77".to_string())
        );
        // unrelated location, unrelated name
        assert_eq!(
            extract_set_id(final_dir, Path::new("/elsewhere/archive.tar")),
            None
        );
    }
}
