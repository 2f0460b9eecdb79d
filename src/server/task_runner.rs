//! Drives one backup task end-to-end.
//!
//! Stages: scanning, compressing, copying, finalizing. Every transition
//! writes a bracketed stage tag into the task description; cancellation
//! may arrive in any running stage and is honored at the cooperative
//! checkpoints of every component.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use proxmox_human_byte::HumanByte;

use tbk_api_types::{ResultSummary, ScanStatus, TaskStatus, TaskType};
use tbk_catalog::{CatalogStore, NewFileRow};
use tbk_config::BackupConfig;
use tbk_tools::CancelToken;

use crate::compress::{
    fetch_all_pending, partition_into_units, run_compression, CompressionContext,
    CompressionResult,
};
use crate::scan::{scan_tree, BatchSink, ExcludeList, ScanCounters, ScanOptions};
use crate::tape::{FinalDirMonitor, TapeManager};

/// Fraction of unmarked inventory rows at finalize that fails the task.
const VERIFY_FAILURE_THRESHOLD: f64 = 0.01;

/// Batch size used when streaming scan batches into the catalog.
const INSERT_BATCH_SIZE: usize = 1000;
/// Page size for inventory reads.
const FETCH_PAGE_SIZE: usize = 5000;
/// Backstop for draining the staging directory to tape.
const COPY_DRAIN_BUDGET: Duration = Duration::from_secs(24 * 3600);

/// Sink streaming scanner batches into the task's inventory table.
struct CatalogSink<'a> {
    catalog: &'a CatalogStore,
    task_id: i64,
    backup_set_db_id: i64,
}

impl BatchSink for CatalogSink<'_> {
    fn put(&self, batch: Vec<tbk_api_types::FileEntry>) -> Result<(), Error> {
        let rows: Vec<NewFileRow> = batch
            .into_iter()
            .map(|entry| NewFileRow {
                backup_set_id: self.backup_set_db_id,
                file_path: entry.path.display().to_string(),
                file_size: entry.size,
                mtime: entry.mtime,
            })
            .collect();
        self.catalog
            .bulk_insert_files(self.task_id, rows, INSERT_BATCH_SIZE)
    }
}

pub struct TaskRunner {
    catalog: Arc<CatalogStore>,
    config: BackupConfig,
    tape_manager: Option<Arc<TapeManager>>,
    monitor: Option<Arc<FinalDirMonitor>>,
}

impl TaskRunner {
    pub fn new(
        catalog: Arc<CatalogStore>,
        config: BackupConfig,
        tape_manager: Option<Arc<TapeManager>>,
        monitor: Option<Arc<FinalDirMonitor>>,
    ) -> Self {
        Self {
            catalog,
            config,
            tape_manager,
            monitor,
        }
    }

    fn set_stage(
        &self,
        task_id: i64,
        scan_status: ScanStatus,
        tag: &str,
    ) -> Result<(), Error> {
        self.catalog.set_scan_status(task_id, scan_status)?;
        self.catalog.set_description(task_id, tag)?;
        Ok(())
    }

    /// Execute one task to its terminal state.
    ///
    /// The returned status is also committed to the catalog, together
    /// with the error message on failure or a short reason on cancel.
    pub fn run_task(&self, task_id: i64, cancel: &CancelToken) -> Result<TaskStatus, Error> {
        let task = self
            .catalog
            .get_task(task_id)?
            .ok_or_else(|| format_err!("no such task {}", task_id))?;
        if task.is_template {
            bail!("task {} is a template and cannot be executed", task_id);
        }
        if task.status.is_terminal() {
            bail!("task {} is already {}", task_id, task.status);
        }

        self.catalog.set_task_status(task_id, TaskStatus::Running)?;

        let outcome = self.execute(task_id, cancel);

        let status = match outcome {
            Ok(()) => {
                self.set_stage(task_id, ScanStatus::Finalizing, "[backup completed]")?;
                TaskStatus::Completed
            }
            Err(_) if cancel.is_cancelled() => {
                self.set_stage(task_id, ScanStatus::Cancelled, "[task cancelled]")?;
                self.catalog
                    .set_error_message(task_id, "cancelled by request")?;
                TaskStatus::Cancelled
            }
            Err(err) => {
                log::error!("task {} failed: {:#}", task_id, err);
                self.set_stage(task_id, ScanStatus::Failed, "[task failed]")?;
                self.catalog.set_error_message(task_id, &format!("{:#}", err))?;
                TaskStatus::Failed
            }
        };
        self.catalog.set_task_status(task_id, status)?;
        Ok(status)
    }

    fn execute(&self, task_id: i64, cancel: &CancelToken) -> Result<(), Error> {
        let task = self
            .catalog
            .get_task(task_id)?
            .ok_or_else(|| format_err!("no such task {}", task_id))?;

        // full backups may format the cartridge first, keeping its label
        if self.config.enable_tape_format_before_full
            && matches!(task.task_type, TaskType::Full | TaskType::MonthlyFull)
        {
            if let Some(ref manager) = self.tape_manager {
                self.set_stage(task_id, ScanStatus::None, "[formatting tape]")?;
                manager.erase_preserve_label(false, cancel)?;
            }
        }

        let set_id = format!(
            "{}_{}",
            task_id,
            proxmox_time::strftime_local("%Y%m%d%H%M%S", proxmox_time::epoch_i64())?
        );
        let backup_set_db_id = self.catalog.ensure_backup_set(task_id, &set_id)?;

        // ---------------------------------------------------------- scan
        self.set_stage(task_id, ScanStatus::Scanning, "[scanning files]")?;
        let counters = ScanCounters::default();
        let excludes = ExcludeList::new(&task.exclude_patterns)?;
        let sink = CatalogSink {
            catalog: self.catalog.as_ref(),
            task_id,
            backup_set_db_id,
        };
        let options = ScanOptions {
            worker_count: self.config.scan_threads,
            ..Default::default()
        };
        for root in &task.source_paths {
            cancel.check()?;
            let found = scan_tree(
                &PathBuf::from(root),
                &sink,
                &options,
                &excludes,
                &counters,
                cancel,
                self.config.use_scan_multithread,
            )?;
            log::info!("scanned root {:?}: {} files", root, found);
        }
        cancel.check()?;

        let total_files = counters.files_found.load(Ordering::SeqCst);
        let total_bytes = counters.bytes_found.load(Ordering::SeqCst);
        let permission_errors = counters.permission_errors.load(Ordering::SeqCst);
        self.catalog.freeze_totals(task_id, total_files, total_bytes)?;
        log::info!(
            "scan finished: {} files, {}, {} permission errors",
            total_files,
            HumanByte::from(total_bytes),
            permission_errors
        );

        // ------------------------------------------------------ compress
        self.set_stage(task_id, ScanStatus::Compressing, "[preparing compression]")?;
        let records = fetch_all_pending(&self.catalog, task_id, FETCH_PAGE_SIZE)?;
        let paths: Vec<String> = records.iter().map(|r| r.file_path.clone()).collect();
        let units = partition_into_units(records, self.config.max_file_size);
        let estimated_archive_count = units.len() as u64;

        let output_dir = if self.config.compress_directly_to_tape {
            self.config.tape_mount_point().join(&set_id)
        } else {
            self.config.final_dir().join(&set_id)
        };
        let ctx = CompressionContext {
            catalog: self.catalog.as_ref(),
            config: &self.config,
            task_id,
            backup_set_db_id,
            set_id: &set_id,
            output_dir,
            total_files,
            cancel: cancel.clone(),
        };
        let compression = run_compression(&ctx, units)?;
        cancel.check()?;

        // ---------------------------------------------------------- copy
        self.set_stage(
            task_id,
            ScanStatus::Copying,
            &format!("[writing to tape] {} archive(s)", compression.units_written),
        )?;
        if self.config.compress_directly_to_tape {
            // archives were produced on the mount; account them here
            self.record_direct_archives(&set_id, &compression)?;
        } else if let Some(ref monitor) = self.monitor {
            self.wait_for_copy_drain(monitor, cancel, COPY_DRAIN_BUDGET)?;
        }

        // -------------------------------------------------- finalization
        self.set_stage(task_id, ScanStatus::Finalizing, "[finalizing backup]")?;
        if !self.config.enable_background_copy_update {
            let updated = tbk_tools::retry_with_backoff(
                "finalize copy-state update",
                3,
                Duration::from_millis(500),
                || {
                    self.catalog
                        .mark_files_queued(task_id, backup_set_db_id, paths.clone())
                },
            )?;
            log::info!("finalize marked {} inventory rows as copied", updated);
        }
        self.verify_copy_flags(task_id, backup_set_db_id, &paths, &compression)?;

        let mut errors = Vec::new();
        if permission_errors > 0 {
            errors.push(format!("{} permission errors during scan", permission_errors));
        }
        self.catalog.set_result_summary(
            task_id,
            &ResultSummary {
                estimated_archive_count,
                total_scanned_bytes: total_bytes,
                errors,
            },
        )?;

        let ratio = if compression.processed_bytes > 0 {
            compression.compressed_bytes as f64 / compression.processed_bytes as f64
        } else {
            0.0
        };
        log::info!(
            "task {} done: {} units, {} in, {} out (ratio {:.3})",
            task_id,
            compression.units_written,
            HumanByte::from(compression.processed_bytes),
            HumanByte::from(compression.compressed_bytes),
            ratio
        );
        Ok(())
    }

    /// Wait until the staging directory drained and the catalog queue is
    /// empty; the monitor keeps running across tasks.
    pub fn wait_for_copy_drain(
        &self,
        monitor: &FinalDirMonitor,
        cancel: &CancelToken,
        budget: Duration,
    ) -> Result<(), Error> {
        let deadline = std::time::Instant::now() + budget;
        loop {
            cancel.check()?;
            if monitor.is_final_dir_empty() && monitor.is_idle() {
                self.catalog.drain_writes()?;
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                bail!("staging directory did not drain within {:?}", budget);
            }
            std::thread::sleep(Duration::from_millis(500));
        }
    }

    fn record_direct_archives(
        &self,
        set_id: &str,
        compression: &CompressionResult,
    ) -> Result<(), Error> {
        let tape_id = self
            .tape_manager
            .as_ref()
            .and_then(|manager| manager.current_tape())
            .map(|tape| tape.tape_id);
        for archive in &compression.archives {
            let size = std::fs::metadata(archive)?.len();
            let file_name = archive
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let tape_path = PathBuf::from(set_id).join(file_name);
            self.catalog.record_archive(
                set_id,
                &tape_path.display().to_string(),
                size,
                tape_id.as_deref(),
            )?;
            if let Some(ref manager) = self.tape_manager {
                manager.record_write(size)?;
            }
        }
        Ok(())
    }

    /// Fail the task when at least 1% of the inventory rows of this set
    /// remain unmarked after finalization.
    fn verify_copy_flags(
        &self,
        task_id: i64,
        backup_set_db_id: i64,
        paths: &[String],
        compression: &CompressionResult,
    ) -> Result<(), Error> {
        if paths.is_empty() {
            return Ok(());
        }
        if self
            .catalog
            .verify_files_queued(task_id, backup_set_db_id, paths)?
        {
            return Ok(());
        }

        let copied = self.catalog.count_copied_files(task_id, backup_set_db_id)?;
        let expected = compression.processed_files.max(1);
        let missing = expected.saturating_sub(copied);
        let missing_ratio = missing as f64 / expected as f64;
        if missing_ratio >= VERIFY_FAILURE_THRESHOLD {
            bail!(
                "copy verification failed: {}/{} inventory rows unmarked ({:.2}%)",
                missing,
                expected,
                missing_ratio * 100.0
            );
        }
        log::warn!(
            "copy verification: {} of {} rows unmarked ({:.2}%), below the failure threshold",
            missing,
            expected,
            missing_ratio * 100.0
        );
        Ok(())
    }
}
