//! Archive-unit partitioning and the parallel compression pipeline.
//!
//! The inventory of a backup set is partitioned in cursor order into
//! archive units bounded by the configured unit size; a single oversize
//! file is placed alone, never split. Up to the configured number of
//! units are produced concurrently, fed through a bounded prefetch
//! queue. Each completed unit pushes progress into the catalog and, when
//! background copy updates are enabled, marks its file paths as copied.

mod strategy;
pub use strategy::*;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{format_err, Error};
use proxmox_human_byte::HumanByte;

use tbk_api_types::FileRecord;
use tbk_catalog::{CatalogStore, ProgressUpdate};
use tbk_config::BackupConfig;
use tbk_tools::CancelToken;

/// One group of files packed into one compressed container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveUnit {
    pub index: usize,
    pub files: Vec<FileRecord>,
    pub total_bytes: u64,
}

/// Partition files (in their given order) into archive units.
///
/// A unit closes when the next file would push it past
/// `max_unit_bytes`; a single file larger than the limit forms a unit of
/// its own. Ordering within a unit preserves the input ordering.
pub fn partition_into_units(files: Vec<FileRecord>, max_unit_bytes: u64) -> Vec<ArchiveUnit> {
    let mut units = Vec::new();
    let mut current: Vec<FileRecord> = Vec::new();
    let mut current_bytes = 0u64;

    let mut close =
        |current: &mut Vec<FileRecord>, current_bytes: &mut u64, units: &mut Vec<ArchiveUnit>| {
            if !current.is_empty() {
                units.push(ArchiveUnit {
                    index: units.len(),
                    files: std::mem::take(current),
                    total_bytes: *current_bytes,
                });
                *current_bytes = 0;
            }
        };

    for file in files {
        if !current.is_empty() && current_bytes + file.file_size > max_unit_bytes {
            close(&mut current, &mut current_bytes, &mut units);
        }
        current_bytes += file.file_size;
        current.push(file);
        if current_bytes >= max_unit_bytes {
            close(&mut current, &mut current_bytes, &mut units);
        }
    }
    close(&mut current, &mut current_bytes, &mut units);
    units
}

/// Aggregated result of one compression stage run.
#[derive(Debug, Default, Clone)]
pub struct CompressionResult {
    pub units_written: u64,
    pub processed_files: u64,
    pub processed_bytes: u64,
    pub compressed_bytes: u64,
    pub archives: Vec<PathBuf>,
}

/// Everything the compression stage needs to run for one backup set.
pub struct CompressionContext<'a> {
    pub catalog: &'a CatalogStore,
    pub config: &'a BackupConfig,
    pub task_id: i64,
    pub backup_set_db_id: i64,
    pub set_id: &'a str,
    /// Where finished containers land (`final/<set_id>` or the tape mount)
    pub output_dir: PathBuf,
    pub total_files: u64,
    pub cancel: CancelToken,
}

/// Fetch the full pending inventory of the task in cursor order.
pub fn fetch_all_pending(
    catalog: &CatalogStore,
    task_id: i64,
    page_size: usize,
) -> Result<Vec<FileRecord>, Error> {
    let mut records = Vec::new();
    let mut cursor = 0i64;
    loop {
        let page = catalog.fetch_pending_files(task_id, cursor, page_size)?;
        if page.is_empty() {
            break;
        }
        cursor = page.last().map(|r| r.id).unwrap_or(cursor);
        records.extend(page);
    }
    Ok(records)
}

/// Run the compression stage: one container per archive unit, up to the
/// configured number of units in flight.
pub fn run_compression(
    ctx: &CompressionContext,
    units: Vec<ArchiveUnit>,
) -> Result<CompressionResult, Error> {
    if units.is_empty() {
        return Ok(CompressionResult::default());
    }

    std::fs::create_dir_all(&ctx.output_dir)
        .map_err(|err| format_err!("unable to create {:?} - {}", ctx.output_dir, err))?;

    let archiver = archiver_for(ctx.config.compression_method);
    let options = ArchiveOptions {
        level: ctx.config.compression_level,
        threads: ctx.config.compression_command_threads,
        dictionary_size: ctx.config.compression_dictionary_size.clone(),
        sevenzip_binary: ctx.config.sevenzip_path.clone(),
    };

    let parallel = ctx.config.compression_parallel_batches.max(1);
    let prefetch = parallel + 1;
    let unit_count = units.len();

    let processed_files = Arc::new(AtomicU64::new(0));
    let processed_bytes = Arc::new(AtomicU64::new(0));
    let compressed_bytes = Arc::new(AtomicU64::new(0));

    let outcomes = std::thread::scope(|scope| -> Result<Vec<PathBuf>, Error> {
        let (unit_tx, unit_rx) = crossbeam_channel::bounded::<ArchiveUnit>(prefetch);
        let (outcome_tx, outcome_rx) = crossbeam_channel::unbounded::<Result<PathBuf, Error>>();

        for _ in 0..parallel {
            let unit_rx = unit_rx.clone();
            let outcome_tx = outcome_tx.clone();
            let archiver = &archiver;
            let options = &options;
            let processed_files = Arc::clone(&processed_files);
            let processed_bytes = Arc::clone(&processed_bytes);
            let compressed_bytes = Arc::clone(&compressed_bytes);
            scope.spawn(move || {
                while let Ok(unit) = unit_rx.recv() {
                    let outcome = compress_one_unit(
                        ctx,
                        archiver.as_ref(),
                        options,
                        unit,
                        unit_count,
                        &processed_files,
                        &processed_bytes,
                        &compressed_bytes,
                    );
                    if outcome_tx.send(outcome).is_err() {
                        break;
                    }
                }
            });
        }
        drop(outcome_tx);

        // feed units in order through the bounded prefetch queue
        let feeder = scope.spawn(move || {
            for unit in units {
                if unit_tx.send(unit).is_err() {
                    break;
                }
            }
        });

        let mut outcomes = Vec::with_capacity(unit_count);
        let mut first_error = None;
        for outcome in outcome_rx.iter() {
            match outcome {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    // stop feeding further units, drain what is in flight
                    ctx.cancel.cancel();
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        let _ = feeder.join();

        match first_error {
            Some(err) => Err(err),
            None => Ok(outcomes),
        }
    })?;

    let mut result = CompressionResult {
        units_written: outcomes.len() as u64,
        processed_files: processed_files.load(Ordering::SeqCst),
        processed_bytes: processed_bytes.load(Ordering::SeqCst),
        compressed_bytes: compressed_bytes.load(Ordering::SeqCst),
        archives: Vec::new(),
    };
    let mut archives = outcomes;
    archives.sort();
    result.archives = archives;
    Ok(result)
}

#[allow(clippy::too_many_arguments)]
fn compress_one_unit(
    ctx: &CompressionContext,
    archiver: &dyn Archiver,
    options: &ArchiveOptions,
    unit: ArchiveUnit,
    unit_count: usize,
    processed_files: &AtomicU64,
    processed_bytes: &AtomicU64,
    compressed_bytes: &AtomicU64,
) -> Result<PathBuf, Error> {
    ctx.cancel.check()?;

    let archive_name = format!(
        "backup_{}_{}.{}",
        ctx.set_id,
        unit.index,
        archiver.extension()
    );
    let output = ctx.output_dir.join(&archive_name);
    let inputs: Vec<PathBuf> = unit
        .files
        .iter()
        .map(|record| PathBuf::from(&record.file_path))
        .collect();

    log::info!(
        "compressing unit {}/{} ({} files, {})",
        unit.index + 1,
        unit_count,
        unit.files.len(),
        HumanByte::from(unit.total_bytes),
    );

    let stats = archiver.compress(&inputs, &output, options, &ctx.cancel)?;

    let files_done = processed_files.fetch_add(unit.files.len() as u64, Ordering::SeqCst)
        + unit.files.len() as u64;
    let bytes_done =
        processed_bytes.fetch_add(stats.input_bytes, Ordering::SeqCst) + stats.input_bytes;
    let compressed_done =
        compressed_bytes.fetch_add(stats.compressed_bytes, Ordering::SeqCst) + stats.compressed_bytes;

    let percent = if ctx.total_files > 0 {
        (files_done as f64 / ctx.total_files as f64) * 100.0
    } else {
        0.0
    };
    if let Err(err) = ctx.catalog.update_progress(
        ctx.task_id,
        ProgressUpdate {
            processed_files: files_done,
            processed_bytes: bytes_done,
            compressed_bytes: compressed_done,
            progress_percent: percent,
        },
    ) {
        log::warn!("progress update failed: {}", err);
    }
    if let Err(err) = ctx.catalog.set_description(
        ctx.task_id,
        &format!(
            "[compressing files] {}/{} files ({:.1}%)",
            files_done, ctx.total_files, percent
        ),
    ) {
        log::warn!("description update failed: {}", err);
    }

    // inventory-update errors never abort the stage; finalize verifies
    if ctx.config.enable_background_copy_update {
        let paths: Vec<String> = unit
            .files
            .iter()
            .map(|record| record.file_path.clone())
            .collect();
        match ctx
            .catalog
            .mark_files_queued(ctx.task_id, ctx.backup_set_db_id, paths)
        {
            Ok(updated) => log::debug!(
                "unit {} marked {} inventory rows as copied",
                unit.index,
                updated
            ),
            Err(err) => log::warn!("background copy update for unit {} failed: {}", unit.index, err),
        }
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, size: u64) -> FileRecord {
        FileRecord {
            id,
            backup_set_id: 1,
            file_path: format!("/data/file_{}", id),
            file_size: size,
            mtime: 0,
            is_copy_success: None,
            copy_status_at: None,
            archive_id: None,
        }
    }

    fn sizes(units: &[ArchiveUnit]) -> Vec<Vec<u64>> {
        units
            .iter()
            .map(|u| u.files.iter().map(|f| f.file_size).collect())
            .collect()
    }

    #[test]
    fn test_partition_unit_boundary() {
        // 600 + 500 would exceed 1000, 500 + 400 fits exactly under it
        let units = partition_into_units(
            vec![record(1, 600), record(2, 500), record(3, 400)],
            1000,
        );
        assert_eq!(sizes(&units), vec![vec![600], vec![500, 400]]);
        assert_eq!(units.len(), 2);
    }

    #[test]
    fn test_partition_oversize_file_is_alone() {
        let units = partition_into_units(vec![record(1, 5000), record(2, 100)], 1000);
        assert_eq!(sizes(&units), vec![vec![5000], vec![100]]);
    }

    #[test]
    fn test_partition_single_oversize_plus_one() {
        // a file of exactly limit + 1 forms its own unit
        let units = partition_into_units(vec![record(1, 1001)], 1000);
        assert_eq!(sizes(&units), vec![vec![1001]]);
    }

    #[test]
    fn test_partition_preserves_order_and_indexes() {
        let units = partition_into_units(
            (1..=6).map(|i| record(i, 400)).collect(),
            1000,
        );
        // 400+400 = 800, the third 400 would exceed -> units of two
        assert_eq!(units.len(), 3);
        for (expected, unit) in units.iter().enumerate() {
            assert_eq!(unit.index, expected);
        }
        let ids: Vec<i64> = units
            .iter()
            .flat_map(|u| u.files.iter().map(|f| f.id))
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_partition_exact_fit_closes_unit() {
        let units = partition_into_units(vec![record(1, 500), record(2, 500), record(3, 1)], 1000);
        assert_eq!(sizes(&units), vec![vec![500, 500], vec![1]]);
    }

    #[test]
    fn test_partition_empty_input() {
        assert!(partition_into_units(Vec::new(), 1000).is_empty());
    }
}
