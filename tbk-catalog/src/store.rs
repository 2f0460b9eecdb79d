//! The catalog store façade.
//!
//! Reads run on a dedicated connection guarded by a mutex; every write is
//! submitted to the single writer thread. Task creation provisions the
//! task row, the physical inventory table and the group mapping in one
//! transaction - a failure leaves no partial state.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use rusqlite::{params, Connection, OptionalExtension, Row};

use tbk_api_types::{
    BackupSet, BackupTask, FileRecord, ResultSummary, ScanStatus, TapeCartridge, TapeStatus,
    TaskConfig, TaskStatus,
};

use crate::schema::{init_schema, inventory_table_name, INVENTORY_COLUMNS};
use crate::writer::{CatalogWriter, Priority};
use crate::{mark_files_queued_tx, verify_files_queued_tx};

/// Tuning knobs for the store; defaults match the production settings.
#[derive(Debug, Clone)]
pub struct CatalogTuning {
    pub command_timeout: Duration,
    pub warn_threshold: Duration,
    pub heartbeat: Duration,
}

impl Default for CatalogTuning {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(60),
            warn_threshold: Duration::from_secs(5),
            heartbeat: Duration::from_secs(30),
        }
    }
}

/// Row payload for bulk inventory inserts.
#[derive(Debug, Clone)]
pub struct NewFileRow {
    pub backup_set_id: i64,
    pub file_path: String,
    pub file_size: u64,
    pub mtime: i64,
}

/// Progress counters pushed by the compressor.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProgressUpdate {
    pub processed_files: u64,
    pub processed_bytes: u64,
    pub compressed_bytes: u64,
    pub progress_percent: f64,
}

pub struct CatalogStore {
    reader: Mutex<Connection>,
    writer: CatalogWriter,
}

fn open_connection(path: &Path, tuning: &CatalogTuning) -> Result<Connection, Error> {
    let conn = Connection::open(path)
        .map_err(|err| format_err!("unable to open catalog {:?} - {}", path, err))?;
    conn.busy_timeout(tuning.command_timeout)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

impl CatalogStore {
    pub fn open(path: &Path, tuning: CatalogTuning) -> Result<Self, Error> {
        let writer_conn = open_connection(path, &tuning)?;
        init_schema(&writer_conn)?;
        let reader = open_connection(path, &tuning)?;
        let writer = CatalogWriter::spawn(writer_conn, tuning.warn_threshold, tuning.heartbeat);
        Ok(Self {
            reader: Mutex::new(reader),
            writer,
        })
    }

    pub fn open_with_defaults(path: &Path) -> Result<Self, Error> {
        Self::open(path, CatalogTuning::default())
    }

    fn with_reader<R>(&self, f: impl FnOnce(&Connection) -> Result<R, Error>) -> Result<R, Error> {
        let conn = self
            .reader
            .lock()
            .map_err(|_| format_err!("catalog reader lock poisoned"))?;
        f(&conn)
    }

    /// Wait until every queued write has been processed.
    pub fn drain_writes(&self) -> Result<(), Error> {
        self.writer.drain()
    }

    // ------------------------------------------------------------------
    // tasks

    /// Create a task from its configuration.
    ///
    /// Non-template tasks get their physical inventory table and the
    /// group-mapping row inside the same transaction.
    pub fn create_task(&self, config: &TaskConfig) -> Result<i64, Error> {
        let config = config.clone();
        self.writer
            .submit(Priority::Normal, "create task", move |conn| {
                create_task_tx(conn, &config)
            })
            .wait()
    }

    /// Clone a template into a new execution with the same invariants.
    pub fn clone_template_to_execution(&self, template_id: i64) -> Result<i64, Error> {
        let template = self
            .get_task(template_id)?
            .ok_or_else(|| format_err!("no such task {}", template_id))?;
        if !template.is_template {
            bail!("task {} is not a template", template_id);
        }
        let config = TaskConfig {
            task_name: template.task_name.clone(),
            task_type: template.task_type,
            source_paths: template.source_paths.clone(),
            exclude_patterns: template.exclude_patterns.clone(),
            compression_enabled: template.compression_enabled,
            encryption_enabled: template.encryption_enabled,
            enable_simple_scan: template.enable_simple_scan,
            retention_days: template.retention_days,
            tape_device: template.tape_device.clone(),
            is_template: false,
        };
        self.create_task(&config)
    }

    pub fn get_task(&self, task_id: i64) -> Result<Option<BackupTask>, Error> {
        self.with_reader(|conn| {
            let task = conn
                .query_row(
                    "SELECT id, task_name, task_type, source_paths, exclude_patterns,
                            status, scan_status, progress_percent, total_files,
                            processed_files, total_bytes, processed_bytes,
                            compressed_bytes, result_summary, tape_device, is_template,
                            description, retention_days, compression_enabled,
                            encryption_enabled, enable_simple_scan, created_at,
                            started_at, completed_at, error_message, backup_files_table
                     FROM backup_tasks WHERE id = ?1",
                    params![task_id],
                    task_from_row,
                )
                .optional()?;
            Ok(task)
        })
    }

    /// All tasks, optionally filtered by status, newest first.
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<BackupTask>, Error> {
        self.with_reader(|conn| {
            let base = "SELECT id, task_name, task_type, source_paths, exclude_patterns,
                            status, scan_status, progress_percent, total_files,
                            processed_files, total_bytes, processed_bytes,
                            compressed_bytes, result_summary, tape_device, is_template,
                            description, retention_days, compression_enabled,
                            encryption_enabled, enable_simple_scan, created_at,
                            started_at, completed_at, error_message, backup_files_table
                     FROM backup_tasks";
            let tasks = match status {
                Some(status) => {
                    let mut stmt = conn
                        .prepare(&format!("{} WHERE status = ?1 ORDER BY id DESC", base))?;
                    let rows = stmt.query_map(params![status.to_string()], task_from_row)?;
                    rows.collect::<Result<Vec<_>, _>>()?
                }
                None => {
                    let mut stmt = conn.prepare(&format!("{} ORDER BY id DESC", base))?;
                    let rows = stmt.query_map([], task_from_row)?;
                    rows.collect::<Result<Vec<_>, _>>()?
                }
            };
            Ok(tasks)
        })
    }

    /// Delete a task together with its inventory table and group row.
    ///
    /// Running tasks are refused; the caller cancels first.
    pub fn delete_task(&self, task_id: i64) -> Result<(), Error> {
        let task = self
            .get_task(task_id)?
            .ok_or_else(|| format_err!("no such task {}", task_id))?;
        if task.status == TaskStatus::Running {
            bail!("task {} is running and cannot be deleted", task_id);
        }
        self.writer
            .submit(Priority::Normal, "delete task", move |conn| {
                let tx = conn.transaction()?;
                let table: Option<String> = tx
                    .query_row(
                        "SELECT table_name FROM backup_files_groups WHERE task_id = ?1",
                        params![task_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(table) = table {
                    tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", table))?;
                    tx.execute(
                        "DELETE FROM backup_files_groups WHERE task_id = ?1",
                        params![task_id],
                    )?;
                }
                tx.execute("DELETE FROM backup_tasks WHERE id = ?1", params![task_id])?;
                tx.commit()?;
                Ok(())
            })
            .wait()
    }

    /// Inventory table name, verified against the group mapping.
    pub fn task_table(&self, task_id: i64) -> Result<String, Error> {
        self.with_reader(|conn| {
            let table: Option<String> = conn
                .query_row(
                    "SELECT table_name FROM backup_files_groups WHERE task_id = ?1",
                    params![task_id],
                    |row| row.get(0),
                )
                .optional()?;
            table.ok_or_else(|| format_err!("task {} has no inventory table", task_id))
        })
    }

    pub fn set_task_status(&self, task_id: i64, status: TaskStatus) -> Result<(), Error> {
        self.writer
            .submit(Priority::High, "set task status", move |conn| {
                let now = proxmox_time::epoch_i64();
                match status {
                    TaskStatus::Running => conn.execute(
                        "UPDATE backup_tasks SET status = ?1, started_at = ?2 WHERE id = ?3",
                        params![status.to_string(), now, task_id],
                    )?,
                    TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => conn
                        .execute(
                            "UPDATE backup_tasks SET status = ?1, completed_at = ?2 WHERE id = ?3",
                            params![status.to_string(), now, task_id],
                        )?,
                    _ => conn.execute(
                        "UPDATE backup_tasks SET status = ?1 WHERE id = ?2",
                        params![status.to_string(), task_id],
                    )?,
                };
                Ok(())
            })
            .wait()
    }

    pub fn set_scan_status(&self, task_id: i64, scan_status: ScanStatus) -> Result<(), Error> {
        self.writer
            .submit(Priority::High, "set scan status", move |conn| {
                conn.execute(
                    "UPDATE backup_tasks SET scan_status = ?1 WHERE id = ?2",
                    params![scan_status.to_string(), task_id],
                )?;
                Ok(())
            })
            .wait()
    }

    /// Record the latest bracketed stage tag.
    pub fn set_description(&self, task_id: i64, description: &str) -> Result<(), Error> {
        let description = description.to_string();
        self.writer
            .submit(Priority::High, "set description", move |conn| {
                conn.execute(
                    "UPDATE backup_tasks SET description = ?1 WHERE id = ?2",
                    params![description, task_id],
                )?;
                Ok(())
            })
            .wait()
    }

    pub fn set_error_message(&self, task_id: i64, message: &str) -> Result<(), Error> {
        let message = message.to_string();
        self.writer
            .submit(Priority::High, "set error message", move |conn| {
                conn.execute(
                    "UPDATE backup_tasks SET error_message = ?1 WHERE id = ?2",
                    params![message, task_id],
                )?;
                Ok(())
            })
            .wait()
    }

    /// Freeze scan totals once the scanner finished.
    pub fn freeze_totals(&self, task_id: i64, total_files: u64, total_bytes: u64) -> Result<(), Error> {
        self.writer
            .submit(Priority::High, "freeze totals", move |conn| {
                conn.execute(
                    "UPDATE backup_tasks SET total_files = ?1, total_bytes = ?2 WHERE id = ?3",
                    params![total_files as i64, total_bytes as i64, task_id],
                )?;
                Ok(())
            })
            .wait()
    }

    pub fn update_progress(&self, task_id: i64, update: ProgressUpdate) -> Result<(), Error> {
        self.writer
            .submit(Priority::High, "update progress", move |conn| {
                conn.execute(
                    "UPDATE backup_tasks SET
                         processed_files = ?1,
                         processed_bytes = ?2,
                         compressed_bytes = ?3,
                         progress_percent = ?4
                     WHERE id = ?5",
                    params![
                        update.processed_files as i64,
                        update.processed_bytes as i64,
                        update.compressed_bytes as i64,
                        update.progress_percent,
                        task_id
                    ],
                )?;
                Ok(())
            })
            .wait()
    }

    pub fn set_result_summary(&self, task_id: i64, summary: &ResultSummary) -> Result<(), Error> {
        let json = serde_json::to_string(summary)?;
        self.writer
            .submit(Priority::High, "set result summary", move |conn| {
                conn.execute(
                    "UPDATE backup_tasks SET result_summary = ?1 WHERE id = ?2",
                    params![json, task_id],
                )?;
                Ok(())
            })
            .wait()
    }

    // ------------------------------------------------------------------
    // file inventory

    /// Bulk-insert scanned files into the task's inventory table.
    ///
    /// Duplicates within a batch are accepted silently; deduplication
    /// happens when paths are marked as copied.
    pub fn bulk_insert_files(
        &self,
        task_id: i64,
        rows: Vec<NewFileRow>,
        batch_size: usize,
    ) -> Result<(), Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let table = self.task_table(task_id)?;
        self.writer
            .submit(Priority::High, "bulk insert files", move |conn| {
                let now = proxmox_time::epoch_i64();
                for chunk in rows.chunks(batch_size.max(1)) {
                    let tx = conn.transaction()?;
                    {
                        let mut stmt = tx.prepare(&format!(
                            "INSERT INTO {} (backup_set_id, file_path, file_size, mtime, updated_at)
                             VALUES (?1, ?2, ?3, ?4, ?5)",
                            table
                        ))?;
                        for row in chunk {
                            stmt.execute(params![
                                row.backup_set_id,
                                row.file_path,
                                row.file_size as i64,
                                row.mtime,
                                now
                            ])?;
                        }
                    }
                    tx.commit()?;
                }
                Ok(())
            })
            .wait()
    }

    /// Mark paths of one backup set as copied; returns rows updated.
    pub fn mark_files_queued(
        &self,
        task_id: i64,
        backup_set_id: i64,
        paths: Vec<String>,
    ) -> Result<usize, Error> {
        if paths.is_empty() {
            return Ok(0);
        }
        let table = self.task_table(task_id)?;
        self.writer
            .submit(Priority::High, "mark files queued", move |conn| {
                let now = proxmox_time::epoch_i64();
                mark_files_queued_tx(conn, &table, backup_set_id, &paths, now)
            })
            .wait()
    }

    /// True iff every path of the set is marked as copied.
    pub fn verify_files_queued(
        &self,
        task_id: i64,
        backup_set_id: i64,
        paths: &[String],
    ) -> Result<bool, Error> {
        let table = self.task_table(task_id)?;
        self.with_reader(|conn| verify_files_queued_tx(conn, &table, backup_set_id, paths))
    }

    /// Page through the inventory in stable id order.
    pub fn fetch_pending_files(
        &self,
        task_id: i64,
        cursor: i64,
        limit: usize,
    ) -> Result<Vec<FileRecord>, Error> {
        let table = self.task_table(task_id)?;
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, backup_set_id, file_path, file_size, mtime,
                        is_copy_success, copy_status_at, archive_id
                 FROM {} WHERE id > ?1 ORDER BY id LIMIT ?2",
                table
            ))?;
            let rows = stmt.query_map(params![cursor, limit as i64], |row| {
                Ok(FileRecord {
                    id: row.get(0)?,
                    backup_set_id: row.get(1)?,
                    file_path: row.get(2)?,
                    file_size: row.get::<_, i64>(3)? as u64,
                    mtime: row.get(4)?,
                    is_copy_success: row.get(5)?,
                    copy_status_at: row.get(6)?,
                    archive_id: row.get(7)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Count of distinct copied paths in one backup set.
    pub fn count_copied_files(&self, task_id: i64, backup_set_id: i64) -> Result<u64, Error> {
        let table = self.task_table(task_id)?;
        self.with_reader(|conn| {
            let count: i64 = conn.query_row(
                &format!(
                    "SELECT COUNT(DISTINCT file_path) FROM {}
                     WHERE backup_set_id = ?1 AND is_copy_success = 1",
                    table
                ),
                params![backup_set_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    // ------------------------------------------------------------------
    // tape cartridges

    pub fn upsert_tape(&self, tape: &TapeCartridge) -> Result<(), Error> {
        let tape = tape.clone();
        self.writer
            .submit(Priority::Normal, "upsert tape", move |conn| {
                upsert_tape_tx(conn, &tape)
            })
            .wait()
    }

    pub fn get_tape(&self, tape_id: &str) -> Result<Option<TapeCartridge>, Error> {
        let tape_id = tape_id.to_uppercase();
        self.with_reader(|conn| {
            let tape = conn
                .query_row(
                    &format!("{} WHERE tape_id = ?1", TAPE_SELECT),
                    params![tape_id],
                    tape_from_row,
                )
                .optional()?;
            Ok(tape)
        })
    }

    pub fn list_tapes(&self) -> Result<Vec<TapeCartridge>, Error> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(&format!("{} ORDER BY tape_id", TAPE_SELECT))?;
            let rows = stmt.query_map([], tape_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// First available, unexpired cartridge with enough free space.
    pub fn find_available_tape(
        &self,
        required_bytes: u64,
        now: i64,
    ) -> Result<Option<TapeCartridge>, Error> {
        let tapes = self.list_tapes()?;
        Ok(tapes
            .into_iter()
            .find(|tape| tape.is_available_for_backup(required_bytes, now)))
    }

    /// Cartridges whose retention window elapsed but whose status does not
    /// say so yet.
    pub fn expired_candidates(&self, now: i64) -> Result<Vec<TapeCartridge>, Error> {
        let tapes = self.list_tapes()?;
        Ok(tapes
            .into_iter()
            .filter(|tape| tape.is_expired(now) && tape.status != TapeStatus::Expired)
            .collect())
    }

    /// Rename a cartridge primary key after a re-label.
    ///
    /// On a key conflict only the label column is updated; a missing
    /// original row is reported so the caller can decide to insert.
    pub fn rename_tape(
        &self,
        old_tape_id: &str,
        new_tape_id: &str,
        new_label: &str,
    ) -> Result<bool, Error> {
        let old_tape_id = old_tape_id.to_uppercase();
        let new_tape_id = new_tape_id.to_uppercase();
        let new_label = new_label.to_string();
        self.writer
            .submit(Priority::Normal, "rename tape", move |conn| {
                let result = conn.execute(
                    "UPDATE tape_cartridges SET tape_id = ?1, label = ?2 WHERE tape_id = ?3",
                    params![new_tape_id, new_label, old_tape_id],
                );
                match result {
                    Ok(affected) => Ok(affected > 0),
                    Err(rusqlite::Error::SqliteFailure(err, _))
                        if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        // primary key taken, keep the key and update the label
                        let affected = conn.execute(
                            "UPDATE tape_cartridges SET label = ?1 WHERE tape_id = ?2",
                            params![new_label, old_tape_id],
                        )?;
                        Ok(affected > 0)
                    }
                    Err(err) => Err(err.into()),
                }
            })
            .wait()
    }

    /// Account a tape write on the cartridge row.
    pub fn record_tape_write(&self, tape_id: &str, bytes: u64, now: i64) -> Result<(), Error> {
        let tape_id = tape_id.to_uppercase();
        self.writer
            .submit(Priority::High, "record tape write", move |conn| {
                conn.execute(
                    "UPDATE tape_cartridges SET
                         used_bytes = used_bytes + ?1,
                         write_count = write_count + 1,
                         last_used_date = ?2
                     WHERE tape_id = ?3",
                    params![bytes as i64, now, tape_id],
                )?;
                Ok(())
            })
            .wait()
    }

    // ------------------------------------------------------------------
    // backup sets

    /// Make sure the backup-set row exists and return its id.
    pub fn ensure_backup_set(&self, task_id: i64, set_id: &str) -> Result<i64, Error> {
        let set_id = set_id.to_string();
        self.writer
            .submit(Priority::Normal, "ensure backup set", move |conn| {
                let now = proxmox_time::epoch_i64();
                conn.execute(
                    "INSERT INTO backup_sets (task_id, set_id, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?3)
                     ON CONFLICT(set_id) DO NOTHING",
                    params![task_id, set_id, now],
                )?;
                let id = conn.query_row(
                    "SELECT id FROM backup_sets WHERE set_id = ?1",
                    params![set_id],
                    |row| row.get(0),
                )?;
                Ok(id)
            })
            .wait()
    }

    /// Record one archive landing on tape for a backup set.
    pub fn record_archive(
        &self,
        set_id: &str,
        archive_path: &str,
        archive_bytes: u64,
        tape_id: Option<&str>,
    ) -> Result<(), Error> {
        let set_id = set_id.to_string();
        let archive_path = archive_path.to_string();
        let tape_id = tape_id.map(|t| t.to_uppercase());
        self.writer
            .submit(Priority::High, "record archive", move |conn| {
                let now = proxmox_time::epoch_i64();
                let affected = conn.execute(
                    "UPDATE backup_sets SET
                         archive_count = archive_count + 1,
                         total_bytes = total_bytes + ?1,
                         last_archive_path = ?2,
                         tape_id = COALESCE(?3, tape_id),
                         updated_at = ?4
                     WHERE set_id = ?5",
                    params![archive_bytes as i64, archive_path, tape_id, now, set_id],
                )?;
                if affected == 0 {
                    bail!("backup set '{}' not found", set_id);
                }
                Ok(())
            })
            .wait()
    }

    pub fn get_backup_set(&self, set_id: &str) -> Result<Option<BackupSet>, Error> {
        let set_id = set_id.to_string();
        self.with_reader(|conn| {
            let set = conn
                .query_row(
                    "SELECT id, task_id, set_id, tape_id, archive_count, total_bytes,
                            last_archive_path, created_at, updated_at
                     FROM backup_sets WHERE set_id = ?1",
                    params![set_id],
                    |row| {
                        Ok(BackupSet {
                            id: row.get(0)?,
                            task_id: row.get(1)?,
                            set_id: row.get(2)?,
                            tape_id: row.get(3)?,
                            archive_count: row.get::<_, i64>(4)? as u64,
                            total_bytes: row.get::<_, i64>(5)? as u64,
                            last_archive_path: row.get(6)?,
                            created_at: row.get(7)?,
                            updated_at: row.get(8)?,
                        })
                    },
                )
                .optional()?;
            Ok(set)
        })
    }
}

// ----------------------------------------------------------------------
// row mapping

fn parse_json_list(value: String) -> Vec<String> {
    serde_json::from_str(&value).unwrap_or_default()
}

fn task_from_row(row: &Row) -> rusqlite::Result<BackupTask> {
    let task_type: String = row.get(2)?;
    let status: String = row.get(5)?;
    let scan_status: String = row.get(6)?;
    let summary: Option<String> = row.get(13)?;
    Ok(BackupTask {
        id: row.get(0)?,
        task_name: row.get(1)?,
        task_type: task_type.parse().unwrap_or(tbk_api_types::TaskType::Full),
        source_paths: parse_json_list(row.get(3)?),
        exclude_patterns: parse_json_list(row.get(4)?),
        status: status.parse().unwrap_or(TaskStatus::Pending),
        scan_status: scan_status.parse().unwrap_or(ScanStatus::None),
        progress_percent: row.get(7)?,
        total_files: row.get::<_, i64>(8)? as u64,
        processed_files: row.get::<_, i64>(9)? as u64,
        total_bytes: row.get::<_, i64>(10)? as u64,
        processed_bytes: row.get::<_, i64>(11)? as u64,
        compressed_bytes: row.get::<_, i64>(12)? as u64,
        result_summary: summary.and_then(|s| serde_json::from_str(&s).ok()),
        tape_device: row.get(14)?,
        is_template: row.get(15)?,
        description: row.get(16)?,
        retention_days: row.get(17)?,
        compression_enabled: row.get(18)?,
        encryption_enabled: row.get(19)?,
        enable_simple_scan: row.get(20)?,
        created_at: row.get(21)?,
        started_at: row.get(22)?,
        completed_at: row.get(23)?,
        error_message: row.get(24)?,
        backup_files_table: row.get(25)?,
    })
}

fn create_task_tx(conn: &mut Connection, config: &TaskConfig) -> Result<i64, Error> {
    let tx = conn.transaction()?;
    let now = proxmox_time::epoch_i64();
    tx.execute(
        "INSERT INTO backup_tasks (
             task_name, task_type, source_paths, exclude_patterns, status,
             scan_status, is_template, retention_days, compression_enabled,
             encryption_enabled, enable_simple_scan, tape_device, created_at
         ) VALUES (?1, ?2, ?3, ?4, 'pending', 'none', ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            config.task_name,
            config.task_type.to_string(),
            serde_json::to_string(&config.source_paths)?,
            serde_json::to_string(&config.exclude_patterns)?,
            config.is_template,
            config.retention_days,
            config.compression_enabled,
            config.encryption_enabled,
            config.enable_simple_scan,
            config.tape_device,
            now
        ],
    )?;
    let task_id = tx.last_insert_rowid();

    if !config.is_template {
        let table = inventory_table_name(task_id);
        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            table, INVENTORY_COLUMNS
        ))?;
        tx.execute(
            "INSERT INTO backup_files_groups (table_name, task_id) VALUES (?1, ?2)",
            params![table, task_id],
        )?;
        let group_id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE backup_tasks SET backup_files_table = ?1, backup_files_group_id = ?2
             WHERE id = ?3",
            params![table, group_id, task_id],
        )?;
    }

    tx.commit()?;
    Ok(task_id)
}

const TAPE_SELECT: &str = "SELECT tape_id, label, status, media_type, generation,
        serial_number, manufacturer, location, capacity_bytes, used_bytes,
        retention_months, created_date, first_use_date, expiry_date,
        last_used_date, last_erase_date, health_score, error_count,
        warning_count, write_count, read_count, load_count, pass_count,
        backup_group, backup_sets
 FROM tape_cartridges";

fn tape_from_row(row: &Row) -> rusqlite::Result<TapeCartridge> {
    let status: String = row.get(2)?;
    let backup_sets: String = row.get(24)?;
    Ok(TapeCartridge {
        tape_id: row.get(0)?,
        label: row.get(1)?,
        status: status.parse().unwrap_or(TapeStatus::Error),
        media_type: row.get(3)?,
        generation: row.get::<_, i64>(4)? as u32,
        serial_number: row.get(5)?,
        manufacturer: row.get(6)?,
        location: row.get(7)?,
        capacity_bytes: row.get::<_, i64>(8)? as u64,
        used_bytes: row.get::<_, i64>(9)? as u64,
        retention_months: row.get::<_, i64>(10)? as u32,
        created_date: row.get(11)?,
        first_use_date: row.get(12)?,
        expiry_date: row.get(13)?,
        last_used_date: row.get(14)?,
        last_erase_date: row.get(15)?,
        health_score: row.get::<_, i64>(16)? as u32,
        error_count: row.get::<_, i64>(17)? as u64,
        warning_count: row.get::<_, i64>(18)? as u64,
        write_count: row.get::<_, i64>(19)? as u64,
        read_count: row.get::<_, i64>(20)? as u64,
        load_count: row.get::<_, i64>(21)? as u64,
        pass_count: row.get::<_, i64>(22)? as u64,
        backup_group: row.get(23)?,
        backup_sets: serde_json::from_str(&backup_sets).unwrap_or_default(),
    })
}

fn upsert_tape_tx(conn: &Connection, tape: &TapeCartridge) -> Result<(), Error> {
    conn.execute(
        "INSERT INTO tape_cartridges (
             tape_id, label, status, media_type, generation, serial_number,
             manufacturer, location, capacity_bytes, used_bytes,
             retention_months, created_date, first_use_date, expiry_date,
             last_used_date, last_erase_date, health_score, error_count,
             warning_count, write_count, read_count, load_count, pass_count,
             backup_group, backup_sets
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                   ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)
         ON CONFLICT(tape_id) DO UPDATE SET
             label = excluded.label,
             status = excluded.status,
             media_type = excluded.media_type,
             generation = excluded.generation,
             serial_number = excluded.serial_number,
             manufacturer = excluded.manufacturer,
             location = excluded.location,
             capacity_bytes = excluded.capacity_bytes,
             used_bytes = excluded.used_bytes,
             retention_months = excluded.retention_months,
             created_date = excluded.created_date,
             first_use_date = excluded.first_use_date,
             expiry_date = excluded.expiry_date,
             last_used_date = excluded.last_used_date,
             last_erase_date = excluded.last_erase_date,
             health_score = excluded.health_score,
             error_count = excluded.error_count,
             warning_count = excluded.warning_count,
             write_count = excluded.write_count,
             read_count = excluded.read_count,
             load_count = excluded.load_count,
             pass_count = excluded.pass_count,
             backup_group = excluded.backup_group,
             backup_sets = excluded.backup_sets",
        params![
            tape.tape_id,
            tape.label,
            tape.status.to_string(),
            tape.media_type,
            tape.generation as i64,
            tape.serial_number,
            tape.manufacturer,
            tape.location,
            tape.capacity_bytes as i64,
            tape.used_bytes as i64,
            tape.retention_months as i64,
            tape.created_date,
            tape.first_use_date,
            tape.expiry_date,
            tape.last_used_date,
            tape.last_erase_date,
            tape.health_score as i64,
            tape.error_count as i64,
            tape.warning_count as i64,
            tape.write_count as i64,
            tape.read_count as i64,
            tape.load_count as i64,
            tape.pass_count as i64,
            tape.backup_group,
            serde_json::to_string(&tape.backup_sets)?,
        ],
    )?;
    Ok(())
}
