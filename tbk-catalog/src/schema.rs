//! Catalog schema. All statements are idempotent.

use anyhow::Error;
use rusqlite::Connection;

pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS backup_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_name TEXT NOT NULL,
    task_type TEXT NOT NULL,
    source_paths TEXT NOT NULL DEFAULT '[]',
    exclude_patterns TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'pending',
    scan_status TEXT NOT NULL DEFAULT 'none',
    progress_percent REAL NOT NULL DEFAULT 0,
    total_files INTEGER NOT NULL DEFAULT 0,
    processed_files INTEGER NOT NULL DEFAULT 0,
    total_bytes INTEGER NOT NULL DEFAULT 0,
    processed_bytes INTEGER NOT NULL DEFAULT 0,
    compressed_bytes INTEGER NOT NULL DEFAULT 0,
    result_summary TEXT,
    tape_device TEXT,
    is_template INTEGER NOT NULL DEFAULT 0,
    description TEXT NOT NULL DEFAULT '',
    retention_days INTEGER NOT NULL DEFAULT 0,
    compression_enabled INTEGER NOT NULL DEFAULT 1,
    encryption_enabled INTEGER NOT NULL DEFAULT 0,
    enable_simple_scan INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER,
    error_message TEXT,
    backup_files_group_id INTEGER,
    backup_files_table TEXT
);

CREATE TABLE IF NOT EXISTS backup_files_groups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL UNIQUE,
    task_id INTEGER NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS backup_files_template (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    backup_set_id INTEGER NOT NULL DEFAULT 0,
    file_path TEXT NOT NULL,
    file_size INTEGER NOT NULL DEFAULT 0,
    mtime INTEGER NOT NULL DEFAULT 0,
    is_copy_success INTEGER,
    copy_status_at INTEGER,
    updated_at INTEGER,
    archive_id INTEGER
);

CREATE TABLE IF NOT EXISTS tape_cartridges (
    tape_id TEXT PRIMARY KEY,
    label TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'new',
    media_type TEXT NOT NULL DEFAULT 'LTO',
    generation INTEGER NOT NULL DEFAULT 8,
    serial_number TEXT NOT NULL DEFAULT '',
    manufacturer TEXT NOT NULL DEFAULT '',
    location TEXT NOT NULL DEFAULT '',
    capacity_bytes INTEGER NOT NULL DEFAULT 0,
    used_bytes INTEGER NOT NULL DEFAULT 0,
    retention_months INTEGER NOT NULL DEFAULT 6,
    notes TEXT,
    created_date INTEGER NOT NULL DEFAULT 0,
    first_use_date INTEGER,
    expiry_date INTEGER,
    last_used_date INTEGER,
    last_erase_date INTEGER,
    auto_erase INTEGER NOT NULL DEFAULT 1,
    health_score INTEGER NOT NULL DEFAULT 100,
    error_count INTEGER NOT NULL DEFAULT 0,
    warning_count INTEGER NOT NULL DEFAULT 0,
    write_count INTEGER NOT NULL DEFAULT 0,
    read_count INTEGER NOT NULL DEFAULT 0,
    load_count INTEGER NOT NULL DEFAULT 0,
    pass_count INTEGER NOT NULL DEFAULT 0,
    backup_group TEXT,
    backup_sets TEXT NOT NULL DEFAULT '[]',
    backup_set_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS backup_sets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL,
    set_id TEXT NOT NULL UNIQUE,
    tape_id TEXT,
    archive_count INTEGER NOT NULL DEFAULT 0,
    total_bytes INTEGER NOT NULL DEFAULT 0,
    last_archive_path TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
";

/// Column list shared by `backup_files_template` and every per-task clone.
pub(crate) const INVENTORY_COLUMNS: &str = "
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    backup_set_id INTEGER NOT NULL DEFAULT 0,
    file_path TEXT NOT NULL,
    file_size INTEGER NOT NULL DEFAULT 0,
    mtime INTEGER NOT NULL DEFAULT 0,
    is_copy_success INTEGER,
    copy_status_at INTEGER,
    updated_at INTEGER,
    archive_id INTEGER
";

pub(crate) fn init_schema(conn: &Connection) -> Result<(), Error> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Physical inventory table name for a task, zero-padded like the
/// production deployments (`backup_files_000044`).
pub fn inventory_table_name(task_id: i64) -> String {
    format!("backup_files_{:06}", task_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_idempotent() -> Result<(), Error> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        init_schema(&conn)?;
        Ok(())
    }

    #[test]
    fn test_table_name_padding() {
        assert_eq!(inventory_table_name(44), "backup_files_000044");
        assert_eq!(inventory_table_name(1234567), "backup_files_1234567");
    }
}
