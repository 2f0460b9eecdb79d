use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One file discovered by the scanner, before it reaches the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: PathBuf,
    pub size: u64,
    pub mtime: i64,
}

/// One row of a task's physical inventory table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: i64,
    pub backup_set_id: i64,
    pub file_path: String,
    pub file_size: u64,
    pub mtime: i64,
    /// Tri-valued: `None` = unset, `Some(true)` = copied, `Some(false)` = failed
    pub is_copy_success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copy_status_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_id: Option<i64>,
}

/// The materialized output of a single task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSet {
    pub id: i64,
    pub task_id: i64,
    /// Identifier used in staging/tape path layouts
    pub set_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tape_id: Option<String>,
    pub archive_count: u64,
    pub total_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_archive_path: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}
