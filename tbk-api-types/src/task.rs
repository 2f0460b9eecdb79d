use serde::{Deserialize, Serialize};

/// Backup task type
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Full backup of all source paths
    Full,
    /// Only files changed since the last backup
    Incremental,
    /// Only files changed since the last full backup
    Differential,
    /// Scheduler-driven full backup at month start
    MonthlyFull,
}

serde_plain::derive_display_from_serialize!(TaskType);
serde_plain::derive_fromstr_from_deserialize!(TaskType);

/// Task execution status
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet started
    Pending,
    /// Execution in progress
    Running,
    /// Finished successfully
    Completed,
    /// Aborted with a fatal error
    Failed,
    /// Cancelled by request
    Cancelled,
}

serde_plain::derive_display_from_serialize!(TaskStatus);
serde_plain::derive_fromstr_from_deserialize!(TaskStatus);

impl TaskStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Fine-grained pipeline stage of a running task
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    /// No pipeline activity yet
    None,
    /// Directory scan in progress
    Scanning,
    /// Archive units being produced
    Compressing,
    /// Archives draining to tape
    Copying,
    /// Catalog verification and summary
    Finalizing,
    /// Pipeline failed
    Failed,
    /// Pipeline cancelled
    Cancelled,
}

serde_plain::derive_display_from_serialize!(ScanStatus);
serde_plain::derive_fromstr_from_deserialize!(ScanStatus);

/// Summary written into the task record at finalization.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ResultSummary {
    /// Number of archive units the partitioner produced
    pub estimated_archive_count: u64,
    /// Total bytes discovered by the scanner
    pub total_scanned_bytes: u64,
    /// Errors collected along the way (truncated)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Configuration used to create a task (template or execution).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub task_name: String,
    pub task_type: TaskType,
    /// Ordered set of filesystem roots to back up
    pub source_paths: Vec<String>,
    /// Glob-like patterns; matching files are skipped during scan
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub compression_enabled: bool,
    #[serde(default)]
    pub encryption_enabled: bool,
    #[serde(default)]
    pub enable_simple_scan: bool,
    pub retention_days: i64,
    /// Pin the task to a specific drive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tape_device: Option<String>,
    /// Templates are never executed; they clone into executions
    #[serde(default)]
    pub is_template: bool,
}

fn default_true() -> bool {
    true
}

/// A planned or running backup execution (one row of `backup_tasks`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupTask {
    pub id: i64,
    pub task_name: String,
    pub task_type: TaskType,
    pub source_paths: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub status: TaskStatus,
    pub scan_status: ScanStatus,
    pub progress_percent: f64,
    pub total_files: u64,
    pub processed_files: u64,
    pub total_bytes: u64,
    pub processed_bytes: u64,
    pub compressed_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<ResultSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tape_device: Option<String>,
    pub is_template: bool,
    /// Carries the latest bracketed stage tag, e.g. `[compressing files] ...`
    pub description: String,
    pub retention_days: i64,
    pub compression_enabled: bool,
    pub encryption_enabled: bool,
    pub enable_simple_scan: bool,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Name of the task's physical file-inventory table
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_files_table: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_round_trip() {
        assert_eq!(TaskStatus::Running.to_string(), "running");
        assert_eq!(
            "cancelled".parse::<TaskStatus>().unwrap(),
            TaskStatus::Cancelled
        );
        assert_eq!(TaskType::MonthlyFull.to_string(), "monthly_full");
        assert_eq!("copying".parse::<ScanStatus>().unwrap(), ScanStatus::Copying);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }
}
