//! Stage derivation for the status surface.
//!
//! Every pipeline transition writes a bracketed tag into the task
//! description (e.g. `[compressing files] 814/1637 files (49.7%)`). The
//! status surface derives a canonical stage code from the last tag via
//! keyword matching over an ordered table.

use serde::{Deserialize, Serialize};

use crate::{ScanStatus, TaskStatus};

/// Canonical pipeline stage codes.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStage {
    Scan,
    Compress,
    Copy,
    Finalize,
    Format,
    Waiting,
    Cancelled,
    Failed,
}

serde_plain::derive_display_from_serialize!(OperationStage);
serde_plain::derive_fromstr_from_deserialize!(OperationStage);

/// Keyword table, checked in order; the first hit wins.
const STAGE_KEYWORDS: &[(&str, OperationStage)] = &[
    ("scan", OperationStage::Scan),
    ("preparing compression", OperationStage::Compress),
    ("compress", OperationStage::Compress),
    ("waiting for next batch", OperationStage::Compress),
    ("copy", OperationStage::Copy),
    ("writing", OperationStage::Copy),
    ("complet", OperationStage::Finalize),
    ("finaliz", OperationStage::Finalize),
    ("format", OperationStage::Format),
    ("cancel", OperationStage::Cancelled),
    ("fail", OperationStage::Failed),
];

/// Linear stage flow shown as step indicators by the status surface.
pub const STAGE_FLOW: &[(OperationStage, &str)] = &[
    (OperationStage::Scan, "scanning files"),
    (OperationStage::Compress, "compressing"),
    (OperationStage::Copy, "writing to tape"),
    (OperationStage::Finalize, "finalizing"),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStep {
    pub code: OperationStage,
    pub label: String,
    /// "completed" | "active" | "pending"
    pub status: String,
}

/// Derived stage view over a task's description and status columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInfo {
    /// Last bracketed tag with trailing progress text appended
    pub operation_status: String,
    pub operation_stage: OperationStage,
    pub stage_steps: Vec<StageStep>,
}

/// Extract the last bracketed tag from a description, with any progress
/// text following the closing bracket appended.
fn last_bracketed_tag(description: &str) -> Option<String> {
    let close = description.rfind(']')?;
    let open = description[..close].rfind('[')?;
    let mut tag = description[open + 1..close].replace("...", "");
    let remaining = description[close + 1..].trim();
    if !remaining.is_empty() {
        tag.push(' ');
        tag.push_str(remaining);
    }
    Some(tag)
}

fn stage_from_keywords(operation_status: &str) -> Option<OperationStage> {
    let lowered = operation_status.to_lowercase();
    STAGE_KEYWORDS
        .iter()
        .find(|(keyword, _)| lowered.contains(keyword))
        .map(|(_, code)| *code)
}

fn flow_index(stage: OperationStage) -> Option<usize> {
    STAGE_FLOW.iter().position(|(code, _)| *code == stage)
}

/// Build the stage view for one task.
///
/// The bracketed tag wins; without one, the task/scan status columns
/// decide, falling back to `waiting`.
pub fn build_stage_info(
    description: &str,
    scan_status: Option<ScanStatus>,
    status: TaskStatus,
) -> StageInfo {
    let mut operation_status = last_bracketed_tag(description);
    let mut stage = operation_status.as_deref().and_then(stage_from_keywords);

    if stage.is_none() {
        let (code, default_text) = match status {
            TaskStatus::Failed => (OperationStage::Failed, "task failed"),
            TaskStatus::Cancelled => (OperationStage::Cancelled, "task cancelled"),
            TaskStatus::Completed => (OperationStage::Finalize, "backup completed"),
            TaskStatus::Running => {
                let code = match scan_status {
                    Some(ScanStatus::Scanning) => OperationStage::Scan,
                    Some(ScanStatus::Compressing) => OperationStage::Compress,
                    Some(ScanStatus::Copying) => OperationStage::Copy,
                    Some(ScanStatus::Finalizing) => OperationStage::Finalize,
                    _ => OperationStage::Scan,
                };
                (code, "processing")
            }
            TaskStatus::Pending => (OperationStage::Waiting, "waiting to start"),
        };
        stage = Some(code);
        if operation_status.is_none() {
            operation_status = Some(default_text.to_string());
        }
    }

    let stage = stage.unwrap_or(OperationStage::Waiting);
    let mut stage_steps = Vec::new();
    if let Some(current) = flow_index(stage) {
        for (idx, (code, label)) in STAGE_FLOW.iter().enumerate() {
            let step_status = if idx < current {
                "completed"
            } else if idx == current {
                "active"
            } else {
                "pending"
            };
            stage_steps.push(StageStep {
                code: *code,
                label: label.to_string(),
                status: step_status.to_string(),
            });
        }
    }

    StageInfo {
        operation_status: operation_status.unwrap_or_default(),
        operation_stage: stage,
        stage_steps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_extraction_keeps_progress_text() {
        let info = build_stage_info(
            "[compressing files] 814/1637 files (49.7%)",
            Some(ScanStatus::Compressing),
            TaskStatus::Running,
        );
        assert_eq!(info.operation_stage, OperationStage::Compress);
        assert_eq!(info.operation_status, "compressing files 814/1637 files (49.7%)");
    }

    #[test]
    fn test_last_tag_wins() {
        let info = build_stage_info(
            "[scanning directories] done [writing to tape] backup_7_0.tar.zst",
            None,
            TaskStatus::Running,
        );
        assert_eq!(info.operation_stage, OperationStage::Copy);
    }

    #[test]
    fn test_fallback_uses_status_columns() {
        let info = build_stage_info("", Some(ScanStatus::Copying), TaskStatus::Running);
        assert_eq!(info.operation_stage, OperationStage::Copy);

        let info = build_stage_info("", None, TaskStatus::Cancelled);
        assert_eq!(info.operation_stage, OperationStage::Cancelled);
        assert_eq!(info.operation_status, "task cancelled");

        let info = build_stage_info("", None, TaskStatus::Pending);
        assert_eq!(info.operation_stage, OperationStage::Waiting);
    }

    #[test]
    fn test_stage_steps_reflect_progress() {
        let info = build_stage_info("[writing to tape]", None, TaskStatus::Running);
        let statuses: Vec<&str> = info.stage_steps.iter().map(|s| s.status.as_str()).collect();
        assert_eq!(statuses, vec!["completed", "completed", "active", "pending"]);
    }

    #[test]
    fn test_format_stage_has_no_flow_steps() {
        let info = build_stage_info("[formatting tape]", None, TaskStatus::Running);
        assert_eq!(info.operation_stage, OperationStage::Format);
        assert!(info.stage_steps.is_empty());
    }
}
