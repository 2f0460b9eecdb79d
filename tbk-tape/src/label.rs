//! LTFS volume label handling.
//!
//! On a platform with the cartridge mounted as a filesystem the label
//! round-trips through a JSON label document at a fixed name on the
//! mount; formatting (which itself clears the medium) goes through the
//! configured external format+label tool with a hard timeout.

use std::path::Path;
use std::time::Duration;

use anyhow::format_err;
use serde::{Deserialize, Serialize};

use tbk_tools::command::{run_with_limits, ExitReason, RunLimits};
use tbk_tools::fs::{file_read_optional_string, replace_file_atomic};

use crate::TapeDriverError;

/// Name of the label document on the mounted volume.
pub const TAPE_LABEL_FILE_NAME: &str = ".tape-label.json";

/// Timeout for external label tooling.
const LABEL_TOOL_TIMEOUT: Duration = Duration::from_secs(600);
/// Timeout for label reads; on expiry the child is killed and the read
/// reports no label.
const LABEL_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Volume label metadata identifying a cartridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeLabel {
    pub tape_id: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_system: Option<String>,
}

impl TapeLabel {
    pub fn new(tape_id: &str, label: &str) -> Self {
        Self {
            tape_id: tape_id.to_string(),
            label: label.to_string(),
            serial_number: None,
            file_system: None,
        }
    }

    /// Serial numbers are only usable when 6 uppercase alphanumerics.
    pub fn usable_serial(&self) -> Option<&str> {
        match self.serial_number.as_deref() {
            Some(serial)
                if serial.len() == 6
                    && serial
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() && !c.is_ascii_lowercase()) =>
            {
                Some(serial)
            }
            _ => None,
        }
    }
}

/// Scheduler-driven label format: `TP<YYYY><MM>01`.
pub fn scheduler_label(year: i32, month: u32) -> String {
    format!("TP{:04}{:02}01", year, month)
}

/// Write the label document onto the mounted volume.
pub fn write_label(mount_point: &Path, label: &TapeLabel) -> Result<(), TapeDriverError> {
    if !mount_point.exists() {
        return Err(TapeDriverError::Other(format_err!(
            "tape mount point {:?} does not exist",
            mount_point
        )));
    }
    let data = serde_json::to_vec_pretty(label)
        .map_err(|err| TapeDriverError::Other(err.into()))?;
    replace_file_atomic(&mount_point.join(TAPE_LABEL_FILE_NAME), &data)?;
    Ok(())
}

/// Read the label document from the mounted volume.
///
/// Returns `None` when the mount or the document is absent; a present but
/// unparsable document is a protocol error.
pub fn read_label(mount_point: &Path) -> Result<Option<TapeLabel>, TapeDriverError> {
    if !mount_point.exists() {
        log::warn!("tape mount point {:?} does not exist", mount_point);
        return Ok(None);
    }
    let content = match file_read_optional_string(&mount_point.join(TAPE_LABEL_FILE_NAME))? {
        Some(content) => content,
        None => return Ok(None),
    };
    let label = serde_json::from_str(&content)
        .map_err(|err| TapeDriverError::Protocol(format!("invalid label document: {}", err)))?;
    Ok(Some(label))
}

/// Format the volume through the external format+label tool.
///
/// The tool is expected to clear the medium and set the given volume
/// label; the label document is rewritten afterwards so reads keep
/// working through the mount.
pub fn format_with_tool(
    tool: &Path,
    mount_point: &Path,
    label: &TapeLabel,
) -> Result<(), TapeDriverError> {
    let mut command = std::process::Command::new(tool);
    command.arg(mount_point);
    command.arg(&label.label);
    if let Some(serial) = label.usable_serial() {
        command.arg(serial);
    }

    log::info!("[label-tool] executing: {:?}", command);
    let output = run_with_limits(command, RunLimits::with_timeout(LABEL_TOOL_TIMEOUT))?;
    tbk_tools::command::log_command_output("label-tool", &output);

    match output.reason {
        ExitReason::Exited(0) => {}
        ExitReason::TimedOut => {
            return Err(TapeDriverError::Timeout {
                verb: "format".to_string(),
                timeout: LABEL_TOOL_TIMEOUT,
            })
        }
        ExitReason::Signal => {
            return Err(TapeDriverError::DeviceBusy(
                "format tool killed by signal".to_string(),
            ))
        }
        ExitReason::Cancelled => return Err(TapeDriverError::Cancelled),
        ExitReason::Exited(code) => {
            return Err(TapeDriverError::Other(format_err!(
                "format tool failed with code {}: {}",
                code,
                output.stderr.trim()
            )))
        }
    }

    write_label(mount_point, label)
}

/// Read the label via an external read tool, killing it on timeout.
///
/// Falls back to the label document when no tool is configured.
pub fn read_label_with_tool(
    tool: Option<&Path>,
    mount_point: &Path,
) -> Result<Option<TapeLabel>, TapeDriverError> {
    let tool = match tool {
        Some(tool) => tool,
        None => return read_label(mount_point),
    };

    let mut command = std::process::Command::new(tool);
    command.arg(mount_point);
    let output = run_with_limits(command, RunLimits::with_timeout(LABEL_READ_TIMEOUT))?;
    match output.reason {
        ExitReason::Exited(0) => {
            let volume_name = output.stdout.trim();
            if volume_name.is_empty() {
                return Ok(None);
            }
            Ok(Some(TapeLabel::new(volume_name, volume_name)))
        }
        ExitReason::TimedOut => {
            log::warn!("label read tool timed out, killed");
            Ok(None)
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn testdir(name: &str) -> PathBuf {
        let mut dir: PathBuf = String::from("./target/testout").into();
        dir.push(module_path!());
        dir.push(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_label_round_trip_is_verbatim() {
        let mount = testdir("round_trip");
        let mut label = TapeLabel::new("ARCHV01", "ARCHV01");
        label.serial_number = Some("ABCDEF".to_string());

        write_label(&mount, &label).unwrap();
        let read = read_label(&mount).unwrap().unwrap();
        assert_eq!(read, label);
        assert_eq!(read.tape_id, "ARCHV01");
        assert_eq!(read.serial_number.as_deref(), Some("ABCDEF"));
    }

    #[test]
    fn test_missing_label_reads_none() {
        let mount = testdir("missing");
        assert!(read_label(&mount).unwrap().is_none());
        assert!(read_label(&mount.join("nonexistent")).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_label_is_protocol_error() {
        let mount = testdir("corrupt");
        std::fs::write(mount.join(TAPE_LABEL_FILE_NAME), "not json").unwrap();
        match read_label(&mount) {
            Err(TapeDriverError::Protocol(_)) => {}
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_serial_usability_rules() {
        let mut label = TapeLabel::new("T1", "T1");
        assert_eq!(label.usable_serial(), None);
        label.serial_number = Some("ABCDEF".to_string());
        assert_eq!(label.usable_serial(), Some("ABCDEF"));
        label.serial_number = Some("abcdef".to_string());
        assert_eq!(label.usable_serial(), None);
        label.serial_number = Some("TOOLONG1".to_string());
        assert_eq!(label.usable_serial(), None);
    }

    #[test]
    fn test_scheduler_label_format() {
        assert_eq!(scheduler_label(2025, 11), "TP20251101");
        assert_eq!(scheduler_label(2026, 3), "TP20260301");
    }
}
