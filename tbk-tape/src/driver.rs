//! Async-free façade over the external device-control tool.
//!
//! Every verb serializes into one subprocess invocation of the shape
//! `<tool> [flags..] -f <device> <verb> [args..]`. Exit codes are reported
//! to the caller; a killed child maps to `DeviceBusy`, a timeout kills the
//! child and maps to `Timeout`.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tbk_api_types::{PartitionInfo, TapeDeviceInfo, TapeUsage};
use tbk_config::BackupConfig;
use tbk_tools::command::{run_with_limits, CommandOutput, ExitReason, RunLimits};
use tbk_tools::CancelToken;

use crate::parse;
use crate::TapeDriverError;

/// Subprocess wall clock for quick verbs (tur, rewind dispatch, qrypos ...).
const DEFAULT_VERB_TIMEOUT: Duration = Duration::from_secs(30);
/// Wall clock for verbs that move the medium (load, unload, rewind).
const MOTION_VERB_TIMEOUT: Duration = Duration::from_secs(600);
/// Cadence of the `tur` poll during a long erase.
pub const ERASE_POLL_INTERVAL: Duration = Duration::from_secs(15);
/// Outer budget for a long erase.
pub const ERASE_OUTER_BUDGET: Duration = Duration::from_secs(3 * 3600);
/// Expected poll count for the erase progress estimate (3 h / 15 s).
const ERASE_EXPECTED_POLLS: u64 = 720;
/// Readiness wait: up to 30 retries, 1 s apart.
const READY_RETRIES: u32 = 30;

/// Default tool locations probed when none is configured.
const TOOL_CANDIDATES: &[&str] = &[
    "/usr/local/itdt/itdt",
    "/usr/bin/itdt",
    "C:\\itdt\\itdt.exe",
];

/// Handle to the external device-control tool.
pub struct ToolTapeDriver {
    tool_path: PathBuf,
    force_generic: bool,
    scan_show_all_paths: bool,
    default_device: String,
}

impl ToolTapeDriver {
    /// Locate the tool binary and build the driver.
    ///
    /// Fails with [`TapeDriverError::DriverUnavailable`] when the binary
    /// exists at none of the candidate locations.
    pub fn new(config: &BackupConfig) -> Result<Self, TapeDriverError> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(ref path) = config.tool_path {
            candidates.push(path.clone());
        }
        candidates.extend(TOOL_CANDIDATES.iter().map(PathBuf::from));

        let tool_path = candidates
            .iter()
            .find(|path| path.exists())
            .cloned()
            .ok_or_else(|| {
                let checked: Vec<String> = candidates
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect();
                TapeDriverError::DriverUnavailable(checked.join(", "))
            })?;

        Ok(Self {
            tool_path,
            force_generic: config.tool_force_generic,
            scan_show_all_paths: config.tool_scan_show_all_paths,
            default_device: config
                .tool_device_path
                .clone()
                .unwrap_or_else(|| "/dev/nst0".to_string()),
        })
    }

    /// Build a driver around a known tool binary (tests, diagnostics).
    pub fn with_tool(tool_path: &Path, default_device: &str) -> Self {
        Self {
            tool_path: tool_path.to_owned(),
            force_generic: false,
            scan_show_all_paths: false,
            default_device: default_device.to_string(),
        }
    }

    pub fn default_device(&self) -> &str {
        &self.default_device
    }

    /// Normalize a device path for the tool.
    ///
    /// Strips a trailing colon and rewrites SCSI-addressed alternates to
    /// the OS-native tape node.
    pub fn normalize_device(&self, device: &str) -> String {
        let device = device.trim().trim_end_matches(':');
        let lowered = device.to_lowercase();
        if lowered.starts_with("\\\\.\\scsi") {
            return "\\\\.\\Tape0".to_string();
        }
        if lowered.starts_with("/dev/sg") {
            return self.default_device.clone();
        }
        device.to_string()
    }

    fn run_verb(
        &self,
        device: Option<&str>,
        verb: &str,
        extra_args: &[&str],
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<CommandOutput, TapeDriverError> {
        let mut command = std::process::Command::new(&self.tool_path);
        if self.force_generic {
            command.arg("-force-generic-dd");
        }
        if let Some(device) = device {
            command.arg("-f").arg(self.normalize_device(device));
        }
        command.arg(verb);
        command.args(extra_args);

        log::info!("[tape-tool] executing: {:?}", command);
        let output = run_with_limits(
            command,
            RunLimits {
                timeout: Some(timeout),
                cancel: cancel.cloned(),
            },
        )?;
        tbk_tools::command::log_command_output("tape-tool", &output);

        match output.reason {
            ExitReason::Signal => Err(TapeDriverError::DeviceBusy(format!(
                "'{}' child killed by signal",
                verb
            ))),
            ExitReason::TimedOut => Err(TapeDriverError::Timeout {
                verb: verb.to_string(),
                timeout,
            }),
            ExitReason::Cancelled => Err(TapeDriverError::Cancelled),
            ExitReason::Exited(_) => Ok(output),
        }
    }

    fn run_expect_success(
        &self,
        device: &str,
        verb: &str,
        extra_args: &[&str],
        timeout: Duration,
    ) -> Result<(), TapeDriverError> {
        let output = self.run_verb(Some(device), verb, extra_args, timeout, None)?;
        if !output.success() {
            return Err(TapeDriverError::Other(anyhow::format_err!(
                "'{}' failed with code {:?}: {}",
                verb,
                output.exit_code(),
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// TEST UNIT READY. A non-zero exit simply means "not ready".
    pub fn test_unit_ready(&self, device: &str) -> Result<bool, TapeDriverError> {
        let output = self.run_verb(Some(device), "tur", &[], DEFAULT_VERB_TIMEOUT, None)?;
        Ok(output.success())
    }

    /// Wait until the unit reports ready, retrying once per second.
    pub fn wait_until_ready(&self, device: &str) -> Result<(), TapeDriverError> {
        for _ in 0..READY_RETRIES {
            if self.test_unit_ready(device)? {
                return Ok(());
            }
            std::thread::sleep(Duration::from_secs(1));
        }
        Err(TapeDriverError::Timeout {
            verb: "tur".to_string(),
            timeout: Duration::from_secs(READY_RETRIES as u64),
        })
    }

    pub fn rewind(&self, device: &str) -> Result<(), TapeDriverError> {
        self.run_expect_success(device, "rewind", &[], MOTION_VERB_TIMEOUT)
    }

    pub fn load(&self, device: &str, auto_mount: bool) -> Result<(), TapeDriverError> {
        let args: &[&str] = if auto_mount { &["-amu"] } else { &[] };
        self.run_expect_success(device, "load", args, MOTION_VERB_TIMEOUT)
    }

    pub fn unload(&self, device: &str) -> Result<(), TapeDriverError> {
        self.run_expect_success(device, "unload", &[], MOTION_VERB_TIMEOUT)
    }

    /// Short erase, synchronous.
    pub fn erase_short(&self, device: &str) -> Result<(), TapeDriverError> {
        self.run_expect_success(device, "erase", &["-short"], MOTION_VERB_TIMEOUT)
    }

    /// Long erase (full physical erase, may run for hours).
    ///
    /// Dispatches ERASE, then polls TEST UNIT READY every 15 s until the
    /// drive reports ready. `progress` receives a 0..=100 estimate:
    /// `min(99, polls/expected*99)` while running, 100 at completion, 0 on
    /// cancel.
    pub fn erase_long(
        &self,
        device: &str,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(f64),
    ) -> Result<(), TapeDriverError> {
        progress(0.0);

        // The dispatch either returns quickly (drive goes busy) or times
        // out while the drive is already erasing; both count as dispatched.
        match self.run_verb(Some(device), "erase", &[], Duration::from_secs(60), None) {
            Ok(output) if !output.success() => {
                return Err(TapeDriverError::Other(anyhow::format_err!(
                    "drive rejected ERASE: {}",
                    output.stderr.trim()
                )));
            }
            Ok(_) | Err(TapeDriverError::Timeout { .. }) => {}
            Err(err) => return Err(err),
        }

        let started = Instant::now();
        let mut polls: u64 = 0;
        loop {
            // sleep in 1 s slices so a cancel takes effect promptly
            for _ in 0..ERASE_POLL_INTERVAL.as_secs() {
                if cancel.is_cancelled() {
                    progress(0.0);
                    return Err(TapeDriverError::Cancelled);
                }
                std::thread::sleep(Duration::from_secs(1));
            }
            polls += 1;
            progress((polls as f64 / ERASE_EXPECTED_POLLS as f64 * 99.0).min(99.0));

            if self.test_unit_ready(device)? {
                progress(100.0);
                log::info!(
                    "long erase finished after {} minutes",
                    started.elapsed().as_secs() / 60
                );
                return Ok(());
            }
            if started.elapsed() >= ERASE_OUTER_BUDGET {
                return Err(TapeDriverError::Timeout {
                    verb: "erase".to_string(),
                    timeout: ERASE_OUTER_BUDGET,
                });
            }
        }
    }

    pub fn write_filemarks(&self, device: &str, count: u32) -> Result<(), TapeDriverError> {
        let count_string = count.to_string();
        let mut args: Vec<&str> = Vec::new();
        if count > 1 {
            args.push(&count_string);
        }
        self.run_expect_success(device, "weof", &args, MOTION_VERB_TIMEOUT)
    }

    pub fn query_position(&self, device: &str) -> Result<Option<u64>, TapeDriverError> {
        let output = self.run_verb(Some(device), "qrypos", &[], DEFAULT_VERB_TIMEOUT, None)?;
        if !output.success() {
            return Ok(None);
        }
        Ok(parse::parse_position(&output.stdout))
    }

    /// Query the partition layout; `has_partitions` is the authoritative
    /// "formatted" signal.
    pub fn query_partition(&self, device: &str) -> Result<PartitionInfo, TapeDriverError> {
        let output = self.run_verb(Some(device), "qrypart", &[], DEFAULT_VERB_TIMEOUT, None)?;
        if !output.success() {
            log::warn!(
                "qrypart failed with code {:?}, treating cartridge as unformatted",
                output.exit_code()
            );
            return Ok(PartitionInfo::default());
        }
        Ok(parse::parse_partition_info(&output.stdout))
    }

    /// Usage statistics plus the derived health score.
    pub fn tape_usage(&self, device: &str) -> Result<TapeUsage, TapeDriverError> {
        let output = self.run_verb(Some(device), "tapeusage", &[], DEFAULT_VERB_TIMEOUT, None)?;
        if !output.success() {
            log::warn!("tapeusage failed with code {:?}", output.exit_code());
            return Ok(TapeUsage::default());
        }
        let mut usage = parse::parse_tape_usage(&output.stdout);
        usage.is_formatted = self.query_partition(device)?.has_partitions;
        Ok(usage)
    }

    /// Read the TapeAlert log page.
    ///
    /// Drives or tools without support simply report no flags; this
    /// never fails the owning operation.
    pub fn tape_alert_flags(&self, device: &str) -> Result<crate::TapeAlertFlags, TapeDriverError> {
        let output = match self.run_verb(
            Some(device),
            "logsense",
            &["-p", "0x2e"],
            DEFAULT_VERB_TIMEOUT,
            None,
        ) {
            Ok(output) if output.success() => output,
            Ok(_) | Err(TapeDriverError::Timeout { .. }) => {
                return Ok(crate::TapeAlertFlags::empty())
            }
            Err(err) => return Err(err),
        };
        match crate::alerts::decode_tape_alert_hex(&output.stdout) {
            Ok(flags) => Ok(flags),
            Err(err) => {
                log::warn!("unparsable tape alert payload: {}", err);
                Ok(crate::TapeAlertFlags::empty())
            }
        }
    }

    /// Scan the bus for tape devices.
    pub fn scan_devices(&self) -> Result<Vec<TapeDeviceInfo>, TapeDriverError> {
        let args: &[&str] = if self.scan_show_all_paths {
            &["-showallpaths"]
        } else {
            &[]
        };
        let output = self.run_verb(None, "scan", args, MOTION_VERB_TIMEOUT, None)?;
        if !output.success() {
            return Ok(Vec::new());
        }
        Ok(parse::parse_scan_output(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn testdir(name: &str) -> PathBuf {
        let mut dir: PathBuf = String::from("./target/testout").into();
        dir.push(module_path!());
        dir.push(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn fake_tool(dir: &Path, script: &str) -> PathBuf {
        let path = dir.join("itdt");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn test_missing_tool_is_driver_unavailable() {
        let mut config = BackupConfig::default();
        config.tool_path = Some(PathBuf::from("/nonexistent/itdt"));
        // the default candidates are absent on a build host as well
        match ToolTapeDriver::new(&config) {
            Err(TapeDriverError::DriverUnavailable(_)) => {}
            other => panic!("expected DriverUnavailable, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_tur_reports_ready_state() {
        let dir = testdir("tur");
        let tool = fake_tool(&dir, "exit 0");
        let driver = ToolTapeDriver::with_tool(&tool, "/dev/nst0");
        assert!(driver.test_unit_ready("/dev/nst0").unwrap());

        let tool = fake_tool(&dir, "exit 2");
        let driver = ToolTapeDriver::with_tool(&tool, "/dev/nst0");
        assert!(!driver.test_unit_ready("/dev/nst0").unwrap());
    }

    #[test]
    fn test_scan_devices_via_tool() {
        let dir = testdir("scan");
        let tool = fake_tool(
            &dir,
            r#"echo '#0 /dev/nst0: - [ULT3580-HH9]-[R3G1] S/N:10WT036260'"#,
        );
        let driver = ToolTapeDriver::with_tool(&tool, "/dev/nst0");
        let devices = driver.scan_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].serial, "10WT036260");
    }

    #[test]
    fn test_device_normalization() {
        let dir = testdir("normalize");
        let tool = fake_tool(&dir, "exit 0");
        let driver = ToolTapeDriver::with_tool(&tool, "/dev/nst0");
        assert_eq!(driver.normalize_device("/dev/nst0:"), "/dev/nst0");
        assert_eq!(driver.normalize_device(r"\\.\scsi0:"), r"\\.\Tape0");
        assert_eq!(driver.normalize_device("/dev/sg3"), "/dev/nst0");
    }

    #[test]
    fn test_rewind_failure_carries_stderr() {
        let dir = testdir("rewind_fail");
        let tool = fake_tool(&dir, "echo 'medium not present' >&2; exit 1");
        let driver = ToolTapeDriver::with_tool(&tool, "/dev/nst0");
        let err = driver.rewind("/dev/nst0").unwrap_err();
        assert!(err.to_string().contains("medium not present"));
    }
}
