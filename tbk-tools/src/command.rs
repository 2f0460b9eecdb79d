//! Subprocess control.
//!
//! Every external tool call goes through here: stdin closed, stdout and
//! stderr captured, a wall-clock timeout with kill, and a cooperative
//! cancel that also kills the child.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{format_err, Error};

use crate::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Why a child process stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Normal exit with the given code
    Exited(i32),
    /// Terminated by a signal
    Signal,
    /// Killed after the wall-clock timeout elapsed
    TimedOut,
    /// Killed after a cancel request
    Cancelled,
}

/// Captured result of a finished child process.
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub reason: ExitReason,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        matches!(self.reason, ExitReason::Exited(0))
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.reason {
            ExitReason::Exited(code) => Some(code),
            _ => None,
        }
    }
}

/// Execution limits for one child process.
#[derive(Debug, Default, Clone)]
pub struct RunLimits {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

impl RunLimits {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }
}

fn spawn_reader(stream: Option<impl Read + Send + 'static>) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut buffer);
        }
        buffer
    })
}

fn wait_with_limits(child: &mut Child, limits: &RunLimits) -> Result<ExitReason, Error> {
    let deadline = limits.timeout.map(|timeout| Instant::now() + timeout);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(match status.code() {
                Some(code) => ExitReason::Exited(code),
                None => ExitReason::Signal,
            });
        }
        if let Some(ref cancel) = limits.cancel {
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(ExitReason::Cancelled);
            }
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(ExitReason::TimedOut);
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Run a command to completion under the given limits.
///
/// Returns `Err` only when the child cannot be spawned; timeouts, cancels
/// and non-zero exits are reported through [`CommandOutput::reason`].
pub fn run_with_limits(mut command: Command, limits: RunLimits) -> Result<CommandOutput, Error> {
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|err| format_err!("failed to execute {:?} - {}", command, err))?;

    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());

    let reason = wait_with_limits(&mut child, &limits)?;

    let stdout = stdout_reader
        .join()
        .map_err(|_| format_err!("stdout reader thread panicked"))?;
    let stderr = stderr_reader
        .join()
        .map_err(|_| format_err!("stderr reader thread panicked"))?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        reason,
    })
}

/// Log captured tool output line by line at debug level.
pub fn log_command_output(tag: &str, output: &CommandOutput) {
    for line in output.stdout.lines() {
        log::debug!("[{}] {}", tag, line);
    }
    for line in output.stderr.lines() {
        log::debug!("[{}] (stderr) {}", tag, line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_output() -> Result<(), Error> {
        let mut command = Command::new("sh");
        command.args(["-c", "echo out; echo err >&2"]);
        let output = run_with_limits(command, RunLimits::default())?;
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        Ok(())
    }

    #[test]
    fn test_timeout_kills_child() -> Result<(), Error> {
        let mut command = Command::new("sleep");
        command.arg("30");
        let start = Instant::now();
        let output = run_with_limits(
            command,
            RunLimits::with_timeout(Duration::from_millis(300)),
        )?;
        assert_eq!(output.reason, ExitReason::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(5));
        Ok(())
    }

    #[test]
    fn test_cancel_kills_child() -> Result<(), Error> {
        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            canceller.cancel();
        });
        let mut command = Command::new("sleep");
        command.arg("30");
        let output = run_with_limits(
            command,
            RunLimits {
                timeout: None,
                cancel: Some(cancel),
            },
        )?;
        assert_eq!(output.reason, ExitReason::Cancelled);
        Ok(())
    }

    #[test]
    fn test_nonzero_exit_reported() -> Result<(), Error> {
        let mut command = Command::new("sh");
        command.args(["-c", "exit 3"]);
        let output = run_with_limits(command, RunLimits::default())?;
        assert_eq!(output.exit_code(), Some(3));
        assert!(!output.success());
        Ok(())
    }
}
