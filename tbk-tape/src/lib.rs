//! LTO tape support via an external device-control tool.
//!
//! The driver shells out to an ITDT-compatible binary for every device
//! verb; no direct SCSI pass-through happens in-process. Output parsing
//! lives in [`parse`], LTFS volume label handling in [`label`].

use std::time::Duration;

pub mod alerts;
pub use alerts::{tape_alert_flags_critical, TapeAlertFlags};

mod driver;
pub use driver::*;

pub mod label;
pub mod parse;

/// Errors surfaced by the tape driver.
#[derive(thiserror::Error, Debug)]
pub enum TapeDriverError {
    /// The control tool binary exists at none of the candidate locations.
    #[error("tape control tool not found (checked: {0})")]
    DriverUnavailable(String),
    /// The child process was killed by a signal.
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("'{verb}' timed out after {timeout:?}")]
    Timeout { verb: String, timeout: Duration },
    #[error("operation cancelled")]
    Cancelled,
    /// Tool output did not have the required structure.
    #[error("unparsable tool output: {0}")]
    Protocol(String),
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}
