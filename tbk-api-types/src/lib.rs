//! Shared data types for the tape backup engine.
//!
//! Everything in here is plain data: task and cartridge records, status
//! enums, and the helpers that derive state from them (expiry, stage
//! codes). No component logic lives in this crate.

mod task;
pub use task::*;

mod tape;
pub use tape::*;

mod device;
pub use device::*;

mod file;
pub use file::*;

mod stage;
pub use stage::*;

use anyhow::Error;

/// Extract the local (year, month) of an epoch timestamp.
pub fn year_month(epoch: i64) -> Result<(i32, u32), Error> {
    let year: i32 = proxmox_time::strftime_local("%Y", epoch)?.parse()?;
    let month: u32 = proxmox_time::strftime_local("%m", epoch)?.parse()?;
    Ok((year, month))
}

/// Epoch of the first day of the month `months` after `epoch`.
///
/// Retention windows have year/month granularity, so the result is pinned
/// to noon UTC of the first day - no local timezone can shift that into a
/// neighboring month.
pub fn add_months(epoch: i64, months: u32) -> Result<i64, Error> {
    let (year, month) = year_month(epoch)?;
    let total = (year as i64) * 12 + (month as i64 - 1) + months as i64;
    let (new_year, new_month) = (total.div_euclid(12), total.rem_euclid(12) + 1);
    proxmox_time::parse_rfc3339(&format!("{:04}-{:02}-01T12:00:00Z", new_year, new_month))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_months_rolls_over_year() -> Result<(), Error> {
        let start = proxmox_time::parse_rfc3339("2025-10-15T12:00:00Z")?;
        let expiry = add_months(start, 6)?;
        assert_eq!(year_month(expiry)?, (2026, 4));
        Ok(())
    }

    #[test]
    fn test_add_months_same_year() -> Result<(), Error> {
        let start = proxmox_time::parse_rfc3339("2025-03-01T12:00:00Z")?;
        let expiry = add_months(start, 2)?;
        assert_eq!(year_month(expiry)?, (2025, 5));
        Ok(())
    }
}
