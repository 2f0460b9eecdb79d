use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use crate::year_month;

/// Cartridge lifecycle status
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TapeStatus {
    /// Fresh cartridge, never used
    New,
    /// Ready for allocation
    Available,
    /// Loaded in a drive by a running task
    InUse,
    /// Capacity exhausted
    Full,
    /// Retention window elapsed
    Expired,
    /// Hardware or catalog error
    Error,
    /// Under maintenance, not allocatable
    Maintenance,
    /// Permanently removed from rotation
    Retired,
}

serde_plain::derive_display_from_serialize!(TapeStatus);
serde_plain::derive_fromstr_from_deserialize!(TapeStatus);

/// Usage fraction above which a cartridge counts as full.
pub const TAPE_FULL_THRESHOLD_PERCENT: f64 = 95.0;

/// One physical tape and its catalog metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapeCartridge {
    /// Alphanumeric label, uppercase
    pub tape_id: String,
    /// Human-readable label
    pub label: String,
    pub status: TapeStatus,

    pub capacity_bytes: u64,
    pub used_bytes: u64,

    pub created_date: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_use_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_erase_date: Option<i64>,

    pub location: String,
    pub media_type: String,
    pub generation: u32,
    pub serial_number: String,
    pub manufacturer: String,
    pub retention_months: u32,

    pub write_count: u64,
    pub read_count: u64,
    pub load_count: u64,
    pub pass_count: u64,

    /// 0..=100, derived from drive usage statistics
    pub health_score: u32,
    pub error_count: u64,
    pub warning_count: u64,

    /// `YYYY-MM` backup group this cartridge is assigned to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_group: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backup_sets: Vec<String>,
}

impl TapeCartridge {
    pub fn new(tape_id: &str, label: &str, capacity_bytes: u64, retention_months: u32) -> Self {
        Self {
            tape_id: tape_id.to_uppercase(),
            label: label.to_string(),
            status: TapeStatus::New,
            capacity_bytes,
            used_bytes: 0,
            created_date: proxmox_time::epoch_i64(),
            first_use_date: None,
            expiry_date: None,
            last_used_date: None,
            last_erase_date: None,
            location: String::new(),
            media_type: "LTO".to_string(),
            generation: 8,
            serial_number: String::new(),
            manufacturer: String::new(),
            retention_months,
            write_count: 0,
            read_count: 0,
            load_count: 0,
            pass_count: 0,
            health_score: 100,
            error_count: 0,
            warning_count: 0,
            backup_group: None,
            backup_sets: Vec::new(),
        }
    }

    pub fn free_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes)
    }

    pub fn usage_percent(&self) -> f64 {
        if self.capacity_bytes == 0 {
            return 0.0;
        }
        (self.used_bytes as f64 / self.capacity_bytes as f64) * 100.0
    }

    pub fn is_full(&self) -> bool {
        self.used_bytes >= self.capacity_bytes
            || self.usage_percent() >= TAPE_FULL_THRESHOLD_PERCENT
    }

    /// Retention check with year/month granularity.
    ///
    /// A cartridge is expired when the current (year, month) is at or past
    /// the expiry (year, month); the day never participates.
    pub fn is_expired(&self, now: i64) -> bool {
        let expiry = match self.expiry_date {
            Some(expiry) => expiry,
            None => return false,
        };
        let (expiry_year, expiry_month) = match year_month(expiry) {
            Ok(pair) => pair,
            Err(_) => return false,
        };
        let (current_year, current_month) = match year_month(now) {
            Ok(pair) => pair,
            Err(_) => return false,
        };
        current_year > expiry_year
            || (current_year == expiry_year && current_month >= expiry_month)
    }

    pub fn days_until_expiry(&self, now: i64) -> i64 {
        match self.expiry_date {
            Some(expiry) => (expiry - now) / 86400,
            None => -1,
        }
    }

    pub fn age_days(&self, now: i64) -> i64 {
        (now - self.created_date).max(0) / 86400
    }

    /// Whether this cartridge may receive a new backup right now.
    pub fn is_available_for_backup(&self, required_space: u64, now: i64) -> bool {
        if self.status != TapeStatus::Available {
            return false;
        }
        if self.is_expired(now) || self.is_full() {
            return false;
        }
        if required_space > 0 && self.free_bytes() < required_space {
            return false;
        }
        true
    }

    /// Account for data written to the cartridge.
    pub fn update_usage(&mut self, bytes_written: u64, now: i64) {
        self.used_bytes += bytes_written;
        self.last_used_date = Some(now);
        self.write_count += 1;
        if self.is_full() {
            self.status = TapeStatus::Full;
        }
    }

    pub fn update_read_access(&mut self, now: i64) {
        self.last_used_date = Some(now);
        self.read_count += 1;
    }

    /// Transition into a drive. Rejects lifecycle violations.
    pub fn mark_as_used(&mut self, backup_group: Option<&str>, now: i64) -> Result<(), Error> {
        match self.status {
            TapeStatus::New | TapeStatus::Available | TapeStatus::InUse => {}
            other => bail!(
                "invalid state transition: cannot load tape '{}' with status {}",
                self.tape_id,
                other
            ),
        }
        self.status = TapeStatus::InUse;
        self.last_used_date = Some(now);
        self.load_count += 1;
        if self.first_use_date.is_none() {
            self.first_use_date = Some(now);
        }
        if let Some(group) = backup_group {
            self.backup_group = Some(group.to_string());
        }
        Ok(())
    }

    /// Return to the pool unless full or expired.
    pub fn mark_as_available(&mut self, now: i64) {
        if !self.is_expired(now) && !self.is_full() {
            self.status = TapeStatus::Available;
        }
    }

    pub fn mark_as_expired(&mut self) {
        self.status = TapeStatus::Expired;
    }

    pub fn mark_error(&mut self) {
        self.status = TapeStatus::Error;
        self.error_count += 1;
    }

    /// Reset after an erase: usage cleared, retention window restarted.
    pub fn reset_usage(&mut self, now: i64) -> Result<(), Error> {
        self.used_bytes = 0;
        self.created_date = now;
        self.expiry_date = Some(crate::add_months(now, self.retention_months)?);
        self.last_erase_date = Some(now);
        self.backup_group = None;
        self.backup_sets.clear();
        self.mark_as_available(now);
        Ok(())
    }

    pub fn update_health_score(&mut self, new_score: u32) {
        self.health_score = new_score.min(100);
    }

    pub fn increment_error_count(&mut self) {
        self.error_count += 1;
        if self.error_count > 5 {
            self.status = TapeStatus::Error;
        }
    }

    pub fn increment_warning_count(&mut self) {
        self.warning_count += 1;
    }
}

/// Aggregate view over the cartridge inventory.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct InventoryStatus {
    pub total_tapes: usize,
    pub available_tapes: usize,
    pub in_use_tapes: usize,
    pub expired_tapes: usize,
    pub total_capacity_bytes: u64,
    pub used_capacity_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_tape: Option<String>,
}

impl InventoryStatus {
    pub fn free_capacity_bytes(&self) -> u64 {
        self.total_capacity_bytes
            .saturating_sub(self.used_capacity_bytes)
    }

    pub fn usage_percent(&self) -> f64 {
        if self.total_capacity_bytes == 0 {
            return 0.0;
        }
        (self.used_capacity_bytes as f64 / self.total_capacity_bytes as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tape() -> TapeCartridge {
        TapeCartridge::new("ARCHV01", "archive tape 01", 1000, 6)
    }

    #[test]
    fn test_full_by_threshold() {
        let mut tape = test_tape();
        tape.used_bytes = 949;
        assert!(!tape.is_full());
        tape.used_bytes = 950;
        assert!(tape.is_full());
    }

    #[test]
    fn test_year_month_expiry() -> Result<(), Error> {
        let mut tape = test_tape();
        tape.expiry_date = Some(proxmox_time::parse_rfc3339("2025-10-15T12:00:00Z")?);

        // any day inside the expiry month counts as expired
        assert!(tape.is_expired(proxmox_time::parse_rfc3339("2025-10-01T23:00:00Z")?));
        assert!(tape.is_expired(proxmox_time::parse_rfc3339("2025-10-31T00:00:00Z")?));
        assert!(tape.is_expired(proxmox_time::parse_rfc3339("2026-01-05T12:00:00Z")?));
        // the month before is not
        assert!(!tape.is_expired(proxmox_time::parse_rfc3339("2025-09-30T00:00:00Z")?));
        Ok(())
    }

    #[test]
    fn test_load_rejects_retired() {
        let mut tape = test_tape();
        tape.status = TapeStatus::Retired;
        assert!(tape.mark_as_used(None, 0).is_err());
    }

    #[test]
    fn test_usage_accounting_flips_to_full() {
        let mut tape = test_tape();
        tape.status = TapeStatus::InUse;
        tape.update_usage(400, 100);
        assert_eq!(tape.used_bytes, 400);
        assert_eq!(tape.write_count, 1);
        assert_eq!(tape.status, TapeStatus::InUse);
        tape.update_usage(600, 200);
        assert_eq!(tape.status, TapeStatus::Full);
    }

    #[test]
    fn test_reset_usage_restarts_retention() -> Result<(), Error> {
        let mut tape = test_tape();
        tape.status = TapeStatus::Expired;
        tape.used_bytes = 900;
        let now = proxmox_time::parse_rfc3339("2025-03-10T12:00:00Z")?;
        tape.reset_usage(now)?;
        assert_eq!(tape.used_bytes, 0);
        assert_eq!(tape.status, TapeStatus::Available);
        let (year, month) = crate::year_month(tape.expiry_date.unwrap())?;
        assert_eq!((year, month), (2025, 9));
        Ok(())
    }
}
