//! Cartridge inventory and selection, single-drive mutual exclusion,
//! retention enforcement, label round-trip.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, format_err, Error};

use tbk_api_types::{year_month, InventoryStatus, TapeCartridge, TapeStatus, TapeUsage};
use tbk_catalog::CatalogStore;
use tbk_config::BackupConfig;
use tbk_tape::label::{self, TapeLabel};
use tbk_tape::{TapeDriverError, ToolTapeDriver};
use tbk_tools::CancelToken;

struct DriveState {
    current: Option<TapeCartridge>,
}

/// Detailed view over the loaded cartridge.
#[derive(Debug, Clone)]
pub struct TapeDetail {
    pub cartridge: TapeCartridge,
    pub usage: Option<TapeUsage>,
}

pub struct TapeManager {
    catalog: Arc<CatalogStore>,
    driver: Arc<ToolTapeDriver>,
    config: BackupConfig,
    device: String,
    /// Per-drive mutual exclusion; every device sequence and every
    /// cartridge-row mutation happens under this lock.
    drive: Mutex<DriveState>,
}

impl TapeManager {
    pub fn new(
        catalog: Arc<CatalogStore>,
        driver: Arc<ToolTapeDriver>,
        config: BackupConfig,
    ) -> Self {
        let device = config
            .tool_device_path
            .clone()
            .unwrap_or_else(|| driver.default_device().to_string());
        Self {
            catalog,
            driver,
            config,
            device,
            drive: Mutex::new(DriveState { current: None }),
        }
    }

    fn lock_drive(&self) -> Result<MutexGuard<DriveState>, Error> {
        self.drive
            .lock()
            .map_err(|_| format_err!("drive lock poisoned"))
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// First usable cartridge with enough free space.
    ///
    /// When none is found and auto-erase is enabled, one expired
    /// cartridge is erased and the lookup retried once.
    pub fn get_available_tape(
        &self,
        required_bytes: u64,
        cancel: &CancelToken,
    ) -> Result<Option<TapeCartridge>, Error> {
        let now = proxmox_time::epoch_i64();
        if let Some(tape) = self.catalog.find_available_tape(required_bytes, now)? {
            return Ok(Some(tape));
        }

        if self.config.auto_erase_expired {
            if let Some(expired) = self.catalog.expired_candidates(now)?.into_iter().next() {
                log::info!(
                    "no usable cartridge, erasing expired cartridge '{}'",
                    expired.tape_id
                );
                self.erase_tape(&expired.tape_id, cancel)?;
                return self.catalog.find_available_tape(required_bytes, now);
            }
        }

        log::warn!("no usable cartridge available");
        Ok(None)
    }

    /// Load a cartridge into the drive and mark it in use.
    pub fn load_tape(&self, tape_id: &str, cancel: &CancelToken) -> Result<(), Error> {
        let mut state = self.lock_drive()?;
        let now = proxmox_time::epoch_i64();

        let mut tape = self
            .catalog
            .get_tape(tape_id)?
            .ok_or_else(|| format_err!("invalid state: cartridge '{}' not in catalog", tape_id))?;

        if tape.is_expired(now) {
            log::warn!("cartridge '{}' is expired, erasing before use", tape.tape_id);
            self.erase_preserve_label_locked(&mut state, false, cancel)?;
            tape = self
                .catalog
                .get_tape(tape_id)?
                .unwrap_or(tape);
        }

        self.driver.load(&self.device, true).or_else(|err| {
            // standalone drives report "no media changer"; the medium is
            // already seated then
            log::debug!("load verb not applicable: {}", err);
            Ok::<(), TapeDriverError>(())
        })?;
        self.driver.wait_until_ready(&self.device)?;
        self.driver.rewind(&self.device)?;

        match label::read_label(&self.config.tape_mount_point())? {
            Some(on_tape) if !on_tape.tape_id.eq_ignore_ascii_case(&tape.tape_id) => {
                bail!(
                    "wrong cartridge in drive: expected '{}', found '{}'",
                    tape.tape_id,
                    on_tape.tape_id
                );
            }
            Some(_) => {}
            None => log::warn!("cartridge '{}' carries no readable label", tape.tape_id),
        }

        tape.mark_as_used(None, now)?;
        self.catalog.upsert_tape(&tape)?;
        state.current = Some(tape);
        Ok(())
    }

    /// Unload the current cartridge. Idempotent: a second call is a no-op.
    pub fn unload_tape(&self) -> Result<(), Error> {
        let mut state = self.lock_drive()?;
        let tape = match state.current.take() {
            Some(tape) => tape,
            None => return Ok(()),
        };
        let now = proxmox_time::epoch_i64();

        self.driver.write_filemarks(&self.device, 1)?;
        self.driver.rewind(&self.device)?;
        if let Err(err) = self.driver.unload(&self.device) {
            log::warn!("unload verb failed (standalone drive?): {}", err);
        }

        let mut tape = tape;
        if tape.status == TapeStatus::InUse {
            tape.mark_as_available(now);
        }
        self.catalog.upsert_tape(&tape)?;
        log::info!("cartridge '{}' unloaded", tape.tape_id);
        Ok(())
    }

    /// Long-erase a cartridge and reset its catalog accounting.
    pub fn erase_tape(&self, tape_id: &str, cancel: &CancelToken) -> Result<(), Error> {
        let _state = self.lock_drive()?;
        let mut tape = self
            .catalog
            .get_tape(tape_id)?
            .ok_or_else(|| format_err!("invalid state: cartridge '{}' not in catalog", tape_id))?;

        let mut last_logged = 0u32;
        let result = self.driver.erase_long(&self.device, cancel, &mut |percent| {
            let bucket = (percent / 10.0) as u32;
            if bucket > last_logged {
                last_logged = bucket;
                log::info!("erase of '{}' at {:.1}%", tape_id, percent);
            }
        });

        match result {
            Ok(()) => {
                let now = proxmox_time::epoch_i64();
                tape.reset_usage(now)?;
                self.catalog.upsert_tape(&tape)?;
                log::info!("cartridge '{}' erased and back in rotation", tape.tape_id);
                Ok(())
            }
            Err(TapeDriverError::Cancelled) => bail!("operation cancelled"),
            Err(err) => {
                tape.mark_error();
                self.catalog.upsert_tape(&tape)?;
                Err(format_err!("erase of '{}' failed: {}", tape_id, err))
            }
        }
    }

    /// Format the cartridge while preserving its volume label.
    ///
    /// The format operation itself clears the data. In scheduler mode
    /// (`use_current_year_month`) a fresh `TP<YYYY><MM>01` label is
    /// written instead of the preserved one.
    pub fn erase_preserve_label(
        &self,
        use_current_year_month: bool,
        cancel: &CancelToken,
    ) -> Result<(), Error> {
        let mut state = self.lock_drive()?;
        self.erase_preserve_label_locked(&mut state, use_current_year_month, cancel)
    }

    fn erase_preserve_label_locked(
        &self,
        _state: &mut DriveState,
        use_current_year_month: bool,
        cancel: &CancelToken,
    ) -> Result<(), Error> {
        cancel.check()?;
        let mount = self.config.tape_mount_point();
        let now = proxmox_time::epoch_i64();
        let (current_year, current_month) = year_month(now)?;

        let original = label::read_label(&mount)?;
        let (original_tape_id, original_label) = match original {
            Some(ref label) => (Some(label.tape_id.clone()), Some(label.label.clone())),
            None => (None, None),
        };

        let new_label = if use_current_year_month {
            let text = label::scheduler_label(current_year, current_month);
            log::info!("scheduler format: labeling cartridge as {}", text);
            TapeLabel::new(&text, &text)
        } else if let Some(ref label) = original {
            log::info!("format preserving label '{}'", label.label);
            label.clone()
        } else {
            let text = format!("TP{}", proxmox_time::strftime_local("%Y%m%d", now)?);
            log::info!("no readable label, formatting with fallback label {}", text);
            TapeLabel::new(&text, &text)
        };

        match self.config.label_tool_path {
            Some(ref tool) => label::format_with_tool(tool, &mount, &new_label)?,
            None => {
                // no format tool: a long erase clears the medium, then the
                // label document is rewritten on the mount
                self.driver.erase_long(&self.device, cancel, &mut |_| {})?;
                if mount.exists() {
                    label::write_label(&mount, &new_label)?;
                }
            }
        }

        self.reconcile_label_change(
            original_tape_id.as_deref(),
            original_label.as_deref(),
            &new_label,
            use_current_year_month,
            now,
        )
    }

    /// Bring the catalog row in line with a re-labeled cartridge.
    fn reconcile_label_change(
        &self,
        original_tape_id: Option<&str>,
        original_label: Option<&str>,
        new_label: &TapeLabel,
        scheduler_mode: bool,
        now: i64,
    ) -> Result<(), Error> {
        if let Some(original_id) = original_tape_id {
            if self.catalog.get_tape(original_id)?.is_some() {
                if original_id.eq_ignore_ascii_case(&new_label.tape_id) {
                    return Ok(());
                }
                let renamed =
                    self.catalog
                        .rename_tape(original_id, &new_label.tape_id, &new_label.label)?;
                log::info!(
                    "catalog record updated: '{}' -> '{}' (renamed: {})",
                    original_label.unwrap_or(original_id),
                    new_label.label,
                    renamed
                );
                return Ok(());
            }
        }

        if scheduler_mode {
            // scheduler-driven format on an unknown cartridge: register it
            let mut tape = TapeCartridge::new(
                &new_label.tape_id,
                &new_label.label,
                self.config.max_volume_size,
                self.config.default_retention_months,
            );
            tape.status = TapeStatus::Available;
            tape.created_date = now;
            tape.expiry_date = Some(tbk_api_types::add_months(
                now,
                self.config.default_retention_months,
            )?);
            if let Some(serial) = new_label.usable_serial() {
                tape.serial_number = serial.to_string();
            }
            self.catalog.upsert_tape(&tape)?;
            log::info!("registered freshly formatted cartridge '{}'", tape.tape_id);
        } else if original_tape_id.is_some() {
            log::warn!(
                "original cartridge record '{}' not found in catalog, label change not persisted",
                original_tape_id.unwrap_or_default()
            );
        }
        Ok(())
    }

    /// Mark year/month-expired cartridges, optionally erase them.
    ///
    /// Returns the ids of the cartridges that were found expired.
    pub fn check_retention_periods(&self, cancel: &CancelToken) -> Result<Vec<String>, Error> {
        let now = proxmox_time::epoch_i64();
        let candidates = self.catalog.expired_candidates(now)?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        log::info!("{} cartridge(s) reached their retention window", candidates.len());
        let mut expired_ids = Vec::new();
        for mut tape in candidates {
            tape.mark_as_expired();
            self.catalog.upsert_tape(&tape)?;
            log::warn!(
                "cartridge '{}' expired (expiry {})",
                tape.tape_id,
                tape.expiry_date
                    .and_then(|e| proxmox_time::epoch_to_rfc3339(e).ok())
                    .unwrap_or_default()
            );
            expired_ids.push(tape.tape_id.clone());

            if self.config.auto_erase_expired {
                if let Err(err) = self.erase_tape(&tape.tape_id, cancel) {
                    log::warn!("auto-erase of '{}' failed: {}", tape.tape_id, err);
                }
            }
        }
        Ok(expired_ids)
    }

    /// Account data written to the loaded cartridge.
    pub fn record_write(&self, bytes: u64) -> Result<(), Error> {
        let mut state = self.lock_drive()?;
        let now = proxmox_time::epoch_i64();
        let tape = match state.current.as_mut() {
            Some(tape) => tape,
            None => bail!("invalid state: no cartridge loaded"),
        };
        tape.update_usage(bytes, now);
        self.catalog.record_tape_write(&tape.tape_id, bytes, now)?;
        if tape.is_full() {
            log::warn!("cartridge '{}' is full", tape.tape_id);
            self.catalog.upsert_tape(tape)?;
        }
        Ok(())
    }

    pub fn current_tape(&self) -> Option<TapeCartridge> {
        self.drive.lock().ok()?.current.clone()
    }

    /// Detail view of the loaded cartridge including drive statistics.
    pub fn tape_info(&self) -> Result<Option<TapeDetail>, Error> {
        let cartridge = match self.current_tape() {
            Some(cartridge) => cartridge,
            None => return Ok(None),
        };
        let usage = match self.driver.tape_usage(&self.device) {
            Ok(usage) => Some(usage),
            Err(err) => {
                log::warn!("tape usage query failed: {}", err);
                None
            }
        };
        Ok(Some(TapeDetail { cartridge, usage }))
    }

    /// Check the drive's TapeAlert page for the loaded cartridge.
    ///
    /// Warnings bump the warning counter; a critical flag marks the
    /// cartridge as faulty.
    pub fn check_tape_alerts(&self) -> Result<Vec<String>, Error> {
        let mut state = self.lock_drive()?;
        let tape = match state.current.as_mut() {
            Some(tape) => tape,
            None => return Ok(Vec::new()),
        };

        let flags = self.driver.tape_alert_flags(&self.device)?;
        if flags.is_empty() {
            return Ok(Vec::new());
        }

        let descriptions = tbk_tape::alerts::tape_alert_descriptions(flags);
        for text in &descriptions {
            log::warn!("tape alert on '{}': {}", tape.tape_id, text);
        }
        if tbk_tape::tape_alert_flags_critical(flags) {
            tape.mark_error();
        } else {
            tape.increment_warning_count();
        }
        self.catalog.upsert_tape(tape)?;
        Ok(descriptions)
    }

    /// Aggregate inventory view; capacity warning above 90% usage.
    pub fn inventory_status(&self) -> Result<InventoryStatus, Error> {
        let now = proxmox_time::epoch_i64();
        let tapes = self.catalog.list_tapes()?;
        let mut status = InventoryStatus {
            total_tapes: tapes.len(),
            ..Default::default()
        };
        for tape in &tapes {
            match tape.status {
                TapeStatus::Available => status.available_tapes += 1,
                TapeStatus::InUse => status.in_use_tapes += 1,
                _ => {}
            }
            if tape.is_expired(now) {
                status.expired_tapes += 1;
            }
            status.total_capacity_bytes += tape.capacity_bytes;
            status.used_capacity_bytes += tape.used_bytes;
        }
        status.current_tape = self.current_tape().map(|tape| tape.tape_id);
        if status.usage_percent() > 90.0 {
            log::warn!(
                "tape inventory almost full: {:.1}% of total capacity used",
                status.usage_percent()
            );
        }
        Ok(status)
    }
}
