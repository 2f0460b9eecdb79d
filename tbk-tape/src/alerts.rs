//! Tape Alert Flags
//!
//! See LTO SCSI Reference LOG_SENSE - LP 2Eh: TapeAlerts. The external
//! tool reports the log page payload as hex; drives that do not support
//! the page simply report no flags.

use anyhow::{bail, Error};

bitflags::bitflags! {
    /// Tape Alert Flags
    pub struct TapeAlertFlags: u64 {
        const READ_WARNING = 1 << (0x0001 -1);
        const WRITE_WARNING = 1 << (0x0002 -1);
        const HARD_ERROR = 1 << (0x0003 -1);
        const MEDIA = 1 << (0x0004 -1);
        const READ_FAILURE = 1 << (0x0005 -1);
        const WRITE_FAILURE = 1 << (0x0006 -1);
        const MEDIA_LIFE = 1 << (0x0007 -1);
        const NOT_DATA_GRADE = 1 << (0x0008 -1);
        const WRITE_PROTECT = 1 << (0x0009 -1);
        const NO_REMOVAL = 1 << (0x000A -1);
        const CLEANING_MEDIA = 1 << (0x000B -1);
        const UNSUPPORTED_FORMAT = 1 << (0x000C -1);
        const RECOVERABLE_MECHANICAL_CARTRIDGE_FAILURE = 1 << (0x000D -1);
        const UNRECOVERABLE_SNAPPED_TAPE = 1 << (0x000E -1);
        const MEMORY_CHIP_IN_CARTRIDGE_FAILURE = 1 << (0x000F -1);
        const FORCED_EJECT = 1 << (0x0010 -1);
        const READ_ONLY_FORMAT = 1 << (0x0011 -1);
        const TAPE_DIRECTORY_CORRUPTED = 1 << (0x0012 -1);
        const NEARING_MEDIA_LIFE = 1 << (0x0013 -1);
        const CLEAN_NOW = 1 << (0x0014 -1);
        const CLEAN_PERIODIC = 1 << (0x0015 -1);
        const EXPIRED_CLEANING_MEDIA = 1 << (0x0016 -1);
        const INVALID_CLEANING_TAPE = 1 << (0x0017 -1);
        const RETENSION_REQUEST = 1 << (0x0018 -1);
        const HOST_CHANNEL_FAILURE = 1 << (0x0019 -1);
        const COOLING_FAN_FAILURE = 1 << (0x001A -1);
        const POWER_SUPPLY_FAILURE = 1 << (0x001B -1);
        const POWER_CONSUMPTION = 1 << (0x001C -1);
        const DRIVE_MAINTENANCE = 1 << (0x001D -1);
        const HARDWARE_A = 1 << (0x001E -1);
        const HARDWARE_B = 1 << (0x001F -1);
        const INTERFACE = 1 << (0x0020 -1);
        const EJECT_MEDIA = 1 << (0x0021 -1);
        const DOWNLOAD_FAULT = 1 << (0x0022 -1);
        const DRIVE_HUMIDITY = 1 << (0x0023 -1);
        const DRIVE_TEMPERATURE = 1 << (0x0024 -1);
        const DRIVE_VOLTAGE = 1 << (0x0025 -1);
        const PREDICTIVE_FAILURE = 1 << (0x0026 -1);
        const DIAGNOSTICS_REQUIRED = 1 << (0x0027 -1);
        const LOADING_FAILURE = 1 << (0x0037 -1);
        const UNRECOVERABLE_UNLOAD_FAILURE = 1 << (0x0038 -1);
        const AUTOMATION_INTERFACE_FAILURE = 1 << (0x0039 -1);
        const FIRMWARE_FAILURE = 1 << (0x003A -1);
    }
}

/// Flags that make the loaded cartridge unusable.
pub fn tape_alert_flags_critical(flags: TapeAlertFlags) -> bool {
    flags.intersects(
        TapeAlertFlags::MEDIA
            | TapeAlertFlags::READ_FAILURE
            | TapeAlertFlags::WRITE_FAILURE
            | TapeAlertFlags::UNRECOVERABLE_SNAPPED_TAPE
            | TapeAlertFlags::MEMORY_CHIP_IN_CARTRIDGE_FAILURE
            | TapeAlertFlags::UNSUPPORTED_FORMAT
            | TapeAlertFlags::UNRECOVERABLE_UNLOAD_FAILURE,
    )
}

/// Decode the tool-reported hex payload of the TapeAlert log page.
///
/// The flag word sits after the 2-byte page header; a short payload
/// means the page is unsupported and reads as no flags.
pub fn decode_tape_alert_hex(payload: &str) -> Result<TapeAlertFlags, Error> {
    let cleaned: String = payload
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect();
    if cleaned.len() % 2 != 0 {
        bail!("tape alert payload has odd hex length");
    }
    let mut data = Vec::with_capacity(cleaned.len() / 2);
    for i in (0..cleaned.len()).step_by(2) {
        data.push(u8::from_str_radix(&cleaned[i..i + 2], 16)?);
    }
    if data.len() < 4 {
        return Ok(TapeAlertFlags::empty());
    }

    let mut bits: u64 = 0;
    for (index, byte) in data[2..].iter().take(8).enumerate() {
        bits |= (*byte as u64) << (8 * (7 - index));
    }
    // flag 1 is the most significant bit of the first payload byte
    let mut flags = TapeAlertFlags::empty();
    for flag_number in 0..64u64 {
        if bits & (1 << (63 - flag_number)) != 0 {
            flags |= TapeAlertFlags::from_bits_truncate(1 << flag_number);
        }
    }
    Ok(flags)
}

/// Human-readable list of the set flags.
pub fn tape_alert_descriptions(flags: TapeAlertFlags) -> Vec<String> {
    let known = [
        (TapeAlertFlags::CLEAN_NOW, "drive needs cleaning"),
        (TapeAlertFlags::NEARING_MEDIA_LIFE, "medium nearing end of life"),
        (TapeAlertFlags::MEDIA, "medium error"),
        (TapeAlertFlags::HARD_ERROR, "excessive read/write errors"),
        (TapeAlertFlags::DRIVE_MAINTENANCE, "drive needs maintenance"),
        (TapeAlertFlags::DRIVE_TEMPERATURE, "temperature out of range"),
        (TapeAlertFlags::POWER_SUPPLY_FAILURE, "power supply problem"),
        (TapeAlertFlags::COOLING_FAN_FAILURE, "cooling fan failure"),
        (TapeAlertFlags::WRITE_PROTECT, "cartridge is write protected"),
        (TapeAlertFlags::READ_FAILURE, "unrecoverable read failure"),
        (TapeAlertFlags::WRITE_FAILURE, "unrecoverable write failure"),
    ];
    let mut descriptions: Vec<String> = known
        .iter()
        .filter(|(flag, _)| flags.contains(*flag))
        .map(|(_, text)| text.to_string())
        .collect();
    let described: TapeAlertFlags = known
        .iter()
        .fold(TapeAlertFlags::empty(), |acc, (flag, _)| acc | *flag);
    let rest = flags - described;
    if !rest.is_empty() {
        descriptions.push(format!("{:?}", rest));
    }
    descriptions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_payload_has_no_flags() {
        assert_eq!(
            decode_tape_alert_hex("").unwrap(),
            TapeAlertFlags::empty()
        );
        assert_eq!(
            decode_tape_alert_hex("2e00").unwrap(),
            TapeAlertFlags::empty()
        );
    }

    #[test]
    fn test_first_flag_is_read_warning() {
        // header 2e00, first payload byte with the MSB set -> flag 1
        let flags = decode_tape_alert_hex("2e00 80 00 00 00 00 00 00 00").unwrap();
        assert_eq!(flags, TapeAlertFlags::READ_WARNING);
        assert!(!tape_alert_flags_critical(flags));
    }

    #[test]
    fn test_critical_flag_detection() {
        // flag 4 (MEDIA) is bit 4 from the top: 0001....
        let flags = decode_tape_alert_hex("2e00 10 00 00 00 00 00 00 00").unwrap();
        assert_eq!(flags, TapeAlertFlags::MEDIA);
        assert!(tape_alert_flags_critical(flags));
        assert_eq!(
            tape_alert_descriptions(flags),
            vec!["medium error".to_string()]
        );
    }

    #[test]
    fn test_odd_length_payload_is_rejected() {
        assert!(decode_tape_alert_hex("2e0").is_err());
    }

    #[test]
    fn test_clean_now_flag() {
        // flag 0x14 = 20, bit index 19 from the top of the 64-bit word:
        // byte 2 of the payload (bits 17..24) -> 0b0001_0000 -> 0x10
        let flags = decode_tape_alert_hex("2e00 00 00 10 00 00 00 00 00").unwrap();
        assert_eq!(flags, TapeAlertFlags::CLEAN_NOW);
    }
}
