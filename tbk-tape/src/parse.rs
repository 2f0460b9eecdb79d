//! Parsers for the line-oriented output of the device-control tool.

use lazy_static::lazy_static;
use regex::Regex;

use tbk_api_types::{PartitionInfo, PartitionSize, TapeDeviceInfo, TapeUsage};

lazy_static! {
    // e.g. "#0 \\.\scsi0: - [ULT3580-HH9]-[R3G1] S/N:10WT036260 H0-B0-T24-L0"
    static ref SCAN_RECORD: Regex = Regex::new(
        r"(?i)#\d+\s+(\S+?):?\s+-\s+\[([^\]]+)\](?:-\[([^\]]*)\])?\s+S/N:(\S+)"
    )
    .unwrap();
    static ref BARE_DEVICE: Regex =
        Regex::new(r"(?i)(\\\\\.\\[a-z0-9_-]+|/dev/n?st\d+|/dev/IBMtape\d+)").unwrap();
    static ref ACTIVE_PARTITION: Regex =
        Regex::new(r"(?i)Active Partition[.\s]+(\d+)").unwrap();
    static ref MAX_ADDITIONAL: Regex =
        Regex::new(r"(?i)Max\.?\s*Additional Partitions[.\s]+(\d+)").unwrap();
    static ref ADDITIONAL_DEFINED: Regex =
        Regex::new(r"(?i)Additional Partitions defined[.\s]+(\d+)").unwrap();
    static ref PARTITIONING_TYPE: Regex =
        Regex::new(r"(?i)Partitioning Type is[.\s]+(.+)").unwrap();
    static ref PARTITION_SIZE: Regex =
        Regex::new(r"(?i)Partition\s+(\d+)\s+Size\s+\(Meg\)[.\s]+(\d+)").unwrap();
    static ref POSITION: Regex = Regex::new(r"(?i)(?:block\s+)?position[^0-9]*(\d+)").unwrap();
}

/// Parse `scan` output into device records.
///
/// Accepts vendor-agnostic records of the shape
/// `#N <node>: - [<model>]-[<gen>?] S/N:<serial> ...` and synthesizes a
/// minimal record from bare device node mentions.
pub fn parse_scan_output(output: &str) -> Vec<TapeDeviceInfo> {
    let mut devices = Vec::new();
    for raw in output.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(caps) = SCAN_RECORD.captures(line) {
            let model = caps[2].to_string();
            let vendor = if model.to_uppercase().contains("ULT3580") {
                "IBM"
            } else {
                "Unknown"
            };
            devices.push(TapeDeviceInfo {
                path: caps[1].trim_end_matches(':').to_string(),
                vendor: vendor.to_string(),
                model,
                generation: caps.get(3).map(|m| m.as_str().trim()).unwrap_or("").to_string(),
                serial: caps[4].to_string(),
                status: "online".to_string(),
            });
            continue;
        }
        if let Some(caps) = BARE_DEVICE.captures(line) {
            devices.push(TapeDeviceInfo::from_path(
                caps[1].trim_end_matches(':'),
            ));
        }
    }
    devices
}

/// Parse `qrypart` output.
///
/// `has_partitions` is only set when the output actually carries partition
/// information; a formatted cartridge always does.
pub fn parse_partition_info(output: &str) -> PartitionInfo {
    let mut info = PartitionInfo::default();

    let lowered = output.to_lowercase();
    let has_keywords = ["partition 0", "partition 1", "partition 2", "partition 3"]
        .iter()
        .any(|kw| lowered.contains(kw))
        || lowered.contains("active partition")
        || lowered.contains("partitions defined")
        || lowered.contains("partitioning type");
    if !has_keywords {
        return info;
    }

    for raw in output.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(caps) = PARTITION_SIZE.captures(line) {
            info.partitions.push(PartitionSize {
                index: caps[1].parse().unwrap_or(0),
                size_meg: caps[2].parse().unwrap_or(0),
            });
            continue;
        }
        if let Some(caps) = ACTIVE_PARTITION.captures(line) {
            info.active_partition = caps[1].parse().ok();
        } else if let Some(caps) = MAX_ADDITIONAL.captures(line) {
            info.max_additional_partitions = caps[1].parse().ok();
        } else if let Some(caps) = ADDITIONAL_DEFINED.captures(line) {
            info.additional_partitions_defined = caps[1].parse().ok();
        } else if let Some(caps) = PARTITIONING_TYPE.captures(line) {
            info.partitioning_type = Some(caps[1].trim().trim_matches('.').trim().to_string());
        }
    }

    info.has_partitions = info.additional_partitions_defined.unwrap_or(0) > 0
        || !info.partitions.is_empty()
        || info.active_partition.is_some();
    info
}

fn parse_counter(line: &str, name: &str) -> Option<u64> {
    let pattern = format!(r"(?i){}[.\s]+(\d+)", regex::escape(name));
    Regex::new(&pattern)
        .ok()?
        .captures(line)
        .and_then(|caps| caps[1].parse().ok())
}

/// Parse `tapeusage` counters. The health score is computed afterwards,
/// `is_formatted` comes from a separate `qrypart` query.
pub fn parse_tape_usage(output: &str) -> TapeUsage {
    let mut usage = TapeUsage::default();
    for raw in output.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(value) = parse_counter(line, "Data Sets Read") {
            usage.data_sets_read = value;
        } else if let Some(value) = parse_counter(line, "Data Sets Written") {
            usage.data_sets_written = value;
        } else if let Some(value) = parse_counter(line, "Read Retries") {
            usage.read_retries = value;
        } else if let Some(value) = parse_counter(line, "Write Retries") {
            usage.write_retries = value;
        } else if let Some(value) = parse_counter(line, "Unrecovered Read Err") {
            usage.unrecovered_read_errors = value;
        } else if let Some(value) = parse_counter(line, "Unrecovered Write Err") {
            usage.unrecovered_write_errors = value;
        } else if let Some(value) = parse_counter(line, "Fatal Suspend Reads") {
            usage.fatal_suspend_reads = value;
        } else if let Some(value) = parse_counter(line, "Fatal Suspended Writes") {
            usage.fatal_suspended_writes = value;
        } else if let Some(value) = parse_counter(line, "Suspended Reads") {
            usage.suspended_reads = value;
        } else if let Some(value) = parse_counter(line, "Suspended Writes") {
            usage.suspended_writes = value;
        }
    }
    usage.health_score = usage.compute_health_score();
    usage
}

/// Extract the block position from `qrypos` output.
pub fn parse_position(output: &str) -> Option<u64> {
    POSITION
        .captures(output)
        .and_then(|caps| caps[1].parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCAN_OUTPUT: &str = r"Scanning SCSI bus ...
#0 \\.\scsi0: - [ULT3580-HH9]-[R3G1] S/N:10WT036260 H0-B0-T24-L0  (Generic-Device)
#1 /dev/nst1: - [HP-LTO8]-[] S/N:HX201B0099
found device \\.\tape3 without inquiry data
";

    #[test]
    fn test_scan_record_parsing() {
        let devices = parse_scan_output(SCAN_OUTPUT);
        assert_eq!(devices.len(), 3);

        assert_eq!(devices[0].path, r"\\.\scsi0");
        assert_eq!(devices[0].vendor, "IBM");
        assert_eq!(devices[0].model, "ULT3580-HH9");
        assert_eq!(devices[0].generation, "R3G1");
        assert_eq!(devices[0].serial, "10WT036260");

        assert_eq!(devices[1].path, "/dev/nst1");
        assert_eq!(devices[1].vendor, "Unknown");
        assert_eq!(devices[1].generation, "");

        // bare node mention synthesizes a minimal record
        assert_eq!(devices[2].path, r"\\.\tape3");
        assert_eq!(devices[2].model, "");
        assert_eq!(devices[2].status, "online");
    }

    const QRYPART_OUTPUT: &str = "\
Querying partition information ...
Active Partition ............ 0
Max. Additional Partitions .. 3
Additional Partitions defined 1
Partitioning Type is ........ wrap-wise partitioning
Partition 0 Size (Meg) ...... 128000
Partition 1 Size (Meg) ...... 17614000
Exit with code: 0
";

    #[test]
    fn test_partition_parsing() {
        let info = parse_partition_info(QRYPART_OUTPUT);
        assert!(info.has_partitions);
        assert_eq!(info.active_partition, Some(0));
        assert_eq!(info.max_additional_partitions, Some(3));
        assert_eq!(info.additional_partitions_defined, Some(1));
        assert_eq!(
            info.partitioning_type.as_deref(),
            Some("wrap-wise partitioning")
        );
        assert_eq!(info.partitions.len(), 2);
        assert_eq!(info.partitions[1].size_meg, 17614000);
    }

    #[test]
    fn test_unformatted_tape_has_no_partitions() {
        let info = parse_partition_info("Medium is not partitioned or not loaded\n");
        assert!(!info.has_partitions);
        assert!(info.partitions.is_empty());
    }

    const TAPEUSAGE_OUTPUT: &str = "\
Tape Usage Log ...
Thread Count              7
Data Sets Read            294
Data Sets Written         218
Read Retries              0
Write Retries             4
Unrecovered Read Err.     0
Unrecovered Write Err.    0
Suspended Reads           0
Suspended Writes          4
Fatal Suspend Reads       0
Fatal Suspended Writes    0
Result: PASSED
Code: OK
";

    #[test]
    fn test_tape_usage_parsing() {
        let usage = parse_tape_usage(TAPEUSAGE_OUTPUT);
        assert_eq!(usage.data_sets_read, 294);
        assert_eq!(usage.data_sets_written, 218);
        assert_eq!(usage.write_retries, 4);
        assert_eq!(usage.suspended_writes, 4);
        // 100 - 2*4 (suspended) - 4 (retries)
        assert_eq!(usage.health_score, 88);
    }

    #[test]
    fn test_position_parsing() {
        assert_eq!(parse_position("Current Block Position ... 1234\n"), Some(1234));
        assert_eq!(parse_position("no position here"), None);
    }
}
