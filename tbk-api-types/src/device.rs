use serde::{Deserialize, Serialize};

/// One tape device discovered by the external tool's `scan` verb.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeDeviceInfo {
    /// Device node, e.g. `/dev/nst0` or `\\.\Tape0`
    pub path: String,
    pub vendor: String,
    pub model: String,
    /// Drive generation marker as reported, e.g. `R3G1`
    pub generation: String,
    pub serial: String,
    pub status: String,
}

impl TapeDeviceInfo {
    /// Minimal record for devices only seen as a bare node path.
    pub fn from_path(path: &str) -> Self {
        Self {
            path: path.to_string(),
            vendor: String::new(),
            model: String::new(),
            generation: String::new(),
            serial: String::new(),
            status: "online".to_string(),
        }
    }
}

/// Partition layout reported by `qrypart`.
///
/// `has_partitions` is the authoritative "formatted" signal.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_partition: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_additional_partitions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_partitions_defined: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partitioning_type: Option<String>,
    pub partitions: Vec<PartitionSize>,
    pub has_partitions: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSize {
    pub index: u32,
    pub size_meg: u64,
}

/// Usage counters reported by `tapeusage`, plus the derived health score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapeUsage {
    pub data_sets_read: u64,
    pub data_sets_written: u64,
    pub read_retries: u64,
    pub write_retries: u64,
    pub unrecovered_read_errors: u64,
    pub unrecovered_write_errors: u64,
    pub suspended_reads: u64,
    pub suspended_writes: u64,
    pub fatal_suspend_reads: u64,
    pub fatal_suspended_writes: u64,
    /// 0..=100, see [`TapeUsage::compute_health_score`]
    pub health_score: u32,
    pub is_formatted: bool,
}

impl Default for TapeUsage {
    fn default() -> Self {
        Self {
            data_sets_read: 0,
            data_sets_written: 0,
            read_retries: 0,
            write_retries: 0,
            unrecovered_read_errors: 0,
            unrecovered_write_errors: 0,
            suspended_reads: 0,
            suspended_writes: 0,
            fatal_suspend_reads: 0,
            fatal_suspended_writes: 0,
            health_score: 100,
            is_formatted: false,
        }
    }
}

impl TapeUsage {
    /// Base 100, minus 10 per fatal suspend, 5 per unrecovered error,
    /// 2 per suspended operation and up to 10 for retries, clamped to 0..=100.
    pub fn compute_health_score(&self) -> u32 {
        let mut score: i64 = 100;
        score -= (self.fatal_suspend_reads + self.fatal_suspended_writes) as i64 * 10;
        score -= (self.unrecovered_read_errors + self.unrecovered_write_errors) as i64 * 5;
        score -= (self.suspended_reads + self.suspended_writes) as i64 * 2;
        score -= (self.read_retries + self.write_retries).min(10) as i64;
        score.clamp(0, 100) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_score_deductions() {
        let mut usage = TapeUsage::default();
        assert_eq!(usage.compute_health_score(), 100);

        usage.write_retries = 4;
        usage.suspended_writes = 4;
        assert_eq!(usage.compute_health_score(), 100 - 4 - 8);

        usage.fatal_suspended_writes = 2;
        usage.unrecovered_read_errors = 3;
        assert_eq!(usage.compute_health_score(), 100 - 4 - 8 - 20 - 15);
    }

    #[test]
    fn test_health_score_clamps_to_zero() {
        let usage = TapeUsage {
            fatal_suspend_reads: 20,
            ..Default::default()
        };
        assert_eq!(usage.compute_health_score(), 0);
    }

    #[test]
    fn test_retry_deduction_is_capped() {
        let usage = TapeUsage {
            read_retries: 500,
            write_retries: 500,
            ..Default::default()
        };
        assert_eq!(usage.compute_health_score(), 90);
    }
}
