//! Engine configuration.
//!
//! Every knob is an environment variable with a default matching the
//! production deployment. [`BackupConfig::from_env`] reads the full set;
//! components receive the struct (or a clone) at construction time.

use std::env;
use std::path::PathBuf;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

/// Supported archiver strategies.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMethod {
    /// Parallel gzip equivalent, produces `.tar.gz`
    Pgzip,
    /// External `7z` binary, produces `.7z`
    SevenzipCommand,
    /// Plain tar container, no compression
    Tar,
    /// Zstandard, produces `.tar.zst`
    Zstd,
}

impl CompressionMethod {
    pub fn parse(value: &str) -> Result<Self, Error> {
        Ok(match value.trim().to_lowercase().as_str() {
            "pgzip" | "gzip" => CompressionMethod::Pgzip,
            // the in-process LZMA implementation of earlier releases maps
            // onto the external command strategy
            "7zip_command" | "7zip-command" | "py7zr" | "7z" => CompressionMethod::SevenzipCommand,
            "tar" => CompressionMethod::Tar,
            "zstd" => CompressionMethod::Zstd,
            other => bail!("unknown compression method '{}'", other),
        })
    }

    /// File extension of the produced container.
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionMethod::Pgzip => "tar.gz",
            CompressionMethod::SevenzipCommand => "7z",
            CompressionMethod::Tar => "tar",
            CompressionMethod::Zstd => "tar.zst",
        }
    }
}

/// The full configuration of the backup engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    // scanner
    pub scan_threads: usize,
    pub use_scan_multithread: bool,

    // compression
    pub compression_method: CompressionMethod,
    pub compression_level: u32,
    pub compression_threads: usize,
    pub compression_command_threads: usize,
    pub compression_dictionary_size: String,
    pub compression_parallel_batches: usize,
    /// Archive unit target size in bytes
    pub max_file_size: u64,
    pub backup_compress_dir: PathBuf,
    pub compress_directly_to_tape: bool,

    // tape
    /// Drive letter (`O`) or mount path (`/mnt/ltfs`) of the LTFS mount
    pub tape_drive_letter: String,
    pub default_block_size: u64,
    pub max_volume_size: u64,
    pub default_retention_months: u32,
    pub auto_erase_expired: bool,
    pub enable_tape_format_before_full: bool,

    // external device tool
    pub tool_path: Option<PathBuf>,
    pub tool_device_path: Option<String>,
    pub tool_force_generic: bool,
    pub tool_scan_show_all_paths: bool,
    /// Format+label tool used when the platform cannot label via the mount
    pub label_tool_path: Option<PathBuf>,
    /// External archiver binary for the command compression strategy
    pub sevenzip_path: Option<PathBuf>,

    // catalog
    pub catalog_path: PathBuf,
    pub catalog_command_timeout_secs: u64,
    pub catalog_warn_threshold_secs: u64,
    pub catalog_heartbeat_secs: u64,

    // pipeline
    pub enable_background_copy_update: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            scan_threads: 4,
            use_scan_multithread: true,
            compression_method: CompressionMethod::Pgzip,
            compression_level: 9,
            compression_threads: 4,
            compression_command_threads: 4,
            compression_dictionary_size: "256m".to_string(),
            compression_parallel_batches: 2,
            max_file_size: 12 * 1024 * 1024 * 1024,
            backup_compress_dir: PathBuf::from("temp/compress"),
            compress_directly_to_tape: true,
            tape_drive_letter: "O".to_string(),
            default_block_size: 262144,
            max_volume_size: 322122547200,
            default_retention_months: 6,
            auto_erase_expired: true,
            enable_tape_format_before_full: true,
            tool_path: None,
            tool_device_path: None,
            tool_force_generic: true,
            tool_scan_show_all_paths: true,
            label_tool_path: None,
            sevenzip_path: None,
            catalog_path: PathBuf::from("backup_catalog.db"),
            catalog_command_timeout_secs: 60,
            catalog_warn_threshold_secs: 5,
            catalog_heartbeat_secs: 30,
            enable_background_copy_update: false,
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) -> Result<(), Error>
where
    T::Err: std::fmt::Display,
{
    if let Some(value) = env_string(name) {
        match value.parse() {
            Ok(parsed) => *target = parsed,
            Err(err) => bail!("invalid value '{}' for {}: {}", value, name, err),
        }
    }
    Ok(())
}

fn env_bool(name: &str, target: &mut bool) -> Result<(), Error> {
    if let Some(value) = env_string(name) {
        *target = match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            other => bail!("invalid boolean '{}' for {}", other, name),
        };
    }
    Ok(())
}

impl BackupConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();

        env_parse("SCAN_THREADS", &mut config.scan_threads)?;
        env_bool("USE_SCAN_MULTITHREAD", &mut config.use_scan_multithread)?;

        if let Some(method) = env_string("COMPRESSION_METHOD") {
            config.compression_method = CompressionMethod::parse(&method)?;
        }
        env_parse("COMPRESSION_LEVEL", &mut config.compression_level)?;
        env_parse("COMPRESSION_THREADS", &mut config.compression_threads)?;
        env_parse(
            "COMPRESSION_COMMAND_THREADS",
            &mut config.compression_command_threads,
        )?;
        if let Some(size) = env_string("COMPRESSION_DICTIONARY_SIZE") {
            config.compression_dictionary_size = size;
        }
        env_parse(
            "COMPRESSION_PARALLEL_BATCHES",
            &mut config.compression_parallel_batches,
        )?;
        env_parse("MAX_FILE_SIZE", &mut config.max_file_size)?;
        if let Some(dir) = env_string("BACKUP_COMPRESS_DIR") {
            config.backup_compress_dir = PathBuf::from(dir);
        }
        env_bool(
            "COMPRESS_DIRECTLY_TO_TAPE",
            &mut config.compress_directly_to_tape,
        )?;

        if let Some(letter) = env_string("TAPE_DRIVE_LETTER") {
            config.tape_drive_letter = letter;
        }
        env_parse("DEFAULT_BLOCK_SIZE", &mut config.default_block_size)?;
        env_parse("MAX_VOLUME_SIZE", &mut config.max_volume_size)?;
        env_parse(
            "DEFAULT_RETENTION_MONTHS",
            &mut config.default_retention_months,
        )?;
        env_bool("AUTO_ERASE_EXPIRED", &mut config.auto_erase_expired)?;
        env_bool(
            "ENABLE_TAPE_FORMAT_BEFORE_FULL",
            &mut config.enable_tape_format_before_full,
        )?;

        config.tool_path = env_string("TAPE_TOOL_PATH").map(PathBuf::from);
        config.tool_device_path = env_string("TAPE_TOOL_DEVICE_PATH");
        env_bool("TAPE_TOOL_FORCE_GENERIC", &mut config.tool_force_generic)?;
        env_bool(
            "TAPE_TOOL_SCAN_SHOW_ALL_PATHS",
            &mut config.tool_scan_show_all_paths,
        )?;
        config.label_tool_path = env_string("TAPE_LABEL_TOOL_PATH").map(PathBuf::from);
        config.sevenzip_path = env_string("SEVENZIP_PATH").map(PathBuf::from);

        if let Some(path) = env_string("CATALOG_PATH") {
            config.catalog_path = PathBuf::from(path);
        }
        env_parse(
            "CATALOG_COMMAND_TIMEOUT",
            &mut config.catalog_command_timeout_secs,
        )?;
        env_bool(
            "ENABLE_BACKGROUND_COPY_UPDATE",
            &mut config.enable_background_copy_update,
        )?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.scan_threads == 0 || self.scan_threads > 16 {
            bail!("SCAN_THREADS must be within 1..=16");
        }
        if self.compression_parallel_batches == 0 {
            bail!("COMPRESSION_PARALLEL_BATCHES must be at least 1");
        }
        if self.max_file_size == 0 {
            bail!("MAX_FILE_SIZE must not be zero");
        }
        Ok(())
    }

    /// The staging directory holding finished archive units.
    pub fn final_dir(&self) -> PathBuf {
        self.backup_compress_dir.join("final")
    }

    /// Resolve the LTFS mount point from the configured drive letter.
    ///
    /// A single letter means a platform drive letter (`O` becomes `O:\`),
    /// anything longer is taken as a mount path verbatim.
    pub fn tape_mount_point(&self) -> PathBuf {
        let value = self.tape_drive_letter.trim();
        if value.len() == 1 && value.chars().all(|c| c.is_ascii_alphabetic()) {
            PathBuf::from(format!("{}:\\", value.to_uppercase()))
        } else {
            PathBuf::from(value)
        }
    }
}
