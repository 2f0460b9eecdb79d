//! Archiver strategies.
//!
//! Each strategy streams its input files into one container, producing
//! the output atomically: data goes to a `.partial` sibling, gets
//! fsynced, then renamed. Cancellation kills any child process and
//! removes the partial output.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, format_err, Error};

use tbk_config::CompressionMethod;
use tbk_tools::command::{run_with_limits, ExitReason, RunLimits};
use tbk_tools::fs::{finalize_partial, partial_path};
use tbk_tools::CancelToken;

/// Result of producing one archive unit.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveStats {
    pub input_bytes: u64,
    pub compressed_bytes: u64,
    pub duration: Duration,
}

/// Strategy-independent options.
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub level: u32,
    pub threads: usize,
    pub dictionary_size: String,
    /// External archiver binary for the command strategy
    pub sevenzip_binary: Option<PathBuf>,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            level: 9,
            threads: 4,
            dictionary_size: "256m".to_string(),
            sevenzip_binary: None,
        }
    }
}

pub trait Archiver: Send + Sync {
    /// Container extension, e.g. `tar.zst`
    fn extension(&self) -> &'static str;

    /// Produce one container at `output` from the ordered input list.
    fn compress(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        options: &ArchiveOptions,
        cancel: &CancelToken,
    ) -> Result<ArchiveStats, Error>;
}

/// Pick the archiver for the configured method.
pub fn archiver_for(method: CompressionMethod) -> Box<dyn Archiver> {
    match method {
        CompressionMethod::Tar => Box::new(TarArchiver),
        CompressionMethod::Pgzip => Box::new(GzipArchiver),
        CompressionMethod::Zstd => Box::new(ZstdArchiver),
        CompressionMethod::SevenzipCommand => Box::new(SevenZipCommandArchiver),
    }
}

fn archive_member_name(path: &Path) -> PathBuf {
    match path.strip_prefix("/") {
        Ok(relative) => relative.to_owned(),
        Err(_) => path.to_owned(),
    }
}

/// Stream all inputs into a tar container, honoring cancellation between
/// members. Returns the input byte count.
fn write_tar<W: Write>(
    writer: W,
    inputs: &[PathBuf],
    cancel: &CancelToken,
) -> Result<(W, u64), Error> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);
    let mut input_bytes = 0u64;
    for input in inputs {
        cancel.check()?;
        let metadata = std::fs::metadata(input)
            .map_err(|err| format_err!("unable to stat {:?} - {}", input, err))?;
        input_bytes += metadata.len();
        builder
            .append_path_with_name(input, archive_member_name(input))
            .map_err(|err| format_err!("unable to archive {:?} - {}", input, err))?;
    }
    let writer = builder.into_inner()?;
    Ok((writer, input_bytes))
}

/// Run a container producer against the partial output, finalize on
/// success, clean up on failure.
fn produce_atomically(
    output: &Path,
    producer: impl FnOnce(File) -> Result<u64, Error>,
) -> Result<ArchiveStats, Error> {
    let started = Instant::now();
    let partial = partial_path(output);
    let file = File::create(&partial)
        .map_err(|err| format_err!("unable to create {:?} - {}", partial, err))?;

    match producer(file) {
        Ok(input_bytes) => {
            finalize_partial(&partial, output)?;
            let compressed_bytes = std::fs::metadata(output)?.len();
            Ok(ArchiveStats {
                input_bytes,
                compressed_bytes,
                duration: started.elapsed(),
            })
        }
        Err(err) => {
            let _ = std::fs::remove_file(&partial);
            Err(err)
        }
    }
}

/// Plain tar container, no compression.
pub struct TarArchiver;

impl Archiver for TarArchiver {
    fn extension(&self) -> &'static str {
        "tar"
    }

    fn compress(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        _options: &ArchiveOptions,
        cancel: &CancelToken,
    ) -> Result<ArchiveStats, Error> {
        produce_atomically(output, |file| {
            let (_file, input_bytes) = write_tar(file, inputs, cancel)?;
            Ok(input_bytes)
        })
    }
}

/// Gzip-compressed tar container.
pub struct GzipArchiver;

impl Archiver for GzipArchiver {
    fn extension(&self) -> &'static str {
        "tar.gz"
    }

    fn compress(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        options: &ArchiveOptions,
        cancel: &CancelToken,
    ) -> Result<ArchiveStats, Error> {
        let level = flate2::Compression::new(options.level.min(9));
        produce_atomically(output, |file| {
            let encoder = flate2::write::GzEncoder::new(file, level);
            let (encoder, input_bytes) = write_tar(encoder, inputs, cancel)?;
            encoder.finish()?;
            Ok(input_bytes)
        })
    }
}

/// Zstandard-compressed tar container.
pub struct ZstdArchiver;

impl Archiver for ZstdArchiver {
    fn extension(&self) -> &'static str {
        "tar.zst"
    }

    fn compress(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        options: &ArchiveOptions,
        cancel: &CancelToken,
    ) -> Result<ArchiveStats, Error> {
        let level = (options.level.min(21)) as i32;
        produce_atomically(output, |file| {
            let encoder = zstd::stream::write::Encoder::new(file, level)?;
            let (encoder, input_bytes) = write_tar(encoder, inputs, cancel)?;
            encoder.finish()?;
            Ok(input_bytes)
        })
    }
}

/// External `7z` archiver.
pub struct SevenZipCommandArchiver;

const SEVENZIP_CANDIDATES: &[&str] = &["/usr/bin/7z", "/usr/bin/7za", "/usr/local/bin/7z"];

impl SevenZipCommandArchiver {
    fn binary(options: &ArchiveOptions) -> Result<PathBuf, Error> {
        if let Some(ref binary) = options.sevenzip_binary {
            return Ok(binary.clone());
        }
        SEVENZIP_CANDIDATES
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
            .ok_or_else(|| format_err!("no 7z binary found (checked {:?})", SEVENZIP_CANDIDATES))
    }
}

impl Archiver for SevenZipCommandArchiver {
    fn extension(&self) -> &'static str {
        "7z"
    }

    fn compress(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        options: &ArchiveOptions,
        cancel: &CancelToken,
    ) -> Result<ArchiveStats, Error> {
        let binary = Self::binary(options)?;
        let started = Instant::now();
        let partial = partial_path(output);

        let mut command = std::process::Command::new(binary);
        command.arg("a");
        command.arg("-t7z");
        command.arg(format!("-mx={}", options.level.min(9)));
        command.arg(format!("-md={}", options.dictionary_size));
        command.arg(format!("-mmt={}", options.threads.max(1)));
        command.arg("-y");
        command.arg(&partial);
        let mut input_bytes = 0u64;
        for input in inputs {
            input_bytes += std::fs::metadata(input)?.len();
            command.arg(input);
        }

        let result = run_with_limits(
            command,
            RunLimits {
                timeout: None,
                cancel: Some(cancel.clone()),
            },
        );
        let output_state = match result {
            Ok(state) => state,
            Err(err) => {
                let _ = std::fs::remove_file(&partial);
                return Err(err);
            }
        };
        tbk_tools::command::log_command_output("7z", &output_state);

        match output_state.reason {
            ExitReason::Exited(0) => {
                finalize_partial(&partial, output)?;
                let compressed_bytes = std::fs::metadata(output)?.len();
                Ok(ArchiveStats {
                    input_bytes,
                    compressed_bytes,
                    duration: started.elapsed(),
                })
            }
            ExitReason::Cancelled => {
                let _ = std::fs::remove_file(&partial);
                bail!("operation cancelled");
            }
            reason => {
                let _ = std::fs::remove_file(&partial);
                bail!(
                    "7z failed ({:?}): {}",
                    reason,
                    output_state.stderr.trim()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn testdir(name: &str) -> PathBuf {
        let mut dir: PathBuf = String::from("./target/testout").into();
        dir.push(module_path!());
        dir.push(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sample_inputs(dir: &Path) -> Vec<PathBuf> {
        let a = dir.join("a.txt");
        let b = dir.join("b.bin");
        std::fs::write(&a, vec![b'x'; 2000]).unwrap();
        std::fs::write(&b, vec![0u8; 3000]).unwrap();
        vec![a, b]
    }

    #[test]
    fn test_tar_strategy_is_atomic() -> Result<(), Error> {
        let dir = testdir("tar");
        let inputs = sample_inputs(&dir);
        let output = dir.join("unit.tar");
        let stats = TarArchiver.compress(
            &inputs,
            &output,
            &ArchiveOptions::default(),
            &CancelToken::new(),
        )?;
        assert_eq!(stats.input_bytes, 5000);
        assert!(output.exists());
        assert!(!partial_path(&output).exists());
        Ok(())
    }

    #[test]
    fn test_gzip_strategy_compresses() -> Result<(), Error> {
        let dir = testdir("gzip");
        let inputs = sample_inputs(&dir);
        let output = dir.join("unit.tar.gz");
        let stats = GzipArchiver.compress(
            &inputs,
            &output,
            &ArchiveOptions::default(),
            &CancelToken::new(),
        )?;
        assert_eq!(stats.input_bytes, 5000);
        // repetitive input must shrink
        assert!(stats.compressed_bytes < stats.input_bytes);
        Ok(())
    }

    #[test]
    fn test_zstd_strategy_round_trips() -> Result<(), Error> {
        let dir = testdir("zstd");
        let inputs = sample_inputs(&dir);
        let output = dir.join("unit.tar.zst");
        ZstdArchiver.compress(
            &inputs,
            &output,
            &ArchiveOptions::default(),
            &CancelToken::new(),
        )?;

        // the container must decode and carry both members
        let decoder = zstd::stream::read::Decoder::new(File::open(&output)?)?;
        let mut archive = tar::Archive::new(decoder);
        let names: Vec<String> = archive
            .entries()?
            .map(|e| {
                e.unwrap()
                    .path()
                    .unwrap()
                    .file_name()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(names, vec!["a.txt", "b.bin"]);
        Ok(())
    }

    #[test]
    fn test_cancelled_run_leaves_no_partial() {
        let dir = testdir("cancelled");
        let inputs = sample_inputs(&dir);
        let output = dir.join("unit.tar");
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = TarArchiver.compress(&inputs, &output, &ArchiveOptions::default(), &cancel);
        assert!(result.is_err());
        assert!(!output.exists());
        assert!(!partial_path(&output).exists());
    }

    #[test]
    fn test_missing_input_cleans_up() {
        let dir = testdir("missing_input");
        let inputs = vec![dir.join("not-there.txt")];
        let output = dir.join("unit.tar.gz");
        let result = GzipArchiver.compress(
            &inputs,
            &output,
            &ArchiveOptions::default(),
            &CancelToken::new(),
        );
        assert!(result.is_err());
        assert!(!partial_path(&output).exists());
    }
}
