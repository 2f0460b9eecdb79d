//! Filesystem helpers.
//!
//! Outputs are produced atomically: data goes to a sibling temp file,
//! gets fsynced, then renamed into place.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};

/// Name of the in-progress sibling for `path`.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

/// Fsync a finished partial file and rename it to its final name.
pub fn finalize_partial(partial: &Path, target: &Path) -> Result<(), Error> {
    let file = File::open(partial)
        .map_err(|err| format_err!("unable to open partial file {:?} - {}", partial, err))?;
    file.sync_all()?;
    std::fs::rename(partial, target)
        .map_err(|err| format_err!("unable to rename {:?} to {:?} - {}", partial, target, err))?;
    Ok(())
}

/// Atomically replace the contents of `path` with `data`.
pub fn replace_file_atomic(path: &Path, data: &[u8]) -> Result<(), Error> {
    let partial = partial_path(path);
    std::fs::write(&partial, data)
        .map_err(|err| format_err!("unable to write {:?} - {}", partial, err))?;
    finalize_partial(&partial, path)
}

/// Copy `src` to `dst` and fsync the destination before returning.
///
/// Returns the number of bytes copied.
pub fn copy_with_fsync(src: &Path, dst: &Path) -> Result<u64, Error> {
    let mut reader = File::open(src)
        .map_err(|err| format_err!("unable to open source {:?} - {}", src, err))?;
    let mut writer = File::create(dst)
        .map_err(|err| format_err!("unable to create target {:?} - {}", dst, err))?;
    let bytes = io::copy(&mut reader, &mut writer)?;
    writer.sync_all()?;
    Ok(bytes)
}

/// Read a file to a string, mapping a missing file to `None`.
pub fn file_read_optional_string(path: &Path) -> Result<Option<String>, Error> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(format_err!("unable to read {:?} - {}", path, err)),
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

    #[test]
    fn test_replace_file_atomic_leaves_no_partial() -> Result<(), Error> {
        let dir = testdir("replace_atomic");
        let target = dir.join("state.json");
        replace_file_atomic(&target, b"one")?;
        replace_file_atomic(&target, b"two")?;
        assert_eq!(std::fs::read_to_string(&target)?, "two");
        assert!(!partial_path(&target).exists());
        Ok(())
    }

    #[test]
    fn test_copy_with_fsync_returns_size() -> Result<(), Error> {
        let dir = testdir("copy_fsync");
        let src = dir.join("src.bin");
        std::fs::write(&src, vec![7u8; 4096])?;
        let dst = dir.join("dst.bin");
        assert_eq!(copy_with_fsync(&src, &dst)?, 4096);
        assert_eq!(std::fs::metadata(&dst)?.len(), 4096);
        Ok(())
    }

    #[test]
    fn test_optional_read() -> Result<(), Error> {
        let dir = testdir("optional_read");
        assert!(file_read_optional_string(&dir.join("missing"))?.is_none());
        std::fs::write(dir.join("present"), "data")?;
        assert_eq!(
            file_read_optional_string(&dir.join("present"))?.as_deref(),
            Some("data")
        );
        Ok(())
    }
}
