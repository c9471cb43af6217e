// src/fsutil.rs

//! Filesystem primitives shared by the stores
//!
//! Every write that must survive a crash goes through a temporary file in the
//! destination directory followed by a rename, so readers only ever observe
//! the old or the new contents.

use crate::error::{Error, Result};
use crate::hash::{Digest, HashingWriter};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Atomically replace `path` with `bytes`
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = parent_dir(path)?;
    fs::create_dir_all(parent)
        .map_err(|e| Error::io(format!("Failed to create directory {}", parent.display()), e))?;

    let mut temp = NamedTempFile::new_in(parent)
        .map_err(|e| Error::io(format!("Failed to create temp file in {}", parent.display()), e))?;
    temp.write_all(bytes)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| Error::io(format!("Failed to write temp file for {}", path.display()), e))?;

    persist(temp, path)?;
    sync_dir(parent);
    Ok(())
}

/// Atomically copy `src` over `dst`, returning the digest of the bytes written
///
/// The copy is marked executable since everything cmam places is a program.
pub(crate) fn copy_atomic(src: &Path, dst: &Path) -> Result<(Digest, u64)> {
    let parent = parent_dir(dst)?;
    fs::create_dir_all(parent)
        .map_err(|e| Error::io(format!("Failed to create directory {}", parent.display()), e))?;

    let mut source = File::open(src)
        .map_err(|e| Error::io(format!("Failed to open {}", src.display()), e))?;
    let temp = NamedTempFile::new_in(parent)
        .map_err(|e| Error::io(format!("Failed to create temp file in {}", parent.display()), e))?;

    let mut writer = HashingWriter::new(temp);
    io::copy(&mut source, &mut writer).map_err(|e| {
        Error::io(
            format!("Failed to copy {} to {}", src.display(), dst.display()),
            e,
        )
    })?;
    let (temp, digest, size) = writer.finish();

    temp.as_file()
        .sync_all()
        .map_err(|e| Error::io(format!("Failed to sync copy of {}", src.display()), e))?;
    make_executable(temp.path())?;

    persist(temp, dst)?;
    sync_dir(parent);
    Ok((digest, size))
}

/// Rename `src` onto `dst`, replacing any existing file
pub(crate) fn rename(src: &Path, dst: &Path) -> Result<()> {
    fs::rename(src, dst).map_err(|e| {
        Error::io(
            format!("Failed to move {} to {}", src.display(), dst.display()),
            e,
        )
    })?;
    if let Some(parent) = dst.parent() {
        sync_dir(parent);
    }
    Ok(())
}

/// Remove a file, reporting whether it existed
pub(crate) fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io(format!("Failed to remove {}", path.display()), e)),
    }
}

/// Remove a directory tree, ignoring one that is already gone
pub(crate) fn remove_dir_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io(format!("Failed to remove {}", path.display()), e)),
    }
}

#[cfg(unix)]
pub(crate) fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .map_err(|e| Error::io(format!("Failed to set permissions on {}", path.display()), e))
}

#[cfg(not(unix))]
pub(crate) fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

fn persist(temp: NamedTempFile, dst: &Path) -> Result<()> {
    temp.persist(dst)
        .map_err(|e| Error::io(format!("Failed to move temp file to {}", dst.display()), e.error))?;
    Ok(())
}

fn parent_dir(path: &Path) -> Result<&Path> {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| Error::IoError(format!("{} has no parent directory", path.display())))
}

// Directory fsync makes the rename itself durable. Not all platforms allow
// opening a directory, so failures are ignored.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(handle) = File::open(dir) {
            let _ = handle.sync_all();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}
