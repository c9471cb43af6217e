// src/manifest/lock.rs

//! Advisory lock guarding manifest mutation
//!
//! The lock is an exclusive `flock`/`LockFileEx` on `manifest.lock`. The OS
//! drops it when the holding process exits, however it exits, so a killed
//! invocation never leaves the store wedged. The file body names the holder
//! for diagnostics only; it is never used to decide ownership.

use crate::error::{Error, Result};
use fs4::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Interval between acquisition attempts while waiting
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Held exclusive lock; released on drop
#[derive(Debug)]
pub struct ManifestLock {
    file: File,
    path: PathBuf,
}

impl ManifestLock {
    /// Wait up to `timeout` for the lock
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let started = Instant::now();
        let mut announced = false;

        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                debug!("Acquired manifest lock after {:?}", started.elapsed());
                return Ok(lock);
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(Error::ManifestLocked {
                    waited,
                    holder: Self::holder(path),
                });
            }

            if !announced {
                info!(
                    "Waiting for manifest lock held by {}",
                    Self::holder(path).unwrap_or_else(|| "another process".to_string())
                );
                announced = true;
            }
            thread::sleep(POLL_INTERVAL.min(timeout - waited));
        }
    }

    /// Take the lock if it is free right now
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("Failed to create {}", parent.display()), e))?;
        }

        // No truncate: the current holder's note must survive a failed attempt
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::io(format!("Failed to open {}", path.display()), e))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                let mut lock = Self {
                    file,
                    path: path.to_path_buf(),
                };
                lock.record_holder();
                Ok(Some(lock))
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            #[cfg(windows)]
            Err(err) if matches!(err.raw_os_error(), Some(32 | 33)) => Ok(None),
            Err(err) => Err(Error::io(format!("Failed to lock {}", path.display()), err)),
        }
    }

    /// Holder note left by the current (or last) lock owner
    pub fn holder(path: &Path) -> Option<String> {
        fs::read_to_string(path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record_holder(&mut self) {
        let note = format!(
            "pid={} acquired={}\n",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        );
        // Diagnostics only; a failed write does not affect mutual exclusion
        let written = self
            .file
            .set_len(0)
            .and_then(|_| self.file.write_all(note.as_bytes()))
            .and_then(|_| self.file.flush());
        if let Err(e) = written {
            debug!("Could not record lock holder in {}: {}", self.path.display(), e);
        }
    }
}
