//! Lock file backing the admission gate.
//!
//! The configured lock file name is suffixed with the supervisor's pid, created,
//! exclusively locked and stamped with that pid. Two supervisors pointed at the
//! same lock directory therefore never share a gate, and a supervisor that
//! cannot create its lock file refuses to start.

use fs2::FileExt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorCode, Result};

/// Append the current process id to a configured lock file path.
#[must_use]
pub fn expand_lock_path(base: &Path) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{}", std::process::id()));
    PathBuf::from(name)
}

/// An exclusively locked file, released and removed on drop.
#[derive(Debug)]
pub struct GateLock {
    /// The lock file handle
    file: Option<File>,
    /// Path to the lock file
    path: PathBuf,
}

impl GateLock {
    /// Create, lock and stamp the lock file at exactly `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written, or if another
    /// holder already has it locked.
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                Error::admission_with_source(
                    format!("Failed to open or create lock file at {}", path.display()),
                    e,
                )
            })?;

        file.try_lock_exclusive().map_err(|e| Error::Admission {
            code: ErrorCode::AdmissionLockHeld,
            message: format!("Lock file {} is held by another process", path.display()),
            source: Some(Box::new(e)),
        })?;

        file.set_len(0)
            .and_then(|()| writeln!(file, "{}", std::process::id()))
            .map_err(|e| {
                Error::admission_with_source(
                    format!("Failed to write lock file {}", path.display()),
                    e,
                )
            })?;

        Ok(Self {
            file: Some(file),
            path,
        })
    }

    /// Lock the pid-suffixed variant of `base`.
    ///
    /// # Errors
    ///
    /// See [`GateLock::acquire`].
    pub fn acquire_expanded<P: AsRef<Path>>(base: P) -> Result<Self> {
        Self::acquire(expand_lock_path(base.as_ref()))
    }

    /// Path of the locked file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the lock and removes the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be unlocked
    pub fn release(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            FileExt::unlock(&file).map_err(|e| {
                Error::io_with_source(
                    format!("Failed to release lock on file {}", self.path.display()),
                    e,
                )
            })?;
            drop(file);
            // someone may already have cleaned the directory
            let _ = std::fs::remove_file(&self.path);
        }
        Ok(())
    }

    /// Checks if the lock is currently held.
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for GateLock {
    fn drop(&mut self) {
        if self.is_locked() {
            let _ = self.release();
        }
    }
}
