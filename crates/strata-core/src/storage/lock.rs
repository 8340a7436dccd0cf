//! Advisory data-directory lock.

use std::fs::{File, OpenOptions};
use std::path::Path;

use fs2::FileExt;

use crate::error::StorageError;

/// An advisory exclusive lock (`flock(2)` on Unix) on a data directory's
/// `LOCK` file.
///
/// The lock is released automatically when this struct is dropped (the
/// underlying file descriptor is closed). A second process attempting to
/// open the same data directory fails immediately rather than corrupting
/// shared files.
#[derive(Debug)]
pub struct DirectoryLock {
    _file: File,
}

impl DirectoryLock {
    /// Acquire the exclusive lock without blocking.
    ///
    /// Creates the lock file if it does not exist. Returns
    /// `StorageError::DirectoryLocked` if another handle holds it.
    pub fn acquire(path: &Path) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        file.try_lock_exclusive()
            .map_err(|_| StorageError::DirectoryLocked)?;

        Ok(Self { _file: file })
    }
}
