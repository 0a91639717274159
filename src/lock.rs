// src/lock.rs

//! Advisory transaction lock
//!
//! Serializes concurrent transactions against the same root. The lock file
//! is opened read-write (created if needed); a non-blocking exclusive lock
//! is tried first, then a blocking one after warning the user. On read-only
//! filesystems the file is reopened read-only and only a shared lock is
//! taken, so query tools on a read-only root never block each other.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    ReadOnly,
    ReadWrite,
}

/// Held advisory lock over a transaction root
///
/// The lock is released on drop; release failures are swallowed.
#[derive(Debug)]
pub struct TransactionLock {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl TransactionLock {
    /// Acquire the transaction lock at the given path
    ///
    /// Blocks if another process holds the write lock. Returns
    /// `Error::LockFailed` only when the lock cannot be obtained at all.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (file, mode) = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
        {
            Ok(f) => (f, LockMode::ReadWrite),
            Err(_) => {
                // Read-only root: fall back to a shared advisory guard.
                let f = File::open(path).map_err(|_| Error::LockFailed {
                    path: path.to_path_buf(),
                })?;
                (f, LockMode::ReadOnly)
            }
        };

        let lock = Self {
            file,
            path: path.to_path_buf(),
            mode,
        };

        match lock.mode {
            LockMode::ReadWrite => {
                if lock.file.try_lock_exclusive().is_err() {
                    warn!("waiting for transaction lock on {}", lock.path.display());
                    if lock.file.lock_exclusive().is_err() {
                        error!(
                            "cannot create transaction lock on {}",
                            lock.path.display()
                        );
                        return Err(Error::LockFailed {
                            path: lock.path.clone(),
                        });
                    }
                }
            }
            LockMode::ReadOnly => {
                if lock.file.lock_shared().is_err() {
                    return Err(Error::LockFailed {
                        path: lock.path.clone(),
                    });
                }
            }
        }

        debug!("acquired transaction lock on {}", lock.path.display());
        Ok(lock)
    }

    /// True if the lock holds exclusive (write) access
    pub fn is_exclusive(&self) -> bool {
        self.mode == LockMode::ReadWrite
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TransactionLock {
    fn drop(&mut self) {
        // Cleanup must never fail the caller.
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("lock");

        let lock = TransactionLock::acquire(&path).unwrap();
        assert!(lock.is_exclusive());
        drop(lock);

        // Re-acquirable after release.
        let lock = TransactionLock::acquire(&path).unwrap();
        assert!(lock.is_exclusive());
    }

    #[test]
    fn test_second_acquire_blocked_while_held() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("lock");

        let _held = TransactionLock::acquire(&path).unwrap();

        // A second open handle in the same process cannot take the
        // exclusive lock without blocking.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        assert!(file.try_lock_exclusive().is_err());
    }

    #[test]
    fn test_creates_parent_directories() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("var/lib/rpmtxn/.transaction_lock");
        let lock = TransactionLock::acquire(&path).unwrap();
        assert!(lock.path().exists());
    }
}
