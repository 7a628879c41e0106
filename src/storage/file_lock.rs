//! Cross-process advisory lock on the data directory
//!
//! Fallback appends and migration passes hold `<data_dir>/index.db.lock`
//! exclusively, so the host application and a `capture-ledger` CLI run against
//! the same directory never interleave. Every acquisition opens its own handle,
//! which makes threads of one process contend on it as well.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{LedgerError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct DataDirLock {
    path: PathBuf,
    timeout: Duration,
}

/// Held lock. Released on drop.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl DataDirLock {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self { path: path.into(), timeout }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when someone else holds it.
    pub fn try_acquire(&self) -> Result<Option<LockGuard>> {
        let file = self.open()?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(LockGuard { file, path: self.path.clone() })),
            Err(e) if is_contended(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Poll until acquired, failing with `Locked` after the timeout.
    pub fn acquire(&self) -> Result<LockGuard> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(guard) = self.try_acquire()? {
                return Ok(guard);
            }
            if Instant::now() >= deadline {
                tracing::warn!("[DataDirLock] Timed out after {:?}: {}", self.timeout, self.path.display());
                return Err(LedgerError::Locked { path: self.path.clone() });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn open(&self) -> Result<File> {
        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?)
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::debug!("[DataDirLock] Unlock failed for {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_second_handle_is_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db.lock");
        let first = DataDirLock::new(&path, Duration::from_millis(50));
        let second = DataDirLock::new(&path, Duration::from_millis(50));

        let guard = first.try_acquire().unwrap().expect("free lock");
        assert!(second.try_acquire().unwrap().is_none());
        assert!(matches!(second.acquire(), Err(LedgerError::Locked { .. })));

        drop(guard);
        assert!(second.acquire().is_ok());
    }

    #[test]
    fn test_waiter_gets_lock_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = Arc::new(DataDirLock::new(dir.path().join("index.db.lock"), Duration::from_secs(5)));

        let guard = lock.acquire().unwrap();
        let waiter = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || lock.acquire().map(|_| ()))
        };
        std::thread::sleep(Duration::from_millis(100));
        drop(guard);

        assert!(waiter.join().unwrap().is_ok());
    }
}
