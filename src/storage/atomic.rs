//! All-or-nothing file writes
//!
//! The payload goes to a temporary file in the target's directory, is synced,
//! then renamed over the target. Readers see the old content or the new content,
//! never a mix. The temporary file is removed on every failure path.

use std::ffi::OsString;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::error::{LedgerError, Result};

pub struct AtomicWriter;

impl AtomicWriter {
    pub fn write(path: &Path, payload: &[u8]) -> Result<()> {
        Self::write_with(path, |file| file.write_all(payload))
    }

    /// Like [`AtomicWriter::write`], with the caller filling the temporary file.
    /// If `fill` fails the target is left untouched.
    pub fn write_with<F>(path: &Path, fill: F) -> Result<()>
    where
        F: FnOnce(&mut File) -> std::io::Result<()>,
    {
        let dir = parent_dir(path);
        let file_name = path
            .file_name()
            .ok_or_else(|| LedgerError::InvalidPath(format!("no file name in {}", path.display())))?;
        let mut prefix = OsString::from(".");
        prefix.push(file_name);
        prefix.push(".");

        std::fs::create_dir_all(dir).map_err(|e| LedgerError::write(path, e))?;

        // Dropping `tmp` deletes the file, so every early return below cleans up.
        let mut tmp = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| LedgerError::write(path, e))?;

        fill(tmp.as_file_mut()).map_err(|e| LedgerError::write(path, e))?;
        tmp.as_file_mut().flush().map_err(|e| LedgerError::write(path, e))?;
        tmp.as_file().sync_all().map_err(|e| LedgerError::write(path, e))?;

        tmp.persist(path).map_err(|e| {
            tracing::warn!("[AtomicWriter] Replace failed for {}: {}", path.display(), e.error);
            // e.file is dropped here, removing the temporary
            LedgerError::write(path, e.error)
        })?;

        sync_dir(dir);
        tracing::debug!("[AtomicWriter] Wrote {}", path.display());
        Ok(())
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Persist the rename itself. Best effort: not every platform can open a directory.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        tracing::debug!("[AtomicWriter] Directory sync failed for {}: {}", dir.display(), e);
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_write_and_replace() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("checkpoint.json");

        AtomicWriter::write(&target, b"first").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"first");

        AtomicWriter::write(&target, b"second").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"second");
        assert_eq!(entries(dir.path()), vec!["checkpoint.json"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_file_name() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join(OsStr::from_bytes(b"state-\xff.json"));

        AtomicWriter::write(&target, b"one").unwrap();
        AtomicWriter::write(&target, b"two").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"two");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_creates_missing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("state.json");
        AtomicWriter::write(&target, b"{}").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"{}");
    }

    #[test]
    fn test_interrupted_fill_keeps_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data.bin");
        std::fs::write(&target, b"previous").unwrap();

        let result = AtomicWriter::write_with(&target, |file| {
            file.write_all(b"half of the new")?;
            Err(io::Error::new(io::ErrorKind::Other, "simulated crash"))
        });

        assert!(matches!(result, Err(LedgerError::Write { .. })));
        assert_eq!(std::fs::read(&target).unwrap(), b"previous");
        assert_eq!(entries(dir.path()), vec!["data.bin"]);
    }

    #[test]
    fn test_interrupted_fill_keeps_target_absent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("never.bin");

        let result = AtomicWriter::write_with(&target, |_| {
            Err(io::Error::new(io::ErrorKind::Other, "simulated crash"))
        });

        assert!(result.is_err());
        assert!(!target.exists());
        assert!(entries(dir.path()).is_empty());
    }

    #[test]
    fn test_failed_replace_removes_temporary() {
        let dir = tempfile::tempdir().unwrap();
        // A non-empty directory cannot be replaced by a file.
        let target = dir.path().join("occupied");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("keep"), b"x").unwrap();

        let result = AtomicWriter::write(&target, b"payload");

        assert!(matches!(result, Err(LedgerError::Write { .. })));
        assert!(target.is_dir());
        assert_eq!(entries(dir.path()), vec!["occupied"]);
    }
}
