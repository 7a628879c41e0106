//! Append-only JSONL fallback log
//!
//! Holds capture records the index could not take. One JSON object per line,
//! each line written with a single flushed write under the log's mutex so that
//! concurrent appends never interleave. Earlier lines are never rewritten.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{LedgerError, Result};
use crate::storage::file_lock::DataDirLock;
use crate::storage::record::{CaptureId, CaptureRecord};

pub struct FallbackLog {
    path: PathBuf,
    file: Mutex<LogFile>,
    sync_appends: bool,
    dir_lock: Option<DataDirLock>,
}

struct LogFile {
    file: File,
    /// A failed append left bytes that could not be truncated away.
    needs_seal: bool,
}

impl FallbackLog {
    /// Open (or create) the log. A torn final line left by a crash is sealed with
    /// a newline so the next append starts on a fresh line.
    pub fn open(path: impl Into<PathBuf>, sync_appends: bool) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        seal_torn_tail(&mut file, &path)?;

        tracing::info!("[FallbackLog] Opened {}", path.display());
        Ok(Self {
            path,
            file: Mutex::new(LogFile { file, needs_seal: false }),
            sync_appends,
            dir_lock: None,
        })
    }

    /// Hold `lock` around every append.
    pub fn with_lock(mut self, lock: DataDirLock) -> Self {
        self.dir_lock = Some(lock);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The line is fully present or fully absent when this returns, even on error.
    pub fn append(&self, record: &CaptureRecord) -> Result<()> {
        self.append_with(record, |file, line| file.write_all(line))
    }

    fn append_with<F>(&self, record: &CaptureRecord, write: F) -> Result<()>
    where
        F: FnOnce(&mut File, &[u8]) -> std::io::Result<()>,
    {
        record.metadata.validate()?;
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut log = self.file.lock()
            .map_err(|_| LedgerError::State("Poisoned lock".into()))?;
        let _dir_guard = self.dir_lock.as_ref().map(DataDirLock::acquire).transpose()?;

        if log.needs_seal {
            log.file.write_all(b"\n")?;
            log.needs_seal = false;
            tracing::warn!("[FallbackLog] Sealed fragment of an earlier failed append");
        }

        let before = log.file.metadata()?.len();
        if let Err(e) = write_line(&mut log.file, &line, self.sync_appends, write) {
            log.roll_back(before, &self.path);
            return Err(e.into());
        }

        tracing::debug!("[FallbackLog] Appended {} ({} bytes)", record.id, line.len());
        Ok(())
    }

    /// Lazy pass over every complete line. Call again to start a new pass.
    pub fn read_all(&self) -> Result<LogReader> {
        self.read_from(0)
    }

    /// Lazy pass starting at a byte offset previously returned by [`LogReader::offset`].
    pub fn read_from(&self, offset: u64) -> Result<LogReader> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(offset))?;
        Ok(LogReader {
            reader,
            offset,
            line: 0,
            buf: Vec::new(),
            malformed: Vec::new(),
            done: false,
        })
    }

    /// Id of the first parseable record, used to recognise a replaced log.
    pub fn first_record_id(&self) -> Result<Option<CaptureId>> {
        match self.read_all()?.next() {
            Some(Ok(record)) => Ok(Some(record.id)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn write_line<F>(file: &mut File, line: &[u8], sync: bool, write: F) -> std::io::Result<()>
where
    F: FnOnce(&mut File, &[u8]) -> std::io::Result<()>,
{
    write(file, line)?;
    file.flush()?;
    if sync {
        file.sync_data()?;
    }
    Ok(())
}

impl LogFile {
    /// Drop whatever a failed append wrote past `len`.
    fn roll_back(&mut self, len: u64, path: &Path) {
        match self.file.set_len(len).and_then(|()| self.file.sync_data()) {
            Ok(()) => tracing::warn!("[FallbackLog] Failed append rolled back to {} bytes", len),
            Err(e) => {
                tracing::warn!(
                    "[FallbackLog] Could not roll back {}, next append starts a fresh line: {}",
                    path.display(),
                    e
                );
                self.needs_seal = true;
            }
        }
    }
}

fn seal_torn_tail(file: &mut File, path: &Path) -> Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        tracing::warn!("[FallbackLog] Sealing torn final line in {}", path.display());
        file.write_all(b"\n")?;
        file.sync_data()?;
    }
    Ok(())
}

/// A line that could not be decoded. Skipped, never fatal.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseFailure {
    /// 1-based line number within this pass.
    pub line: usize,
    /// Byte offset where the line starts.
    pub offset: u64,
    pub reason: String,
}

impl From<ParseFailure> for LedgerError {
    fn from(failure: ParseFailure) -> Self {
        LedgerError::Parse { line: failure.line, reason: failure.reason }
    }
}

/// Iterator over the records of one pass. Items are `Err` only for I/O failures;
/// malformed lines are skipped and collected in [`LogReader::malformed`].
pub struct LogReader {
    reader: BufReader<File>,
    offset: u64,
    line: usize,
    buf: Vec<u8>,
    malformed: Vec<ParseFailure>,
    done: bool,
}

impl LogReader {
    /// Offset just past the last complete line consumed.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn malformed(&self) -> &[ParseFailure] {
        &self.malformed
    }
}

impl Iterator for LogReader {
    type Item = Result<CaptureRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            self.buf.clear();
            let n = match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(n) => n,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };
            if n == 0 {
                self.done = true;
                break;
            }
            if self.buf.last() != Some(&b'\n') {
                // Append in flight, or torn by a crash and not yet sealed.
                tracing::debug!("[FallbackLog] Stopping at incomplete line at offset {}", self.offset);
                self.done = true;
                break;
            }

            let start = self.offset;
            self.offset += n as u64;
            self.line += 1;

            let parsed = std::str::from_utf8(&self.buf)
                .map_err(|e| e.to_string())
                .and_then(|text| {
                    let text = text.trim();
                    if text.is_empty() {
                        return Ok(None);
                    }
                    serde_json::from_str::<CaptureRecord>(text)
                        .map(Some)
                        .map_err(|e| e.to_string())
                });

            match parsed {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => continue,
                Err(reason) => {
                    let failure = ParseFailure { line: self.line, offset: start, reason };
                    tracing::warn!(offset = start, "[FallbackLog] Skipping malformed line: {}",
                        LedgerError::from(failure.clone()));
                    self.malformed.push(failure);
                }
            }
        }
        None
    }
}
