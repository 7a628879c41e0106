// FILE: src/engine/migrator.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::context::SessionContext;
use crate::error::{LedgerError, Result};
use crate::storage::{AtomicWriter, CaptureId, DataDirLock, FallbackLog, RecordIndex};

/// Counts from one migration pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Parseable records read from the fallback log this pass.
    pub scanned: usize,
    /// Newly committed to the index.
    pub migrated: usize,
    /// Already in the index (or repeated in the log); skipped.
    pub already_present: usize,
    pub malformed: usize,
    /// Byte offset the pass started reading at.
    pub resumed_from: u64,
}

/// How far a previous pass got. Written atomically after each committed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationCheckpoint {
    pub offset: u64,
    /// First record of the log when the checkpoint was taken.
    pub head_id: Option<CaptureId>,
    pub migrated_total: u64,
    pub completed_at: DateTime<Utc>,
}

/// Folds fallback log records into the index exactly once.
///
/// The fallback log is never truncated; it stays as the audit trail. The
/// checkpoint only saves re-reading: the `contains` check is what keeps the
/// pass idempotent, including after a crash between commit and checkpoint.
pub struct Migrator {
    index: Arc<dyn RecordIndex>,
    log: Arc<FallbackLog>,
    checkpoint_path: PathBuf,
    running: Mutex<()>,
    dir_lock: Option<DataDirLock>,
}

impl Migrator {
    pub fn new(index: Arc<dyn RecordIndex>, log: Arc<FallbackLog>, checkpoint_path: impl Into<PathBuf>) -> Self {
        Self {
            index,
            log,
            checkpoint_path: checkpoint_path.into(),
            running: Mutex::new(()),
            dir_lock: None,
        }
    }

    /// Hold `lock` for each whole pass, excluding other processes.
    pub fn with_lock(mut self, lock: DataDirLock) -> Self {
        self.dir_lock = Some(lock);
        self
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint_path
    }

    pub fn migrate(&self, ctx: &SessionContext) -> Result<MigrationReport> {
        let span = ctx.span("migrate");
        let _enter = span.enter();
        let _running = self.running.lock()
            .map_err(|_| LedgerError::State("Poisoned lock".into()))?;
        let _dir_guard = self.dir_lock.as_ref().map(DataDirLock::acquire).transpose()?;

        let checkpoint = self.load_checkpoint();
        let start = self.resume_offset(checkpoint.as_ref())?;
        tracing::info!(offset = start, "[Migrator] Migration started: {}", self.log.path().display());

        // 1. Read and partition
        let mut report = MigrationReport { resumed_from: start, ..Default::default() };
        let mut reader = self.log.read_from(start)?;
        let mut seen = HashSet::new();
        let mut pending = Vec::new();

        for item in reader.by_ref() {
            let record = item?;
            report.scanned += 1;
            if !seen.insert(record.id.clone()) || self.index.contains(&record.id)? {
                report.already_present += 1;
                continue;
            }
            pending.push(record);
        }
        report.malformed = reader.malformed().len();
        let end = reader.offset();

        // 2. One transaction for everything pending
        if !pending.is_empty() {
            match self.index.insert_batch(&pending) {
                Ok(outcome) => {
                    report.migrated = outcome.inserted;
                    // Recorded into the index between partition and commit.
                    report.already_present += outcome.skipped_ids.len();
                }
                Err(e) => {
                    tracing::error!(
                        attempted = pending.len(),
                        error = %e,
                        "[Migrator] Batch rolled back, nothing migrated this attempt"
                    );
                    return Err(e);
                }
            }
        }

        // 3. Move the boundary
        if end != start || checkpoint.is_none() {
            let previous = checkpoint.as_ref().map(|c| c.migrated_total).unwrap_or(0);
            self.save_checkpoint(end, previous + report.migrated as u64);
        }

        tracing::info!(
            scanned = report.scanned,
            migrated = report.migrated,
            already_present = report.already_present,
            malformed = report.malformed,
            "[Migrator] Migration finished"
        );
        Ok(report)
    }

    pub fn load_checkpoint(&self) -> Option<MigrationCheckpoint> {
        let bytes = match std::fs::read(&self.checkpoint_path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("[Migrator] Checkpoint unreadable, rescanning from start: {}", e);
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!("[Migrator] Checkpoint corrupt, rescanning from start: {}", e);
                None
            }
        }
    }

    /// Offset to resume at; 0 when the log no longer matches the checkpoint.
    fn resume_offset(&self, checkpoint: Option<&MigrationCheckpoint>) -> Result<u64> {
        let Some(checkpoint) = checkpoint else {
            return Ok(0);
        };
        if checkpoint.offset > self.log.len()? {
            tracing::warn!("[Migrator] Fallback log shorter than checkpoint, rescanning from start");
            return Ok(0);
        }
        if checkpoint.offset > 0 && self.log.first_record_id()? != checkpoint.head_id {
            tracing::warn!("[Migrator] Fallback log was replaced, rescanning from start");
            return Ok(0);
        }
        Ok(checkpoint.offset)
    }

    /// Failure here only costs a re-read next time.
    fn save_checkpoint(&self, offset: u64, migrated_total: u64) {
        let head_id = match self.log.first_record_id() {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("[Migrator] Checkpoint skipped: {}", e);
                return;
            }
        };
        let checkpoint = MigrationCheckpoint { offset, head_id, migrated_total, completed_at: Utc::now() };
        let written = serde_json::to_vec_pretty(&checkpoint)
            .map_err(LedgerError::from)
            .and_then(|payload| AtomicWriter::write(&self.checkpoint_path, &payload));
        if let Err(e) = written {
            tracing::warn!("[Migrator] Checkpoint write failed: {}", e);
        }
    }
}
