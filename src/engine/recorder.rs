// FILE: src/engine/recorder.rs
use std::sync::Arc;

use crate::context::SessionContext;
use crate::error::{LedgerError, Result};
use crate::storage::{CaptureRecord, FallbackLog, RecordIndex};

/// Where a recorded capture ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Stored in the index (or was already there).
    Indexed,
    /// Index refused it; the fallback log holds it until the next migration.
    FellBackToLog,
}

/// Entry point for the capture pipeline.
///
/// Tries the index, degrades to the fallback log, and reports
/// [`LedgerError::Lost`] only when both tiers refused the record.
pub struct CaptureRecorder {
    index: Arc<dyn RecordIndex>,
    log: Arc<FallbackLog>,
}

impl CaptureRecorder {
    pub fn new(index: Arc<dyn RecordIndex>, log: Arc<FallbackLog>) -> Self {
        Self { index, log }
    }

    pub fn record(&self, ctx: &SessionContext, record: &CaptureRecord) -> Result<RecordOutcome> {
        let span = ctx.span("record");
        let _enter = span.enter();

        record.validate()?;
        if !record.is_complete() {
            return Err(LedgerError::InvalidRecord(format!(
                "artifact for {} does not exist: {}",
                record.id,
                record.artifact_path.display()
            )));
        }

        // 1. Primary tier
        let index_error = match self.index.insert(record) {
            Ok(()) => {
                tracing::debug!(capture_id = %record.id, "[Recorder] Indexed");
                return Ok(RecordOutcome::Indexed);
            }
            Err(LedgerError::DuplicateKey(id)) => {
                tracing::debug!(capture_id = %id, "[Recorder] Already indexed, nothing to do");
                return Ok(RecordOutcome::Indexed);
            }
            Err(e) => e,
        };

        // 2. Fallback tier
        match self.log.append(record) {
            Ok(()) => {
                tracing::warn!(
                    capture_id = %record.id,
                    error = %index_error,
                    "[Recorder] Index unavailable, capture diverted to fallback log {}",
                    self.log.path().display()
                );
                Ok(RecordOutcome::FellBackToLog)
            }
            Err(log_error) => {
                let lost = LedgerError::Lost {
                    id: record.id.to_string(),
                    index_error: index_error.to_string(),
                    log_error: log_error.to_string(),
                };
                tracing::error!(capture_id = %record.id, "[Recorder] {}", lost);
                Err(lost)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::fakes::{SwitchableIndex, UnavailableIndex};
    use crate::storage::{CaptureId, IndexStore, MetaValue};
    use std::path::Path;
    use std::time::Duration;

    fn ctx() -> SessionContext {
        SessionContext::new("session-test")
    }

    fn record(id: &str) -> CaptureRecord {
        CaptureRecord::new("session-test", "", 0).with_id(id)
    }

    fn fallback(dir: &Path) -> Arc<FallbackLog> {
        Arc::new(FallbackLog::open(dir.join("captures.jsonl"), true).unwrap())
    }

    fn index(dir: &Path) -> Arc<SwitchableIndex> {
        Arc::new(SwitchableIndex::new(
            IndexStore::open(dir.join("index.db"), Duration::from_secs(5)).unwrap(),
        ))
    }

    #[test]
    fn test_indexed_when_store_available() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(dir.path());
        let log = fallback(dir.path());
        let recorder = CaptureRecorder::new(idx.clone(), log.clone());

        let r = record("1");
        assert_eq!(recorder.record(&ctx(), &r).unwrap(), RecordOutcome::Indexed);
        assert_eq!(idx.get(&r.id).unwrap(), Some(r.clone()));
        assert!(log.is_empty().unwrap());

        // Re-recording the same id is success-equivalent and writes nothing new.
        assert_eq!(recorder.record(&ctx(), &r).unwrap(), RecordOutcome::Indexed);
        assert_eq!(idx.inner.count().unwrap(), 1);
        assert!(log.is_empty().unwrap());
    }

    #[test]
    fn test_falls_back_when_index_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let log = fallback(dir.path());
        let recorder = CaptureRecorder::new(Arc::new(UnavailableIndex), log.clone());

        let r = record("7");
        assert_eq!(recorder.record(&ctx(), &r).unwrap(), RecordOutcome::FellBackToLog);

        let lines: Vec<CaptureRecord> = log.read_all().unwrap().map(|x| x.unwrap()).collect();
        assert_eq!(lines, vec![r]);
        let raw = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(raw.lines().count(), 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_lost_when_both_tiers_fail() {
        // Every write to /dev/full fails with ENOSPC.
        let full = Arc::new(FallbackLog::open("/dev/full", true).unwrap());
        let recorder = CaptureRecorder::new(Arc::new(UnavailableIndex), full);

        let err = recorder.record(&ctx(), &record("9")).unwrap_err();
        assert!(err.is_lost());
        assert!(matches!(err, LedgerError::Lost { ref id, .. } if id == "9"));
    }

    #[test]
    fn test_rejects_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(dir.path());
        let log = fallback(dir.path());
        let recorder = CaptureRecorder::new(idx.clone(), log.clone());

        let r = CaptureRecord::new("s", dir.path().join("missing.jpg"), 0);
        assert!(matches!(recorder.record(&ctx(), &r), Err(LedgerError::InvalidRecord(_))));
        assert_eq!(idx.inner.count().unwrap(), 0);
        assert!(log.is_empty().unwrap());

        std::fs::write(&r.artifact_path, b"jpeg").unwrap();
        assert_eq!(recorder.record(&ctx(), &r).unwrap(), RecordOutcome::Indexed);
    }

    #[test]
    fn test_rejects_metadata_neither_tier_can_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(dir.path());
        let log = fallback(dir.path());
        let recorder = CaptureRecorder::new(idx.clone(), log.clone());

        let mut nan = record("nan");
        nan.metadata.extra.insert("exposure".into(), MetaValue::Float(f64::NAN));
        let mut shadowed = record("shadowed");
        shadowed.metadata.width = Some(640);
        shadowed.metadata.extra.insert("width".into(), MetaValue::Int(1));

        for down in [false, true] {
            idx.set_down(down);
            for r in [&nan, &shadowed] {
                assert!(matches!(recorder.record(&ctx(), r), Err(LedgerError::InvalidRecord(_))));
            }
        }
        idx.set_down(false);
        assert_eq!(idx.inner.count().unwrap(), 0);
        assert!(log.is_empty().unwrap());
    }

    #[test]
    fn test_every_record_lands_in_one_tier() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(dir.path());
        let log = fallback(dir.path());
        let recorder = CaptureRecorder::new(idx.clone(), log.clone());

        let records: Vec<_> = (0..20).map(|i| record(&format!("r-{}", i))).collect();
        for (i, r) in records.iter().enumerate() {
            idx.set_down(i % 3 == 0);
            recorder.record(&ctx(), r).unwrap();
        }
        idx.set_down(false);

        let logged: Vec<CaptureId> = log.read_all().unwrap().map(|x| x.unwrap().id).collect();
        for r in &records {
            let in_index = idx.contains(&r.id).unwrap();
            let in_log = logged.contains(&r.id);
            assert!(in_index ^ in_log, "{} must be in exactly one tier", r.id);
        }
        assert_eq!(logged.len(), 7);
    }
}
