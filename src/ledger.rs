//! Wiring of the durability layer over one data directory
//!
//! Owns the index store, the fallback log, the recorder and the migrator. The
//! host application shares one `Ledger` (behind an `Arc`) between its capture
//! worker and whatever runs the startup migration.

use std::sync::Arc;

use crate::config::LedgerConfig;
use crate::context::SessionContext;
use crate::engine::{CaptureRecorder, MigrationReport, Migrator, RecordOutcome};
use crate::error::Result;
use crate::storage::{CaptureRecord, DataDirLock, FallbackLog, IndexStore};

pub struct Ledger {
    config: LedgerConfig,
    index: Arc<IndexStore>,
    log: Arc<FallbackLog>,
    recorder: CaptureRecorder,
    migrator: Migrator,
}

impl Ledger {
    /// An index that cannot be opened yet is not fatal: captures go to the
    /// fallback log until it comes back. Fallback appends and migration passes
    /// take the data directory lock, so several processes may open one directory.
    pub fn open(config: &LedgerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let index = Arc::new(IndexStore::lazy(config.index_path(), config.busy_timeout()));
        if let Err(e) = index.connect() {
            tracing::warn!("[Ledger] Index unavailable at startup, captures will use the fallback log: {}", e);
        }
        let dir_lock = DataDirLock::new(config.lock_path(), config.busy_timeout());
        let log = Arc::new(
            FallbackLog::open(config.fallback_path(), config.sync_appends)?.with_lock(dir_lock.clone()),
        );

        let recorder = CaptureRecorder::new(index.clone(), log.clone());
        let migrator = Migrator::new(index.clone(), log.clone(), config.checkpoint_path()).with_lock(dir_lock);

        tracing::info!("[Ledger] Ready: {}", config.data_dir.display());
        Ok(Self { config: config.clone(), index, log, recorder, migrator })
    }

    pub fn record(&self, ctx: &SessionContext, record: &CaptureRecord) -> Result<RecordOutcome> {
        self.recorder.record(ctx, record)
    }

    /// Startup reconciliation of the fallback log into the index.
    pub fn startup(&self, ctx: &SessionContext) -> Result<MigrationReport> {
        self.migrator.migrate(ctx)
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    pub fn fallback_log(&self) -> &FallbackLog {
        &self.log
    }

    pub fn recorder(&self) -> &CaptureRecorder {
        &self.recorder
    }

    pub fn migrator(&self) -> &Migrator {
        &self.migrator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use crate::storage::{CaptureId, RecordIndex};
    use std::collections::HashSet;

    fn config(dir: &std::path::Path) -> LedgerConfig {
        LedgerConfig { data_dir: dir.join("data"), sync_appends: false, ..Default::default() }
    }

    #[test]
    fn test_open_record_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(&config(dir.path())).unwrap();
        let ctx = SessionContext::new("run-1");

        let artifact = dir.path().join("selfie.jpg");
        std::fs::write(&artifact, b"jpeg").unwrap();
        let record = CaptureRecord::new(&ctx.session_id, &artifact, 0);

        assert_eq!(ledger.record(&ctx, &record).unwrap(), RecordOutcome::Indexed);
        assert_eq!(ledger.index().latest().unwrap(), Some(record));
        assert_eq!(ledger.startup(&ctx).unwrap().migrated, 0);
    }

    #[test]
    fn test_unavailable_index_at_startup_then_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        std::fs::create_dir_all(&cfg.data_dir).unwrap();
        // A directory where the database file should be makes the index unopenable.
        std::fs::create_dir(cfg.index_path()).unwrap();

        let ledger = Ledger::open(&cfg).unwrap();
        let ctx = SessionContext::new("run-2");
        let record = CaptureRecord::new(&ctx.session_id, "", 1);
        assert_eq!(ledger.record(&ctx, &record).unwrap(), RecordOutcome::FellBackToLog);

        std::fs::remove_dir(cfg.index_path()).unwrap();
        let report = ledger.startup(&ctx).unwrap();
        assert_eq!(report.migrated, 1);
        assert_eq!(ledger.index().get(&record.id).unwrap(), Some(record));
    }

    #[test]
    fn test_two_ledgers_on_one_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = LedgerConfig { busy_timeout_ms: 100, ..config(dir.path()) };
        std::fs::create_dir_all(&cfg.data_dir).unwrap();
        std::fs::create_dir(cfg.index_path()).unwrap();

        // Host application and CLI, both unable to reach the index.
        let host = Ledger::open(&cfg).unwrap();
        let cli = Ledger::open(&cfg).unwrap();
        let ctx = SessionContext::new("run-3");

        let held = DataDirLock::new(cfg.lock_path(), cfg.busy_timeout()).acquire().unwrap();
        let blocked = cli.record(&ctx, &CaptureRecord::new(&ctx.session_id, "", 0)).unwrap_err();
        assert!(blocked.is_lost());
        assert!(matches!(cli.startup(&ctx), Err(LedgerError::Locked { .. })));
        drop(held);

        let a = CaptureRecord::new(&ctx.session_id, "", 0);
        let b = CaptureRecord::new(&ctx.session_id, "", 1);
        assert_eq!(host.record(&ctx, &a).unwrap(), RecordOutcome::FellBackToLog);
        assert_eq!(cli.record(&ctx, &b).unwrap(), RecordOutcome::FellBackToLog);

        let mut reader = host.fallback_log().read_all().unwrap();
        let ids: Vec<CaptureId> = reader.by_ref().map(|r| r.unwrap().id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
        assert!(reader.malformed().is_empty());
    }

    #[test]
    fn test_recorder_and_migrator_threads_share_the_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());

        // Seed the fallback log as an earlier run would have.
        let backlog: Vec<CaptureRecord> =
            (0..50).map(|i| CaptureRecord::new("old", "", 0).with_id(format!("old-{}", i))).collect();
        {
            let log = FallbackLog::open(cfg.fallback_path(), false).unwrap();
            for r in &backlog {
                log.append(r).unwrap();
            }
        }

        let ledger = Arc::new(Ledger::open(&cfg).unwrap());
        let fresh: Vec<CaptureRecord> =
            (0..50).map(|i| CaptureRecord::new("new", "", 0).with_id(format!("new-{}", i))).collect();

        let writer = {
            let ledger = Arc::clone(&ledger);
            let fresh = fresh.clone();
            std::thread::spawn(move || {
                let ctx = SessionContext::new("new");
                for r in &fresh {
                    assert_eq!(ledger.record(&ctx, r).unwrap(), RecordOutcome::Indexed);
                }
            })
        };
        let migrator = {
            let ledger = Arc::clone(&ledger);
            std::thread::spawn(move || {
                let ctx = SessionContext::new("startup");
                ledger.startup(&ctx).unwrap();
                ledger.startup(&ctx).unwrap()
            })
        };
        writer.join().unwrap();
        let second = migrator.join().unwrap();
        assert_eq!(second.migrated, 0);

        assert_eq!(ledger.index().count().unwrap(), 100);
        let all: HashSet<CaptureId> = backlog.iter().chain(fresh.iter()).map(|r| r.id.clone()).collect();
        for id in &all {
            assert!(ledger.index().contains(id).unwrap());
        }
    }
}
