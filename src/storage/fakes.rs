//! Fault-injecting index implementations (testing only)

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{LedgerError, Result};
use crate::storage::index_store::{BatchOutcome, IndexStore, RecordIndex};
use crate::storage::record::{CaptureId, CaptureRecord};

fn unavailable() -> LedgerError {
    LedgerError::Io(std::io::Error::new(std::io::ErrorKind::Other, "database is locked"))
}

/// Index that rejects every operation.
#[derive(Debug, Default)]
pub struct UnavailableIndex;

impl RecordIndex for UnavailableIndex {
    fn insert(&self, _record: &CaptureRecord) -> Result<()> {
        Err(unavailable())
    }

    fn get(&self, _id: &CaptureId) -> Result<Option<CaptureRecord>> {
        Err(unavailable())
    }

    fn contains(&self, _id: &CaptureId) -> Result<bool> {
        Err(unavailable())
    }

    fn insert_batch(&self, _records: &[CaptureRecord]) -> Result<BatchOutcome> {
        Err(unavailable())
    }
}

/// Real store that can be switched offline.
pub struct SwitchableIndex {
    pub inner: IndexStore,
    down: AtomicBool,
}

impl SwitchableIndex {
    pub fn new(inner: IndexStore) -> Self {
        Self { inner, down: AtomicBool::new(false) }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(unavailable())
        } else {
            Ok(())
        }
    }
}

impl RecordIndex for SwitchableIndex {
    fn insert(&self, record: &CaptureRecord) -> Result<()> {
        self.check()?;
        self.inner.insert(record)
    }

    fn get(&self, id: &CaptureId) -> Result<Option<CaptureRecord>> {
        self.check()?;
        self.inner.get(id)
    }

    fn contains(&self, id: &CaptureId) -> Result<bool> {
        self.check()?;
        self.inner.contains(id)
    }

    fn insert_batch(&self, records: &[CaptureRecord]) -> Result<BatchOutcome> {
        self.check()?;
        self.inner.insert_batch(records)
    }
}
