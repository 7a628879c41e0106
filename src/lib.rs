//! Capture Ledger: durable bookkeeping for photobooth captures
//!
//! Two storage tiers behind one recorder:
//! - Index Store (SQLite, WAL - queryable, may be locked or missing)
//! - Fallback Log (append-only JSONL - written only when the index refuses)
//! - Migrator (startup pass - drains the log back into the index)

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod storage;

pub use config::LedgerConfig;
pub use context::SessionContext;
pub use engine::{CaptureRecorder, MigrationCheckpoint, MigrationReport, Migrator, RecordOutcome};
pub use error::{LedgerError, Result};
pub use ledger::Ledger;
pub use storage::{
    AtomicWriter,
    CaptureId,
    CaptureMetadata,
    CaptureRecord,
    FallbackLog,
    IndexStore,
    MediaFormat,
    MetaValue,
    RecordIndex,
};
