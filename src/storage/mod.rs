// FILE: src/storage/mod.rs
pub mod atomic;
pub mod fallback_log;
pub mod file_lock;
pub mod index_store;
pub mod record;
pub mod schema;

#[cfg(test)]
pub(crate) mod fakes;

// Common exports
pub use atomic::AtomicWriter;
pub use fallback_log::{FallbackLog, LogReader, ParseFailure};
pub use file_lock::{DataDirLock, LockGuard};
pub use index_store::{BatchOutcome, IndexStore, RecordIndex};
pub use record::{CaptureId, CaptureMetadata, CaptureRecord, MediaFormat, MetaValue};
