// FILE: src/engine/mod.rs
pub mod migrator;
pub mod recorder;

pub use migrator::{MigrationCheckpoint, MigrationReport, Migrator};
pub use recorder::{CaptureRecorder, RecordOutcome};
