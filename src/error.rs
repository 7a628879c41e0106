//! Error types for the capture ledger

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Atomic write did not complete. The target file is unchanged.
    #[error("Write error for {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Duplicate capture id: {0}")]
    DuplicateKey(String),

    /// Batch commit failed and was rolled back. Safe to retry.
    #[error("Transaction failed ({attempted} records rolled back): {source}")]
    Transaction {
        attempted: usize,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Parse error on fallback line {line}: {reason}")]
    Parse { line: usize, reason: String },

    /// Neither the index nor the fallback log accepted the record.
    #[error("Capture {id} lost: index failed ({index_error}), fallback log failed ({log_error})")]
    Lost {
        id: String,
        index_error: String,
        log_error: String,
    },

    /// Another process or thread held the data directory lock past the timeout.
    #[error("Timed out waiting for lock {path}")]
    Locked { path: PathBuf },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl LedgerError {
    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write { path: path.into(), source }
    }

    pub fn is_lost(&self) -> bool {
        matches!(self, Self::Lost { .. })
    }

    /// Whether re-issuing the whole call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transaction { .. }
                | Self::Database(_)
                | Self::Io(_)
                | Self::Write { .. }
                | Self::Locked { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
