// FILE: src/storage/index_store.rs
use rusqlite::{params, Connection, Row, TransactionBehavior};
use rusqlite::types::Type;
use rusqlite::ErrorCode;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Result, LedgerError};
use crate::storage::record::{format_timestamp, parse_timestamp, CaptureId, CaptureRecord};
use crate::storage::schema;

/// Keyed capture store the recorder and migrator write through.
///
/// Implementations serialize their own write transactions: a batch from the
/// migrator and a single insert from the recorder never interleave.
pub trait RecordIndex: Send + Sync {
    /// Fails with `DuplicateKey` if the id is already stored.
    fn insert(&self, record: &CaptureRecord) -> Result<()>;

    fn get(&self, id: &CaptureId) -> Result<Option<CaptureRecord>>;

    fn contains(&self, id: &CaptureId) -> Result<bool>;

    /// One transaction: every non-duplicate record commits, or none do.
    /// Ids already present are skipped and reported, not errors.
    fn insert_batch(&self, records: &[CaptureRecord]) -> Result<BatchOutcome>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub skipped_ids: Vec<CaptureId>,
}

const SELECT_COLUMNS: &str =
    "SELECT id, captured_at, session_id, artifact_path, camera_index, metadata FROM captures";

/// SQLite-backed [`RecordIndex`].
///
/// The connection is opened lazily and reopened after a failed open, so an
/// index that is locked or missing at startup recovers without a restart.
pub struct IndexStore {
    db_path: PathBuf,
    busy_timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

impl IndexStore {
    /// Open now; fails if the database cannot be opened.
    pub fn open(db_path: impl Into<PathBuf>, busy_timeout: Duration) -> Result<Self> {
        let store = Self::lazy(db_path, busy_timeout);
        store.connect()?;
        Ok(store)
    }

    /// Defer opening to the first operation.
    pub fn lazy(db_path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self { db_path: db_path.into(), busy_timeout, conn: Mutex::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn connect(&self) -> Result<()> {
        self.with_conn(|_| Ok(()))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock()
            .map_err(|_| LedgerError::State("Poisoned lock".into()))?;

        if guard.is_none() {
            let conn = schema::open_database(&self.db_path, self.busy_timeout)?;
            schema::create_tables(&conn)?;
            tracing::info!("[IndexStore] Connected: {}", self.db_path.display());
            *guard = Some(conn);
        }

        let conn = guard.as_mut()
            .ok_or_else(|| LedgerError::State("Database not initialized".into()))?;
        let result = f(conn);

        if let Err(e) = &result {
            if breaks_connection(e) {
                tracing::warn!("[IndexStore] Dropping connection, reopening on next use: {}", e);
                *guard = None;
            }
        }
        result
    }

    /// Captures with `start <= captured_at < end`, oldest first.
    pub fn list_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<CaptureRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "{} WHERE captured_at >= ?1 AND captured_at < ?2 ORDER BY captured_at ASC, id ASC",
                SELECT_COLUMNS
            ))?;
            let rows = stmt.query_map(params![format_timestamp(&start), format_timestamp(&end)], row_to_record)?;
            let mut results = Vec::new();
            for r in rows { results.push(r?); }
            Ok(results)
        })
    }

    pub fn list_month(&self, year: i32, month: u32) -> Result<Vec<CaptureRecord>> {
        let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
        let start = month_start(year, month)?;
        let end = month_start(next_year, next_month)?;
        self.list_between(start, end)
    }

    pub fn list_session(&self, session_id: &str) -> Result<Vec<CaptureRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "{} WHERE session_id = ?1 ORDER BY captured_at ASC, id ASC",
                SELECT_COLUMNS
            ))?;
            let rows = stmt.query_map(params![session_id], row_to_record)?;
            let mut results = Vec::new();
            for r in rows { results.push(r?); }
            Ok(results)
        })
    }

    /// Most recent capture by timestamp.
    pub fn latest(&self) -> Result<Option<CaptureRecord>> {
        self.with_conn(|conn| {
            let result = conn.query_row(
                &format!("{} ORDER BY captured_at DESC, id DESC LIMIT 1", SELECT_COLUMNS),
                [],
                row_to_record,
            );
            match result {
                Ok(r) => Ok(Some(r)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(LedgerError::Database(e)),
            }
        })
    }

    pub fn count(&self) -> Result<u64> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM captures", [], |row| row.get::<_, u64>(0))?)
        })
    }
}

impl RecordIndex for IndexStore {
    fn insert(&self, record: &CaptureRecord) -> Result<()> {
        self.with_conn(|conn| {
            if insert_row(conn, record)? {
                tracing::debug!("[IndexStore] Inserted {}", record.id);
                Ok(())
            } else {
                Err(LedgerError::DuplicateKey(record.id.to_string()))
            }
        })
    }

    fn get(&self, id: &CaptureId) -> Result<Option<CaptureRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!("{} WHERE id = ?1", SELECT_COLUMNS))?;
            let result = stmt.query_row(params![id], row_to_record);
            match result {
                Ok(r) => Ok(Some(r)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(LedgerError::Database(e)),
            }
        })
    }

    fn contains(&self, id: &CaptureId) -> Result<bool> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT EXISTS(SELECT 1 FROM captures WHERE id = ?1)")?;
            Ok(stmt.query_row(params![id], |row| row.get::<_, bool>(0))?)
        })
    }

    fn insert_batch(&self, records: &[CaptureRecord]) -> Result<BatchOutcome> {
        let attempted = records.len();
        self.with_conn(|conn| {
            // Dropping `tx` without commit rolls back.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|source| LedgerError::Transaction { attempted, source })?;

            let mut outcome = BatchOutcome::default();
            for record in records {
                match insert_row(&tx, record) {
                    Ok(true) => outcome.inserted += 1,
                    Ok(false) => outcome.skipped_ids.push(record.id.clone()),
                    Err(LedgerError::Database(source)) => {
                        tracing::warn!("[IndexStore] Batch aborted at {}: {}", record.id, source);
                        return Err(LedgerError::Transaction { attempted, source });
                    }
                    Err(e) => return Err(e),
                }
            }

            tx.commit().map_err(|source| LedgerError::Transaction { attempted, source })?;
            tracing::debug!(
                "[IndexStore] Batch committed: {} inserted, {} skipped",
                outcome.inserted,
                outcome.skipped_ids.len()
            );
            Ok(outcome)
        })
    }
}

/// Errors after which the open connection is not worth keeping.
fn breaks_connection(err: &LedgerError) -> bool {
    let source = match err {
        LedgerError::Database(e) => e,
        LedgerError::Transaction { source, .. } => source,
        _ => return false,
    };
    matches!(
        source.sqlite_error_code(),
        Some(ErrorCode::SystemIoFailure)
            | Some(ErrorCode::CannotOpen)
            | Some(ErrorCode::DatabaseCorrupt)
            | Some(ErrorCode::NotADatabase)
    )
}

/// Returns false when the id already exists.
fn insert_row(conn: &Connection, record: &CaptureRecord) -> Result<bool> {
    record.metadata.validate()?;
    let artifact_path = record.artifact_path.to_str()
        .ok_or_else(|| LedgerError::InvalidRecord(format!("artifact path is not valid UTF-8: {}", record.artifact_path.display())))?;
    let metadata = serde_json::to_string(&record.metadata)?;

    let mut stmt = conn.prepare_cached(
        "INSERT INTO captures (id, captured_at, session_id, artifact_path, camera_index, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO NOTHING"
    )?;
    let changed = stmt.execute(params![
        record.id,
        format_timestamp(&record.captured_at),
        record.session_id,
        artifact_path,
        record.camera_index,
        metadata,
    ])?;
    Ok(changed > 0)
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<CaptureRecord> {
    let captured_at: String = row.get(1)?;
    let artifact_path: String = row.get(3)?;
    let metadata: String = row.get(5)?;
    Ok(CaptureRecord {
        id: row.get(0)?,
        captured_at: parse_timestamp(&captured_at)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?,
        session_id: row.get(2)?,
        artifact_path: PathBuf::from(artifact_path),
        camera_index: row.get(4)?,
        metadata: serde_json::from_str(&metadata)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
    })
}

fn month_start(year: i32, month: u32) -> Result<DateTime<Utc>> {
    let date = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| LedgerError::Other(anyhow::anyhow!("invalid month: {}-{}", year, month)))?;
    let midnight = date.and_hms_opt(0, 0, 0)
        .ok_or_else(|| LedgerError::Other(anyhow::anyhow!("invalid month: {}-{}", year, month)))?;
    Ok(Utc.from_utc_datetime(&midnight))
}
