//! Index database initialization
//!
//! Opens the SQLite file behind the index store with:
//! - WAL mode so GUI reads don't block capture writes
//! - a busy timeout for writers from other processes
//! - the `captures` table, its query indexes, and `system_config`

use std::path::Path;
use std::time::Duration;
use rusqlite::{params, Connection};
use crate::error::{Result, LedgerError};

pub const SCHEMA_VERSION: i64 = 1;

/// Open the index database, creating its directory if needed.
pub fn open_database(db_path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let db_dir = db_path.parent()
        .ok_or_else(|| LedgerError::InvalidPath(format!("Invalid database path: {}", db_path.display())))?;
    if !db_dir.as_os_str().is_empty() {
        std::fs::create_dir_all(db_dir).map_err(LedgerError::Io)?;
    }

    let conn = Connection::open(db_path).map_err(LedgerError::Database)?;
    conn.busy_timeout(busy_timeout)?;

    // Enable WAL mode for better concurrent access
    let mode: String = conn.pragma_update_and_check(None, "journal_mode", WAL, |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case(WAL) {
        tracing::warn!("[IndexStore] journal_mode is {} (WAL unavailable)", mode);
    }

    // Durable at transaction commit under WAL
    conn.pragma_update(None, "synchronous", NORMAL)?;

    tracing::debug!("[IndexStore] Opened database: {}", db_path.display());
    Ok(conn)
}

/// Create all required tables in the database
pub fn create_tables(conn: &Connection) -> Result<()> {
    create_captures_table(conn)?;
    create_system_config_table(conn)?;
    record_schema_version(conn)?;
    Ok(())
}

fn create_captures_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(r#"
        CREATE TABLE IF NOT EXISTS captures (
            id TEXT PRIMARY KEY NOT NULL CHECK (length(id) > 0),
            captured_at TEXT NOT NULL,
            session_id TEXT NOT NULL,
            artifact_path TEXT NOT NULL DEFAULT '',
            camera_index INTEGER NOT NULL CHECK (camera_index >= 0),
            metadata TEXT NOT NULL DEFAULT '{}',
            indexed_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX IF NOT EXISTS idx_captures_captured_at ON captures(captured_at);
        CREATE INDEX IF NOT EXISTS idx_captures_session ON captures(session_id);
    "#)?;
    tracing::debug!("[IndexStore] Created captures table");
    Ok(())
}

fn create_system_config_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(r#"
        CREATE TABLE IF NOT EXISTS system_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );
    "#)?;
    Ok(())
}

fn record_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT INTO system_config (key, value) VALUES ('schema_version', ?1)
         ON CONFLICT(key) DO NOTHING",
        params![SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

pub fn schema_version(conn: &Connection) -> Result<Option<i64>> {
    let result = conn.query_row(
        "SELECT value FROM system_config WHERE key = 'schema_version'",
        [],
        |row| row.get::<_, String>(0),
    );
    match result {
        Ok(v) => Ok(v.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(LedgerError::Database(e)),
    }
}

// SQL pragma constants
const WAL: &str = "WAL";
const NORMAL: &str = "NORMAL";
