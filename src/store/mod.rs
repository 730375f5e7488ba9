//! Persistent store.
//!
//! A single SQLite file in WAL mode with STRICT tables, foreign keys and
//! aggregate views. [`Store`] owns the write connection; the batch writer
//! thread takes it over while capture runs. Readers (query sandbox, summary)
//! use [`open_read_only`] so they never contend with writes.

pub mod schema;
pub mod writer;

use crate::record::{from_epoch_seconds, EndReason};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use schema::{CORE_TABLES, CORE_VIEWS, CURRENT_SCHEMA_VERSION};
pub use writer::{BatchWriter, SessionOrigin, WriterConfig, WriterReport};

/// Value [`Store::reset`] requires before it deletes anything.
pub const RESET_CONFIRMATION: &str = "DELETE ALL CAPTURED DATA";

const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

/// Store errors.
#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    /// The database stayed busy or locked through every retry
    Unavailable {
        attempts: u32,
        last: rusqlite::Error,
    },
    Migration(String),
    ResetNotConfirmed,
    Io(std::io::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "SQLite error: {e}"),
            StoreError::Unavailable { attempts, last } => {
                write!(f, "Store unavailable after {attempts} attempts: {last}")
            }
            StoreError::Migration(e) => write!(f, "Migration error: {e}"),
            StoreError::ResetNotConfirmed => {
                write!(f, "Reset refused: confirmation value does not match")
            }
            StoreError::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Sqlite(e) => Some(e),
            StoreError::Unavailable { last, .. } => Some(last),
            StoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

/// Busy and locked errors clear up on their own; everything else is permanent.
pub fn is_transient(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// A session closed by crash recovery.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredSession {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// The write side of the event store.
pub struct Store {
    conn: Connection,
    path: PathBuf,
}

impl Store {
    /// Open (creating if needed) the database at `path` and configure the connection.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(mode = %journal_mode, "database did not switch to WAL mode");
        }
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        tracing::debug!(path = %path.display(), "opened store");
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Open and bring the schema up to date.
    pub fn open_initialized(path: &Path) -> Result<Self, StoreError> {
        let mut store = Self::open(path)?;
        store.initialize()?;
        Ok(store)
    }

    /// Create the schema if absent, apply pending additive migrations otherwise.
    pub fn initialize(&mut self) -> Result<u32, StoreError> {
        schema::run_migrations(&mut self.conn)
    }

    pub fn schema_version(&self) -> Result<i32, StoreError> {
        schema::schema_version(&self.conn)
    }

    /// DDL for all tables, indexes, triggers and views.
    pub fn schema_text(&self) -> Result<String, StoreError> {
        schema::schema_text(&self.conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Close sessions left open by an unclean shutdown.
    ///
    /// Each is ended at the latest event persisted for it (or its start when it
    /// has none) with reason `crash-recovery`.
    pub fn recover_open_sessions(&mut self) -> Result<Vec<RecoveredSession>, StoreError> {
        let tx = self.conn.transaction()?;
        let open: Vec<(i64, f64)> = {
            let mut stmt =
                tx.prepare("SELECT id, started_at FROM sessions WHERE ended_at IS NULL ORDER BY id")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<_, _>>()?
        };

        if open.len() > 1 {
            tracing::error!(
                count = open.len(),
                "invariant violation: more than one open session, closing all"
            );
        }

        let mut recovered = Vec::with_capacity(open.len());
        for (id, started_at) in open {
            let ended_at = close_stale_session(&tx, id, started_at)?;
            tracing::warn!(session = id, "closed session left open by previous run");
            recovered.push(RecoveredSession {
                id,
                started_at: from_epoch_seconds(started_at).unwrap_or_default(),
                ended_at: from_epoch_seconds(ended_at).unwrap_or_default(),
            });
        }
        tx.commit()?;
        Ok(recovered)
    }

    /// The id the next session should use.
    pub fn next_session_id(&self) -> Result<i64, StoreError> {
        let max: Option<i64> = self
            .conn
            .query_row("SELECT MAX(id) FROM sessions", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0) + 1)
    }

    /// Number of sessions without an end timestamp.
    pub fn open_session_count(&self) -> Result<i64, StoreError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE ended_at IS NULL",
            [],
            |row| row.get(0),
        )?)
    }

    /// Drop all captured data and recreate an empty schema.
    ///
    /// Refuses unless `confirmation` equals [`RESET_CONFIRMATION`].
    pub fn reset(&mut self, confirmation: &str) -> Result<(), StoreError> {
        if confirmation != RESET_CONFIRMATION {
            return Err(StoreError::ResetNotConfirmed);
        }

        let tx = self.conn.transaction()?;
        schema::drop_core_schema(&tx)?;
        tx.commit()?;
        tracing::warn!(path = %self.path.display(), "dropped all captured data");

        self.initialize()?;
        Ok(())
    }
}

/// Close one open session at its latest event timestamp. Returns the end time.
pub(crate) fn close_stale_session(
    conn: &Connection,
    id: i64,
    started_at: f64,
) -> rusqlite::Result<f64> {
    let last_event: Option<f64> = conn
        .query_row(
            "SELECT MAX(ts) FROM (
                 SELECT MAX(ts) AS ts FROM pointer_events WHERE session_id = ?1
                 UNION ALL
                 SELECT MAX(ts) FROM key_events WHERE session_id = ?1
                 UNION ALL
                 SELECT MAX(ts) FROM switches WHERE session_id = ?1
             )",
            params![id],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    let ended_at = last_event.unwrap_or(started_at).max(started_at);

    conn.execute(
        "UPDATE sessions SET ended_at = ?1, end_reason = ?2
         WHERE id = ?3 AND ended_at IS NULL",
        params![ended_at, EndReason::CrashRecovery.as_str(), id],
    )?;
    Ok(ended_at)
}

/// Open a read-only connection for queries.
///
/// The file must already exist; read-only mode cannot create it.
pub fn open_read_only(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "query_only", "ON")?;
    Ok(conn)
}
