//! Batch persistence.
//!
//! [`BatchWriter`] owns the only write connection while capture runs. It
//! buffers [`Record`]s and commits them as one transaction every
//! `flush_interval` or once `flush_batch_size` records are waiting. Busy or
//! locked flushes are retried with exponential backoff; when retries run out
//! the writer stops with [`StoreError::Unavailable`] and keeps the buffer
//! instead of discarding it.
//!
//! The writer exits after a final flush once every record sender is dropped.

use super::{close_stale_session, is_transient, Store, StoreError};
use crate::collector::types::AppIdentity;
use crate::config::Config;
use crate::record::{sort_for_flush, to_epoch_seconds, Record};
use crate::stats::SharedStats;
use crossbeam_channel::{select, tick, Receiver};
use rusqlite::{params, Connection, TransactionBehavior};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::Uuid;

/// Flush policy.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub flush_interval: Duration,
    pub batch_size: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl From<&Config> for WriterConfig {
    fn from(config: &Config) -> Self {
        Self {
            flush_interval: config.flush_interval,
            batch_size: config.flush_batch_size,
            max_retries: config.flush_max_retries,
            backoff_base: config.flush_backoff_base,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Where and by whom sessions are being recorded.
#[derive(Debug, Clone)]
pub struct SessionOrigin {
    pub run_id: Uuid,
    pub hostname: Option<String>,
    pub username: Option<String>,
}

impl SessionOrigin {
    /// Describe the current process: a fresh run id plus host and user names.
    pub fn current() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            hostname: hostname::get()
                .ok()
                .map(|name| name.to_string_lossy().into_owned()),
            username: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .ok(),
        }
    }
}

/// Totals for one writer lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterReport {
    pub records_written: u64,
    pub flushes: u64,
    pub retries: u64,
}

/// Handle to the writer thread.
pub struct BatchWriter {
    handle: Option<JoinHandle<Result<WriterReport, StoreError>>>,
    failed: Arc<AtomicBool>,
}

impl BatchWriter {
    /// Take ownership of `store` and start consuming `records`.
    pub fn spawn(
        store: Store,
        origin: SessionOrigin,
        config: WriterConfig,
        records: Receiver<Record>,
        stats: Option<SharedStats>,
    ) -> std::io::Result<Self> {
        let failed = Arc::new(AtomicBool::new(false));
        let failed_flag = failed.clone();

        let handle = thread::Builder::new()
            .name("mousetrace-writer".into())
            .spawn(move || {
                let mut worker = Worker {
                    store,
                    origin,
                    config,
                    stats,
                    buffer: Vec::new(),
                    app_ids: HashMap::new(),
                    report: WriterReport::default(),
                };
                let result = worker.run(records);
                if let Err(ref e) = result {
                    failed_flag.store(true, Ordering::SeqCst);
                    tracing::error!(
                        error = %e,
                        unflushed = worker.buffer.len(),
                        "batch writer stopped"
                    );
                }
                result
            })?;

        Ok(Self {
            handle: Some(handle),
            failed,
        })
    }

    /// Whether the writer gave up on a fatal error.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Wait for the final flush. All record senders must be dropped first.
    pub fn finish(mut self) -> Result<WriterReport, StoreError> {
        self.join()
    }

    fn join(&mut self) -> Result<WriterReport, StoreError> {
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(StoreError::Io(std::io::Error::other(
                    "batch writer thread panicked",
                )))
            }),
            None => Ok(WriterReport::default()),
        }
    }
}

impl Drop for BatchWriter {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.join();
        }
    }
}

struct Worker {
    store: Store,
    origin: SessionOrigin,
    config: WriterConfig,
    stats: Option<SharedStats>,
    buffer: Vec<Record>,
    /// Committed application ids by key
    app_ids: HashMap<String, i64>,
    report: WriterReport,
}

impl Worker {
    fn run(&mut self, records: Receiver<Record>) -> Result<WriterReport, StoreError> {
        let ticker = tick(self.config.flush_interval);

        loop {
            select! {
                recv(records) -> msg => match msg {
                    Ok(record) => {
                        self.buffer.push(record);
                        if self.buffer.len() >= self.config.batch_size {
                            self.flush()?;
                        }
                    }
                    Err(_) => break,
                },
                recv(ticker) -> _ => self.flush()?,
            }
        }

        self.flush()?;
        tracing::debug!(
            records = self.report.records_written,
            flushes = self.report.flushes,
            "batch writer finished"
        );
        Ok(self.report.clone())
    }

    /// Commit the whole buffer, retrying transient failures.
    fn flush(&mut self) -> Result<(), StoreError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        sort_for_flush(&mut self.buffer);

        let mut attempt: u32 = 0;
        loop {
            let result = write_batch(
                &mut self.store.conn,
                &self.buffer,
                &self.app_ids,
                &self.origin,
            );
            match result {
                Ok(new_apps) => {
                    // Ids become visible only after the commit succeeded
                    self.app_ids.extend(new_apps);
                    let count = self.buffer.len() as u64;
                    self.buffer.clear();
                    self.report.records_written += count;
                    self.report.flushes += 1;
                    if let Some(stats) = &self.stats {
                        stats.record_flush(count);
                    }
                    tracing::debug!(records = count, "flushed batch");
                    return Ok(());
                }
                Err(e) if is_transient(&e) && attempt < self.config.max_retries => {
                    let delay = self.config.backoff_base * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    self.report.retries += 1;
                    if let Some(stats) = &self.stats {
                        stats.record_flush_retry();
                    }
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "store busy, retrying flush"
                    );
                    thread::sleep(delay);
                }
                Err(e) if is_transient(&e) => {
                    return Err(StoreError::Unavailable {
                        attempts: attempt + 1,
                        last: e,
                    });
                }
                Err(e) => return Err(StoreError::Sqlite(e)),
            }
        }
    }
}

/// Write `records` in one immediate transaction.
///
/// Returns the application ids created by this batch.
fn write_batch(
    conn: &mut Connection,
    records: &[Record],
    known_apps: &HashMap<String, i64>,
    origin: &SessionOrigin,
) -> rusqlite::Result<HashMap<String, i64>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut new_apps = HashMap::new();
    let run_id = origin.run_id.to_string();

    {
        let mut apps = AppResolver {
            conn: &tx,
            known: known_apps,
            created: &mut new_apps,
        };

        for record in records {
            match record {
                Record::SessionOpened {
                    session_id,
                    started_at,
                } => {
                    force_close_others(&tx, *session_id)?;
                    tx.execute(
                        "INSERT INTO sessions (id, started_at, run_id, hostname, username)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            session_id,
                            to_epoch_seconds(*started_at),
                            run_id,
                            origin.hostname,
                            origin.username
                        ],
                    )?;
                }
                Record::SessionClosed {
                    session_id,
                    ended_at,
                    reason,
                } => {
                    tx.execute(
                        "UPDATE sessions SET ended_at = ?1, end_reason = ?2
                         WHERE id = ?3 AND ended_at IS NULL",
                        params![to_epoch_seconds(*ended_at), reason.as_str(), session_id],
                    )?;
                }
                Record::Switch(switch) => {
                    let ts = to_epoch_seconds(switch.timestamp);
                    let from_id = match &switch.from {
                        Some(app) => Some(apps.resolve(app, ts)?),
                        None => None,
                    };
                    let to_id = apps.resolve(&switch.to, ts)?;
                    tx.prepare_cached(
                        "INSERT INTO switches (session_id, from_app_id, to_app_id, ts, clock_skew)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )?
                    .execute(params![
                        switch.session_id,
                        from_id,
                        to_id,
                        ts,
                        switch.clock_skew as i64
                    ])?;
                }
                Record::Pointer(pointer) => {
                    let ts = to_epoch_seconds(pointer.event.timestamp);
                    let app_id = match &pointer.app {
                        Some(app) => Some(apps.resolve(app, ts)?),
                        None => None,
                    };
                    let (dx, dy) = match pointer.event.scroll_delta {
                        Some((dx, dy)) => (Some(dx), Some(dy)),
                        None => (None, None),
                    };
                    tx.prepare_cached(
                        "INSERT INTO pointer_events
                             (session_id, application_id, kind, x, y, button, dx, dy, ts, clock_skew)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    )?
                    .execute(params![
                        pointer.session_id,
                        app_id,
                        pointer.event.kind.as_str(),
                        pointer.event.x,
                        pointer.event.y,
                        pointer.event.button.map(|b| b.as_str()),
                        dx,
                        dy,
                        ts,
                        pointer.clock_skew as i64
                    ])?;
                }
                Record::Key(key) => {
                    let ts = to_epoch_seconds(key.event.timestamp);
                    let app_id = match &key.app {
                        Some(app) => Some(apps.resolve(app, ts)?),
                        None => None,
                    };
                    tx.prepare_cached(
                        "INSERT INTO key_events
                             (session_id, application_id, key_class, direction, ts, clock_skew)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    )?
                    .execute(params![
                        key.session_id,
                        app_id,
                        key.event.class.as_str(),
                        key.event.direction.as_str(),
                        ts,
                        key.clock_skew as i64
                    ])?;
                }
            }
        }
    }

    tx.commit()?;
    Ok(new_apps)
}

/// Close any other open session before a new one is inserted.
fn force_close_others(conn: &Connection, new_session_id: i64) -> rusqlite::Result<()> {
    let stale: Vec<(i64, f64)> = {
        let mut stmt = conn.prepare_cached(
            "SELECT id, started_at FROM sessions WHERE ended_at IS NULL AND id <> ?1",
        )?;
        let rows = stmt.query_map(params![new_session_id], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        rows.collect::<Result<_, _>>()?
    };

    for (id, started_at) in stale {
        tracing::error!(
            stale_session = id,
            new_session = new_session_id,
            "invariant violation: overlapping open sessions, force-closing the stale one"
        );
        close_stale_session(conn, id, started_at)?;
    }
    Ok(())
}

/// Application id lookup with lazy creation.
struct AppResolver<'a> {
    conn: &'a Connection,
    known: &'a HashMap<String, i64>,
    created: &'a mut HashMap<String, i64>,
}

impl AppResolver<'_> {
    fn resolve(&mut self, app: &AppIdentity, first_seen: f64) -> rusqlite::Result<i64> {
        if let Some(id) = self.known.get(&app.key).or_else(|| self.created.get(&app.key)) {
            return Ok(*id);
        }

        // Existing rows are never modified
        self.conn
            .prepare_cached(
                "INSERT INTO applications (app_key, display_name, first_seen_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(app_key) DO NOTHING",
            )?
            .execute(params![app.key, app.display_name, first_seen])?;
        let id: i64 = self.conn.query_row(
            "SELECT id FROM applications WHERE app_key = ?1",
            params![app.key],
            |row| row.get(0),
        )?;
        self.created.insert(app.key.clone(), id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::types::{
        KeyClass, KeyDirection, KeyboardEvent, MouseButton, PointerEvent,
    };
    use crate::record::{EndReason, KeyRecord, PointerRecord, SwitchRecord};
    use chrono::{DateTime, Utc};
    use crossbeam_channel::unbounded;

    fn ts(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000 + ms).unwrap()
    }

    fn origin() -> SessionOrigin {
        SessionOrigin {
            run_id: Uuid::new_v4(),
            hostname: Some("test-host".into()),
            username: Some("tester".into()),
        }
    }

    fn session_records(id: i64, app: &str) -> Vec<Record> {
        let app = AppIdentity::new(app, app);
        vec![
            Record::SessionOpened {
                session_id: id,
                started_at: ts(0),
            },
            Record::Switch(SwitchRecord {
                session_id: id,
                from: None,
                to: app.clone(),
                timestamp: ts(0),
                clock_skew: false,
            }),
            Record::Pointer(PointerRecord {
                session_id: id,
                app: Some(app.clone()),
                event: PointerEvent::click_at(ts(10), 5.0, 6.0, MouseButton::Left, true),
                clock_skew: false,
            }),
            Record::Key(KeyRecord {
                session_id: id,
                app: Some(app),
                event: KeyboardEvent::at(ts(20), KeyClass::Letter, KeyDirection::Down),
                clock_skew: true,
            }),
        ]
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn test_write_batch_persists_all_record_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open_initialized(&dir.path().join("w.db")).unwrap();
        let mut records = session_records(1, "editor");
        records.push(Record::SessionClosed {
            session_id: 1,
            ended_at: ts(30),
            reason: EndReason::ExplicitStop,
        });

        let created = write_batch(&mut store.conn, &records, &HashMap::new(), &origin()).unwrap();
        assert_eq!(created.len(), 1);

        let conn = store.connection();
        assert_eq!(count(conn, "SELECT COUNT(*) FROM switches"), 1);
        assert_eq!(count(conn, "SELECT COUNT(*) FROM pointer_events WHERE kind = 'click_down' AND button = 'left'"), 1);
        assert_eq!(count(conn, "SELECT COUNT(*) FROM key_events WHERE clock_skew = 1"), 1);
        assert_eq!(count(conn, "SELECT COUNT(*) FROM sessions WHERE end_reason = 'explicit-stop' AND hostname = 'test-host'"), 1);
    }

    #[test]
    fn test_application_rows_are_immutable() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open_initialized(&dir.path().join("w.db")).unwrap();
        let mut records = session_records(1, "editor");
        records.push(Record::Switch(SwitchRecord {
            session_id: 1,
            from: Some(AppIdentity::new("editor", "editor")),
            to: AppIdentity::new("browser", "Browser"),
            timestamp: ts(25),
            clock_skew: false,
        }));
        write_batch(&mut store.conn, &records, &HashMap::new(), &origin()).unwrap();

        // Same key, new display name, fresh cache: reuses the row unchanged
        let later = vec![Record::Key(KeyRecord {
            session_id: 1,
            app: Some(AppIdentity::new("editor", "Editor (renamed)")),
            event: KeyboardEvent::at(ts(40), KeyClass::Digit, KeyDirection::Down),
            clock_skew: false,
        })];
        let created = write_batch(&mut store.conn, &later, &HashMap::new(), &origin()).unwrap();
        assert_eq!(created.len(), 1);

        let conn = store.connection();
        assert_eq!(count(conn, "SELECT COUNT(*) FROM applications"), 2);
        let name: String = conn
            .query_row(
                "SELECT display_name FROM applications WHERE app_key = 'editor'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(name, "editor");
    }

    #[test]
    fn test_failed_batch_commits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open_initialized(&dir.path().join("w.db")).unwrap();
        let mut records = session_records(1, "editor");
        // Unknown session violates the foreign key
        records.push(Record::Key(KeyRecord {
            session_id: 99,
            app: None,
            event: KeyboardEvent::at(ts(50), KeyClass::Letter, KeyDirection::Up),
            clock_skew: false,
        }));

        assert!(write_batch(&mut store.conn, &records, &HashMap::new(), &origin()).is_err());
        assert_eq!(count(store.connection(), "SELECT COUNT(*) FROM sessions"), 0);
        assert_eq!(count(store.connection(), "SELECT COUNT(*) FROM applications"), 0);
    }

    #[test]
    fn test_new_session_force_closes_stale_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open_initialized(&dir.path().join("w.db")).unwrap();
        write_batch(&mut store.conn, &session_records(1, "editor"), &HashMap::new(), &origin())
            .unwrap();

        let second = vec![Record::SessionOpened {
            session_id: 2,
            started_at: ts(1_000),
        }];
        write_batch(&mut store.conn, &second, &HashMap::new(), &origin()).unwrap();

        let conn = store.connection();
        assert_eq!(count(conn, "SELECT COUNT(*) FROM sessions WHERE ended_at IS NULL"), 1);
        let (ended_at, reason): (f64, String) = conn
            .query_row(
                "SELECT ended_at, end_reason FROM sessions WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(ended_at, to_epoch_seconds(ts(20)));
        assert_eq!(reason, "crash-recovery");
    }

    #[test]
    fn test_writer_flushes_on_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.db");
        let store = Store::open_initialized(&path).unwrap();
        let (tx, rx) = unbounded();
        let config = WriterConfig {
            flush_interval: Duration::from_secs(60),
            batch_size: 3,
            ..WriterConfig::default()
        };

        let writer = BatchWriter::spawn(store, origin(), config, rx, None).unwrap();
        for record in session_records(1, "editor") {
            tx.send(record).unwrap();
        }
        drop(tx);

        let report = writer.finish().unwrap();
        assert_eq!(report.records_written, 4);
        // One flush at the batch threshold, one final flush
        assert_eq!(report.flushes, 2);

        let conn = crate::store::open_read_only(&path).unwrap();
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM key_events"), 1);
    }

    #[test]
    fn test_locked_store_is_retried_then_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.db");
        let store = Store::open_initialized(&path).unwrap();

        // Hold the write lock from another connection for the whole test
        let blocker = Connection::open(&path).unwrap();
        blocker.execute_batch("BEGIN IMMEDIATE;").unwrap();

        let (tx, rx) = unbounded();
        let config = WriterConfig {
            flush_interval: Duration::from_secs(60),
            batch_size: 1,
            max_retries: 2,
            backoff_base: Duration::from_millis(1),
        };
        let stats = std::sync::Arc::new(crate::stats::CaptureStats::new());
        let writer =
            BatchWriter::spawn(store, origin(), config, rx, Some(stats.clone())).unwrap();
        tx.send(session_records(1, "editor").remove(0)).unwrap();
        drop(tx);

        match writer.finish() {
            Err(StoreError::Unavailable { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected Unavailable, got {other:?}"),
        }
        assert_eq!(stats.snapshot().flush_retries, 2);
        blocker.execute_batch("ROLLBACK;").unwrap();
    }
}
