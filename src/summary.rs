//! Activity summary computed from the store views.
//!
//! Everything here reads through a read-only connection; nothing is cached
//! in-process, so a summary always reflects the latest committed flush.

use crate::store::{open_read_only, StoreError};
use crate::record::to_epoch_seconds;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The 60-second window with the most key presses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpmWindow {
    pub start_ts: f64,
    pub end_ts: f64,
    pub keypresses: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppClicks {
    pub app_name: String,
    pub clicks: i64,
}

/// Totals and rates over the whole database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub sessions: i64,
    pub clicks: i64,
    pub moves: i64,
    /// Application changes, not counting the switch that opens each session
    pub switches: i64,
    pub keypresses: i64,
    /// Key presses per minute of recorded session time
    pub kpm_overall: f64,
    pub kpm_last_60m: f64,
    pub best_kpm: f64,
    pub best_kpm_window: Option<KpmWindow>,
    pub top_apps: Vec<AppClicks>,
}

/// Summarize the database at `path`.
pub fn summarize(path: &Path) -> Result<Summary, StoreError> {
    let conn = open_read_only(path)?;
    summarize_connection(&conn, to_epoch_seconds(Utc::now()))
}

/// Summarize using `now` (epoch seconds) for open sessions and the last-hour window.
pub fn summarize_connection(conn: &Connection, now: f64) -> Result<Summary, StoreError> {
    let count = |sql: &str| -> rusqlite::Result<i64> { conn.query_row(sql, [], |row| row.get(0)) };

    let sessions = count("SELECT COUNT(*) FROM sessions")?;
    let clicks = count("SELECT COUNT(*) FROM pointer_events WHERE kind = 'click_down'")?;
    let moves = count("SELECT COUNT(*) FROM pointer_events WHERE kind = 'move'")?;
    let switches = count("SELECT COUNT(*) FROM switches WHERE from_app_id IS NOT NULL")?;
    let keypresses = count("SELECT COUNT(*) FROM key_events WHERE direction = 'down'")?;

    let session_seconds: f64 = conn.query_row(
        "SELECT COALESCE(SUM(MAX(COALESCE(ended_at, ?1) - started_at, 0)), 0.0) FROM sessions",
        params![now],
        |row| row.get(0),
    )?;
    let kpm_overall = if session_seconds > 0.0 {
        keypresses as f64 / (session_seconds / 60.0)
    } else {
        0.0
    };

    let last_hour: i64 = conn.query_row(
        "SELECT COUNT(*) FROM key_events WHERE direction = 'down' AND ts >= ?1",
        params![now - 3600.0],
        |row| row.get(0),
    )?;
    let kpm_last_60m = last_hour as f64 / 60.0;

    let best_kpm_window = best_kpm_window(conn)?;
    let best_kpm = best_kpm_window
        .as_ref()
        .map(|w| w.keypresses as f64)
        .unwrap_or(0.0);

    Ok(Summary {
        sessions,
        clicks,
        moves,
        switches,
        keypresses,
        kpm_overall: round2(kpm_overall),
        kpm_last_60m: round2(kpm_last_60m),
        best_kpm,
        best_kpm_window,
        top_apps: top_apps_by_clicks(conn, 10)?,
    })
}

/// The best rolling 60-second window, from `vw_best_kpm_window`.
pub fn best_kpm_window(conn: &Connection) -> Result<Option<KpmWindow>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT window_start, window_end, keypresses FROM vw_best_kpm_window",
            [],
            |row| {
                Ok(KpmWindow {
                    start_ts: row.get(0)?,
                    end_ts: row.get(1)?,
                    keypresses: row.get(2)?,
                })
            },
        )
        .optional()?)
}

pub fn top_apps_by_clicks(conn: &Connection, limit: usize) -> Result<Vec<AppClicks>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT app_name, clicks FROM vw_clicks_by_app ORDER BY clicks DESC, app_name LIMIT ?1",
    )?;
    let apps = stmt
        .query_map(params![limit as i64], |row| {
            Ok(AppClicks {
                app_name: row.get(0)?,
                clicks: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(apps)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Sessions:             {}", self.sessions)?;
        writeln!(f, "Clicks:               {}", self.clicks)?;
        writeln!(f, "Moves:                {}", self.moves)?;
        writeln!(f, "Switches:             {}", self.switches)?;
        writeln!(f, "Keypresses:           {}", self.keypresses)?;
        writeln!(f, "KPM (overall):        {:.2}", self.kpm_overall)?;
        writeln!(f, "KPM (last 60m):       {:.2}", self.kpm_last_60m)?;
        writeln!(f, "Best KPM (1m window): {:.2}", self.best_kpm)?;
        if let Some(window) = &self.best_kpm_window {
            writeln!(
                f,
                "  best window start: {:.3}, end: {:.3}, keypresses: {}",
                window.start_ts, window.end_ts, window.keypresses
            )?;
        }
        writeln!(f, "Top apps (by clicks):")?;
        for app in &self.top_apps {
            writeln!(f, "  {:30} {:6}", app.app_name, app.clicks)?;
        }
        Ok(())
    }
}
