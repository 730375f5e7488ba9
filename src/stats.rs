//! Capture counters.
//!
//! Counts what the pipeline did (events seen, moves coalesced, rows flushed)
//! without holding any event content. Counters are shared between the
//! sampler, engine and writer threads and can be persisted as JSON so the
//! `status` command can report on the last run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Live counters for one capture run.
#[derive(Debug)]
pub struct CaptureStats {
    /// Raw events taken from the adapter queue
    events_received: AtomicU64,
    /// Pointer moves replaced by a later move before their tick
    moves_coalesced: AtomicU64,
    /// Events the adapter discarded on a full queue
    events_dropped: AtomicU64,
    /// Records persisted with the clock-skew flag
    clock_anomalies: AtomicU64,
    sessions_opened: AtomicU64,
    switches: AtomicU64,
    records_flushed: AtomicU64,
    flushes: AtomicU64,
    flush_retries: AtomicU64,
    run_start: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl CaptureStats {
    pub fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            moves_coalesced: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            clock_anomalies: AtomicU64::new(0),
            sessions_opened: AtomicU64::new(0),
            switches: AtomicU64::new(0),
            records_flushed: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            flush_retries: AtomicU64::new(0),
            run_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Counters that are written to `path` by [`CaptureStats::save`].
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut stats = Self::new();
        stats.persist_path = Some(path);
        stats
    }

    pub fn record_event_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_move_coalesced(&self) {
        self.moves_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    /// The adapter keeps its own running total; mirror it here.
    pub fn set_events_dropped(&self, total: u64) {
        self.events_dropped.store(total, Ordering::Relaxed);
    }

    pub fn record_clock_anomaly(&self) {
        self.clock_anomalies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_switch(&self) {
        self.switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self, records: u64) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.records_flushed.fetch_add(records, Ordering::Relaxed);
    }

    pub fn record_flush_retry(&self) {
        self.flush_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            moves_coalesced: self.moves_coalesced.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            clock_anomalies: self.clock_anomalies.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            switches: self.switches.load(Ordering::Relaxed),
            records_flushed: self.records_flushed.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flush_retries: self.flush_retries.load(Ordering::Relaxed),
            run_start: self.run_start,
            run_duration_secs: (Utc::now() - self.run_start).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        self.snapshot().to_string()
    }

    /// Save stats to disk. A no-op without a persistence path.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let persisted = PersistedStats {
                stats: self.snapshot(),
                last_updated: Utc::now(),
            };
            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    /// Read the stats a previous run saved to `path`.
    pub fn load_last(path: &std::path::Path) -> Result<Option<PersistedStats>, std::io::Error> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        let persisted = serde_json::from_str(&content).map_err(std::io::Error::other)?;
        Ok(Some(persisted))
    }
}

impl Default for CaptureStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub events_received: u64,
    pub moves_coalesced: u64,
    pub events_dropped: u64,
    pub clock_anomalies: u64,
    pub sessions_opened: u64,
    pub switches: u64,
    pub records_flushed: u64,
    pub flushes: u64,
    pub flush_retries: u64,
    pub run_start: DateTime<Utc>,
    pub run_duration_secs: u64,
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Capture Statistics:\n\
             - Events received: {}\n\
             - Moves coalesced: {}\n\
             - Events dropped (queue full): {}\n\
             - Clock anomalies: {}\n\
             - Sessions opened: {}\n\
             - Application switches: {}\n\
             - Records flushed: {} in {} flushes ({} retries)\n\
             - Run duration: {} seconds\n\
             \n\
             Privacy:\n\
             - Keys are stored as coarse classes, never as typed content",
            self.events_received,
            self.moves_coalesced,
            self.events_dropped,
            self.clock_anomalies,
            self.sessions_opened,
            self.switches,
            self.records_flushed,
            self.flushes,
            self.flush_retries,
            self.run_duration_secs
        )
    }
}

/// Stats format for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedStats {
    #[serde(flatten)]
    pub stats: StatsSnapshot,
    pub last_updated: DateTime<Utc>,
}

/// Thread-safe shared counters.
pub type SharedStats = Arc<CaptureStats>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting() {
        let stats = CaptureStats::new();
        stats.record_event_received();
        stats.record_event_received();
        stats.record_move_coalesced();
        stats.record_flush(10);
        stats.record_flush(5);
        stats.set_events_dropped(3);

        let snap = stats.snapshot();
        assert_eq!(snap.events_received, 2);
        assert_eq!(snap.moves_coalesced, 1);
        assert_eq!(snap.records_flushed, 15);
        assert_eq!(snap.flushes, 2);
        assert_eq!(snap.events_dropped, 3);
    }

    #[test]
    fn test_summary_format() {
        let summary = CaptureStats::new().summary();
        assert!(summary.contains("Events received"));
        assert!(summary.contains("Clock anomalies"));
        assert!(summary.contains("never as typed content"));
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let stats = CaptureStats::with_persistence(path.clone());
        stats.record_session_opened();
        stats.record_switch();
        stats.save().unwrap();

        let loaded = CaptureStats::load_last(&path).unwrap().unwrap();
        assert_eq!(loaded.stats.sessions_opened, 1);
        assert_eq!(loaded.stats.switches, 1);
        assert!(CaptureStats::load_last(&dir.path().join("missing.json"))
            .unwrap()
            .is_none());
    }
}
