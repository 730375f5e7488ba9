//! Derived records handed from the session machine to the batch writer.

use crate::collector::types::{AppIdentity, KeyboardEvent, PointerEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    IdleTimeout,
    ExplicitStop,
    CrashRecovery,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::IdleTimeout => "idle-timeout",
            EndReason::ExplicitStop => "explicit-stop",
            EndReason::CrashRecovery => "crash-recovery",
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A foreground-application change inside a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchRecord {
    pub session_id: i64,
    /// `None` for the switch that opens a session
    pub from: Option<AppIdentity>,
    pub to: AppIdentity,
    pub timestamp: DateTime<Utc>,
    pub clock_skew: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointerRecord {
    pub session_id: i64,
    /// Foreground application when the event happened
    pub app: Option<AppIdentity>,
    pub event: PointerEvent,
    pub clock_skew: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyRecord {
    pub session_id: i64,
    pub app: Option<AppIdentity>,
    pub event: KeyboardEvent,
    pub clock_skew: bool,
}

/// One row-level change for the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    SessionOpened {
        session_id: i64,
        started_at: DateTime<Utc>,
    },
    SessionClosed {
        session_id: i64,
        ended_at: DateTime<Utc>,
        reason: EndReason,
    },
    Switch(SwitchRecord),
    Pointer(PointerRecord),
    Key(KeyRecord),
}

impl Record {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Record::SessionOpened { started_at, .. } => *started_at,
            Record::SessionClosed { ended_at, .. } => *ended_at,
            Record::Switch(r) => r.timestamp,
            Record::Pointer(r) => r.event.timestamp,
            Record::Key(r) => r.event.timestamp,
        }
    }
}

/// Order a batch by timestamp. The sort is stable, so records sharing a
/// timestamp keep their emission order (an open always precedes its first
/// switch, a close always follows the last event).
pub fn sort_for_flush(records: &mut [Record]) {
    records.sort_by_key(|r| r.timestamp());
}

/// Unix epoch seconds with microsecond precision, the stored time format.
pub fn to_epoch_seconds(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1_000_000.0
}

pub fn from_epoch_seconds(secs: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::types::{KeyClass, KeyDirection};
    use chrono::Duration;

    #[test]
    fn test_end_reason_strings() {
        assert_eq!(EndReason::IdleTimeout.as_str(), "idle-timeout");
        assert_eq!(EndReason::ExplicitStop.to_string(), "explicit-stop");
        assert_eq!(EndReason::CrashRecovery.as_str(), "crash-recovery");
    }

    #[test]
    fn test_sort_is_stable_for_equal_timestamps() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::milliseconds(5);
        let mut records = vec![
            Record::Key(KeyRecord {
                session_id: 1,
                app: None,
                event: KeyboardEvent::at(t1, KeyClass::Letter, KeyDirection::Down),
                clock_skew: false,
            }),
            Record::SessionOpened {
                session_id: 1,
                started_at: t0,
            },
            Record::Switch(SwitchRecord {
                session_id: 1,
                from: None,
                to: AppIdentity::unknown(),
                timestamp: t0,
                clock_skew: false,
            }),
        ];
        sort_for_flush(&mut records);
        assert!(matches!(records[0], Record::SessionOpened { .. }));
        assert!(matches!(records[1], Record::Switch(_)));
        assert!(matches!(records[2], Record::Key(_)));
    }

    #[test]
    fn test_epoch_seconds_keep_microseconds() {
        let ts = DateTime::from_timestamp_micros(1_700_000_000_123_456).unwrap();
        let secs = to_epoch_seconds(ts);
        assert_eq!(from_epoch_seconds(secs), Some(ts));
    }
}
