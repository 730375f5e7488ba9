//! Session and application-switch state machine.
//!
//! [`SessionMachine`] is the single serialization point for session state.
//! It consumes [`Signal`]s strictly in arrival order on one thread and emits
//! the [`Record`]s the batch writer persists.
//!
//! Idle detection counts poll ticks rather than reading a wall clock, so the
//! effective threshold is always a whole number of poll periods. The first
//! tick after an event closes a partial period and does not count toward it.

use crate::collector::types::{AppIdentity, InputEvent};
use crate::record::{EndReason, KeyRecord, PointerRecord, Record, SwitchRecord};
use crate::stats::SharedStats;
use chrono::{DateTime, Utc};

/// Input to the state machine.
#[derive(Debug, Clone)]
pub enum Signal {
    /// A sampled pointer or keyboard event.
    Input(InputEvent),
    /// A poll-sampler tick. `app` is `None` when the foreground lookup failed.
    Poll {
        app: Option<AppIdentity>,
        at: DateTime<Utc>,
    },
    /// Close any open session.
    Stop { at: DateTime<Utc>, reason: EndReason },
}

/// The currently open session.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenSession {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub current_app: AppIdentity,
    /// Latest timestamp recorded in this session
    pub last_event_at: DateTime<Utc>,
    /// Poll ticks since the last pointer or key event, the partial one included
    pub idle_ticks: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    NoSession,
    Open(OpenSession),
}

/// Explicit state-machine context.
pub struct SessionMachine {
    state: SessionState,
    next_session_id: i64,
    /// Last foreground application reported by the poll sampler
    observed_app: Option<AppIdentity>,
    idle_limit: Option<u32>,
    skew_tolerance: chrono::Duration,
    last_seen: Option<DateTime<Utc>>,
    stats: Option<SharedStats>,
}

impl SessionMachine {
    /// `next_session_id` must be above every id already in the store.
    pub fn new(next_session_id: i64, idle_limit: Option<u32>) -> Self {
        Self {
            state: SessionState::NoSession,
            next_session_id,
            observed_app: None,
            idle_limit,
            skew_tolerance: chrono::Duration::zero(),
            last_seen: None,
            stats: None,
        }
    }

    /// Regressions up to `tolerance` are clamped without being flagged.
    pub fn with_skew_tolerance(mut self, tolerance: std::time::Duration) -> Self {
        self.skew_tolerance =
            chrono::Duration::from_std(tolerance).unwrap_or_else(|_| chrono::Duration::zero());
        self
    }

    pub fn with_stats(mut self, stats: SharedStats) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, SessionState::Open(_))
    }

    pub fn current_session_id(&self) -> Option<i64> {
        match &self.state {
            SessionState::Open(open) => Some(open.id),
            SessionState::NoSession => None,
        }
    }

    pub fn current_app(&self) -> Option<&AppIdentity> {
        match &self.state {
            SessionState::Open(open) => Some(&open.current_app),
            SessionState::NoSession => None,
        }
    }

    /// Process one signal, appending derived records to `out`.
    pub fn handle(&mut self, signal: Signal, out: &mut Vec<Record>) {
        match signal {
            Signal::Input(event) => self.on_input(event, out),
            Signal::Poll { app, at } => self.on_poll(app, at, out),
            Signal::Stop { at, reason } => self.close(at, reason, out),
        }
    }

    fn on_input(&mut self, event: InputEvent, out: &mut Vec<Record>) {
        let (timestamp, clock_skew) = self.clamp(event.timestamp());
        let event = event.with_timestamp(timestamp);

        if let SessionState::NoSession = self.state {
            self.open(timestamp, out);
        }

        let SessionState::Open(ref mut open) = self.state else {
            return;
        };
        open.last_event_at = timestamp;
        open.idle_ticks = 0;

        let session_id = open.id;
        let app = Some(open.current_app.clone());
        out.push(match event {
            InputEvent::Pointer(event) => Record::Pointer(PointerRecord {
                session_id,
                app,
                event,
                clock_skew,
            }),
            InputEvent::Keyboard(event) => Record::Key(KeyRecord {
                session_id,
                app,
                event,
                clock_skew,
            }),
        });
    }

    fn on_poll(&mut self, app: Option<AppIdentity>, at: DateTime<Utc>, out: &mut Vec<Record>) {
        if let Some(app) = app {
            self.observed_app = Some(app);
        }

        let needs_switch = match (&self.state, &self.observed_app) {
            (SessionState::Open(open), Some(observed)) => !open.current_app.same_app(observed),
            _ => false,
        };
        if needs_switch {
            let (timestamp, clock_skew) = self.clamp(at);
            if let (SessionState::Open(open), Some(observed)) =
                (&mut self.state, &self.observed_app)
            {
                let from = std::mem::replace(&mut open.current_app, observed.clone());
                tracing::debug!(
                    session = open.id,
                    from = %from.key,
                    to = %observed.key,
                    "application switch"
                );
                out.push(Record::Switch(SwitchRecord {
                    session_id: open.id,
                    from: Some(from),
                    to: observed.clone(),
                    timestamp,
                    clock_skew,
                }));
                open.last_event_at = timestamp;
                if let Some(stats) = &self.stats {
                    stats.record_switch();
                }
            }
        }

        let idle_expired = match (&mut self.state, self.idle_limit) {
            (SessionState::Open(open), Some(limit)) => {
                open.idle_ticks = open.idle_ticks.saturating_add(1);
                open.idle_ticks > limit
            }
            _ => false,
        };
        if idle_expired {
            self.close(at, EndReason::IdleTimeout, out);
        }
    }

    fn open(&mut self, at: DateTime<Utc>, out: &mut Vec<Record>) {
        let id = self.next_session_id;
        self.next_session_id += 1;

        let app = self.observed_app.clone().unwrap_or_else(AppIdentity::unknown);
        tracing::info!(session = id, app = %app.key, "session opened");

        out.push(Record::SessionOpened {
            session_id: id,
            started_at: at,
        });
        out.push(Record::Switch(SwitchRecord {
            session_id: id,
            from: None,
            to: app.clone(),
            timestamp: at,
            clock_skew: false,
        }));
        if let Some(stats) = &self.stats {
            stats.record_session_opened();
            stats.record_switch();
        }

        self.state = SessionState::Open(OpenSession {
            id,
            started_at: at,
            current_app: app,
            last_event_at: at,
            idle_ticks: 0,
        });
    }

    fn close(&mut self, at: DateTime<Utc>, reason: EndReason, out: &mut Vec<Record>) {
        let SessionState::Open(open) = std::mem::replace(&mut self.state, SessionState::NoSession)
        else {
            return;
        };

        // Only an explicit stop extends the session to the stop time
        let ended_at = match reason {
            EndReason::ExplicitStop => at.max(open.last_event_at),
            EndReason::IdleTimeout | EndReason::CrashRecovery => open.last_event_at,
        };
        self.last_seen = Some(self.last_seen.map_or(ended_at, |last| last.max(ended_at)));

        tracing::info!(
            session = open.id,
            reason = %reason,
            duration_ms = (ended_at - open.started_at).num_milliseconds(),
            "session closed"
        );
        out.push(Record::SessionClosed {
            session_id: open.id,
            ended_at,
            reason,
        });
    }

    /// Keep timestamps monotonic. Returns the timestamp to record and whether
    /// the regression was large enough to flag as a clock anomaly.
    fn clamp(&mut self, ts: DateTime<Utc>) -> (DateTime<Utc>, bool) {
        match self.last_seen {
            Some(last) if ts < last => {
                let regression = last - ts;
                let flagged = regression > self.skew_tolerance;
                if flagged {
                    tracing::warn!(
                        regression_ms = regression.num_milliseconds(),
                        "clock moved backwards, clamping event timestamp"
                    );
                    if let Some(stats) = &self.stats {
                        stats.record_clock_anomaly();
                    }
                }
                (last, flagged)
            }
            _ => {
                self.last_seen = Some(ts);
                (ts, false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::types::{KeyClass, KeyDirection, KeyboardEvent, PointerEvent};
    use crate::stats::CaptureStats;
    use chrono::Duration;
    use std::sync::Arc;

    fn at(base: DateTime<Utc>, ms: i64) -> DateTime<Utc> {
        base + Duration::milliseconds(ms)
    }

    fn key(ts: DateTime<Utc>) -> Signal {
        Signal::Input(InputEvent::Keyboard(KeyboardEvent::at(
            ts,
            KeyClass::Letter,
            KeyDirection::Down,
        )))
    }

    fn poll(app: &str, ts: DateTime<Utc>) -> Signal {
        Signal::Poll {
            app: Some(AppIdentity::new(app, app)),
            at: ts,
        }
    }

    fn switches(records: &[Record]) -> Vec<&SwitchRecord> {
        records
            .iter()
            .filter_map(|r| match r {
                Record::Switch(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_first_input_opens_session_with_initial_switch() {
        let t0 = Utc::now();
        let mut machine = SessionMachine::new(7, None);
        let mut out = Vec::new();

        machine.handle(poll("editor", t0), &mut out);
        assert!(out.is_empty());
        assert!(!machine.is_open());

        machine.handle(key(at(t0, 10)), &mut out);
        assert_eq!(out.len(), 3);
        assert_eq!(
            out[0],
            Record::SessionOpened {
                session_id: 7,
                started_at: at(t0, 10)
            }
        );
        let initial = switches(&out);
        assert_eq!(initial.len(), 1);
        assert!(initial[0].from.is_none());
        assert_eq!(initial[0].to.key, "editor");
        assert!(matches!(out[2], Record::Key(ref k) if k.session_id == 7));
        assert_eq!(machine.current_session_id(), Some(7));
    }

    #[test]
    fn test_unknown_app_without_poll() {
        let mut machine = SessionMachine::new(1, None);
        let mut out = Vec::new();
        machine.handle(key(Utc::now()), &mut out);
        assert!(machine.current_app().unwrap().is_unknown());
    }

    #[test]
    fn test_switch_compares_by_key_not_display_name() {
        let t0 = Utc::now();
        let mut machine = SessionMachine::new(1, None);
        let mut out = Vec::new();
        machine.handle(poll("editor", t0), &mut out);
        machine.handle(key(at(t0, 1)), &mut out);
        out.clear();

        machine.handle(
            Signal::Poll {
                app: Some(AppIdentity::new("editor", "Editor - notes.txt")),
                at: at(t0, 100),
            },
            &mut out,
        );
        assert!(out.is_empty());

        machine.handle(poll("browser", at(t0, 200)), &mut out);
        let found = switches(&out);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].from.as_ref().map(|a| a.key.as_str()), Some("editor"));
        assert_eq!(found[0].to.key, "browser");

        // Repeating the same app never emits a duplicate switch
        out.clear();
        machine.handle(poll("browser", at(t0, 300)), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_failed_lookup_keeps_current_app() {
        let t0 = Utc::now();
        let mut machine = SessionMachine::new(1, None);
        let mut out = Vec::new();
        machine.handle(poll("editor", t0), &mut out);
        machine.handle(key(at(t0, 1)), &mut out);
        out.clear();

        machine.handle(Signal::Poll { app: None, at: at(t0, 100) }, &mut out);
        assert!(out.is_empty());
        assert_eq!(machine.current_app().unwrap().key, "editor");
    }

    #[test]
    fn test_idle_timeout_closes_at_last_event() {
        let t0 = Utc::now();
        let mut machine = SessionMachine::new(1, Some(3));
        let mut out = Vec::new();
        machine.handle(key(t0), &mut out);
        machine.handle(key(at(t0, 50)), &mut out);

        machine.handle(poll("editor", at(t0, 100)), &mut out);
        machine.handle(Signal::Poll { app: None, at: at(t0, 200) }, &mut out);
        machine.handle(Signal::Poll { app: None, at: at(t0, 300) }, &mut out);
        assert!(machine.is_open());
        out.clear();
        machine.handle(Signal::Poll { app: None, at: at(t0, 400) }, &mut out);

        assert!(!machine.is_open());
        // The switch at 100ms is the last recorded activity
        assert_eq!(
            out.last(),
            Some(&Record::SessionClosed {
                session_id: 1,
                ended_at: at(t0, 100),
                reason: EndReason::IdleTimeout
            })
        );
    }

    #[test]
    fn test_input_resets_idle_counter() {
        let t0 = Utc::now();
        let mut machine = SessionMachine::new(1, Some(2));
        let mut out = Vec::new();
        machine.handle(key(t0), &mut out);
        machine.handle(Signal::Poll { app: None, at: at(t0, 100) }, &mut out);
        machine.handle(key(at(t0, 150)), &mut out);
        machine.handle(Signal::Poll { app: None, at: at(t0, 200) }, &mut out);
        assert!(machine.is_open());
        machine.handle(Signal::Poll { app: None, at: at(t0, 300) }, &mut out);
        assert!(machine.is_open());
        machine.handle(Signal::Poll { app: None, at: at(t0, 400) }, &mut out);
        assert!(!machine.is_open());
    }

    #[test]
    fn test_input_just_before_tick_gets_full_idle_threshold() {
        // 300ms at 10 Hz is three ticks
        let t0 = Utc::now();
        let mut machine = SessionMachine::new(1, Some(3));
        let mut out = Vec::new();
        machine.handle(key(at(t0, 99)), &mut out);

        for ms in [100, 200, 300] {
            machine.handle(Signal::Poll { app: None, at: at(t0, ms) }, &mut out);
            assert!(machine.is_open(), "closed after {}ms idle", ms - 99);
        }
        machine.handle(Signal::Poll { app: None, at: at(t0, 400) }, &mut out);
        assert!(!machine.is_open());
    }

    #[test]
    fn test_new_session_after_idle_gets_next_id() {
        let t0 = Utc::now();
        let mut machine = SessionMachine::new(4, Some(1));
        let mut out = Vec::new();
        machine.handle(key(t0), &mut out);
        machine.handle(Signal::Poll { app: None, at: at(t0, 100) }, &mut out);
        assert!(machine.is_open());
        machine.handle(Signal::Poll { app: None, at: at(t0, 200) }, &mut out);
        assert!(!machine.is_open());

        machine.handle(key(at(t0, 500)), &mut out);
        assert_eq!(machine.current_session_id(), Some(5));
    }

    #[test]
    fn test_explicit_stop_never_ends_before_last_event() {
        let t0 = Utc::now();
        let mut machine = SessionMachine::new(1, None);
        let mut out = Vec::new();
        machine.handle(key(at(t0, 500)), &mut out);
        out.clear();

        machine.handle(
            Signal::Stop {
                at: at(t0, 100),
                reason: EndReason::ExplicitStop,
            },
            &mut out,
        );
        assert_eq!(
            out,
            vec![Record::SessionClosed {
                session_id: 1,
                ended_at: at(t0, 500),
                reason: EndReason::ExplicitStop
            }]
        );

        // Stopping with no open session is a no-op
        out.clear();
        machine.handle(
            Signal::Stop {
                at: at(t0, 900),
                reason: EndReason::ExplicitStop,
            },
            &mut out,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_crash_stop_ends_at_last_event() {
        let t0 = Utc::now();
        let mut machine = SessionMachine::new(1, None);
        let mut out = Vec::new();
        machine.handle(key(t0), &mut out);
        machine.handle(
            Signal::Stop {
                at: at(t0, 5_000),
                reason: EndReason::CrashRecovery,
            },
            &mut out,
        );
        assert!(matches!(
            out.last(),
            Some(Record::SessionClosed { ended_at, reason: EndReason::CrashRecovery, .. })
                if *ended_at == t0
        ));
    }

    #[test]
    fn test_backwards_clock_is_clamped_and_flagged() {
        let t0 = Utc::now();
        let stats = Arc::new(CaptureStats::new());
        let mut machine = SessionMachine::new(1, None)
            .with_skew_tolerance(std::time::Duration::from_millis(100))
            .with_stats(stats.clone());
        let mut out = Vec::new();
        machine.handle(key(at(t0, 1_000)), &mut out);
        out.clear();

        // Within tolerance: clamped silently
        machine.handle(
            Signal::Input(InputEvent::Pointer(PointerEvent::movement_at(
                at(t0, 950),
                1.0,
                1.0,
            ))),
            &mut out,
        );
        // Beyond tolerance: clamped and flagged
        machine.handle(key(at(t0, 200)), &mut out);

        match (&out[0], &out[1]) {
            (Record::Pointer(p), Record::Key(k)) => {
                assert_eq!(p.event.timestamp, at(t0, 1_000));
                assert!(!p.clock_skew);
                assert_eq!(k.event.timestamp, at(t0, 1_000));
                assert!(k.clock_skew);
            }
            other => panic!("unexpected records: {other:?}"),
        }
        assert_eq!(stats.snapshot().clock_anomalies, 1);
    }

    #[test]
    fn test_records_stay_within_session_span() {
        let t0 = Utc::now();
        let mut machine = SessionMachine::new(1, None);
        let mut out = Vec::new();
        machine.handle(poll("a", t0), &mut out);
        machine.handle(key(at(t0, 10)), &mut out);
        machine.handle(poll("b", at(t0, 5)), &mut out);
        machine.handle(key(at(t0, 40)), &mut out);
        machine.handle(
            Signal::Stop {
                at: at(t0, 60),
                reason: EndReason::ExplicitStop,
            },
            &mut out,
        );

        let start = out.first().unwrap().timestamp();
        let end = out.last().unwrap().timestamp();
        assert!(out.iter().all(|r| r.timestamp() >= start && r.timestamp() <= end));
        let mut sorted = out.clone();
        crate::record::sort_for_flush(&mut sorted);
        assert_eq!(sorted, out);
    }
}
