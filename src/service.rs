//! Capture service.
//!
//! Wires the pipeline together and owns its lifecycle:
//!
//! ```text
//! EventSource ──▶ PointerSampler ──┐
//!                                  ├──▶ engine (SessionMachine) ──▶ BatchWriter ──▶ Store
//! ForegroundProbe ──▶ PollSampler ─┘
//! ```
//!
//! Every stage runs on its own named thread and talks to the next one over a
//! crossbeam channel. Shutdown happens front to back: the adapter stops, the
//! samplers drain what it already queued, the engine closes the open session,
//! and the writer makes a final flush.

use crate::collector::{EventSource, ForegroundProbe};
use crate::config::Config;
use crate::error::CaptureError;
use crate::record::{EndReason, Record};
use crate::sampler::{PointerSampler, PollSampler, SamplerHandle};
use crate::session::{SessionMachine, Signal};
use crate::stats::{CaptureStats, SharedStats, StatsSnapshot};
use crate::store::{
    BatchWriter, RecoveredSession, SessionOrigin, Store, WriterConfig, WriterReport,
};
use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// What a finished capture run did.
#[derive(Debug, Clone)]
pub struct CaptureReport {
    /// Sessions closed by crash recovery at startup
    pub recovered_sessions: usize,
    pub writer: WriterReport,
    pub stats: StatsSnapshot,
}

/// A running capture pipeline.
pub struct CaptureService {
    source: Box<dyn EventSource>,
    pointer: Option<SamplerHandle>,
    poll: Option<SamplerHandle>,
    signals: Option<Sender<Signal>>,
    engine: Option<JoinHandle<()>>,
    writer: Option<BatchWriter>,
    stats: SharedStats,
    recovered: Vec<RecoveredSession>,
    db_path: PathBuf,
}

impl CaptureService {
    /// Start capturing from `source`, tracking the foreground app with `probe`.
    ///
    /// The adapter is started first so a missing permission fails before the
    /// store is touched. Sessions left open by a previous run are closed with
    /// reason `crash-recovery` before any new session can open.
    pub fn start(
        config: &Config,
        mut source: Box<dyn EventSource>,
        probe: Box<dyn ForegroundProbe>,
    ) -> Result<Self, CaptureError> {
        config.validate()?;
        source.start()?;

        match Pipeline::spawn(config, source.as_ref(), probe) {
            Ok(pipeline) => {
                tracing::info!(
                    db = %config.db_path.display(),
                    poll_hz = config.poll_hz,
                    move_hz = config.move_hz,
                    "capture started"
                );
                Ok(Self {
                    source,
                    pointer: Some(pipeline.pointer),
                    poll: Some(pipeline.poll),
                    signals: Some(pipeline.signals),
                    engine: Some(pipeline.engine),
                    writer: Some(pipeline.writer),
                    stats: pipeline.stats,
                    recovered: pipeline.recovered,
                    db_path: config.db_path.clone(),
                })
            }
            Err(e) => {
                source.stop();
                Err(e)
            }
        }
    }

    /// Stop the pointer sampler only. Queued input is still delivered.
    pub fn stop_pointer_sampler(&mut self) {
        if let Some(mut sampler) = self.pointer.take() {
            sampler.stop();
        }
    }

    /// Stop the foreground poller only. Switches and idle detection stop with it.
    pub fn stop_poll_sampler(&mut self) {
        if let Some(mut sampler) = self.poll.take() {
            sampler.stop();
        }
    }

    pub fn pointer_sampler_running(&self) -> bool {
        self.pointer.as_ref().is_some_and(SamplerHandle::is_running)
    }

    pub fn poll_sampler_running(&self) -> bool {
        self.poll.as_ref().is_some_and(SamplerHandle::is_running)
    }

    /// False once the writer has given up; records are no longer being persisted.
    pub fn is_healthy(&self) -> bool {
        let writer_ok = self.writer.as_ref().is_some_and(|w| !w.has_failed());
        let engine_ok = self.engine.as_ref().is_some_and(|h| !h.is_finished());
        writer_ok && engine_ok
    }

    pub fn stats(&self) -> SharedStats {
        self.stats.clone()
    }

    pub fn recovered_sessions(&self) -> &[RecoveredSession] {
        &self.recovered
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Close the open session with reason `explicit-stop` and flush everything.
    pub fn stop(mut self) -> Result<CaptureReport, CaptureError> {
        self.shutdown(EndReason::ExplicitStop)
    }

    fn shutdown(&mut self, reason: EndReason) -> Result<CaptureReport, CaptureError> {
        let at = Utc::now();

        self.source.stop();
        self.stop_pointer_sampler();
        self.stop_poll_sampler();

        if let Some(signals) = self.signals.take() {
            // Fails only when the engine already exited
            let _ = signals.send(Signal::Stop { at, reason });
        }
        let engine = self.engine.take().map(JoinHandle::join);
        let writer = self.writer.take().map(BatchWriter::finish).transpose();

        self.stats.set_events_dropped(self.source.dropped_events());
        if let Err(e) = self.stats.save() {
            tracing::warn!(error = %e, "could not save capture stats");
        }
        tracing::info!(reason = %reason, "capture stopped");

        if matches!(engine, Some(Err(_))) {
            return Err(CaptureError::WorkerPanicked("session engine"));
        }
        let writer = writer?.unwrap_or_default();

        Ok(CaptureReport {
            recovered_sessions: self.recovered.len(),
            writer,
            stats: self.stats.snapshot(),
        })
    }
}

impl Drop for CaptureService {
    fn drop(&mut self) {
        if self.engine.is_some() || self.writer.is_some() {
            tracing::warn!("capture service dropped without stop");
            if let Err(e) = self.shutdown(EndReason::CrashRecovery) {
                tracing::error!(error = %e, "shutdown on drop failed");
            }
        }
    }
}

/// The threads behind a [`CaptureService`].
struct Pipeline {
    pointer: SamplerHandle,
    poll: SamplerHandle,
    signals: Sender<Signal>,
    engine: JoinHandle<()>,
    writer: BatchWriter,
    stats: SharedStats,
    recovered: Vec<RecoveredSession>,
}

impl Pipeline {
    fn spawn(
        config: &Config,
        source: &dyn EventSource,
        probe: Box<dyn ForegroundProbe>,
    ) -> Result<Self, CaptureError> {
        let mut store = Store::open_initialized(&config.db_path)?;
        let recovered = store.recover_open_sessions()?;
        let still_open = store.open_session_count()?;
        if still_open != 0 {
            return Err(CaptureError::InvariantViolation(format!(
                "{still_open} session(s) still open after recovery"
            )));
        }
        let next_session_id = store.next_session_id()?;

        let stats: SharedStats = Arc::new(CaptureStats::with_persistence(config.stats_path()));

        let (record_tx, record_rx) = unbounded::<Record>();
        let writer = BatchWriter::spawn(
            store,
            SessionOrigin::current(),
            WriterConfig::from(config),
            record_rx,
            Some(stats.clone()),
        )?;

        let machine = SessionMachine::new(next_session_id, config.idle_ticks())
            .with_skew_tolerance(config.clock_skew_tolerance)
            .with_stats(stats.clone());
        let (signal_tx, signal_rx) = unbounded::<Signal>();
        let engine = spawn_engine(machine, signal_rx, record_tx)?;

        let pointer = PointerSampler::new(config.move_period())
            .record_moves(config.record_moves)
            .record_keys(config.record_keys)
            .with_stats(stats.clone())
            .spawn(source.receiver().clone(), signal_tx.clone())?;
        let poll = PollSampler::new(config.poll_period()).spawn(probe, signal_tx.clone())?;

        Ok(Self {
            pointer,
            poll,
            signals: signal_tx,
            engine,
            writer,
            stats,
            recovered,
        })
    }
}

/// Run the state machine over `signals` until every sender is gone.
fn spawn_engine(
    mut machine: SessionMachine,
    signals: Receiver<Signal>,
    records: Sender<Record>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("mousetrace-engine".into())
        .spawn(move || {
            let mut out = Vec::new();
            let forward = |out: &mut Vec<Record>| -> bool {
                out.drain(..).all(|record| records.send(record).is_ok())
            };

            for signal in signals.iter() {
                machine.handle(signal, &mut out);
                if !forward(&mut out) {
                    tracing::error!("writer is gone, session engine stopping");
                    return;
                }
            }

            if machine.is_open() {
                tracing::warn!("signal channel closed with a session open");
                machine.handle(
                    Signal::Stop {
                        at: Utc::now(),
                        reason: EndReason::CrashRecovery,
                    },
                    &mut out,
                );
                forward(&mut out);
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{
        AppIdentity, CollectorError, InputEvent, ManualProbe, ManualSource, MouseButton,
        PointerEvent,
    };
    use crossbeam_channel::bounded;
    use std::time::Duration;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        Config {
            db_path: dir.path().join("capture.db"),
            flush_interval: Duration::from_millis(50),
            ..Config::default()
        }
    }

    struct DeniedSource {
        receiver: Receiver<InputEvent>,
    }

    impl EventSource for DeniedSource {
        fn start(&mut self) -> Result<(), CollectorError> {
            Err(CollectorError::PermissionDenied)
        }
        fn stop(&mut self) {}
        fn is_running(&self) -> bool {
            false
        }
        fn receiver(&self) -> &Receiver<InputEvent> {
            &self.receiver
        }
    }

    #[test]
    fn test_permission_denied_is_fatal_before_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let (_tx, receiver) = bounded(1);

        let result = CaptureService::start(
            &config,
            Box::new(DeniedSource { receiver }),
            Box::new(ManualProbe::default()),
        );
        assert!(matches!(result, Err(CaptureError::PermissionDenied)));
        assert!(!config.db_path.exists());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            move_hz: 0.0,
            ..test_config(&dir)
        };
        let result = CaptureService::start(
            &config,
            Box::new(ManualSource::new()),
            Box::new(ManualProbe::default()),
        );
        assert!(matches!(result, Err(CaptureError::Config(_))));
    }

    #[test]
    fn test_click_opens_and_stop_closes_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let source = ManualSource::new();
        let input = source.handle();
        let probe = ManualProbe::new(Some(AppIdentity::new("com.example.editor", "Editor")));

        let service =
            CaptureService::start(&config, Box::new(source), Box::new(probe)).unwrap();
        assert!(service.is_healthy());
        assert!(input.push(InputEvent::Pointer(PointerEvent::click(
            10.0,
            20.0,
            MouseButton::Left,
            true
        ))));
        std::thread::sleep(Duration::from_millis(150));

        let report = service.stop().unwrap();
        assert_eq!(report.stats.sessions_opened, 1);
        assert!(report.writer.records_written >= 4);

        let store = Store::open(&config.db_path).unwrap();
        let (count, reason): (i64, String) = store
            .connection()
            .query_row(
                "SELECT COUNT(*), MAX(end_reason) FROM sessions WHERE ended_at IS NOT NULL",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(reason, "explicit-stop");
        assert!(config.stats_path().exists());
    }

    #[test]
    fn test_samplers_stop_independently() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let mut service = CaptureService::start(
            &config,
            Box::new(ManualSource::new()),
            Box::new(ManualProbe::default()),
        )
        .unwrap();
        assert!(service.pointer_sampler_running());
        assert!(service.poll_sampler_running());

        service.stop_poll_sampler();
        assert!(!service.poll_sampler_running());
        assert!(service.pointer_sampler_running());

        service.stop_pointer_sampler();
        assert!(!service.pointer_sampler_running());
        assert!(service.is_healthy());

        let report = service.stop().unwrap();
        assert_eq!(report.stats.sessions_opened, 0);
    }
}
