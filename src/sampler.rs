//! Rate-limited samplers.
//!
//! Two independent periodic threads feed the session machine:
//!
//! - [`PointerSampler`] drains the adapter queue, coalesces pointer moves to
//!   at most one per `1 / move_hz` tick (last position wins) and forwards
//!   clicks, scrolls and keys immediately.
//! - [`PollSampler`] asks a [`ForegroundProbe`] for the foreground application
//!   every `1 / poll_hz`, whether or not input is arriving.
//!
//! Each sampler returns its own [`SamplerHandle`]; stopping one leaves the
//! other running.

use crate::collector::types::InputEvent;
use crate::collector::ForegroundProbe;
use crate::session::Signal;
use crate::stats::SharedStats;
use chrono::Utc;
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Handle to a running sampler thread.
pub struct SamplerHandle {
    name: &'static str,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SamplerHandle {
    /// Stop the sampler and wait for its thread. Idempotent.
    pub fn stop(&mut self) {
        // Dropping the sender disconnects the stop channel
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(sampler = self.name, "sampler thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_sampler<F>(name: &'static str, body: F) -> std::io::Result<SamplerHandle>
where
    F: FnOnce(Receiver<()>) + Send + 'static,
{
    let (stop_tx, stop_rx) = bounded::<()>(0);
    let thread = thread::Builder::new()
        .name(format!("mousetrace-{name}"))
        .spawn(move || {
            tracing::info!(sampler = name, "sampler started");
            body(stop_rx);
            tracing::info!(sampler = name, "sampler stopped");
        })?;
    Ok(SamplerHandle {
        name,
        stop_tx: Some(stop_tx),
        thread: Some(thread),
    })
}

/// Move coalescing state for one pointer-sampler period.
struct Coalescer {
    record_moves: bool,
    record_keys: bool,
    pending: Option<InputEvent>,
    /// A move was already forwarded during the current period
    budget_used: bool,
    stats: Option<SharedStats>,
}

impl Coalescer {
    fn new(record_moves: bool, record_keys: bool, stats: Option<SharedStats>) -> Self {
        Self {
            record_moves,
            record_keys,
            pending: None,
            budget_used: false,
            stats,
        }
    }

    /// Accept one raw event, appending anything due for forwarding to `out`.
    fn push(&mut self, event: InputEvent, out: &mut Vec<InputEvent>) {
        if let Some(stats) = &self.stats {
            stats.record_event_received();
        }

        if event.is_move() {
            if !self.record_moves {
                return;
            }
            if self.pending.replace(event).is_some() {
                if let Some(stats) = &self.stats {
                    stats.record_move_coalesced();
                }
            }
            return;
        }

        if !self.record_keys && matches!(event, InputEvent::Keyboard(_)) {
            return;
        }

        // An earlier move goes out ahead of the event if this period allows
        // one. Otherwise it is superseded, since releasing it on a later tick
        // would put it behind a newer event.
        if let Some(pending) = self.pending.take() {
            if self.budget_used {
                if let Some(stats) = &self.stats {
                    stats.record_move_coalesced();
                }
            } else {
                out.push(pending);
                self.budget_used = true;
            }
        }
        out.push(event);
    }

    /// Period boundary: release the pending move unless one already went out.
    fn tick(&mut self) -> Option<InputEvent> {
        if std::mem::take(&mut self.budget_used) {
            return None;
        }
        self.pending.take()
    }

    fn finish(&mut self) -> Option<InputEvent> {
        self.pending.take()
    }
}

/// Pointer-move sampler; also the pass-through path for every other event.
pub struct PointerSampler {
    period: Duration,
    record_moves: bool,
    record_keys: bool,
    stats: Option<SharedStats>,
}

impl PointerSampler {
    /// `period` is the move budget window, `1 / move_hz`.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            record_moves: true,
            record_keys: true,
            stats: None,
        }
    }

    pub fn record_moves(mut self, enabled: bool) -> Self {
        self.record_moves = enabled;
        self
    }

    pub fn record_keys(mut self, enabled: bool) -> Self {
        self.record_keys = enabled;
        self
    }

    pub fn with_stats(mut self, stats: SharedStats) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Start sampling `events` into `signals`.
    ///
    /// On stop, events still queued by the adapter are drained and the pending
    /// move is forwarded, so nothing accepted by the adapter is lost.
    pub fn spawn(
        self,
        events: Receiver<InputEvent>,
        signals: Sender<Signal>,
    ) -> std::io::Result<SamplerHandle> {
        let mut coalescer = Coalescer::new(self.record_moves, self.record_keys, self.stats);
        let period = self.period;

        spawn_sampler("pointer", move |stop_rx| {
            let ticker = tick(period);
            let mut out = Vec::with_capacity(2);

            let forward = |out: &mut Vec<InputEvent>| -> bool {
                out.drain(..)
                    .all(|event| signals.send(Signal::Input(event)).is_ok())
            };

            loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(events) -> msg => match msg {
                        Ok(event) => {
                            coalescer.push(event, &mut out);
                            if !forward(&mut out) {
                                return;
                            }
                        }
                        Err(_) => break,
                    },
                    recv(ticker) -> _ => {
                        if let Some(event) = coalescer.tick() {
                            if signals.send(Signal::Input(event)).is_err() {
                                return;
                            }
                        }
                    }
                }
            }

            for event in events.try_iter() {
                coalescer.push(event, &mut out);
            }
            out.extend(coalescer.finish());
            forward(&mut out);
        })
    }
}

/// Foreground-application poller; its ticks also drive idle detection.
pub struct PollSampler {
    period: Duration,
}

impl PollSampler {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    /// Poll once immediately, then once per period until stopped.
    pub fn spawn(
        self,
        mut probe: Box<dyn ForegroundProbe>,
        signals: Sender<Signal>,
    ) -> std::io::Result<SamplerHandle> {
        let period = self.period;

        spawn_sampler("poll", move |stop_rx| {
            let ticker = tick(period);
            let mut poll = || {
                signals
                    .send(Signal::Poll {
                        app: probe.current(),
                        at: Utc::now(),
                    })
                    .is_ok()
            };

            if !poll() {
                return;
            }
            loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => {
                        if !poll() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
