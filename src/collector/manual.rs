//! Channel-fed event source.
//!
//! Used by tests and demos to drive the capture pipeline with synthetic
//! events instead of OS hooks.

use crate::collector::types::InputEvent;
use crate::collector::{CollectorError, EventSource, EVENT_QUEUE_CAPACITY};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// An event source whose events are pushed through a [`ManualSender`].
pub struct ManualSource {
    sender: Sender<InputEvent>,
    receiver: Receiver<InputEvent>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

/// Handle for injecting events into a [`ManualSource`].
#[derive(Clone)]
pub struct ManualSender {
    sender: Sender<InputEvent>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl ManualSource {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            running: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn handle(&self) -> ManualSender {
        ManualSender {
            sender: self.sender.clone(),
            running: self.running.clone(),
            dropped: self.dropped.clone(),
        }
    }
}

impl Default for ManualSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualSender {
    /// Push an event. Returns false if the source is stopped or the queue is full.
    pub fn push(&self, event: InputEvent) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

impl EventSource for ManualSource {
    fn start(&mut self) -> Result<(), CollectorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CollectorError::AlreadyRunning);
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn receiver(&self) -> &Receiver<InputEvent> {
        &self.receiver
    }

    fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
