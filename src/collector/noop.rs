//! Fallback adapter for platforms without an input hook implementation.
//!
//! Lets the crate and binary build on other targets. It never emits events;
//! the capture service still runs and polls the foreground probe.

use crate::collector::types::InputEvent;
use crate::collector::{CollectorConfig, CollectorError, EventSource, EVENT_QUEUE_CAPACITY};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A collector that never emits events.
pub struct NoopCollector {
    _config: CollectorConfig,
    _sender: Sender<InputEvent>,
    receiver: Receiver<InputEvent>,
    running: Arc<AtomicBool>,
}

impl NoopCollector {
    pub fn new(config: CollectorConfig) -> Self {
        let (sender, receiver) = bounded(EVENT_QUEUE_CAPACITY);
        Self {
            _config: config,
            _sender: sender,
            receiver,
            running: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl EventSource for NoopCollector {
    fn start(&mut self) -> Result<(), CollectorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CollectorError::AlreadyRunning);
        }
        tracing::warn!("no input hook available on this platform; only foreground polling runs");
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
}

/// There is no permission gate on these platforms.
pub fn check_permission() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_start_rejected() {
        let mut collector = NoopCollector::new(CollectorConfig::default());
        assert!(collector.start().is_ok());
        assert_eq!(collector.start(), Err(CollectorError::AlreadyRunning));
        collector.stop();
        assert!(!collector.is_running());
    }
}
