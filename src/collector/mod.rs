//! Event source adapters.
//!
//! This module wraps platform input hooks and converts raw callbacks into
//! normalized [`InputEvent`]s pushed onto a bounded channel. It knows nothing
//! about sessions or storage. Foreground-application lookup lives in
//! [`foreground`].

pub mod foreground;
pub mod manual;
pub mod types;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub mod noop;

use crossbeam_channel::Receiver;

// Re-export commonly used types
pub use foreground::{default_probe, ForegroundProbe, ManualProbe};
pub use manual::{ManualSender, ManualSource};
pub use types::{
    AppIdentity, InputEvent, KeyClass, KeyDirection, KeyboardEvent, MouseButton, PointerEvent,
    PointerKind, UNKNOWN_APP_KEY,
};

#[cfg(target_os = "macos")]
pub use macos::{check_permission, MacOSCollector};

/// Platform-agnostic collector type alias
#[cfg(target_os = "macos")]
pub type Collector = MacOSCollector;

#[cfg(target_os = "windows")]
pub use self::windows::{check_permission, WindowsCollector};

/// Platform-agnostic collector type alias
#[cfg(target_os = "windows")]
pub type Collector = WindowsCollector;

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub use noop::{check_permission, NoopCollector};

/// Platform-agnostic collector type alias
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub type Collector = NoopCollector;

/// Capacity of the adapter-to-sampler channel.
pub const EVENT_QUEUE_CAPACITY: usize = 10_000;

/// Configuration for which event sources to capture.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub capture_keyboard: bool,
    pub capture_mouse: bool,
    /// When false, pointer moves are not emitted (clicks and scrolls still are)
    pub capture_moves: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            capture_keyboard: true,
            capture_mouse: true,
            capture_moves: true,
        }
    }
}

/// A producer of normalized input events.
///
/// Implementations deliver each physical event exactly once onto the channel
/// returned by [`EventSource::receiver`].
pub trait EventSource: Send {
    /// Begin capturing. Fails fast with [`CollectorError::PermissionDenied`]
    /// when the platform refuses access to input events.
    fn start(&mut self) -> Result<(), CollectorError>;

    /// Stop capturing. Idempotent.
    fn stop(&mut self);

    fn is_running(&self) -> bool;

    fn receiver(&self) -> &Receiver<InputEvent>;

    /// Events discarded because the queue was full.
    fn dropped_events(&self) -> u64 {
        0
    }
}

/// Errors that can occur during event collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectorError {
    AlreadyRunning,
    PermissionDenied,
    TapCreationFailed,
    RunLoopSourceFailed,
    HookInstallationFailed,
    /// The capture thread exited before reporting readiness
    WorkerExited,
}

impl std::fmt::Display for CollectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectorError::AlreadyRunning => write!(f, "Collector is already running"),
            CollectorError::PermissionDenied => {
                write!(f, "Input monitoring permission not granted")
            }
            CollectorError::TapCreationFailed => write!(f, "Failed to create CGEvent tap"),
            CollectorError::RunLoopSourceFailed => {
                write!(f, "Failed to create run loop source")
            }
            CollectorError::HookInstallationFailed => {
                write!(f, "Failed to install input hook")
            }
            CollectorError::WorkerExited => {
                write!(f, "Capture thread exited before becoming ready")
            }
        }
    }
}

impl std::error::Error for CollectorError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_config_default() {
        let config = CollectorConfig::default();
        assert!(config.capture_keyboard);
        assert!(config.capture_mouse);
        assert!(config.capture_moves);
    }

    #[test]
    fn test_platform_collector_starts_idle() {
        let collector = Collector::new(CollectorConfig::default());
        assert!(!collector.is_running());
        assert_eq!(collector.dropped_events(), 0);
    }
}
