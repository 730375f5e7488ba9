//! mousetrace - local input activity recorder.
//!
//! Captures pointer and keyboard activity plus the foreground application,
//! groups it into sessions and persists it to a local SQLite database that
//! can be queried safely through a read-only sandbox.
//!
//! # What is recorded
//!
//! - **Pointer**: positions (moves rate-limited), clicks and scrolls
//! - **Keyboard**: press/release direction and a coarse key class, never the key itself
//! - **Applications**: which application is in the foreground, and when it changes
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            mousetrace                            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌──────────────┐                              │
//! │  │  Collector  │──▶│PointerSampler│──┐                           │
//! │  │ (OS hooks)  │   │  (move_hz)   │  │   ┌─────────┐  ┌────────┐ │
//! │  └─────────────┘   └──────────────┘  ├──▶│ Session │─▶│ Batch  │ │
//! │  ┌─────────────┐   ┌──────────────┐  │   │ Machine │  │ Writer │ │
//! │  │ Foreground  │──▶│ PollSampler  │──┘   └─────────┘  └───┬────┘ │
//! │  │   Probe     │   │  (poll_hz)   │                       ▼     │
//! │  └─────────────┘   └──────────────┘    ┌─────────┐  ┌────────┐ │
//! │                                        │ Sandbox │◀─│ SQLite │ │
//! │                                        │  (RO)   │  │ (WAL)  │ │
//! │                                        └─────────┘  └────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use mousetrace::{collector, CaptureService, Config};
//!
//! let config = Config::default();
//! let source = collector::Collector::new(config.collector_config());
//! let service = CaptureService::start(&config, Box::new(source), collector::default_probe())
//!     .expect("failed to start capture");
//!
//! // ... later
//! let report = service.stop().expect("failed to stop capture");
//! println!("{}", report.stats);
//! ```

pub mod collector;
pub mod config;
pub mod error;
pub mod record;
pub mod sampler;
pub mod sandbox;
pub mod service;
pub mod session;
pub mod stats;
pub mod store;
pub mod summary;

// Re-export key types at crate root for convenience
pub use collector::{
    AppIdentity, Collector, CollectorConfig, CollectorError, EventSource, ForegroundProbe,
    InputEvent,
};
pub use config::{Config, ConfigError};
pub use error::CaptureError;
pub use record::{EndReason, Record};
pub use sandbox::{QueryOutcome, QueryRows, QuerySandbox, RejectRule, Rejection};
pub use service::{CaptureReport, CaptureService};
pub use session::{SessionMachine, Signal};
pub use stats::{CaptureStats, SharedStats, StatsSnapshot};
pub use store::{Store, StoreError};
pub use summary::{summarize, Summary};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Capture declaration that can be displayed to users.
pub const CAPTURE_DECLARATION: &str = r#"
╔══════════════════════════════════════════════════════════════════╗
║               MOUSETRACE - CAPTURE DECLARATION                   ║
╠══════════════════════════════════════════════════════════════════╣
║                                                                  ║
║  mousetrace records your input activity to a local database.     ║
║                                                                  ║
║  ✓ WHAT IS RECORDED:                                             ║
║    • Pointer position (sampled), clicks and scrolls              ║
║    • When keys are pressed and released, and a key class         ║
║      (letter, digit, navigation, ...)                            ║
║    • Which application is in the foreground                      ║
║                                                                  ║
║  ✗ WHAT IS NEVER RECORDED:                                       ║
║    • Which keys you press (no passwords, messages, etc.)         ║
║    • Window titles or screen content                             ║
║                                                                  ║
║  Everything stays on this machine. Inspect it at any time with:  ║
║    mousetrace analyze --summary                                  ║
║                                                                  ║
╚══════════════════════════════════════════════════════════════════╝
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_declaration_contents() {
        assert!(CAPTURE_DECLARATION.contains("CAPTURE DECLARATION"));
        assert!(CAPTURE_DECLARATION.contains("NEVER RECORDED"));
        assert!(CAPTURE_DECLARATION.contains("keys you press"));
    }
}
