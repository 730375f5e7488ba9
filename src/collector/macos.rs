//! macOS implementation of event collection using CGEvent tap.
//!
//! This module captures keyboard and mouse events at the system level using
//! macOS's Core Graphics event tap API. It requires Input Monitoring permission.

use crate::collector::types::{
    InputEvent, KeyClass, KeyDirection, KeyboardEvent, MouseButton, PointerEvent,
};
use crate::collector::{CollectorConfig, CollectorError, EventSource, EVENT_QUEUE_CAPACITY};
use core_foundation::runloop::{kCFRunLoopCommonModes, CFRunLoop};
use core_graphics::event::{
    CGEvent, CGEventFlags, CGEventTap, CGEventTapLocation, CGEventTapOptions, CGEventTapPlacement,
    CGEventType, CallbackResult, EventField,
};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// The macOS event collector using CGEvent tap.
pub struct MacOSCollector {
    config: CollectorConfig,
    sender: Sender<InputEvent>,
    receiver: Receiver<InputEvent>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    thread_handle: Option<JoinHandle<()>>,
}

impl MacOSCollector {
    /// Create a new macOS collector with the given configuration.
    pub fn new(config: CollectorConfig) -> Self {
        // Use a bounded channel to prevent unbounded memory growth
        let (sender, receiver) = bounded(EVENT_QUEUE_CAPACITY);

        Self {
            config,
            sender,
            receiver,
            running: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
            thread_handle: None,
        }
    }
}

impl EventSource for MacOSCollector {
    /// Start capturing events in a background thread.
    ///
    /// Blocks until the tap is installed, so a missing Input Monitoring
    /// permission surfaces here as [`CollectorError::PermissionDenied`].
    fn start(&mut self) -> Result<(), CollectorError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(CollectorError::AlreadyRunning);
        }

        self.running.store(true, Ordering::SeqCst);

        let sender = self.sender.clone();
        let running = self.running.clone();
        let dropped = self.dropped.clone();
        let config = self.config.clone();
        let (ready_tx, ready_rx) = bounded::<Result<(), CollectorError>>(1);

        let handle = thread::Builder::new()
            .name("mousetrace-tap".into())
            .spawn(move || {
                if let Err(e) = run_event_loop(sender, running.clone(), dropped, config, &ready_tx)
                {
                    // Delivered only if the loop failed before signaling readiness.
                    let _ = ready_tx.send(Err(e));
                }
                running.store(false, Ordering::SeqCst);
            })
            .map_err(|_| CollectorError::WorkerExited)?;

        let ready = ready_rx.recv().unwrap_or(Err(CollectorError::WorkerExited));
        if let Err(e) = ready {
            self.running.store(false, Ordering::SeqCst);
            let _ = handle.join();
            return Err(e);
        }

        tracing::info!("CGEvent tap installed");
        self.thread_handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            // The run loop wakes every 100ms and exits once running is false
            let _ = handle.join();
            tracing::info!("CGEvent tap removed");
        }
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

impl Drop for MacOSCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build a list of event types to capture based on configuration.
fn build_event_types(config: &CollectorConfig) -> Vec<CGEventType> {
    let mut types = Vec::new();

    if config.capture_keyboard {
        types.push(CGEventType::KeyDown);
        types.push(CGEventType::KeyUp);
        types.push(CGEventType::FlagsChanged);
    }

    if config.capture_mouse {
        if config.capture_moves {
            types.push(CGEventType::MouseMoved);
            types.push(CGEventType::LeftMouseDragged);
            types.push(CGEventType::RightMouseDragged);
            types.push(CGEventType::OtherMouseDragged);
        }
        types.push(CGEventType::LeftMouseDown);
        types.push(CGEventType::LeftMouseUp);
        types.push(CGEventType::RightMouseDown);
        types.push(CGEventType::RightMouseUp);
        types.push(CGEventType::OtherMouseDown);
        types.push(CGEventType::OtherMouseUp);
        types.push(CGEventType::ScrollWheel);
    }

    types
}

/// Run the Core Graphics event loop until `running` is cleared.
fn run_event_loop(
    sender: Sender<InputEvent>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    config: CollectorConfig,
    ready: &Sender<Result<(), CollectorError>>,
) -> Result<(), CollectorError> {
    let event_types = build_event_types(&config);

    // Tap creation fails when Input Monitoring permission is missing.
    let tap = CGEventTap::new(
        CGEventTapLocation::Session,
        CGEventTapPlacement::HeadInsertEventTap,
        CGEventTapOptions::ListenOnly,
        event_types,
        move |_proxy, event_type, event: &CGEvent| {
            if let Some(input) = process_cg_event(event_type, event) {
                if let Err(TrySendError::Full(_)) = sender.try_send(input) {
                    dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            // Passive observer: the event continues unchanged
            CallbackResult::Keep
        },
    )
    .map_err(|_| CollectorError::PermissionDenied)?;

    let source = tap
        .mach_port()
        .create_runloop_source(0)
        .map_err(|_| CollectorError::RunLoopSourceFailed)?;

    let run_loop = CFRunLoop::get_current();
    unsafe {
        run_loop.add_source(&source, kCFRunLoopCommonModes);
    }

    tap.enable();
    let _ = ready.send(Ok(()));

    while running.load(Ordering::SeqCst) {
        CFRunLoop::run_in_mode(
            unsafe { kCFRunLoopCommonModes },
            std::time::Duration::from_millis(100),
            false,
        );
    }

    // The tap is disabled when dropped
    Ok(())
}

/// Modifier flag carried by a modifier key code, used to tell press from release.
fn modifier_flag(keycode: u16) -> Option<CGEventFlags> {
    match keycode {
        0x37 | 0x36 => Some(CGEventFlags::CGEventFlagCommand),
        0x38 | 0x3C => Some(CGEventFlags::CGEventFlagShift),
        0x39 => Some(CGEventFlags::CGEventFlagAlphaShift),
        0x3A | 0x3D => Some(CGEventFlags::CGEventFlagAlternate),
        0x3B | 0x3E => Some(CGEventFlags::CGEventFlagControl),
        0x3F => Some(CGEventFlags::CGEventFlagSecondaryFn),
        _ => None,
    }
}

/// Convert a CGEvent into an [`InputEvent`].
///
/// CGEvent locations are already in global display coordinates with a
/// top-left origin, which is the internal representation.
fn process_cg_event(event_type: CGEventType, event: &CGEvent) -> Option<InputEvent> {
    use core_graphics::event::CGEventType::*;

    let keycode = || event.get_integer_value_field(EventField::KEYBOARD_EVENT_KEYCODE) as u16;
    let location = event.location();
    let (x, y) = (location.x, location.y);

    match event_type {
        KeyDown => {
            // Auto-repeat is not a new physical press
            if event.get_integer_value_field(EventField::KEYBOARD_EVENT_AUTOREPEAT) != 0 {
                return None;
            }
            Some(InputEvent::Keyboard(KeyboardEvent::new(
                KeyClass::from_mac_keycode(keycode()),
                KeyDirection::Down,
            )))
        }
        KeyUp => Some(InputEvent::Keyboard(KeyboardEvent::new(
            KeyClass::from_mac_keycode(keycode()),
            KeyDirection::Up,
        ))),
        FlagsChanged => {
            let code = keycode();
            let direction = match modifier_flag(code) {
                Some(flag) if event.get_flags().contains(flag) => KeyDirection::Down,
                Some(_) => KeyDirection::Up,
                None => return None,
            };
            Some(InputEvent::Keyboard(KeyboardEvent::new(
                KeyClass::Modifier,
                direction,
            )))
        }

        MouseMoved | LeftMouseDragged | RightMouseDragged | OtherMouseDragged => {
            Some(InputEvent::Pointer(PointerEvent::movement(x, y)))
        }

        LeftMouseDown => Some(InputEvent::Pointer(PointerEvent::click(
            x,
            y,
            MouseButton::Left,
            true,
        ))),
        LeftMouseUp => Some(InputEvent::Pointer(PointerEvent::click(
            x,
            y,
            MouseButton::Left,
            false,
        ))),
        RightMouseDown => Some(InputEvent::Pointer(PointerEvent::click(
            x,
            y,
            MouseButton::Right,
            true,
        ))),
        RightMouseUp => Some(InputEvent::Pointer(PointerEvent::click(
            x,
            y,
            MouseButton::Right,
            false,
        ))),
        OtherMouseDown | OtherMouseUp => {
            let button = match event.get_integer_value_field(EventField::MOUSE_EVENT_BUTTON_NUMBER)
            {
                2 => MouseButton::Middle,
                _ => MouseButton::Other,
            };
            Some(InputEvent::Pointer(PointerEvent::click(
                x,
                y,
                button,
                matches!(event_type, OtherMouseDown),
            )))
        }

        ScrollWheel => {
            let delta_x = event.get_double_value_field(
                EventField::SCROLL_WHEEL_EVENT_POINT_DELTA_AXIS_2,
            );
            let delta_y = event.get_double_value_field(
                EventField::SCROLL_WHEEL_EVENT_POINT_DELTA_AXIS_1,
            );
            Some(InputEvent::Pointer(PointerEvent::scroll(x, y, delta_x, delta_y)))
        }

        _ => None,
    }
}

/// Check if the application has Input Monitoring permission.
///
/// macOS has no direct query for this; creating a passive tap fails when the
/// permission is missing.
pub fn check_permission() -> bool {
    let result = CGEventTap::new(
        CGEventTapLocation::Session,
        CGEventTapPlacement::HeadInsertEventTap,
        CGEventTapOptions::ListenOnly,
        vec![CGEventType::KeyDown],
        |_proxy, _type, _event| CallbackResult::Keep,
    );

    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_types_respect_config() {
        let config = CollectorConfig {
            capture_keyboard: false,
            capture_mouse: true,
            capture_moves: false,
        };
        let types = build_event_types(&config);
        assert!(!types.iter().any(|t| matches!(t, CGEventType::MouseMoved)));
        assert!(types.iter().any(|t| matches!(t, CGEventType::LeftMouseDown)));
        assert!(!types.iter().any(|t| matches!(t, CGEventType::KeyDown)));
    }

    #[test]
    fn test_modifier_flags() {
        assert!(modifier_flag(0x38).is_some());
        assert!(modifier_flag(0x00).is_none());
    }
}
