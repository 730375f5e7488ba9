//! Windows implementation of event collection using Windows Hooks.
//!
//! This module captures keyboard and mouse events at the system level using
//! the Windows Hook API (SetWindowsHookEx). Hook callbacks run on the thread
//! that installed them, which owns the message loop.

use crate::collector::types::{
    InputEvent, KeyClass, KeyDirection, KeyboardEvent, MouseButton, PointerEvent,
};
use crate::collector::{CollectorConfig, CollectorError, EventSource, EVENT_QUEUE_CAPACITY};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use windows::Win32::Foundation::{HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::System::Threading::GetCurrentThreadId;
use windows::Win32::UI::WindowsAndMessaging::{
    CallNextHookEx, GetMessageW, PostThreadMessageW, SetWindowsHookExW, UnhookWindowsHookEx,
    HHOOK, KBDLLHOOKSTRUCT, LLKHF_INJECTED, MSG, MSLLHOOKSTRUCT, WH_KEYBOARD_LL, WH_MOUSE_LL,
    WM_KEYDOWN, WM_KEYUP, WM_LBUTTONDOWN, WM_LBUTTONUP, WM_MBUTTONDOWN, WM_MBUTTONUP,
    WM_MOUSEHWHEEL, WM_MOUSEMOVE, WM_MOUSEWHEEL, WM_QUIT, WM_RBUTTONDOWN, WM_RBUTTONUP,
    WM_SYSKEYDOWN, WM_SYSKEYUP, WM_XBUTTONDOWN, WM_XBUTTONUP,
};

/// The Windows event collector using low-level hooks.
pub struct WindowsCollector {
    config: CollectorConfig,
    sender: Sender<InputEvent>,
    receiver: Receiver<InputEvent>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    hook_thread_id: Arc<AtomicU32>,
    thread_handle: Option<JoinHandle<()>>,
}

impl WindowsCollector {
    /// Create a new Windows collector with the given configuration.
    pub fn new(config: CollectorConfig) -> Self {
        let (sender, receiver) = bounded(EVENT_QUEUE_CAPACITY);

        Self {
            config,
            sender,
            receiver,
            running: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
            hook_thread_id: Arc::new(AtomicU32::new(0)),
            thread_handle: None,
        }
    }
}

impl EventSource for WindowsCollector {
    /// Start capturing events in a background thread.
    ///
    /// Blocks until the hooks are installed; failure to install them is
    /// reported as [`CollectorError::PermissionDenied`].
    fn start(&mut self) -> Result<(), CollectorError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(CollectorError::AlreadyRunning);
        }

        self.running.store(true, Ordering::SeqCst);

        let sender = self.sender.clone();
        let running = self.running.clone();
        let dropped = self.dropped.clone();
        let thread_id = self.hook_thread_id.clone();
        let config = self.config.clone();
        let (ready_tx, ready_rx) = bounded::<Result<(), CollectorError>>(1);

        let handle = thread::Builder::new()
            .name("mousetrace-hooks".into())
            .spawn(move || {
                if let Err(e) = run_hook_loop(sender, dropped, thread_id, config, &ready_tx) {
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

        tracing::info!("low-level input hooks installed");
        self.thread_handle = Some(handle);
        Ok(())
    }

    /// Stop capturing events.
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            // GetMessageW blocks, so wake the hook thread with WM_QUIT
            let thread_id = self.hook_thread_id.load(Ordering::SeqCst);
            if thread_id != 0 {
                unsafe {
                    let _ = PostThreadMessageW(thread_id, WM_QUIT, WPARAM(0), LPARAM(0));
                }
            }
            let _ = handle.join();
            tracing::info!("low-level input hooks removed");
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

impl Drop for WindowsCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Per-thread state for the hook callbacks.
struct HookState {
    sender: Sender<InputEvent>,
    dropped: Arc<AtomicU64>,
    capture_moves: bool,
}

thread_local! {
    static HOOK_STATE: std::cell::RefCell<Option<HookState>> = const { std::cell::RefCell::new(None) };
}

fn emit(event: InputEvent) {
    HOOK_STATE.with(|state| {
        if let Some(ref state) = *state.borrow() {
            if let Err(TrySendError::Full(_)) = state.sender.try_send(event) {
                state.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    });
}

fn moves_enabled() -> bool {
    HOOK_STATE.with(|state| state.borrow().as_ref().map(|s| s.capture_moves).unwrap_or(false))
}

/// Low-level keyboard hook callback.
unsafe extern "system" fn keyboard_hook_proc(
    n_code: i32,
    w_param: WPARAM,
    l_param: LPARAM,
) -> LRESULT {
    if n_code >= 0 {
        let kb_struct = &*(l_param.0 as *const KBDLLHOOKSTRUCT);
        let message = w_param.0 as u32;

        let direction = match message {
            WM_KEYDOWN | WM_SYSKEYDOWN => Some(KeyDirection::Down),
            WM_KEYUP | WM_SYSKEYUP => Some(KeyDirection::Up),
            _ => None,
        };

        // Injected events come from software, not a physical key
        if let Some(direction) = direction {
            if (kb_struct.flags & LLKHF_INJECTED).0 == 0 {
                emit(InputEvent::Keyboard(KeyboardEvent::new(
                    KeyClass::from_virtual_key(kb_struct.vkCode),
                    direction,
                )));
            }
        }
    }

    CallNextHookEx(HHOOK::default(), n_code, w_param, l_param)
}

/// Low-level mouse hook callback.
unsafe extern "system" fn mouse_hook_proc(
    n_code: i32,
    w_param: WPARAM,
    l_param: LPARAM,
) -> LRESULT {
    if n_code >= 0 {
        let mouse_struct = &*(l_param.0 as *const MSLLHOOKSTRUCT);
        // Virtual-screen coordinates, top-left origin
        let x = mouse_struct.pt.x as f64;
        let y = mouse_struct.pt.y as f64;
        // High word of mouseData carries the wheel delta / X button number
        let high_word = ((mouse_struct.mouseData >> 16) & 0xFFFF) as u16;

        let event = match w_param.0 as u32 {
            WM_MOUSEMOVE if moves_enabled() => Some(PointerEvent::movement(x, y)),
            WM_LBUTTONDOWN => Some(PointerEvent::click(x, y, MouseButton::Left, true)),
            WM_LBUTTONUP => Some(PointerEvent::click(x, y, MouseButton::Left, false)),
            WM_RBUTTONDOWN => Some(PointerEvent::click(x, y, MouseButton::Right, true)),
            WM_RBUTTONUP => Some(PointerEvent::click(x, y, MouseButton::Right, false)),
            WM_MBUTTONDOWN => Some(PointerEvent::click(x, y, MouseButton::Middle, true)),
            WM_MBUTTONUP => Some(PointerEvent::click(x, y, MouseButton::Middle, false)),
            WM_XBUTTONDOWN => Some(PointerEvent::click(x, y, MouseButton::Other, true)),
            WM_XBUTTONUP => Some(PointerEvent::click(x, y, MouseButton::Other, false)),
            // 120 units per wheel notch
            WM_MOUSEWHEEL => Some(PointerEvent::scroll(
                x,
                y,
                0.0,
                high_word as i16 as f64 / 120.0,
            )),
            WM_MOUSEHWHEEL => Some(PointerEvent::scroll(
                x,
                y,
                high_word as i16 as f64 / 120.0,
                0.0,
            )),
            _ => None,
        };

        if let Some(event) = event {
            emit(InputEvent::Pointer(event));
        }
    }

    CallNextHookEx(HHOOK::default(), n_code, w_param, l_param)
}

/// Install the hooks and pump messages until WM_QUIT.
fn run_hook_loop(
    sender: Sender<InputEvent>,
    dropped: Arc<AtomicU64>,
    thread_id: Arc<AtomicU32>,
    config: CollectorConfig,
    ready: &Sender<Result<(), CollectorError>>,
) -> Result<(), CollectorError> {
    HOOK_STATE.with(|state| {
        *state.borrow_mut() = Some(HookState {
            sender,
            dropped,
            capture_moves: config.capture_moves,
        });
    });

    unsafe {
        thread_id.store(GetCurrentThreadId(), Ordering::SeqCst);

        let mut hooks: Vec<HHOOK> = Vec::new();

        if config.capture_keyboard {
            match SetWindowsHookExW(WH_KEYBOARD_LL, Some(keyboard_hook_proc), None, 0) {
                Ok(hook) => hooks.push(hook),
                Err(_) => {
                    for hook in hooks {
                        let _ = UnhookWindowsHookEx(hook);
                    }
                    return Err(CollectorError::PermissionDenied);
                }
            }
        }

        if config.capture_mouse {
            match SetWindowsHookExW(WH_MOUSE_LL, Some(mouse_hook_proc), None, 0) {
                Ok(hook) => hooks.push(hook),
                Err(_) => {
                    for hook in hooks {
                        let _ = UnhookWindowsHookEx(hook);
                    }
                    return Err(CollectorError::PermissionDenied);
                }
            }
        }

        let _ = ready.send(Ok(()));

        // Hooks are serviced while this thread waits in GetMessageW
        let mut msg = MSG::default();
        loop {
            let result = GetMessageW(&mut msg, HWND::default(), 0, 0);
            if result.0 <= 0 {
                break;
            }
        }

        for hook in hooks {
            let _ = UnhookWindowsHookEx(hook);
        }
    }

    HOOK_STATE.with(|state| *state.borrow_mut() = None);
    Ok(())
}

/// Check whether a low-level keyboard hook can be installed.
pub fn check_permission() -> bool {
    unsafe {
        match SetWindowsHookExW(WH_KEYBOARD_LL, Some(keyboard_hook_proc), None, 0) {
            Ok(hook) => {
                let _ = UnhookWindowsHookEx(hook);
                true
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_creation() {
        let collector = WindowsCollector::new(CollectorConfig::default());
        assert!(!collector.is_running());
        assert_eq!(collector.dropped_events(), 0);
    }
}
