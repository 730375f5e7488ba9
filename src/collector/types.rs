//! Normalized input event types produced by the platform adapters.
//!
//! Pointer events carry global screen coordinates. Keyboard events never carry
//! the key itself: each key is reduced to a coarse [`KeyClass`] at the adapter
//! boundary, so typed content is never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pointer sample kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerKind {
    Move,
    ClickDown,
    ClickUp,
    Scroll,
}

impl PointerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PointerKind::Move => "move",
            PointerKind::ClickDown => "click_down",
            PointerKind::ClickUp => "click_up",
            PointerKind::Scroll => "scroll",
        }
    }
}

/// Mouse button attached to click samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    Other,
}

impl MouseButton {
    pub fn as_str(&self) -> &'static str {
        match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
            MouseButton::Middle => "middle",
            MouseButton::Other => "other",
        }
    }
}

/// A pointer event in global screen coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointerEvent {
    /// Timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
    pub kind: PointerKind,
    pub x: f64,
    pub y: f64,
    /// Only set for click events
    pub button: Option<MouseButton>,
    /// Scroll deltas (only set for scroll events)
    pub scroll_delta: Option<(f64, f64)>,
}

impl PointerEvent {
    /// Create a new pointer move event.
    pub fn movement(x: f64, y: f64) -> Self {
        Self::movement_at(Utc::now(), x, y)
    }

    pub fn movement_at(timestamp: DateTime<Utc>, x: f64, y: f64) -> Self {
        Self {
            timestamp,
            kind: PointerKind::Move,
            x,
            y,
            button: None,
            scroll_delta: None,
        }
    }

    /// Create a new click event. `pressed` selects between down and up.
    pub fn click(x: f64, y: f64, button: MouseButton, pressed: bool) -> Self {
        Self::click_at(Utc::now(), x, y, button, pressed)
    }

    pub fn click_at(
        timestamp: DateTime<Utc>,
        x: f64,
        y: f64,
        button: MouseButton,
        pressed: bool,
    ) -> Self {
        Self {
            timestamp,
            kind: if pressed {
                PointerKind::ClickDown
            } else {
                PointerKind::ClickUp
            },
            x,
            y,
            button: Some(button),
            scroll_delta: None,
        }
    }

    /// Create a new scroll event at the cursor position.
    pub fn scroll(x: f64, y: f64, delta_x: f64, delta_y: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: PointerKind::Scroll,
            x,
            y,
            button: None,
            scroll_delta: Some((delta_x, delta_y)),
        }
    }
}

/// Key press direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyDirection {
    Down,
    Up,
}

impl KeyDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyDirection::Down => "down",
            KeyDirection::Up => "up",
        }
    }
}

/// Coarse key classification. This is all that is kept of a keystroke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyClass {
    Letter,
    Digit,
    Whitespace,
    Punctuation,
    Editing,
    Modifier,
    Navigation,
    Function,
    Other,
}

impl KeyClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyClass::Letter => "letter",
            KeyClass::Digit => "digit",
            KeyClass::Whitespace => "whitespace",
            KeyClass::Punctuation => "punctuation",
            KeyClass::Editing => "editing",
            KeyClass::Modifier => "modifier",
            KeyClass::Navigation => "navigation",
            KeyClass::Function => "function",
            KeyClass::Other => "other",
        }
    }

    /// Classify a macOS virtual key code (`kVK_*`).
    pub fn from_mac_keycode(code: u16) -> Self {
        match code {
            0x00..=0x09 | 0x0B..=0x11 | 0x1F | 0x20 | 0x22 | 0x23 | 0x25 | 0x26 | 0x28 | 0x2D
            | 0x2E => KeyClass::Letter,
            0x12..=0x17 | 0x19 | 0x1A | 0x1C | 0x1D | 0x52..=0x59 | 0x5B | 0x5C => KeyClass::Digit,
            0x24 | 0x30 | 0x31 | 0x4C => KeyClass::Whitespace,
            0x0A | 0x18 | 0x1B | 0x1E | 0x21 | 0x27 | 0x29..=0x2C | 0x2F | 0x32 | 0x41 | 0x43
            | 0x45 | 0x4B | 0x4E | 0x51 => KeyClass::Punctuation,
            0x33 | 0x75 => KeyClass::Editing,
            0x36..=0x3F => KeyClass::Modifier,
            0x73 | 0x74 | 0x77 | 0x79 | 0x7B..=0x7E => KeyClass::Navigation,
            0x60..=0x65 | 0x67 | 0x69 | 0x6A | 0x6B | 0x6D | 0x6F | 0x71 | 0x76 | 0x78 | 0x7A => {
                KeyClass::Function
            }
            _ => KeyClass::Other,
        }
    }

    /// Classify a Windows virtual key code (`VK_*`).
    pub fn from_virtual_key(vk: u32) -> Self {
        match vk {
            0x41..=0x5A => KeyClass::Letter,
            0x30..=0x39 | 0x60..=0x69 => KeyClass::Digit,
            0x09 | 0x0D | 0x20 => KeyClass::Whitespace,
            0x6A..=0x6F | 0xBA..=0xC0 | 0xDB..=0xDF | 0xE2 => KeyClass::Punctuation,
            0x08 | 0x2D | 0x2E => KeyClass::Editing,
            0x10..=0x12 | 0x14 | 0x5B | 0x5C | 0xA0..=0xA5 => KeyClass::Modifier,
            0x21..=0x28 => KeyClass::Navigation,
            0x70..=0x87 => KeyClass::Function,
            _ => KeyClass::Other,
        }
    }
}

/// A keyboard event: class and direction only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyboardEvent {
    /// Timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
    pub class: KeyClass,
    pub direction: KeyDirection,
}

impl KeyboardEvent {
    pub fn new(class: KeyClass, direction: KeyDirection) -> Self {
        Self::at(Utc::now(), class, direction)
    }

    pub fn at(timestamp: DateTime<Utc>, class: KeyClass, direction: KeyDirection) -> Self {
        Self {
            timestamp,
            class,
            direction,
        }
    }
}

/// Unified event type emitted by every adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InputEvent {
    Pointer(PointerEvent),
    Keyboard(KeyboardEvent),
}

impl InputEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            InputEvent::Pointer(e) => e.timestamp,
            InputEvent::Keyboard(e) => e.timestamp,
        }
    }

    /// Whether this is a pointer move (the only coalescible kind).
    pub fn is_move(&self) -> bool {
        matches!(self, InputEvent::Pointer(p) if p.kind == PointerKind::Move)
    }

    /// Replace the timestamp, keeping everything else.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        match &mut self {
            InputEvent::Pointer(e) => e.timestamp = timestamp,
            InputEvent::Keyboard(e) => e.timestamp = timestamp,
        }
        self
    }
}

/// Identity of a foreground application.
///
/// `key` is stable (bundle identifier, executable path, or process name
/// depending on platform); `display_name` is informational only and never
/// takes part in identity comparisons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppIdentity {
    pub key: String,
    pub display_name: String,
}

/// Key used when no foreground application could be determined.
pub const UNKNOWN_APP_KEY: &str = "unknown";

impl AppIdentity {
    pub fn new(key: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            display_name: display_name.into(),
        }
    }

    pub fn unknown() -> Self {
        Self::new(UNKNOWN_APP_KEY, UNKNOWN_APP_KEY)
    }

    pub fn is_unknown(&self) -> bool {
        self.key == UNKNOWN_APP_KEY
    }

    /// Identity comparison by stable key.
    pub fn same_app(&self, other: &AppIdentity) -> bool {
        self.key == other.key
    }
}

impl PartialEq for AppIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.same_app(other)
    }
}

impl Eq for AppIdentity {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_click_direction() {
        let down = PointerEvent::click(10.0, 20.0, MouseButton::Left, true);
        assert_eq!(down.kind, PointerKind::ClickDown);
        assert_eq!(down.button, Some(MouseButton::Left));

        let up = PointerEvent::click(10.0, 20.0, MouseButton::Left, false);
        assert_eq!(up.kind, PointerKind::ClickUp);
    }

    #[test]
    fn test_is_move() {
        assert!(InputEvent::Pointer(PointerEvent::movement(1.0, 2.0)).is_move());
        assert!(!InputEvent::Pointer(PointerEvent::scroll(1.0, 2.0, 0.0, 3.0)).is_move());
        assert!(!InputEvent::Keyboard(KeyboardEvent::new(KeyClass::Letter, KeyDirection::Down))
            .is_move());
    }

    #[test]
    fn test_mac_key_classes() {
        assert_eq!(KeyClass::from_mac_keycode(0x00), KeyClass::Letter); // A
        assert_eq!(KeyClass::from_mac_keycode(0x2E), KeyClass::Letter); // M
        assert_eq!(KeyClass::from_mac_keycode(0x1D), KeyClass::Digit); // 0
        assert_eq!(KeyClass::from_mac_keycode(0x31), KeyClass::Whitespace); // space
        assert_eq!(KeyClass::from_mac_keycode(0x33), KeyClass::Editing); // delete
        assert_eq!(KeyClass::from_mac_keycode(0x37), KeyClass::Modifier); // command
        assert_eq!(KeyClass::from_mac_keycode(0x7E), KeyClass::Navigation); // up arrow
        assert_eq!(KeyClass::from_mac_keycode(0x7A), KeyClass::Function); // F1
        assert_eq!(KeyClass::from_mac_keycode(0x2B), KeyClass::Punctuation); // comma
    }

    #[test]
    fn test_windows_key_classes() {
        assert_eq!(KeyClass::from_virtual_key(0x41), KeyClass::Letter);
        assert_eq!(KeyClass::from_virtual_key(0x35), KeyClass::Digit);
        assert_eq!(KeyClass::from_virtual_key(0x0D), KeyClass::Whitespace);
        assert_eq!(KeyClass::from_virtual_key(0x08), KeyClass::Editing);
        assert_eq!(KeyClass::from_virtual_key(0xA0), KeyClass::Modifier);
        assert_eq!(KeyClass::from_virtual_key(0x25), KeyClass::Navigation);
        assert_eq!(KeyClass::from_virtual_key(0x7B), KeyClass::Function);
        assert_eq!(KeyClass::from_virtual_key(0xFF), KeyClass::Other);
    }

    #[test]
    fn test_app_identity_compares_by_key() {
        let a = AppIdentity::new("com.example.editor", "Editor");
        let b = AppIdentity::new("com.example.editor", "Editor - draft.txt");
        let c = AppIdentity::new("com.example.browser", "Editor");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(AppIdentity::unknown().is_unknown());
    }
}
