//! Host input injection.
//!
//! The gesture engine talks to a small trait so the production backend
//! (enigo — libei/X11 on Linux, SendInput on Windows, CGEvent on macOS)
//! can be swapped for a recording fake in tests. Implementations hold
//! no state beyond the OS handle and are driven from behind the
//! engine's backend mutex.

use enigo::{Axis, Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};

use crate::error::{Result, TabcastError};

/// Mouse buttons the gesture engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
}

/// Modifier keys held around synthetic wheel events (pinch → zoom).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifierKey {
    Ctrl,
}

/// Injects pointer events into the host desktop.
///
/// `wheel` takes discrete notches with positive `dy` meaning wheel-up
/// (scroll content down); the engine converts pixel deltas before
/// calling.
pub trait InputBackend: Send {
    fn mouse_move(&mut self, x: i32, y: i32) -> Result<()>;
    fn button(&mut self, button: MouseButton, down: bool) -> Result<()>;
    fn wheel(&mut self, dx: i32, dy: i32) -> Result<()>;
    fn modifier(&mut self, key: ModifierKey, down: bool) -> Result<()>;
}

// ── Enigo backend ────────────────────────────────────────────────

/// Production backend on top of enigo.
pub struct EnigoBackend {
    enigo: Enigo,
}

impl EnigoBackend {
    /// Connect to the host input system. Fails when no compositor /
    /// portal access is available, which the supervisor surfaces as an
    /// access error.
    pub fn new() -> Result<Self> {
        let enigo = Enigo::new(&Settings::default())
            .map_err(|e| TabcastError::AccessDenied(format!("input system: {e}")))?;
        Ok(Self { enigo })
    }
}

impl InputBackend for EnigoBackend {
    fn mouse_move(&mut self, x: i32, y: i32) -> Result<()> {
        self.enigo
            .move_mouse(x, y, Coordinate::Abs)
            .map_err(|e| TabcastError::Input(format!("move to ({x}, {y}): {e}")))
    }

    fn button(&mut self, button: MouseButton, down: bool) -> Result<()> {
        let btn = match button {
            MouseButton::Left => Button::Left,
            MouseButton::Right => Button::Right,
        };
        let direction = if down {
            Direction::Press
        } else {
            Direction::Release
        };
        self.enigo
            .button(btn, direction)
            .map_err(|e| TabcastError::Input(format!("button {button:?}: {e}")))
    }

    fn wheel(&mut self, dx: i32, dy: i32) -> Result<()> {
        // enigo's positive vertical direction is scroll-down; ours is
        // wheel-up.
        if dy != 0 {
            self.enigo
                .scroll(-dy, Axis::Vertical)
                .map_err(|e| TabcastError::Input(format!("vertical scroll: {e}")))?;
        }
        if dx != 0 {
            self.enigo
                .scroll(dx, Axis::Horizontal)
                .map_err(|e| TabcastError::Input(format!("horizontal scroll: {e}")))?;
        }
        Ok(())
    }

    fn modifier(&mut self, key: ModifierKey, down: bool) -> Result<()> {
        let key = match key {
            ModifierKey::Ctrl => Key::Control,
        };
        let direction = if down {
            Direction::Press
        } else {
            Direction::Release
        };
        self.enigo
            .key(key, direction)
            .map_err(|e| TabcastError::Input(format!("modifier: {e}")))
    }
}
