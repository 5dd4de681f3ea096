//! Synthetic copy/paste keystrokes sent to the foreground application.

use enigo::{Direction, Enigo, Key, Keyboard, Settings};
#[cfg(target_os = "linux")]
use log::{debug, info};
use std::sync::Mutex;
use thiserror::Error;

#[cfg(target_os = "linux")]
use std::process::Command;

#[derive(Debug, Error)]
pub enum KeystrokeError {
    #[error("keyboard simulation unavailable: {0}")]
    Unavailable(String),
    #[error("failed to send {combo:?}: {reason}")]
    Send { combo: KeyCombo, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCombo {
    Copy,
    Paste,
}

impl KeyCombo {
    fn letter(self) -> char {
        match self {
            KeyCombo::Copy => 'c',
            KeyCombo::Paste => 'v',
        }
    }
}

/// Issues OS-level keystrokes. Implementations must be callable from the UI
/// thread and from worker threads.
pub trait KeystrokeSender: Send + Sync {
    fn send(&self, combo: KeyCombo) -> Result<(), KeystrokeError>;

    fn send_copy(&self) -> Result<(), KeystrokeError> {
        self.send(KeyCombo::Copy)
    }

    fn send_paste(&self) -> Result<(), KeystrokeError> {
        self.send(KeyCombo::Paste)
    }
}

/// Keystrokes through `enigo`, preferring native command-line tools on Linux.
pub struct EnigoKeystrokes {
    // Created lazily: on Linux without a display Enigo::new fails, and the
    // native tools may still work.
    enigo: Mutex<Option<Enigo>>,
}

impl Default for EnigoKeystrokes {
    fn default() -> Self {
        Self::new()
    }
}

impl EnigoKeystrokes {
    pub fn new() -> Self {
        Self {
            enigo: Mutex::new(None),
        }
    }

    fn send_with_enigo(&self, combo: KeyCombo) -> Result<(), KeystrokeError> {
        let mut guard = self.enigo.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            let enigo = Enigo::new(&Settings::default())
                .map_err(|e| KeystrokeError::Unavailable(e.to_string()))?;
            *guard = Some(enigo);
        }
        let Some(enigo) = guard.as_mut() else {
            return Err(KeystrokeError::Unavailable("enigo not initialized".into()));
        };

        let send_err = |e: enigo::InputError| KeystrokeError::Send {
            combo,
            reason: e.to_string(),
        };

        #[cfg(target_os = "macos")]
        let modifier = Key::Meta;
        #[cfg(not(target_os = "macos"))]
        let modifier = Key::Control;

        enigo.key(modifier, Direction::Press).map_err(send_err)?;
        let clicked = enigo.key(Key::Unicode(combo.letter()), Direction::Click);
        // Always release the modifier, even if the click failed.
        let released = enigo.key(modifier, Direction::Release);
        clicked.map_err(send_err)?;
        released.map_err(send_err)?;
        Ok(())
    }
}

impl KeystrokeSender for EnigoKeystrokes {
    fn send(&self, combo: KeyCombo) -> Result<(), KeystrokeError> {
        #[cfg(target_os = "linux")]
        {
            if try_send_key_combo_linux(combo)? {
                return Ok(());
            }
            debug!("Falling back to enigo for {:?}", combo);
        }

        self.send_with_enigo(combo)
    }
}

/// Attempts to send a key combination using Linux-native tools.
/// Returns `Ok(true)` if a native tool handled it, `Ok(false)` to fall back to enigo.
#[cfg(target_os = "linux")]
fn try_send_key_combo_linux(combo: KeyCombo) -> Result<bool, KeystrokeError> {
    let tools: &[NativeTool] = if is_wayland() {
        &[NativeTool::Wtype, NativeTool::Ydotool]
    } else {
        &[NativeTool::Xdotool, NativeTool::Ydotool]
    };

    for tool in tools {
        if tool.is_available() {
            info!("Using {} for {:?}", tool.binary(), combo);
            tool.send(combo)?;
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy)]
enum NativeTool {
    Xdotool,
    Wtype,
    Ydotool,
}

#[cfg(target_os = "linux")]
impl NativeTool {
    fn binary(self) -> &'static str {
        match self {
            NativeTool::Xdotool => "xdotool",
            NativeTool::Wtype => "wtype",
            NativeTool::Ydotool => "ydotool",
        }
    }

    fn is_available(self) -> bool {
        Command::new("which")
            .arg(self.binary())
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    fn args(self, combo: KeyCombo) -> Vec<&'static str> {
        match (self, combo) {
            (NativeTool::Xdotool, KeyCombo::Copy) => vec!["key", "--clearmodifiers", "ctrl+c"],
            (NativeTool::Xdotool, KeyCombo::Paste) => vec!["key", "--clearmodifiers", "ctrl+v"],
            (NativeTool::Wtype, KeyCombo::Copy) => vec!["-M", "ctrl", "-k", "c", "-m", "ctrl"],
            (NativeTool::Wtype, KeyCombo::Paste) => vec!["-M", "ctrl", "-k", "v", "-m", "ctrl"],
            // Linux input event keycodes: ctrl=29, c=46, v=47; <code>:1 down, <code>:0 up.
            (NativeTool::Ydotool, KeyCombo::Copy) => vec!["key", "29:1", "46:1", "46:0", "29:0"],
            (NativeTool::Ydotool, KeyCombo::Paste) => vec!["key", "29:1", "47:1", "47:0", "29:0"],
        }
    }

    fn send(self, combo: KeyCombo) -> Result<(), KeystrokeError> {
        let output = Command::new(self.binary())
            .args(self.args(combo))
            .output()
            .map_err(|e| KeystrokeError::Send {
                combo,
                reason: format!("failed to execute {}: {}", self.binary(), e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(KeystrokeError::Send {
                combo,
                reason: format!("{} failed: {}", self.binary(), stderr.trim()),
            });
        }
        Ok(())
    }
}

/// Check if using the Wayland display server protocol
#[cfg(target_os = "linux")]
pub fn is_wayland() -> bool {
    std::env::var("WAYLAND_DISPLAY").is_ok()
        || std::env::var("XDG_SESSION_TYPE")
            .map(|v| v.eq_ignore_ascii_case("wayland"))
            .unwrap_or(false)
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn ydotool_copy_and_paste_differ_only_in_letter_key() {
        let copy = NativeTool::Ydotool.args(KeyCombo::Copy);
        let paste = NativeTool::Ydotool.args(KeyCombo::Paste);
        assert_eq!(copy.len(), paste.len());
        assert_eq!(copy[1], "29:1");
        assert_eq!(copy[2], "46:1");
        assert_eq!(paste[2], "47:1");
    }

    #[test]
    fn xdotool_clears_held_modifiers() {
        // The hotkey's own modifiers are usually still held when we fire.
        assert!(NativeTool::Xdotool
            .args(KeyCombo::Copy)
            .contains(&"--clearmodifiers"));
    }
}
