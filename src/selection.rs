//! Grabbing the user's current selection from a foreign application.
//!
//! The technique: save the clipboard, clear it, send Ctrl+C, wait for the
//! foreground app to react, read, restore. It races against the target app's
//! responsiveness, so a first empty read gets exactly one retry with a longer
//! wait. An empty result is not an error; it means "nothing selected".

use crate::clipboard::ClipboardChannel;
use crate::input::KeystrokeSender;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

/// Fixed waits used around synthetic keystrokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTimings {
    /// Wait after Ctrl+C on the first capture attempt.
    pub copy_delay: Duration,
    /// Wait after Ctrl+C on the single retry.
    pub retry_delay: Duration,
    /// Wait after Ctrl+V before re-reading the selection.
    pub paste_settle: Duration,
    /// Wait used for the cheap selection re-checks around a paste.
    pub reselect_delay: Duration,
}

impl Default for CaptureTimings {
    fn default() -> Self {
        Self {
            copy_delay: Duration::from_millis(200),
            retry_delay: Duration::from_millis(500),
            paste_settle: Duration::from_millis(200),
            reselect_delay: Duration::from_millis(100),
        }
    }
}

impl CaptureTimings {
    /// All waits zero. Used by tests and by fake keystroke senders that act
    /// synchronously.
    pub fn immediate() -> Self {
        Self {
            copy_delay: Duration::ZERO,
            retry_delay: Duration::ZERO,
            paste_settle: Duration::ZERO,
            reselect_delay: Duration::ZERO,
        }
    }
}

#[derive(Clone)]
pub struct SelectionCapture {
    clipboard: ClipboardChannel,
    keys: Arc<dyn KeystrokeSender>,
    timings: CaptureTimings,
}

impl SelectionCapture {
    pub fn new(
        clipboard: ClipboardChannel,
        keys: Arc<dyn KeystrokeSender>,
        timings: CaptureTimings,
    ) -> Self {
        Self {
            clipboard,
            keys,
            timings,
        }
    }

    pub fn timings(&self) -> CaptureTimings {
        self.timings
    }

    pub fn clipboard(&self) -> &ClipboardChannel {
        &self.clipboard
    }

    pub fn keys(&self) -> &Arc<dyn KeystrokeSender> {
        &self.keys
    }

    /// Captures the selection with the configured first wait, retrying once
    /// with the longer wait when nothing came back.
    pub fn capture(&self) -> String {
        self.capture_with(self.timings.copy_delay)
    }

    /// Like [`capture`](Self::capture) but with an explicit first wait.
    pub fn capture_with(&self, first_delay: Duration) -> String {
        let text = self.capture_once(first_delay);
        if !text.is_empty() {
            return text;
        }

        debug!(
            "No text captured, retrying with longer wait ({:?})",
            self.timings.retry_delay
        );
        self.capture_once(self.timings.retry_delay)
    }

    /// One clear / copy / wait / read / restore cycle. The clipboard is
    /// restored when the guard goes out of scope on every path.
    pub fn capture_once(&self, delay: Duration) -> String {
        let guard = self.clipboard.scoped_swap(None);
        if !guard.is_armed() {
            warn!("Clipboard could not be saved, skipping selection capture");
            return String::new();
        }

        if let Err(e) = self.keys.send_copy() {
            warn!("Failed to simulate copy: {}", e);
            return String::new();
        }

        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let selected = guard.channel().read().trim().to_string();
        debug!(
            "Captured selection: {} chars (wait {:?})",
            selected.chars().count(),
            delay
        );
        selected
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::clipboard::MemoryClipboard;
    use crate::input::{KeyCombo, KeystrokeError, KeystrokeSender};
    use std::sync::{Arc, Mutex};

    /// Simulates a foreground application on top of a `MemoryClipboard`.
    ///
    /// `copies` is a script of what each Ctrl+C puts on the clipboard (`None`
    /// means the app did not react in time). When the script runs out, Ctrl+C
    /// copies `selection`. Ctrl+V clears `selection` unless the field is
    /// read-only.
    pub struct FakeApp {
        pub clipboard: MemoryClipboard,
        pub selection: Mutex<String>,
        pub copies: Mutex<Vec<Option<String>>>,
        pub read_only: bool,
        pub log: Mutex<Vec<KeyCombo>>,
        pub fail: bool,
    }

    impl FakeApp {
        pub fn new(clipboard: MemoryClipboard, selection: &str) -> Arc<Self> {
            Arc::new(Self {
                clipboard,
                selection: Mutex::new(selection.to_string()),
                copies: Mutex::new(Vec::new()),
                read_only: false,
                log: Mutex::new(Vec::new()),
                fail: false,
            })
        }

        pub fn with(
            clipboard: MemoryClipboard,
            selection: &str,
            copies: Vec<Option<&str>>,
            read_only: bool,
        ) -> Arc<Self> {
            Arc::new(Self {
                clipboard,
                selection: Mutex::new(selection.to_string()),
                copies: Mutex::new(copies.into_iter().map(|c| c.map(str::to_string)).collect()),
                read_only,
                log: Mutex::new(Vec::new()),
                fail: false,
            })
        }

        pub fn failing(clipboard: MemoryClipboard) -> Arc<Self> {
            Arc::new(Self {
                clipboard,
                selection: Mutex::new(String::new()),
                copies: Mutex::new(Vec::new()),
                read_only: false,
                log: Mutex::new(Vec::new()),
                fail: true,
            })
        }

        pub fn sent(&self) -> Vec<KeyCombo> {
            self.log.lock().unwrap().clone()
        }

        pub fn selection(&self) -> String {
            self.selection.lock().unwrap().clone()
        }
    }

    impl KeystrokeSender for FakeApp {
        fn send(&self, combo: KeyCombo) -> Result<(), KeystrokeError> {
            self.log.lock().unwrap().push(combo);
            if self.fail {
                return Err(KeystrokeError::Unavailable("no input device".into()));
            }
            match combo {
                KeyCombo::Copy => {
                    let mut copies = self.copies.lock().unwrap();
                    let next = if copies.is_empty() {
                        Some(self.selection())
                    } else {
                        copies.remove(0)
                    };
                    if let Some(text) = next {
                        self.clipboard.set(&text);
                    }
                }
                KeyCombo::Paste => {
                    // After a paste the pasted text is no longer selected.
                    if !self.read_only {
                        self.selection.lock().unwrap().clear();
                    }
                }
            }
            Ok(())
        }
    }
}
