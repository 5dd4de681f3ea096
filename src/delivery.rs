//! Getting a finished result back to the user.
//!
//! Output first passes through [`OutputBuffer`], which holds back anything
//! that could still turn out to be the incompatibility sentinel. Results for
//! windowed actions are appended to the transcript by the coordinator; all
//! others are pasted over the selection by [`ResultDelivery::paste`].

use crate::actions::INCOMPATIBLE_SENTINEL;
use crate::selection::SelectionCapture;
use log::{debug, info, warn};

pub const INCOMPATIBLE_MESSAGE: &str = "The text is incompatible with the requested change.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferVerdict {
    /// Could still be the sentinel (or already was); deliver nothing.
    Pending,
    /// The full sentinel was recognized just now. Reported once per request.
    Incompatible,
    /// Safe to deliver.
    Ready(String),
}

/// Accumulates provider output for the live request.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    text: String,
    incompatible: bool,
}

fn without_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

impl OutputBuffer {
    pub fn clear(&mut self) {
        self.text.clear();
        self.incompatible = false;
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn push(&mut self, chunk: &str) -> BufferVerdict {
        if self.incompatible {
            return BufferVerdict::Pending;
        }
        self.text.push_str(chunk);
        let current = self.text.trim();

        if current == INCOMPATIBLE_SENTINEL {
            self.incompatible = true;
            info!("Provider reported the text as incompatible with the request");
            return BufferVerdict::Incompatible;
        }

        if current.len() <= INCOMPATIBLE_SENTINEL.len()
            && without_whitespace(INCOMPATIBLE_SENTINEL).starts_with(&without_whitespace(current))
        {
            debug!("Output is a prefix of the sentinel, holding back");
            return BufferVerdict::Pending;
        }

        BufferVerdict::Ready(self.text.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasteOutcome {
    /// The paste is assumed to have landed.
    Pasted,
    /// The paste could not be done or looked like it failed; show `text`
    /// read-only instead.
    Fallback(String),
}

/// Direct-replace delivery through the clipboard and Ctrl+V.
pub struct ResultDelivery {
    capture: SelectionCapture,
}

impl ResultDelivery {
    pub fn new(capture: SelectionCapture) -> Self {
        Self { capture }
    }

    /// Pastes `text` over the current selection and checks whether it took.
    ///
    /// The check is a heuristic: when a selection existed before the paste
    /// and the same selection is read back afterwards, the target is assumed
    /// to be read-only. It misreads a field that re-selects identical text
    /// after a successful paste, and cannot see failures when nothing was
    /// selected. The user's clipboard is restored on every path.
    pub fn paste(&self, text: &str) -> PasteOutcome {
        let cleaned = text.trim_end_matches('\n');
        let timings = self.capture.timings();

        let original_selection = self.capture.capture_once(timings.reselect_delay);

        let guard = self.capture.clipboard().scoped_swap(Some(cleaned));
        if !guard.is_armed() {
            warn!("Clipboard could not be saved, showing result instead of pasting");
            return PasteOutcome::Fallback(cleaned.to_string());
        }

        if let Err(e) = self.capture.keys().send_paste() {
            warn!("Failed to simulate paste: {}", e);
            return PasteOutcome::Fallback(cleaned.to_string());
        }

        if !timings.paste_settle.is_zero() {
            std::thread::sleep(timings.paste_settle);
        }

        let new_selection = self.capture.capture_once(timings.reselect_delay);
        guard.restore();

        if !original_selection.is_empty() && new_selection == original_selection {
            info!("Selection unchanged after paste, target looks read-only");
            return PasteOutcome::Fallback(cleaned.to_string());
        }

        debug!("Pasted {} chars", cleaned.chars().count());
        PasteOutcome::Pasted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::{ClipboardChannel, MemoryClipboard};
    use crate::input::KeyCombo;
    use crate::selection::test_support::FakeApp;
    use crate::selection::CaptureTimings;
    use std::sync::Arc;

    fn delivery_for(app: &Arc<FakeApp>) -> ResultDelivery {
        ResultDelivery::new(SelectionCapture::new(
            ClipboardChannel::new(app.clipboard.clone()),
            app.clone(),
            CaptureTimings::immediate(),
        ))
    }

    #[test]
    fn sentinel_and_its_prefixes_are_held_back() {
        for end in 1..=INCOMPATIBLE_SENTINEL.len() {
            let mut buffer = OutputBuffer::default();
            let verdict = buffer.push(&INCOMPATIBLE_SENTINEL[..end]);
            if end == INCOMPATIBLE_SENTINEL.len() {
                assert_eq!(verdict, BufferVerdict::Incompatible);
            } else {
                assert_eq!(verdict, BufferVerdict::Pending, "prefix len {}", end);
            }
        }
    }

    #[test]
    fn growing_sentinel_reports_once() {
        let mut buffer = OutputBuffer::default();
        let verdicts: Vec<_> = ["ERROR_TEXT", "_INCOMPATIBLE", "_WITH_REQUEST", "\n"]
            .iter()
            .map(|chunk| buffer.push(chunk))
            .collect();
        let reported = verdicts
            .iter()
            .filter(|v| **v == BufferVerdict::Incompatible)
            .count();
        assert_eq!(reported, 1);
        assert!(!verdicts.iter().any(|v| matches!(v, BufferVerdict::Ready(_))));
    }

    #[test]
    fn normal_text_is_ready() {
        let mut buffer = OutputBuffer::default();
        assert_eq!(
            buffer.push("Hello there"),
            BufferVerdict::Ready("Hello there".into())
        );
        buffer.clear();
        assert_eq!(buffer.text(), "");
    }

    #[test]
    fn text_that_starts_like_sentinel_but_diverges_is_ready() {
        let mut buffer = OutputBuffer::default();
        assert_eq!(buffer.push("ERROR"), BufferVerdict::Pending);
        assert!(matches!(buffer.push(" in line 3"), BufferVerdict::Ready(_)));
    }

    #[test]
    fn successful_paste_keeps_clipboard() {
        let memory = MemoryClipboard::with_text("user clip");
        let app = FakeApp::new(memory.clone(), "hello");
        let outcome = delivery_for(&app).paste("HELLO\n");
        assert_eq!(outcome, PasteOutcome::Pasted);
        assert_eq!(memory.get(), "user clip");
        assert_eq!(
            app.sent(),
            vec![KeyCombo::Copy, KeyCombo::Paste, KeyCombo::Copy]
        );
    }

    #[test]
    fn unchanged_selection_falls_back_once() {
        let memory = MemoryClipboard::with_text("user clip");
        let app = FakeApp::with(memory.clone(), "hello", Vec::new(), true);
        let outcome = delivery_for(&app).paste("HELLO");
        assert_eq!(outcome, PasteOutcome::Fallback("HELLO".into()));
        assert_eq!(memory.get(), "user clip");
    }

    #[test]
    fn different_selection_after_paste_is_success() {
        let memory = MemoryClipboard::with_text("clip");
        let app = FakeApp::with(
            memory.clone(),
            "",
            vec![Some("hello"), Some("something else")],
            false,
        );
        assert_eq!(delivery_for(&app).paste("x"), PasteOutcome::Pasted);
    }

    #[test]
    fn no_prior_selection_is_assumed_success() {
        let memory = MemoryClipboard::with_text("clip");
        let app = FakeApp::with(memory.clone(), "", Vec::new(), true);
        assert_eq!(delivery_for(&app).paste("x"), PasteOutcome::Pasted);
        assert_eq!(memory.get(), "clip");
    }

    #[test]
    fn keystroke_failure_falls_back() {
        let memory = MemoryClipboard::with_text("clip");
        let app = FakeApp::failing(memory.clone());
        assert_eq!(
            delivery_for(&app).paste("result"),
            PasteOutcome::Fallback("result".into())
        );
        assert_eq!(memory.get(), "clip");
    }
}
