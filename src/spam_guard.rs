//! Hotkey spam detection.
//!
//! A stuck key or a runaway macro can fire the global shortcut many times per
//! second. Every trigger captures the selection and dispatches an AI request,
//! so repeated firing is treated as fatal by the caller: `AppController` exits
//! the process when `record_trigger` reports spam.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding window in which triggers are counted.
pub const TRIGGER_WINDOW: Duration = Duration::from_millis(1500);
/// Number of triggers inside the window that counts as spam.
pub const MAX_TRIGGERS: usize = 3;

#[derive(Debug)]
pub struct SpamGuard {
    recent: VecDeque<Instant>,
    window: Duration,
    threshold: usize,
}

impl Default for SpamGuard {
    fn default() -> Self {
        Self::new(TRIGGER_WINDOW, MAX_TRIGGERS)
    }
}

impl SpamGuard {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(threshold + 1),
            window,
            threshold,
        }
    }

    /// Records a trigger at `now`. Returns true when spam is detected.
    pub fn record_trigger(&mut self, now: Instant) -> bool {
        self.recent.push_back(now);

        // Timestamps are pushed in order, so expired entries sit at the front.
        while let Some(&oldest) = self.recent.front() {
            if now.saturating_duration_since(oldest) > self.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }

        let spam = self.recent.len() >= self.threshold;
        if spam {
            log::warn!(
                "Hotkey spam: {} triggers within {:?}",
                self.recent.len(),
                self.window
            );
        }
        spam
    }

    pub fn recent_count(&self) -> usize {
        self.recent.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(base: Instant, secs: f64) -> Instant {
        base + Duration::from_secs_f64(secs)
    }

    #[test]
    fn three_quick_triggers_are_spam() {
        let base = Instant::now();
        let mut guard = SpamGuard::default();
        assert!(!guard.record_trigger(at(base, 0.0)));
        assert!(!guard.record_trigger(at(base, 0.5)));
        assert!(guard.record_trigger(at(base, 1.0)));
    }

    #[test]
    fn spaced_triggers_are_not_spam() {
        let base = Instant::now();
        let mut guard = SpamGuard::default();
        assert!(!guard.record_trigger(at(base, 0.0)));
        assert!(!guard.record_trigger(at(base, 1.0)));
        assert!(!guard.record_trigger(at(base, 2.1)));
        assert_eq!(guard.recent_count(), 2);
    }

    #[test]
    fn trigger_exactly_on_window_edge_is_kept() {
        let base = Instant::now();
        let mut guard = SpamGuard::default();
        guard.record_trigger(at(base, 0.0));
        guard.record_trigger(at(base, 0.75));
        assert!(guard.record_trigger(at(base, 1.5)));
    }

    #[test]
    fn old_burst_expires() {
        let base = Instant::now();
        let mut guard = SpamGuard::default();
        guard.record_trigger(at(base, 0.0));
        guard.record_trigger(at(base, 0.1));
        assert!(!guard.record_trigger(at(base, 5.0)));
        assert_eq!(guard.recent_count(), 1);
    }
}
