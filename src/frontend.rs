//! The UI collaborator.
//!
//! Everything visible (choice popup, message boxes, response window,
//! read-only fallback) is requested through [`Frontend`]. Implementations run
//! on the UI thread only; user answers come back as [`UiEvent`]s posted to the
//! event loop, never as direct calls into the coordinator.

use crate::actions::ActionSpec;
use crate::conversation::Conversation;
use crate::coordinator::{EventSender, UiEvent};
use log::{error, info, warn};

/// A user-visible message box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub message: String,
    /// Whether the message box should carry an "Open Settings" button.
    pub offer_settings: bool,
}

impl Notification {
    /// Builds a notification, offering the settings shortcut when the title
    /// points at something the user fixes there.
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        let title = title.into();
        let lowered = title.to_lowercase();
        let offer_settings = ["api", "key", "quota", "rate limit", "connection", "settings"]
            .iter()
            .any(|needle| lowered.contains(needle));
        Self {
            title,
            message: message.into(),
            offer_settings,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }
}

pub trait Frontend {
    /// Shows the action picker for a fresh capture. The user's answer is
    /// posted later as `UiEvent::Choose` or `UiEvent::Dismiss` for `request_id`.
    fn present_choices(&mut self, request_id: u64, actions: &[ActionSpec], selected_text: &str);

    fn notify(&mut self, notification: &Notification);

    /// Opens the response window, or refreshes it if already open.
    fn show_response(&mut self, conversation: &Conversation);

    fn close_response(&mut self);

    /// Read-only modal with a copy button, used when pasting failed.
    fn show_read_only(&mut self, text: &str);

    fn close_read_only(&mut self);
}

/// Front end for running without a widget toolkit.
///
/// The action picker immediately answers with the configured default action
/// (or dismisses when none is set). Everything else goes to the log.
pub struct HeadlessFrontend {
    events: EventSender,
    default_action: Option<String>,
    read_only_open: bool,
}

impl HeadlessFrontend {
    pub fn new(events: EventSender, default_action: Option<String>) -> Self {
        Self {
            events,
            default_action,
            read_only_open: false,
        }
    }
}

impl Frontend for HeadlessFrontend {
    fn present_choices(&mut self, request_id: u64, actions: &[ActionSpec], selected_text: &str) {
        let chosen = self
            .default_action
            .as_deref()
            .and_then(|name| actions.iter().find(|a| a.name == name));

        let event = match chosen {
            Some(action) => {
                info!(
                    "Auto-selecting '{}' for {} chars of selection",
                    action.name,
                    selected_text.chars().count()
                );
                UiEvent::Choose {
                    request_id,
                    action: action.name.clone(),
                    instruction: None,
                }
            }
            None => {
                warn!("No default action configured, dismissing choice");
                UiEvent::Dismiss { request_id }
            }
        };

        if self.events.send(event).is_err() {
            error!("Event loop is gone, choice dropped");
        }
    }

    fn notify(&mut self, notification: &Notification) {
        warn!(
            "[{}] {}{}",
            notification.title,
            notification.message,
            if notification.offer_settings {
                " (check settings)"
            } else {
                ""
            }
        );
    }

    fn show_response(&mut self, conversation: &Conversation) {
        if let Some(last) = conversation.last() {
            info!(
                "[{}] {}: {}",
                conversation.title(),
                last.role.as_str(),
                last.content
            );
        }
    }

    fn close_response(&mut self) {
        info!("Response window closed");
    }

    fn show_read_only(&mut self, text: &str) {
        self.read_only_open = true;
        info!("Could not paste into the target field; result:\n{}", text);
    }

    fn close_read_only(&mut self) {
        if self.read_only_open {
            self.read_only_open = false;
            info!("Read-only result closed");
        }
    }
}
