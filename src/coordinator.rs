//! Trigger → capture → choice → dispatch → delivery.
//!
//! `RequestCoordinator` lives on the UI thread and is driven by [`UiEvent`]s.
//! Provider calls run on one short-lived worker thread per request; their
//! results come back through the same event queue. At most one request is
//! live at a time: every trigger and every dispatch cancels the previous one,
//! and a result is only delivered if its request id is still the live one.

use crate::actions::{prepare_request, ActionSource, DeliveryTarget, PreparedRequest};
use crate::conversation::Conversation;
use crate::delivery::{BufferVerdict, OutputBuffer, PasteOutcome, ResultDelivery, INCOMPATIBLE_MESSAGE};
use crate::frontend::{Frontend, Notification};
use crate::providers::{ChatRequest, ProviderError, ProviderGateway};
use crate::selection::SelectionCapture;
use crate::spam_guard::SpamGuard;
use log::{debug, error, info, warn};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Everything the UI thread's event loop reacts to.
#[derive(Debug)]
pub enum UiEvent {
    /// The global hotkey fired. `at` is stamped by the listener, not when
    /// the event is dequeued.
    Trigger { at: Instant },
    /// The user picked an action in the choice popup.
    Choose {
        request_id: u64,
        action: String,
        instruction: Option<String>,
    },
    /// The choice popup was closed without a pick.
    Dismiss { request_id: u64 },
    /// A worker finished.
    ProviderResult {
        request_id: u64,
        outcome: Result<String, ProviderError>,
    },
    /// A follow-up question typed into the response window.
    FollowUp { question: String },
    CloseResponse,
    CloseReadOnly,
    TogglePause,
    ChangeHotkey(String),
    SwitchProvider(String),
    Exit,
}

pub type EventSender = mpsc::Sender<UiEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    SpamChecking,
    Cancelling,
    Capturing,
    AwaitingChoice,
    Dispatching,
    Delivering,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The choice popup is up for this request id.
    AwaitingChoice(u64),
    /// Too many triggers; the application must exit.
    Spam,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Replace,
    Window,
    FollowUp,
}

/// The one request allowed to deliver.
struct PendingRequest {
    id: u64,
    action: String,
    selected_text: String,
    custom_instruction: Option<String>,
    kind: RequestKind,
    provider: &'static str,
    cancel: CancellationToken,
}

struct Captured {
    id: u64,
    selected_text: String,
}

pub struct RequestCoordinator {
    state: CoordinatorState,
    spam: SpamGuard,
    capture: SelectionCapture,
    delivery: ResultDelivery,
    gateway: Arc<ProviderGateway>,
    actions: Arc<dyn ActionSource>,
    events: EventSender,
    next_id: u64,
    captured: Option<Captured>,
    live: Option<PendingRequest>,
    buffer: OutputBuffer,
    conversation: Option<Conversation>,
    read_only_open: bool,
}

impl RequestCoordinator {
    pub fn new(
        capture: SelectionCapture,
        gateway: Arc<ProviderGateway>,
        actions: Arc<dyn ActionSource>,
        events: EventSender,
    ) -> Self {
        Self {
            state: CoordinatorState::Idle,
            spam: SpamGuard::default(),
            delivery: ResultDelivery::new(capture.clone()),
            capture,
            gateway,
            actions,
            events,
            next_id: 0,
            captured: None,
            live: None,
            buffer: OutputBuffer::default(),
            conversation: None,
            read_only_open: false,
        }
    }

    pub fn with_spam_guard(mut self, spam: SpamGuard) -> Self {
        self.spam = spam;
        self
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        self.conversation.as_ref()
    }

    /// Id of the request allowed to deliver, if any.
    pub fn live_request(&self) -> Option<u64> {
        self.live.as_ref().map(|r| r.id)
    }

    pub fn gateway(&self) -> &Arc<ProviderGateway> {
        &self.gateway
    }

    fn set_state(&mut self, state: CoordinatorState) {
        if self.state != state {
            debug!("Coordinator: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn next_request_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Hotkey fired.
    pub fn on_trigger(&mut self, now: Instant, ui: &mut dyn Frontend) -> TriggerOutcome {
        if self.state == CoordinatorState::ShuttingDown {
            return TriggerOutcome::Spam;
        }

        self.set_state(CoordinatorState::SpamChecking);
        if self.spam.record_trigger(now) {
            error!("Hotkey triggered too often, shutting down");
            self.shutdown();
            return TriggerOutcome::Spam;
        }

        self.set_state(CoordinatorState::Cancelling);
        self.cancel_live();
        self.captured = None;
        if self.read_only_open {
            self.read_only_open = false;
            ui.close_read_only();
        }

        self.set_state(CoordinatorState::Capturing);
        let selected_text = self.capture.capture();
        let id = self.next_request_id();
        info!(
            "Request {}: captured {} chars",
            id,
            selected_text.chars().count()
        );

        self.set_state(CoordinatorState::AwaitingChoice);
        let actions = self.actions.get_actions();
        self.captured = Some(Captured {
            id,
            selected_text: selected_text.clone(),
        });
        ui.present_choices(id, &actions, &selected_text);
        TriggerOutcome::AwaitingChoice(id)
    }

    /// The user dismissed the choice popup.
    pub fn dismiss(&mut self, request_id: u64) {
        if self.captured.as_ref().is_some_and(|c| c.id == request_id) {
            debug!("Request {} dismissed", request_id);
            self.captured = None;
            self.set_state(CoordinatorState::Idle);
        }
    }

    /// The user picked `action_name` for the capture `request_id`. Returns
    /// whether a provider request was dispatched.
    pub fn choose(
        &mut self,
        request_id: u64,
        action_name: &str,
        instruction: Option<&str>,
        ui: &mut dyn Frontend,
    ) -> bool {
        let Some(captured) = self.captured.take_if(|c| c.id == request_id) else {
            debug!("Ignoring choice for stale request {}", request_id);
            return false;
        };

        let Some(action) = self.actions.find(action_name) else {
            error!("Action not found: {}", action_name);
            ui.notify(&Notification::error(format!("Unknown action '{}'.", action_name)));
            self.set_state(CoordinatorState::Idle);
            return false;
        };

        match prepare_request(&action, &captured.selected_text, instruction) {
            Ok(prepared) => {
                let kind = match prepared.target {
                    DeliveryTarget::Replace => RequestKind::Replace,
                    DeliveryTarget::Window(_) => RequestKind::Window,
                };
                let pending = PendingMeta {
                    id: captured.id,
                    action: action.name.clone(),
                    selected_text: captured.selected_text,
                    custom_instruction: instruction.map(str::to_string),
                    kind,
                };
                self.dispatch(pending, prepared, ui)
            }
            Err(notification) => {
                info!("Request {} rejected: {}", request_id, notification.message);
                ui.notify(&notification);
                self.set_state(CoordinatorState::Idle);
                false
            }
        }
    }

    /// A follow-up question asked inside the response window.
    pub fn follow_up(&mut self, question: &str, ui: &mut dyn Frontend) -> bool {
        let question = question.trim();
        if question.is_empty() {
            return false;
        }
        let id = self.next_request_id();
        let Some(conversation) = self.conversation.as_mut() else {
            ui.notify(&Notification::error("Chat history not found"));
            return false;
        };
        let request = conversation.ask_followup(question);
        ui.show_response(conversation);
        let meta = PendingMeta {
            id,
            action: conversation.title().to_string(),
            selected_text: String::new(),
            custom_instruction: Some(question.to_string()),
            kind: RequestKind::FollowUp,
        };
        self.start_worker(meta, request, None, ui)
    }

    fn dispatch(
        &mut self,
        meta: PendingMeta,
        prepared: PreparedRequest,
        ui: &mut dyn Frontend,
    ) -> bool {
        let window = match prepared.target {
            DeliveryTarget::Window(conversation) => Some(conversation),
            DeliveryTarget::Replace => None,
        };
        self.start_worker(meta, prepared.request, window, ui)
    }

    /// Binds the request to the current provider and spawns its worker. A
    /// new response window is only opened once a provider was bound.
    fn start_worker(
        &mut self,
        meta: PendingMeta,
        request: ChatRequest,
        window: Option<Conversation>,
        ui: &mut dyn Frontend,
    ) -> bool {
        self.set_state(CoordinatorState::Dispatching);
        self.cancel_live();

        let bound = match self.gateway.begin() {
            Ok(bound) => bound,
            Err(e) => {
                let provider = self
                    .gateway
                    .current_provider()
                    .map(|p| p.display_name())
                    .unwrap_or("the AI provider");
                if let Some(notification) = e.notification(provider) {
                    ui.notify(&notification);
                }
                self.settle();
                return false;
            }
        };

        if let Some(conversation) = window {
            ui.show_response(&conversation);
            self.conversation = Some(conversation);
        }

        let id = meta.id;
        let provider = bound.provider_name();
        let cancel = bound.token().clone();
        let events = self.events.clone();

        info!(
            "Request {}: dispatching '{}' to {}",
            id, meta.action, provider
        );
        let spawned = std::thread::Builder::new()
            .name(format!("request-{}", id))
            .spawn(move || {
                let outcome = bound.send(&request);
                if bound.is_cancelled() {
                    debug!("Request {} cancelled, result dropped", id);
                    return;
                }
                if events
                    .send(UiEvent::ProviderResult {
                        request_id: id,
                        outcome,
                    })
                    .is_err()
                {
                    warn!("Event loop gone, result of request {} dropped", id);
                }
            });

        if let Err(e) = spawned {
            error!("Failed to spawn request worker: {}", e);
            cancel.cancel();
            ui.notify(&Notification::error(format!("Could not start the request: {}", e)));
            self.settle();
            return false;
        }

        self.live = Some(PendingRequest {
            id,
            action: meta.action,
            selected_text: meta.selected_text,
            custom_instruction: meta.custom_instruction,
            kind: meta.kind,
            provider,
            cancel,
        });
        self.settle();
        true
    }

    /// Back to waiting: a choice popup still up keeps its state.
    fn settle(&mut self) {
        if self.captured.is_some() {
            self.set_state(CoordinatorState::AwaitingChoice);
        } else {
            self.set_state(CoordinatorState::Idle);
        }
    }

    /// A worker's result arrived on the UI thread.
    pub fn on_provider_result(
        &mut self,
        request_id: u64,
        outcome: Result<String, ProviderError>,
        ui: &mut dyn Frontend,
    ) {
        let Some(request) = self
            .live
            .take_if(|r| r.id == request_id && !r.cancel.is_cancelled())
        else {
            debug!("Dropping result of superseded request {}", request_id);
            return;
        };

        self.set_state(CoordinatorState::Delivering);
        match outcome {
            Ok(text) => self.deliver(&request, &text, ui),
            Err(ProviderError::Cancelled) => {}
            Err(e) => {
                warn!(
                    "Request {} ('{}') failed on {}: {}",
                    request.id, request.action, request.provider, e
                );
                if request.kind == RequestKind::FollowUp {
                    if let Some(conversation) = self.conversation.as_mut() {
                        conversation.append_followup_error();
                        ui.show_response(conversation);
                    }
                }
                if let Some(notification) = e.notification(request.provider) {
                    ui.notify(&notification);
                }
            }
        }
        self.buffer.clear();
        self.settle();
    }

    fn deliver(&mut self, request: &PendingRequest, text: &str, ui: &mut dyn Frontend) {
        let full = match self.buffer.push(text) {
            BufferVerdict::Ready(full) => full,
            BufferVerdict::Incompatible => {
                ui.notify(&Notification::error(INCOMPATIBLE_MESSAGE));
                return;
            }
            BufferVerdict::Pending => {
                debug!("Request {}: output withheld", request.id);
                return;
            }
        };

        match request.kind {
            RequestKind::Window | RequestKind::FollowUp => match self.conversation.as_mut() {
                Some(conversation) => {
                    conversation.append_answer(&full);
                    ui.show_response(conversation);
                }
                None => debug!("Response window closed before request {} finished", request.id),
            },
            RequestKind::Replace => {
                debug!(
                    "Request {}: replacing {} chars of selection",
                    request.id,
                    request.selected_text.chars().count()
                );
                if let PasteOutcome::Fallback(text) = self.delivery.paste(&full) {
                    self.read_only_open = true;
                    ui.show_read_only(&text);
                }
            }
        }
    }

    /// Response window closed: the transcript is discarded and a pending
    /// answer for it will not be delivered.
    pub fn close_response(&mut self, ui: &mut dyn Frontend) {
        if self
            .live
            .as_ref()
            .is_some_and(|r| r.kind != RequestKind::Replace)
        {
            self.cancel_live();
        }
        if self.conversation.take().is_some() {
            ui.close_response();
        }
    }

    pub fn close_read_only(&mut self, ui: &mut dyn Frontend) {
        if self.read_only_open {
            self.read_only_open = false;
            ui.close_read_only();
        }
    }

    fn cancel_live(&mut self) {
        self.gateway.cancel();
        if let Some(request) = self.live.take() {
            debug!(
                "Cancelling request {} ('{}', custom instruction: {})",
                request.id,
                request.action,
                request.custom_instruction.is_some()
            );
            request.cancel.cancel();
        }
        self.buffer.clear();
    }

    pub fn shutdown(&mut self) {
        self.cancel_live();
        self.captured = None;
        self.set_state(CoordinatorState::ShuttingDown);
    }
}

/// Request details known before the provider is bound.
struct PendingMeta {
    id: u64,
    action: String,
    selected_text: String,
    custom_instruction: Option<String>,
    kind: RequestKind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::default_actions;
    use crate::clipboard::{ClipboardChannel, MemoryClipboard};
    use crate::selection::test_support::FakeApp;
    use crate::selection::CaptureTimings;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        choices: Vec<u64>,
        notes: Vec<Notification>,
        responses: usize,
    }

    impl Frontend for Recorder {
        fn present_choices(&mut self, request_id: u64, _: &[crate::actions::ActionSpec], _: &str) {
            self.choices.push(request_id);
        }
        fn notify(&mut self, notification: &Notification) {
            self.notes.push(notification.clone());
        }
        fn show_response(&mut self, _: &Conversation) {
            self.responses += 1;
        }
        fn close_response(&mut self) {}
        fn show_read_only(&mut self, _: &str) {}
        fn close_read_only(&mut self) {}
    }

    fn coordinator(selection: &str) -> (RequestCoordinator, mpsc::Receiver<UiEvent>, MemoryClipboard) {
        let memory = MemoryClipboard::with_text("clip");
        let app = FakeApp::new(memory.clone(), selection);
        let capture = SelectionCapture::new(
            ClipboardChannel::new(memory.clone()),
            app,
            CaptureTimings::immediate(),
        );
        let (tx, rx) = mpsc::channel();
        let gateway = Arc::new(ProviderGateway::with_providers(Vec::new()));
        let coordinator =
            RequestCoordinator::new(capture, gateway, Arc::new(default_actions()), tx);
        (coordinator, rx, memory)
    }

    #[test]
    fn trigger_captures_and_awaits_choice() {
        let (mut coordinator, _rx, memory) = coordinator("some text");
        let mut ui = Recorder::default();
        let outcome = coordinator.on_trigger(Instant::now(), &mut ui);
        assert_eq!(outcome, TriggerOutcome::AwaitingChoice(1));
        assert_eq!(coordinator.state(), CoordinatorState::AwaitingChoice);
        assert_eq!(ui.choices, vec![1]);
        assert_eq!(memory.get(), "clip");
    }

    #[test]
    fn dismiss_returns_to_idle_without_side_effects() {
        let (mut coordinator, rx, _) = coordinator("x");
        let mut ui = Recorder::default();
        coordinator.on_trigger(Instant::now(), &mut ui);
        coordinator.dismiss(1);
        assert_eq!(coordinator.state(), CoordinatorState::Idle);
        assert!(ui.notes.is_empty());
        assert!(rx.try_recv().is_err());
        // A late choice for the dismissed request is ignored.
        assert!(!coordinator.choose(1, "Proofread", None, &mut ui));
    }

    #[test]
    fn third_quick_trigger_shuts_down() {
        let (mut coordinator, _rx, _) = coordinator("x");
        let mut ui = Recorder::default();
        let base = Instant::now();
        coordinator.on_trigger(base, &mut ui);
        coordinator.on_trigger(base + Duration::from_millis(400), &mut ui);
        let outcome = coordinator.on_trigger(base + Duration::from_millis(800), &mut ui);
        assert_eq!(outcome, TriggerOutcome::Spam);
        assert_eq!(coordinator.state(), CoordinatorState::ShuttingDown);
    }

    #[test]
    fn missing_provider_is_reported() {
        let (mut coordinator, _rx, _) = coordinator("text");
        let mut ui = Recorder::default();
        coordinator.on_trigger(Instant::now(), &mut ui);
        assert!(!coordinator.choose(1, "Proofread", None, &mut ui));
        assert_eq!(ui.notes.len(), 1);
        assert_eq!(ui.notes[0].title, "Settings Required");
        assert_eq!(coordinator.state(), CoordinatorState::Idle);
    }

    #[test]
    fn window_stays_closed_when_no_provider_is_bound() {
        let (mut coordinator, _rx, _) = coordinator("long text");
        let mut ui = Recorder::default();
        coordinator.on_trigger(Instant::now(), &mut ui);
        assert!(!coordinator.choose(1, "Summary", None, &mut ui));
        assert_eq!(ui.responses, 0);
        assert!(coordinator.conversation().is_none());
        assert_eq!(ui.notes[0].title, "Settings Required");
    }

    #[test]
    fn follow_up_without_window_keeps_pending_choice() {
        let (mut coordinator, rx, _) = coordinator("text");
        let mut ui = Recorder::default();
        coordinator.on_trigger(Instant::now(), &mut ui);
        assert!(!coordinator.follow_up("anything else?", &mut ui));
        assert_eq!(coordinator.state(), CoordinatorState::AwaitingChoice);
        assert!(rx.try_recv().is_err());
        // The popup's request is still choosable.
        assert!(!coordinator.choose(1, "Proofread", None, &mut ui));
        assert_eq!(ui.notes.last().unwrap().title, "Settings Required");
    }

    #[test]
    fn stale_result_is_dropped() {
        let (mut coordinator, _rx, _) = coordinator("text");
        let mut ui = Recorder::default();
        coordinator.on_provider_result(42, Ok("late".into()), &mut ui);
        assert!(ui.notes.is_empty());
        assert_eq!(coordinator.state(), CoordinatorState::Idle);
    }
}
