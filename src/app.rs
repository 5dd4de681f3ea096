//! Application controller and the UI-thread event loop.

use crate::coordinator::{EventSender, RequestCoordinator, TriggerOutcome, UiEvent};
use crate::frontend::{Frontend, Notification};
use crate::hotkey::{GlobalHotkey, HotkeyError, Shortcut};
use crate::settings::SharedSettings;
use log::{debug, error, info, warn};
use std::ops::ControlFlow;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

/// Owns everything that lives on the UI thread and dispatches [`UiEvent`]s.
pub struct AppController {
    settings: SharedSettings,
    hotkey: Arc<dyn GlobalHotkey>,
    coordinator: RequestCoordinator,
    frontend: Box<dyn Frontend>,
    events: EventSender,
    receiver: Receiver<UiEvent>,
    exiting: bool,
}

impl AppController {
    pub fn new(
        settings: SharedSettings,
        hotkey: Arc<dyn GlobalHotkey>,
        coordinator: RequestCoordinator,
        frontend: Box<dyn Frontend>,
        events: EventSender,
        receiver: Receiver<UiEvent>,
    ) -> Self {
        Self {
            settings,
            hotkey,
            coordinator,
            frontend,
            events,
            receiver,
            exiting: false,
        }
    }

    /// Sender for posting events to this controller from other threads.
    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    pub fn coordinator(&self) -> &RequestCoordinator {
        &self.coordinator
    }

    /// Registers the configured hotkey. A registration failure is surfaced
    /// and the app keeps running without a hotkey.
    pub fn start(&mut self) {
        let settings = self.settings.get();
        match self.hotkey.register(&settings.hotkey) {
            Ok(()) => info!("Listening for {}", settings.hotkey),
            Err(e) => {
                error!("Hotkey registration failed: {}", e);
                self.frontend.notify(&Notification::new(
                    "Hotkey Settings",
                    format!(
                        "Could not register the shortcut '{}': {}\n\nChoose another shortcut in Settings.",
                        settings.hotkey, e
                    ),
                ));
            }
        }
        if settings.start_paused {
            self.hotkey.set_paused(true);
        }
    }

    /// Processes events until `exit_app` runs or every sender is gone.
    pub fn run(&mut self) {
        self.start();
        while !self.exiting {
            match self.receiver.recv() {
                Ok(event) => {
                    if self.handle_event(event).is_break() {
                        break;
                    }
                }
                Err(_) => {
                    debug!("All event senders dropped");
                    break;
                }
            }
        }
        self.exit_app();
    }

    /// Handles whatever is queued without blocking. Returns the number of
    /// events handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.receiver.try_recv() {
            handled += 1;
            if self.handle_event(event).is_break() {
                break;
            }
        }
        handled
    }

    pub fn handle_event(&mut self, event: UiEvent) -> ControlFlow<()> {
        if self.exiting {
            return ControlFlow::Break(());
        }
        match event {
            UiEvent::Trigger { at } => {
                let outcome = self.coordinator.on_trigger(at, self.frontend.as_mut());
                if outcome == TriggerOutcome::Spam {
                    self.exit_app();
                    return ControlFlow::Break(());
                }
            }
            UiEvent::Choose {
                request_id,
                action,
                instruction,
            } => {
                self.coordinator.choose(
                    request_id,
                    &action,
                    instruction.as_deref(),
                    self.frontend.as_mut(),
                );
            }
            UiEvent::Dismiss { request_id } => self.coordinator.dismiss(request_id),
            UiEvent::ProviderResult {
                request_id,
                outcome,
            } => {
                self.coordinator
                    .on_provider_result(request_id, outcome, self.frontend.as_mut());
            }
            UiEvent::FollowUp { question } => {
                self.coordinator.follow_up(&question, self.frontend.as_mut());
            }
            UiEvent::CloseResponse => self.coordinator.close_response(self.frontend.as_mut()),
            UiEvent::CloseReadOnly => self.coordinator.close_read_only(self.frontend.as_mut()),
            UiEvent::TogglePause => {
                self.toggle_paused();
            }
            UiEvent::ChangeHotkey(binding) => {
                // Failure is already surfaced to the user.
                let _ = self.change_hotkey(&binding);
            }
            UiEvent::SwitchProvider(name) => {
                self.switch_provider(&name);
            }
            UiEvent::Exit => {
                self.exit_app();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Flips the paused flag and returns the new state.
    pub fn toggle_paused(&mut self) -> bool {
        let paused = !self.hotkey.is_paused();
        self.hotkey.set_paused(paused);
        paused
    }

    /// Rebinds the hotkey. The new binding is validated before the old one is
    /// dropped; when registering it fails the previous binding is restored.
    pub fn change_hotkey(&mut self, binding: &str) -> Result<(), HotkeyError> {
        if let Err(e) = Shortcut::parse(binding) {
            warn!("Rejected hotkey '{}': {}", binding, e);
            self.frontend.notify(&Notification::new(
                "Invalid Shortcut",
                format!("'{}' is not a valid shortcut: {}", binding, e),
            ));
            return Err(e);
        }

        let previous = self.hotkey.binding();
        self.hotkey.unregister();

        if let Err(e) = self.hotkey.register(binding) {
            error!("Failed to register '{}': {}", binding, e);
            if let Some(previous) = &previous {
                match self.hotkey.register(previous) {
                    Ok(()) => info!("Restored previous hotkey {}", previous),
                    Err(restore_err) => {
                        error!("Failed to restore hotkey '{}': {}", previous, restore_err)
                    }
                }
            }
            self.frontend.notify(&Notification::new(
                "Hotkey Settings",
                format!("Could not register the shortcut '{}': {}", binding, e),
            ));
            return Err(e);
        }

        let binding = binding.to_string();
        if let Err(e) = self.settings.update(|s| s.hotkey = binding) {
            warn!("Hotkey changed but not saved: {}", e);
        }
        Ok(())
    }

    /// Makes `name` the provider for new requests. Requests already in
    /// flight keep the provider they were bound to.
    pub fn switch_provider(&mut self, name: &str) -> bool {
        let gateway = self.coordinator.gateway().clone();
        if !gateway.set_current(name) {
            self.frontend.notify(&Notification::new(
                "Settings Required",
                format!("Unknown AI provider '{}'. Using the first configured provider.", name),
            ));
            return false;
        }
        let name = name.to_string();
        if let Err(e) = self.settings.update(|s| s.provider = name) {
            warn!("Provider changed but not saved: {}", e);
        }
        true
    }

    /// Stops the hotkey, cancels any live request and ends the event loop.
    /// Safe to call more than once.
    pub fn exit_app(&mut self) {
        if self.exiting {
            return;
        }
        self.exiting = true;
        info!("Shutting down");
        self.stop();
    }

    /// Unregisters the hotkey, cancels any live request and closes open
    /// windows. The event loop keeps running until `exit_app`.
    pub fn stop(&mut self) {
        self.hotkey.unregister();
        self.coordinator.shutdown();
        self.coordinator.close_read_only(self.frontend.as_mut());
        self.coordinator.close_response(self.frontend.as_mut());
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting
    }
}

/// Routes SIGINT and SIGTERM to `UiEvent::Exit`.
#[cfg(unix)]
pub fn forward_signals(events: EventSender) -> anyhow::Result<()> {
    use anyhow::Context;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("failed to install signal handler")?;
    std::thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!("Received signal {}, exiting", signal);
                let _ = events.send(UiEvent::Exit);
            }
        })
        .context("failed to spawn signal thread")?;
    Ok(())
}

#[cfg(not(unix))]
pub fn forward_signals(_events: EventSender) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{default_actions, ActionSpec};
    use crate::clipboard::{ClipboardChannel, MemoryClipboard};
    use crate::conversation::Conversation;
    use crate::providers::ProviderGateway;
    use crate::selection::test_support::FakeApp;
    use crate::selection::{CaptureTimings, SelectionCapture};
    use crate::settings::get_default_settings;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Mutex};
    use std::time::{Duration, Instant};

    /// Records registrations; bindings listed in `refuse` fail to register.
    #[derive(Default)]
    struct FakeHotkey {
        current: Mutex<Option<String>>,
        paused: AtomicBool,
        refuse: Vec<String>,
        registrations: Mutex<Vec<String>>,
    }

    impl GlobalHotkey for FakeHotkey {
        fn register(&self, binding: &str) -> Result<(), HotkeyError> {
            self.registrations.lock().unwrap().push(binding.to_string());
            if self.refuse.iter().any(|b| b == binding) {
                return Err(HotkeyError::Listener("denied".into()));
            }
            *self.current.lock().unwrap() = Some(binding.to_string());
            Ok(())
        }
        fn unregister(&self) {
            *self.current.lock().unwrap() = None;
        }
        fn set_paused(&self, paused: bool) {
            self.paused.store(paused, Ordering::SeqCst);
        }
        fn is_paused(&self) -> bool {
            self.paused.load(Ordering::SeqCst)
        }
        fn binding(&self) -> Option<String> {
            self.current.lock().unwrap().clone()
        }
    }

    #[derive(Clone, Default)]
    struct Notes(Arc<Mutex<Vec<Notification>>>);

    impl Frontend for Notes {
        fn present_choices(&mut self, _: u64, _: &[ActionSpec], _: &str) {}
        fn notify(&mut self, notification: &Notification) {
            self.0.lock().unwrap().push(notification.clone());
        }
        fn show_response(&mut self, _: &Conversation) {}
        fn close_response(&mut self) {}
        fn show_read_only(&mut self, _: &str) {}
        fn close_read_only(&mut self) {}
    }

    fn controller(hotkey: Arc<FakeHotkey>, notes: Notes) -> AppController {
        controller_with(hotkey, notes, "text", CaptureTimings::immediate())
    }

    fn controller_with(
        hotkey: Arc<FakeHotkey>,
        notes: Notes,
        selection: &str,
        timings: CaptureTimings,
    ) -> AppController {
        let memory = MemoryClipboard::with_text("clip");
        let capture = SelectionCapture::new(
            ClipboardChannel::new(memory.clone()),
            FakeApp::new(memory, selection),
            timings,
        );
        let (tx, rx) = mpsc::channel();
        let coordinator = RequestCoordinator::new(
            capture,
            Arc::new(ProviderGateway::with_providers(Vec::new())),
            Arc::new(default_actions()),
            tx.clone(),
        );
        AppController::new(
            SharedSettings::new(get_default_settings(), None),
            hotkey,
            coordinator,
            Box::new(notes),
            tx,
            rx,
        )
    }

    #[test]
    fn start_registers_configured_hotkey() {
        let hotkey = Arc::new(FakeHotkey::default());
        let mut app = controller(hotkey.clone(), Notes::default());
        app.start();
        assert_eq!(hotkey.binding().as_deref(), Some("ctrl+space"));
    }

    #[test]
    fn failed_start_keeps_running_with_diagnostic() {
        let hotkey = Arc::new(FakeHotkey {
            refuse: vec!["ctrl+space".into()],
            ..Default::default()
        });
        let notes = Notes::default();
        let mut app = controller(hotkey.clone(), notes.clone());
        app.start();
        assert!(!app.is_exiting());
        assert_eq!(hotkey.binding(), None);
        assert!(notes.0.lock().unwrap()[0].offer_settings);
    }

    #[test]
    fn rebinding_failure_restores_previous() {
        let hotkey = Arc::new(FakeHotkey {
            refuse: vec!["alt+r".into()],
            ..Default::default()
        });
        let notes = Notes::default();
        let mut app = controller(hotkey.clone(), notes.clone());
        app.start();
        assert!(app.change_hotkey("alt+r").is_err());
        assert_eq!(hotkey.binding().as_deref(), Some("ctrl+space"));
        assert_eq!(notes.0.lock().unwrap().len(), 1);

        app.change_hotkey("ctrl+shift+e").unwrap();
        assert_eq!(hotkey.binding().as_deref(), Some("ctrl+shift+e"));
        assert_eq!(app.settings.get().hotkey, "ctrl+shift+e");
    }

    #[test]
    fn invalid_binding_is_rejected_before_unregistering() {
        let hotkey = Arc::new(FakeHotkey::default());
        let mut app = controller(hotkey.clone(), Notes::default());
        app.start();
        assert!(matches!(
            app.change_hotkey("ctrl++"),
            Err(HotkeyError::Parse { .. })
        ));
        assert_eq!(hotkey.binding().as_deref(), Some("ctrl+space"));
        assert_eq!(hotkey.registrations.lock().unwrap().len(), 1);
    }

    #[test]
    fn toggle_pause_flips_listener() {
        let hotkey = Arc::new(FakeHotkey::default());
        let mut app = controller(hotkey.clone(), Notes::default());
        assert!(app.toggle_paused());
        assert!(hotkey.is_paused());
        assert!(!app.toggle_paused());
    }

    #[test]
    fn exit_event_stops_hotkey() {
        let hotkey = Arc::new(FakeHotkey::default());
        let mut app = controller(hotkey.clone(), Notes::default());
        app.start();
        app.events().send(UiEvent::Exit).unwrap();
        app.events()
            .send(UiEvent::Trigger { at: Instant::now() })
            .unwrap();
        app.pump();
        assert!(app.is_exiting());
        assert_eq!(hotkey.binding(), None);
        assert_eq!(app.coordinator().state(), crate::coordinator::CoordinatorState::ShuttingDown);
    }

    #[test]
    fn trigger_spam_exits() {
        let hotkey = Arc::new(FakeHotkey::default());
        let mut app = controller(hotkey.clone(), Notes::default());
        app.start();
        for _ in 0..3 {
            app.events()
                .send(UiEvent::Trigger { at: Instant::now() })
                .unwrap();
        }
        app.pump();
        assert!(app.is_exiting());
        assert_eq!(hotkey.binding(), None);
    }

    #[test]
    fn queued_presses_count_by_press_time_not_handling_time() {
        // Nothing selected: every capture waits out the copy and retry delays.
        let timings = CaptureTimings {
            copy_delay: Duration::from_millis(400),
            retry_delay: Duration::from_millis(400),
            ..CaptureTimings::immediate()
        };
        let hotkey = Arc::new(FakeHotkey::default());
        let mut app = controller_with(hotkey.clone(), Notes::default(), "", timings);
        app.start();

        let pressed = Instant::now();
        for i in 0..5 {
            app.events()
                .send(UiEvent::Trigger {
                    at: pressed + Duration::from_millis(i),
                })
                .unwrap();
        }
        let handled = app.pump();

        assert!(app.is_exiting());
        assert_eq!(handled, 3);
        assert_eq!(hotkey.binding(), None);
    }

    #[test]
    fn presses_far_apart_are_not_spam_even_when_handled_together() {
        let hotkey = Arc::new(FakeHotkey::default());
        let mut app = controller(hotkey, Notes::default());
        app.start();

        let first = Instant::now();
        for i in 0..4 {
            app.events()
                .send(UiEvent::Trigger {
                    at: first + Duration::from_secs(2 * i),
                })
                .unwrap();
        }
        assert_eq!(app.pump(), 4);
        assert!(!app.is_exiting());
    }
}
