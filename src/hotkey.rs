use log::{debug, error, info};
use rdev::{EventType, Key};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// How long `start` waits for the OS hook to fail before assuming it is up.
/// `rdev::listen` blocks forever on success and returns early on failure.
const LISTEN_STARTUP_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HotkeyError {
    #[error("invalid shortcut '{binding}': {reason}")]
    Parse { binding: String, reason: String },
    #[error("global keyboard hook unavailable: {0}")]
    Listener(String),
}

/// State for tracking active key modifiers (Ctrl, Shift, Alt, Win)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModifierState {
    pub ctrl: bool,
    pub shift: bool,
    pub alt: bool,
    pub win: bool,
}

impl ModifierState {
    pub fn update(&mut self, key: Key, pressed: bool) {
        match key {
            Key::ControlLeft | Key::ControlRight => self.ctrl = pressed,
            Key::ShiftLeft | Key::ShiftRight => self.shift = pressed,
            Key::Alt | Key::AltGr => self.alt = pressed,
            Key::MetaLeft | Key::MetaRight => self.win = pressed,
            _ => {}
        }
    }

    fn any(&self) -> bool {
        self.ctrl || self.shift || self.alt || self.win
    }
}

/// A parsed global shortcut such as `ctrl+space`.
/// For modifier-only shortcuts (like `ctrl+alt`) `key` is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shortcut {
    pub key: Option<Key>,
    pub modifiers: ModifierState,
    pub binding: String,
}

impl Shortcut {
    /// Parses strings like `"ctrl+space"`, `"ctrl+shift+a"` or `"caps lock"`.
    pub fn parse(binding: &str) -> Result<Self, HotkeyError> {
        let parse_err = |reason: String| HotkeyError::Parse {
            binding: binding.to_string(),
            reason,
        };

        let normalized = binding.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(parse_err("empty shortcut".into()));
        }

        let mut modifiers = ModifierState::default();
        let mut main_key: Option<Key> = None;

        for part in normalized.split('+').map(str::trim) {
            match part {
                "ctrl" | "control" => modifiers.ctrl = true,
                "shift" => modifiers.shift = true,
                "alt" | "option" => modifiers.alt = true,
                "win" | "super" | "meta" | "cmd" | "command" => modifiers.win = true,
                "" => return Err(parse_err("empty key between '+'".into())),
                name => {
                    if main_key.is_some() {
                        return Err(parse_err(format!("more than one main key, found '{}'", name)));
                    }
                    main_key =
                        Some(key_from_name(name).ok_or_else(|| parse_err(format!("unknown key '{}'", name)))?);
                }
            }
        }

        if main_key.is_none() && !modifiers.any() {
            return Err(parse_err("shortcut must have at least one key or modifier".into()));
        }

        Ok(Self {
            key: main_key,
            modifiers,
            binding: normalized,
        })
    }
}

/// Turns a raw key event stream into "shortcut pressed" edges.
///
/// Fires once per physical press: key repeat while held does not re-fire, and
/// the shortcut re-arms when its key or any required modifier is released.
#[derive(Debug, Default)]
pub struct ShortcutMatcher {
    modifiers: ModifierState,
    active: bool,
}

impl ShortcutMatcher {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Returns true when this event completes the shortcut.
    pub fn on_event(&mut self, event: &EventType, shortcut: &Shortcut) -> bool {
        match *event {
            EventType::KeyPress(key) => {
                self.modifiers.update(key, true);
                let matches = self.modifiers == shortcut.modifiers
                    && match shortcut.key {
                        Some(wanted) => wanted == key,
                        None => is_modifier_key(key),
                    };
                if matches && !self.active {
                    self.active = true;
                    return true;
                }
                false
            }
            EventType::KeyRelease(key) => {
                self.modifiers.update(key, false);
                let key_released = shortcut.key == Some(key);
                if key_released || self.modifiers != shortcut.modifiers {
                    self.active = false;
                }
                false
            }
            _ => false,
        }
    }
}

fn is_modifier_key(key: Key) -> bool {
    matches!(
        key,
        Key::ControlLeft
            | Key::ControlRight
            | Key::ShiftLeft
            | Key::ShiftRight
            | Key::Alt
            | Key::AltGr
            | Key::MetaLeft
            | Key::MetaRight
    )
}

const NAMED_KEYS: &[(&[&str], Key)] = &[
    (&["space", "spacebar"], Key::Space),
    (&["enter", "return"], Key::Return),
    (&["tab"], Key::Tab),
    (&["backspace"], Key::Backspace),
    (&["escape", "esc"], Key::Escape),
    (&["delete", "del"], Key::Delete),
    (&["insert", "ins"], Key::Insert),
    (&["home"], Key::Home),
    (&["end"], Key::End),
    (&["pageup", "page up", "pgup"], Key::PageUp),
    (&["pagedown", "page down", "pgdn"], Key::PageDown),
    (&["up", "arrowup"], Key::UpArrow),
    (&["down", "arrowdown"], Key::DownArrow),
    (&["left", "arrowleft"], Key::LeftArrow),
    (&["right", "arrowright"], Key::RightArrow),
    (&["caps lock", "capslock", "caps"], Key::CapsLock),
    (&["pause", "break"], Key::Pause),
    (&["printscreen", "print", "prtsc"], Key::PrintScreen),
    (&["scrolllock"], Key::ScrollLock),
    (&["`", "backquote", "grave"], Key::BackQuote),
    (&["-", "minus"], Key::Minus),
    (&["=", "equal"], Key::Equal),
    (&["[", "bracketleft"], Key::LeftBracket),
    (&["]", "bracketright"], Key::RightBracket),
    (&["\\", "backslash"], Key::BackSlash),
    (&[";", "semicolon"], Key::SemiColon),
    (&["'", "quote"], Key::Quote),
    (&[",", "comma"], Key::Comma),
    (&[".", "period"], Key::Dot),
    (&["/", "slash"], Key::Slash),
];

const FUNCTION_KEYS: [Key; 12] = [
    Key::F1,
    Key::F2,
    Key::F3,
    Key::F4,
    Key::F5,
    Key::F6,
    Key::F7,
    Key::F8,
    Key::F9,
    Key::F10,
    Key::F11,
    Key::F12,
];

const LETTER_KEYS: [Key; 26] = [
    Key::KeyA,
    Key::KeyB,
    Key::KeyC,
    Key::KeyD,
    Key::KeyE,
    Key::KeyF,
    Key::KeyG,
    Key::KeyH,
    Key::KeyI,
    Key::KeyJ,
    Key::KeyK,
    Key::KeyL,
    Key::KeyM,
    Key::KeyN,
    Key::KeyO,
    Key::KeyP,
    Key::KeyQ,
    Key::KeyR,
    Key::KeyS,
    Key::KeyT,
    Key::KeyU,
    Key::KeyV,
    Key::KeyW,
    Key::KeyX,
    Key::KeyY,
    Key::KeyZ,
];

const DIGIT_KEYS: [Key; 10] = [
    Key::Num0,
    Key::Num1,
    Key::Num2,
    Key::Num3,
    Key::Num4,
    Key::Num5,
    Key::Num6,
    Key::Num7,
    Key::Num8,
    Key::Num9,
];

fn key_from_name(name: &str) -> Option<Key> {
    if let Some((_, key)) = NAMED_KEYS.iter().find(|(names, _)| names.contains(&name)) {
        return Some(*key);
    }

    if let [c] = name.as_bytes() {
        if c.is_ascii_lowercase() {
            return Some(LETTER_KEYS[(c - b'a') as usize]);
        }
        if c.is_ascii_digit() {
            return Some(DIGIT_KEYS[(c - b'0') as usize]);
        }
    }

    let n: usize = name.strip_prefix('f')?.parse().ok()?;
    FUNCTION_KEYS.get(n.checked_sub(1)?).copied()
}

/// Registration surface used by `AppController`. `HotkeyListener` is the OS
/// implementation.
pub trait GlobalHotkey: Send + Sync {
    fn register(&self, binding: &str) -> Result<(), HotkeyError>;
    fn unregister(&self);
    fn set_paused(&self, paused: bool);
    fn is_paused(&self) -> bool;
    fn binding(&self) -> Option<String>;
}

/// Called on the hook thread with the time the shortcut was pressed.
type TriggerCallback = Arc<dyn Fn(Instant) + Send + Sync>;

struct ListenerShared {
    shortcut: Mutex<Option<Shortcut>>,
    matcher: Mutex<ShortcutMatcher>,
    running: AtomicBool,
    paused: AtomicBool,
    hook_installed: AtomicBool,
    on_trigger: TriggerCallback,
}

impl ListenerShared {
    fn new(on_trigger: TriggerCallback) -> Self {
        Self {
            shortcut: Mutex::new(None),
            matcher: Mutex::new(ShortcutMatcher::default()),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            hook_installed: AtomicBool::new(false),
            on_trigger,
        }
    }
}

/// Global shortcut listener on top of `rdev`.
///
/// The OS hook thread is spawned once and lives for the process; `rdev` has no
/// way to remove it. `unregister` and re-`register` only swap the shortcut the
/// callback matches against.
pub struct HotkeyListener {
    shared: Arc<ListenerShared>,
}

impl HotkeyListener {
    pub fn new(on_trigger: impl Fn(Instant) + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(ListenerShared::new(Arc::new(on_trigger))),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn install_hook(&self) -> Result<(), HotkeyError> {
        if self.shared.hook_installed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Installing global keyboard hook");
        let shared = self.shared.clone();
        let (failed_tx, failed_rx) = mpsc::channel::<String>();

        std::thread::Builder::new()
            .name("hotkey-listener".into())
            .spawn(move || {
                let callback_state = shared.clone();
                if let Err(e) = rdev::listen(move |event| handle_event(&event.event_type, &callback_state)) {
                    error!("Failed to start key listener: {:?}", e);
                    shared.running.store(false, Ordering::SeqCst);
                    shared.hook_installed.store(false, Ordering::SeqCst);
                    let _ = failed_tx.send(format!("{:?}", e));
                }
            })
            .map_err(|e| {
                self.shared.hook_installed.store(false, Ordering::SeqCst);
                HotkeyError::Listener(e.to_string())
            })?;

        match failed_rx.recv_timeout(LISTEN_STARTUP_GRACE) {
            Ok(reason) => Err(HotkeyError::Listener(reason)),
            Err(_) => Ok(()),
        }
    }
}

/// Runs on the OS hook thread; must never block.
fn handle_event(event: &EventType, shared: &ListenerShared) {
    if !shared.running.load(Ordering::SeqCst) {
        return;
    }

    let fired = {
        let Ok(shortcut) = shared.shortcut.try_lock() else {
            return;
        };
        let Some(shortcut) = shortcut.as_ref() else {
            return;
        };
        let Ok(mut matcher) = shared.matcher.try_lock() else {
            return;
        };
        matcher.on_event(event, shortcut)
    };

    if !fired {
        return;
    }
    if shared.paused.load(Ordering::SeqCst) {
        debug!("Hotkey pressed while paused, ignoring");
        return;
    }
    debug!("Hotkey pressed");
    (shared.on_trigger)(Instant::now());
}

impl GlobalHotkey for HotkeyListener {
    fn register(&self, binding: &str) -> Result<(), HotkeyError> {
        let shortcut = Shortcut::parse(binding)?;

        {
            let mut current = self.shared.shortcut.lock().unwrap_or_else(|e| e.into_inner());
            *current = Some(shortcut);
        }
        self.shared
            .matcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset();
        self.shared.running.store(true, Ordering::SeqCst);

        if let Err(e) = self.install_hook() {
            self.unregister();
            return Err(e);
        }

        info!("Registered global shortcut: {}", binding);
        Ok(())
    }

    fn unregister(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            debug!("Hotkey listener already stopped");
        }
        *self.shared.shortcut.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.shared
            .matcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset();
        info!("Global shortcut unregistered");
    }

    fn set_paused(&self, paused: bool) {
        self.shared.paused.store(paused, Ordering::SeqCst);
        info!("Hotkey {}", if paused { "paused" } else { "resumed" });
    }

    fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    fn binding(&self) -> Option<String> {
        if !self.is_running() {
            return None;
        }
        self.shared
            .shortcut
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| s.binding.clone())
    }
}

impl Drop for HotkeyListener {
    fn drop(&mut self) {
        if self.is_running() {
            debug!("HotkeyListener dropped while running; disabling callback");
            self.shared.running.store(false, Ordering::SeqCst);
        }
    }
}
