//! System clipboard access.
//!
//! There is no portable "read the current selection" API, so the clipboard
//! doubles as the channel for grabbing selected text and for pasting results
//! back. Every borrow of the clipboard goes through [`ClipboardChannel::scoped_swap`],
//! which returns a guard that puts the user's original content back when it
//! is dropped, whatever path the caller leaves by.

use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClipboardError {
    #[error("clipboard unavailable: {0}")]
    Unavailable(String),
    #[error("clipboard access failed: {0}")]
    Access(String),
}

/// Clipboard content and format at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClipboardSnapshot {
    Empty,
    Text(String),
    /// Content with no text form (an image, say). It cannot be saved, so
    /// restoring it clears the clipboard.
    NonText,
    /// Every format the clipboard held, captured natively.
    #[cfg(target_os = "windows")]
    Native(Vec<win_clipboard::FormatData>),
}

impl ClipboardSnapshot {
    /// Text view of the snapshot, used for logging and equality checks.
    pub fn text(&self) -> Option<&str> {
        match self {
            ClipboardSnapshot::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Raw clipboard operations. `SystemClipboard` talks to the OS; tests use an
/// in-memory implementation.
pub trait ClipboardBackend: Send {
    fn read_text(&mut self) -> Result<String, ClipboardError>;
    fn write_text(&mut self, text: &str) -> Result<(), ClipboardError>;
    fn clear(&mut self) -> Result<(), ClipboardError>;

    /// Whether the clipboard holds something other than text.
    fn holds_non_text(&mut self) -> bool {
        false
    }

    fn snapshot(&mut self) -> Result<ClipboardSnapshot, ClipboardError> {
        let text = self.read_text()?;
        if !text.is_empty() {
            return Ok(ClipboardSnapshot::Text(text));
        }
        if self.holds_non_text() {
            warn!("Clipboard holds non-text content; it will be lost after this capture");
            return Ok(ClipboardSnapshot::NonText);
        }
        Ok(ClipboardSnapshot::Empty)
    }

    fn restore(&mut self, snapshot: &ClipboardSnapshot) -> Result<(), ClipboardError> {
        match snapshot {
            ClipboardSnapshot::Empty | ClipboardSnapshot::NonText => self.clear(),
            ClipboardSnapshot::Text(text) => self.write_text(text),
            #[cfg(target_os = "windows")]
            ClipboardSnapshot::Native(formats) => win_clipboard::restore_all_formats(formats),
        }
    }
}

/// OS clipboard through `arboard`.
#[derive(Default)]
pub struct SystemClipboard {
    // On Linux the X11/Wayland selection is served by the clipboard handle, so
    // it has to outlive the write for other applications to see the content.
    #[cfg(target_os = "linux")]
    handle: Option<arboard::Clipboard>,
}

impl SystemClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(target_os = "linux")]
    fn with_clipboard<T>(
        &mut self,
        op: impl FnOnce(&mut arboard::Clipboard) -> Result<T, arboard::Error>,
    ) -> Result<T, ClipboardError> {
        if self.handle.is_none() {
            let clipboard = arboard::Clipboard::new()
                .map_err(|e| ClipboardError::Unavailable(e.to_string()))?;
            self.handle = Some(clipboard);
        }
        match self.handle.as_mut() {
            Some(clipboard) => op(clipboard).map_err(|e| ClipboardError::Access(e.to_string())),
            None => Err(ClipboardError::Unavailable("no clipboard handle".into())),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn with_clipboard<T>(
        &mut self,
        op: impl FnOnce(&mut arboard::Clipboard) -> Result<T, arboard::Error>,
    ) -> Result<T, ClipboardError> {
        let mut clipboard =
            arboard::Clipboard::new().map_err(|e| ClipboardError::Unavailable(e.to_string()))?;
        op(&mut clipboard).map_err(|e| ClipboardError::Access(e.to_string()))
    }
}

impl ClipboardBackend for SystemClipboard {
    fn read_text(&mut self) -> Result<String, ClipboardError> {
        self.with_clipboard(|clipboard| match clipboard.get_text() {
            // An empty or non-text clipboard reads as empty text.
            Err(arboard::Error::ContentNotAvailable) => Ok(String::new()),
            other => other,
        })
    }

    fn write_text(&mut self, text: &str) -> Result<(), ClipboardError> {
        self.with_clipboard(|clipboard| clipboard.set_text(text.to_owned()))
    }

    fn clear(&mut self) -> Result<(), ClipboardError> {
        self.with_clipboard(|clipboard| clipboard.clear())
    }

    fn holds_non_text(&mut self) -> bool {
        self.with_clipboard(|clipboard| clipboard.get_image().map(|_| ()))
            .is_ok()
    }

    #[cfg(target_os = "windows")]
    fn snapshot(&mut self) -> Result<ClipboardSnapshot, ClipboardError> {
        match win_clipboard::backup_all_formats() {
            Ok(formats) if formats.is_empty() => Ok(ClipboardSnapshot::Empty),
            Ok(formats) => {
                debug!("Native clipboard backup: {} formats saved", formats.len());
                Ok(ClipboardSnapshot::Native(formats))
            }
            Err(e) => {
                warn!("Native clipboard backup failed: {}. Falling back to text-only.", e);
                let text = self.read_text()?;
                Ok(if text.is_empty() {
                    ClipboardSnapshot::Empty
                } else {
                    ClipboardSnapshot::Text(text)
                })
            }
        }
    }
}

/// Shared, logged clipboard handle.
///
/// OS clipboard access can be denied transiently (another process holds it
/// open on Windows, no display on Linux). Those failures are logged here and
/// never propagate: a failed read is an empty string.
#[derive(Clone)]
pub struct ClipboardChannel {
    backend: Arc<Mutex<Box<dyn ClipboardBackend>>>,
}

impl ClipboardChannel {
    pub fn new(backend: impl ClipboardBackend + 'static) -> Self {
        Self {
            backend: Arc::new(Mutex::new(Box::new(backend))),
        }
    }

    pub fn system() -> Self {
        Self::new(SystemClipboard::new())
    }

    fn with_backend<T>(&self, op: impl FnOnce(&mut dyn ClipboardBackend) -> T) -> T {
        let mut backend = self.backend.lock().unwrap_or_else(|e| e.into_inner());
        op(backend.as_mut())
    }

    pub fn read(&self) -> String {
        match self.with_backend(|b| b.read_text()) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to read clipboard: {}", e);
                String::new()
            }
        }
    }

    pub fn write(&self, text: &str) {
        if let Err(e) = self.with_backend(|b| b.write_text(text)) {
            warn!("Failed to write clipboard: {}", e);
        }
    }

    pub fn clear(&self) {
        if let Err(e) = self.with_backend(|b| b.clear()) {
            warn!("Failed to clear clipboard: {}", e);
        }
    }

    pub fn snapshot(&self) -> Option<ClipboardSnapshot> {
        match self.with_backend(|b| b.snapshot()) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Failed to snapshot clipboard: {}", e);
                None
            }
        }
    }

    fn restore(&self, snapshot: &ClipboardSnapshot) {
        match self.with_backend(|b| b.restore(snapshot)) {
            Ok(()) => debug!("Clipboard restored"),
            Err(e) => warn!(
                "Failed to restore clipboard: {}. Clipboard may hold intermediate content.",
                e
            ),
        }
    }

    /// Saves the current content, then writes `replacement` (or clears when
    /// `None`). The original content comes back when the guard drops.
    ///
    /// If the snapshot cannot be taken the clipboard is left untouched and the
    /// returned guard is disarmed; callers must check [`ClipboardGuard::is_armed`]
    /// before relying on the swap.
    pub fn scoped_swap(&self, replacement: Option<&str>) -> ClipboardGuard {
        let snapshot = self.snapshot();
        if snapshot.is_some() {
            match replacement {
                Some(text) => self.write(text),
                None => self.clear(),
            }
        }
        ClipboardGuard {
            channel: self.clone(),
            snapshot,
        }
    }
}

/// Restores the clipboard to its saved snapshot on drop.
#[must_use = "dropping the guard restores the clipboard immediately"]
pub struct ClipboardGuard {
    channel: ClipboardChannel,
    snapshot: Option<ClipboardSnapshot>,
}

impl ClipboardGuard {
    /// False when the original content could not be saved.
    pub fn is_armed(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn channel(&self) -> &ClipboardChannel {
        &self.channel
    }

    /// Restores now instead of at end of scope.
    pub fn restore(mut self) {
        self.restore_inner();
    }

    fn restore_inner(&mut self) {
        match self.snapshot.take() {
            Some(snapshot) => self.channel.restore(&snapshot),
            None => info!("No clipboard snapshot was taken, nothing to restore"),
        }
    }
}

impl Drop for ClipboardGuard {
    fn drop(&mut self) {
        if self.snapshot.is_some() {
            self.restore_inner();
        }
    }
}

/// Windows-only: clipboard backup/restore that preserves every format,
/// not just text (images, rich text, file lists).
#[cfg(target_os = "windows")]
pub mod win_clipboard {
    use super::ClipboardError;
    use log::{debug, warn};
    use std::ptr;
    use windows::Win32::Foundation::{HANDLE, HGLOBAL};
    use windows::Win32::System::DataExchange::{
        CloseClipboard, EmptyClipboard, EnumClipboardFormats, GetClipboardData, OpenClipboard,
        SetClipboardData,
    };
    use windows::Win32::System::Memory::{GlobalAlloc, GlobalLock, GlobalSize, GlobalUnlock, GHND};

    /// One clipboard format and its raw bytes.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct FormatData {
        pub format: u32,
        pub data: Vec<u8>,
    }

    /// Closes the clipboard when dropped.
    struct OpenGuard;

    impl OpenGuard {
        fn open(purpose: &str) -> Result<Self, ClipboardError> {
            // SAFETY: OpenClipboard(None) associates the clipboard with the current task.
            unsafe { OpenClipboard(None) }
                .map_err(|e| ClipboardError::Access(format!("open for {}: {}", purpose, e)))?;
            Ok(Self)
        }
    }

    impl Drop for OpenGuard {
        fn drop(&mut self) {
            // SAFETY: only constructed after a successful OpenClipboard.
            let _ = unsafe { CloseClipboard() };
        }
    }

    pub fn backup_all_formats() -> Result<Vec<FormatData>, ClipboardError> {
        let _open = OpenGuard::open("backup")?;
        let mut saved = Vec::new();

        // SAFETY: the clipboard is open for the lifetime of `_open`.
        unsafe {
            let mut format = EnumClipboardFormats(0);
            while format != 0 {
                if let Some(entry) = read_format(format) {
                    saved.push(entry);
                }
                format = EnumClipboardFormats(format);
            }
        }

        debug!("Backed up {} clipboard formats", saved.len());
        Ok(saved)
    }

    unsafe fn read_format(format: u32) -> Option<FormatData> {
        let handle = GetClipboardData(format).ok()?;
        if handle.0.is_null() {
            return None;
        }
        let hglobal = HGLOBAL(handle.0);
        let size = GlobalSize(hglobal);
        if size == 0 {
            return None;
        }
        let locked = GlobalLock(hglobal);
        if locked.is_null() {
            return None;
        }
        let data = std::slice::from_raw_parts(locked as *const u8, size).to_vec();
        let _ = GlobalUnlock(hglobal);
        Some(FormatData { format, data })
    }

    pub fn restore_all_formats(formats: &[FormatData]) -> Result<(), ClipboardError> {
        let _open = OpenGuard::open("restore")?;

        // SAFETY: the clipboard is open for the lifetime of `_open`.
        unsafe {
            EmptyClipboard().map_err(|e| ClipboardError::Access(format!("empty: {}", e)))?;
            for entry in formats {
                if let Err(e) = write_format(entry.format, &entry.data) {
                    warn!("Failed to restore clipboard format {}: {}", entry.format, e);
                }
            }
        }
        Ok(())
    }

    unsafe fn write_format(format: u32, data: &[u8]) -> Result<(), String> {
        let hmem = GlobalAlloc(GHND, data.len()).map_err(|e| format!("GlobalAlloc failed: {}", e))?;
        let locked = GlobalLock(hmem);
        if locked.is_null() {
            return Err("GlobalLock failed".into());
        }
        ptr::copy_nonoverlapping(data.as_ptr(), locked as *mut u8, data.len());
        let _ = GlobalUnlock(hmem);

        // The clipboard takes ownership of the memory.
        SetClipboardData(format, Some(HANDLE(hmem.0)))
            .map_err(|e| format!("SetClipboardData failed: {}", e))?;
        Ok(())
    }
}

/// In-memory clipboard for tests and for hosts without a display.
#[derive(Clone, Default)]
pub struct MemoryClipboard {
    content: Arc<Mutex<String>>,
    fail_reads: Arc<std::sync::atomic::AtomicBool>,
    non_text: Arc<std::sync::atomic::AtomicBool>,
}

impl MemoryClipboard {
    pub fn with_text(text: &str) -> Self {
        let clipboard = Self::default();
        clipboard.set(text);
        clipboard
    }

    pub fn get(&self) -> String {
        self.content.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set(&self, text: &str) {
        *self.content.lock().unwrap_or_else(|e| e.into_inner()) = text.to_string();
        self.non_text
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// Puts content with no text form on the clipboard, like a copied image.
    pub fn set_non_text(&self) {
        self.set("");
        self.non_text
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_non_text(&self) -> bool {
        self.non_text.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Makes reads fail, simulating an OS that denies clipboard access.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

impl ClipboardBackend for MemoryClipboard {
    fn read_text(&mut self) -> Result<String, ClipboardError> {
        if self.fail_reads.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ClipboardError::Access("read denied".into()));
        }
        Ok(self.get())
    }

    fn write_text(&mut self, text: &str) -> Result<(), ClipboardError> {
        self.set(text);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), ClipboardError> {
        self.set("");
        Ok(())
    }

    fn holds_non_text(&mut self) -> bool {
        self.is_non_text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_restores_on_drop() {
        let memory = MemoryClipboard::with_text("user data");
        let channel = ClipboardChannel::new(memory.clone());
        {
            let _guard = channel.scoped_swap(Some("temporary"));
            assert_eq!(memory.get(), "temporary");
        }
        assert_eq!(memory.get(), "user data");
    }

    #[test]
    fn guard_clears_when_no_replacement() {
        let memory = MemoryClipboard::with_text("keep me");
        let channel = ClipboardChannel::new(memory.clone());
        let guard = channel.scoped_swap(None);
        assert_eq!(memory.get(), "");
        guard.restore();
        assert_eq!(memory.get(), "keep me");
    }

    #[test]
    fn guard_restores_when_scope_panics() {
        let memory = MemoryClipboard::with_text("before");
        let channel = ClipboardChannel::new(memory.clone());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = channel.scoped_swap(Some("during"));
            panic!("operation failed mid-swap");
        }));
        assert!(result.is_err());
        assert_eq!(memory.get(), "before");
    }

    #[test]
    fn empty_clipboard_restores_to_empty() {
        let memory = MemoryClipboard::default();
        let channel = ClipboardChannel::new(memory.clone());
        {
            let guard = channel.scoped_swap(Some("x"));
            guard.channel().write("y");
        }
        assert_eq!(memory.get(), "");
    }

    #[test]
    fn read_failures_are_swallowed() {
        let memory = MemoryClipboard::with_text("secret");
        memory.set_fail_reads(true);
        let channel = ClipboardChannel::new(memory);
        assert_eq!(channel.read(), "");
        assert!(channel.snapshot().is_none());
    }

    #[test]
    fn non_text_clipboard_is_flagged_then_cleared() {
        let memory = MemoryClipboard::default();
        memory.set_non_text();
        let channel = ClipboardChannel::new(memory.clone());
        assert_eq!(channel.snapshot(), Some(ClipboardSnapshot::NonText));

        let guard = channel.scoped_swap(Some("temporary"));
        assert!(guard.is_armed());
        drop(guard);
        assert_eq!(memory.get(), "");
        assert!(!memory.is_non_text());
    }

    #[test]
    fn disarmed_guard_leaves_clipboard_alone() {
        let memory = MemoryClipboard::with_text("precious");
        memory.set_fail_reads(true);
        let channel = ClipboardChannel::new(memory.clone());
        let guard = channel.scoped_swap(None);
        assert!(!guard.is_armed());
        drop(guard);
        assert_eq!(memory.get(), "precious");
    }
}
