use crate::actions::{default_actions, ActionSource, ActionSpec};
use crate::providers::ProviderConfig;
use crate::selection::CaptureTimings;
use log::{debug, warn};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub const APP_DIR_NAME: &str = "textrelay";
pub const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("no configuration directory on this system")]
    NoConfigDir,
    #[error("cannot access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings in {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

// Accepts both the old numeric format (1-5) and the string format ("trace", "debug", etc.)
impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct LogLevelVisitor;

        impl<'de> Visitor<'de> for LogLevelVisitor {
            type Value = LogLevel;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a string or integer representing log level")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<LogLevel, E> {
                match value.to_lowercase().as_str() {
                    "trace" => Ok(LogLevel::Trace),
                    "debug" => Ok(LogLevel::Debug),
                    "info" => Ok(LogLevel::Info),
                    "warn" => Ok(LogLevel::Warn),
                    "error" => Ok(LogLevel::Error),
                    _ => Err(E::unknown_variant(
                        value,
                        &["trace", "debug", "info", "warn", "error"],
                    )),
                }
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<LogLevel, E> {
                match value {
                    1 => Ok(LogLevel::Trace),
                    2 => Ok(LogLevel::Debug),
                    3 => Ok(LogLevel::Info),
                    4 => Ok(LogLevel::Warn),
                    5 => Ok(LogLevel::Error),
                    _ => Err(E::invalid_value(de::Unexpected::Unsigned(value), &"1-5")),
                }
            }
        }

        deserializer.deserialize_any(LogLevelVisitor)
    }
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

/// Clipboard and keystroke timings, in milliseconds.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct CaptureSettings {
    pub copy_delay_ms: u64,
    pub retry_delay_ms: u64,
    pub paste_settle_ms: u64,
    pub reselect_delay_ms: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            copy_delay_ms: 200,
            retry_delay_ms: 500,
            paste_settle_ms: 200,
            reselect_delay_ms: 100,
        }
    }
}

impl From<CaptureSettings> for CaptureTimings {
    fn from(c: CaptureSettings) -> Self {
        CaptureTimings {
            copy_delay: Duration::from_millis(c.copy_delay_ms),
            retry_delay: Duration::from_millis(c.retry_delay_ms),
            paste_settle: Duration::from_millis(c.paste_settle_ms),
            reselect_delay: Duration::from_millis(c.reselect_delay_ms),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AppSettings {
    #[serde(default = "default_hotkey")]
    pub hotkey: String,
    /// Internal name of the provider used for new requests.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_providers")]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default = "default_actions")]
    pub actions: Vec<ActionSpec>,
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
    /// Action picked automatically when there is no choice popup.
    #[serde(default)]
    pub default_action: Option<String>,
    #[serde(default)]
    pub start_paused: bool,
}

fn default_hotkey() -> String {
    "ctrl+space".to_string()
}

fn default_provider() -> String {
    "gemini".to_string()
}

fn default_providers() -> BTreeMap<String, ProviderConfig> {
    ProviderConfig::defaults()
        .into_iter()
        .map(|config| (config.internal_name().to_string(), config))
        .collect()
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

pub fn get_default_settings() -> AppSettings {
    AppSettings {
        hotkey: default_hotkey(),
        provider: default_provider(),
        providers: default_providers(),
        actions: default_actions(),
        capture: CaptureSettings::default(),
        log_level: default_log_level(),
        default_action: None,
        start_paused: false,
    }
}

impl Default for AppSettings {
    fn default() -> Self {
        get_default_settings()
    }
}

impl AppSettings {
    /// Provider configs in the order providers are offered.
    pub fn provider_configs(&self) -> Vec<ProviderConfig> {
        ProviderConfig::defaults()
            .iter()
            .filter_map(|d| self.providers.get(d.internal_name()).cloned())
            .collect()
    }

    pub fn capture_timings(&self) -> CaptureTimings {
        self.capture.into()
    }
}

/// Fills in providers and actions missing from an older file. Returns whether
/// anything changed.
fn ensure_defaults(settings: &mut AppSettings) -> bool {
    let mut updated = false;

    for (name, config) in default_providers() {
        let misfiled = settings
            .providers
            .get(&name)
            .is_some_and(|c| c.internal_name() != name);
        if misfiled {
            warn!("Provider entry '{}' has the wrong kind, resetting it", name);
        }
        if misfiled || !settings.providers.contains_key(&name) {
            debug!("Adding missing provider: {}", name);
            settings.providers.insert(name, config);
            updated = true;
        }
    }

    if settings.actions.is_empty() {
        debug!("No actions configured, restoring defaults");
        settings.actions = default_actions();
        updated = true;
    }

    updated
}

pub fn app_config_dir() -> Result<PathBuf, SettingsError> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .ok_or(SettingsError::NoConfigDir)
}

pub fn settings_path() -> Result<PathBuf, SettingsError> {
    Ok(app_config_dir()?.join(SETTINGS_FILE_NAME))
}

pub fn read_settings(path: &Path) -> Result<AppSettings, SettingsError> {
    let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn write_settings(path: &Path, settings: &AppSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SettingsError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let json = serde_json::to_string_pretty(settings)?;

    // Write next to the target, then rename over it, so a crash mid-write
    // leaves the previous file intact.
    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, json).map_err(|source| SettingsError::Io {
        path: temp_path.clone(),
        source,
    })?;
    std::fs::rename(&temp_path, path).map_err(|source| {
        let _ = std::fs::remove_file(&temp_path);
        SettingsError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Loads the settings file, creating it from defaults when missing. A file
/// that cannot be read or parsed is left alone and defaults are used in
/// memory.
pub fn load_or_create_app_settings(path: &Path) -> AppSettings {
    if !path.exists() {
        let settings = get_default_settings();
        if let Err(e) = write_settings(path, &settings) {
            warn!("Failed to create settings file: {}", e);
        }
        return settings;
    }

    match read_settings(path) {
        Ok(mut settings) => {
            debug!("Loaded settings from {}", path.display());
            if ensure_defaults(&mut settings) {
                if let Err(e) = write_settings(path, &settings) {
                    warn!("Failed to update settings file: {}", e);
                }
            }
            settings
        }
        Err(e) => {
            warn!("{}; using default settings", e);
            get_default_settings()
        }
    }
}

/// Settings shared between the UI thread and the components reading them.
#[derive(Clone)]
pub struct SharedSettings {
    inner: Arc<RwLock<AppSettings>>,
    path: Option<PathBuf>,
}

impl SharedSettings {
    pub fn new(settings: AppSettings, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
            path,
        }
    }

    pub fn get(&self) -> AppSettings {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Applies `change` and writes the result to disk when backed by a file.
    pub fn update(&self, change: impl FnOnce(&mut AppSettings)) -> Result<(), SettingsError> {
        let snapshot = {
            let mut settings = self.inner.write().unwrap_or_else(|e| e.into_inner());
            change(&mut settings);
            settings.clone()
        };
        match &self.path {
            Some(path) => write_settings(path, &snapshot),
            None => Ok(()),
        }
    }
}

impl ActionSource for SharedSettings {
    fn get_actions(&self) -> Vec<ActionSpec> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .actions
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_accepts_numbers_and_names() {
        let level: LogLevel = serde_json::from_str("2").unwrap();
        assert_eq!(level, LogLevel::Debug);
        let level: LogLevel = serde_json::from_str("\"WARN\"").unwrap();
        assert_eq!(level, LogLevel::Warn);
        assert!(serde_json::from_str::<LogLevel>("9").is_err());
    }

    #[test]
    fn missing_fields_use_defaults() {
        let settings: AppSettings =
            serde_json::from_str(r#"{"hotkey":"alt+shift+r","log_level":1}"#).unwrap();
        assert_eq!(settings.hotkey, "alt+shift+r");
        assert_eq!(settings.provider, "gemini");
        assert_eq!(settings.log_level, LogLevel::Trace);
        assert_eq!(settings.capture, CaptureSettings::default());
        assert_eq!(settings.providers.len(), 5);
        assert_eq!(settings.actions.len(), default_actions().len());
    }

    #[test]
    fn missing_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let settings = load_or_create_app_settings(&path);
        assert_eq!(settings, get_default_settings());
        assert_eq!(read_settings(&path).unwrap(), settings);
    }

    #[test]
    fn broken_file_is_kept_and_defaults_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();
        let settings = load_or_create_app_settings(&path);
        assert_eq!(settings, get_default_settings());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn older_file_gains_missing_providers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(
            &path,
            r#"{"providers":{"ollama":{"kind":"ollama","model":"qwen2.5"}},"actions":[]}"#,
        )
        .unwrap();
        let settings = load_or_create_app_settings(&path);
        assert_eq!(settings.providers.len(), 5);
        match &settings.providers["ollama"] {
            ProviderConfig::Ollama(c) => {
                assert_eq!(c.model, "qwen2.5");
                assert_eq!(c.base_url, "http://localhost:11434");
            }
            other => panic!("unexpected config {:?}", other),
        }
        assert!(!settings.actions.is_empty());
        assert_eq!(read_settings(&path).unwrap(), settings);
    }

    #[test]
    fn rewrite_replaces_file_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        write_settings(&path, &get_default_settings()).unwrap();

        let mut changed = get_default_settings();
        changed.hotkey = "alt+q".into();
        write_settings(&path, &changed).unwrap();

        assert_eq!(read_settings(&path).unwrap().hotkey, "alt+q");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn failed_write_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        write_settings(&path, &get_default_settings()).unwrap();
        // A directory in the way of the temp file makes the write fail.
        std::fs::create_dir(path.with_extension("json.tmp")).unwrap();

        let mut changed = get_default_settings();
        changed.hotkey = "alt+q".into();
        assert!(matches!(
            write_settings(&path, &changed),
            Err(SettingsError::Io { .. })
        ));
        assert_eq!(read_settings(&path).unwrap().hotkey, "ctrl+space");
    }

    #[test]
    fn provider_configs_follow_offer_order() {
        let names: Vec<_> = get_default_settings()
            .provider_configs()
            .iter()
            .map(|c| c.internal_name())
            .collect();
        assert_eq!(names, ["gemini", "openai", "ollama", "anthropic", "mistral"]);
    }

    #[test]
    fn shared_settings_serve_actions() {
        let shared = SharedSettings::new(get_default_settings(), None);
        assert!(shared.find("Proofread").is_some());
        shared
            .update(|s| s.actions.retain(|a| a.name != "Proofread"))
            .unwrap();
        assert!(shared.find("Proofread").is_none());
    }

    #[test]
    fn capture_settings_convert_to_timings() {
        let timings: CaptureTimings = CaptureSettings::default().into();
        assert_eq!(timings.copy_delay, Duration::from_millis(200));
        assert_eq!(timings.reselect_delay, Duration::from_millis(100));
    }
}
