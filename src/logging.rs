//! Process-wide logging: stderr plus an append-only file in the config dir.
//!
//! The crate logs through the `log` macros; `tracing-subscriber` bridges those
//! records and formats them onto both sinks.

use crate::settings::LogLevel;
use anyhow::Context;
use log::{warn, LevelFilter};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::fmt::{self, time::ChronoLocal};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Overrides the configured level, e.g. `TEXTRELAY_LOG=debug,reqwest=warn`.
pub const LOG_ENV_VAR: &str = "TEXTRELAY_LOG";
pub const LOG_FILE_NAME: &str = "textrelay.log";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// HTTP internals are chatty at debug level.
const QUIET_MODULES: [&str; 3] = ["hyper", "hyper_util", "reqwest"];

/// Directive string for the configured level, with `env_spec` appended so its
/// directives win.
fn filter_spec(level: LevelFilter, env_spec: Option<&str>) -> String {
    let mut directives = vec![level.as_str().to_lowercase()];
    if level > LevelFilter::Info {
        directives.extend(QUIET_MODULES.iter().map(|module| format!("{}=info", module)));
    }
    if let Some(spec) = env_spec.map(str::trim).filter(|s| !s.is_empty()) {
        directives.push(spec.to_string());
    }
    directives.join(",")
}

/// Installs the subscriber. `log_dir` is created if needed; when the log file
/// cannot be opened logging continues on stderr only.
pub fn init(level: LogLevel, log_dir: Option<&Path>) -> anyhow::Result<()> {
    let env_spec = std::env::var(LOG_ENV_VAR).ok();
    let filter = EnvFilter::builder().parse_lossy(filter_spec(level.into(), env_spec.as_deref()));

    let (file, file_error) = match log_dir.map(open_log_file) {
        Some(Ok(file)) => (Some(file), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };
    let file_layer = file.map(|file| {
        fmt::layer()
            .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
            .with_ansi(false)
            .with_writer(Mutex::new(file))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .try_init()
        .context("a logger is already installed")?;

    if let Some(e) = file_error {
        warn!("Logging to stderr only: {:#}", e);
    }
    Ok(())
}

fn open_log_file(dir: &Path) -> anyhow::Result<File> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("cannot create log directory {}", dir.display()))?;
    let path = dir.join(LOG_FILE_NAME);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("cannot open log file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_level_applies_without_env() {
        assert_eq!(filter_spec(LevelFilter::Info, None), "info");
        assert_eq!(filter_spec(LevelFilter::Warn, Some("  ")), "warn");
    }

    #[test]
    fn env_spec_comes_last() {
        let spec = filter_spec(LevelFilter::Warn, Some("textrelay_app_lib=debug"));
        assert_eq!(spec, "warn,textrelay_app_lib=debug");
        assert!(EnvFilter::try_new(&spec).is_ok());
    }

    #[test]
    fn http_internals_stay_quiet_at_debug() {
        let spec = filter_spec(LevelFilter::Debug, None);
        assert_eq!(spec, "debug,hyper=info,hyper_util=info,reqwest=info");
        assert!(EnvFilter::try_new(&spec).is_ok());
    }

    #[test]
    fn log_file_is_created_in_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("logs");
        open_log_file(&nested).unwrap();
        assert!(nested.join(LOG_FILE_NAME).is_file());
    }
}
