pub mod actions;
pub mod app;
pub mod clipboard;
pub mod conversation;
pub mod coordinator;
pub mod delivery;
pub mod frontend;
pub mod hotkey;
pub mod input;
pub mod logging;
pub mod providers;
pub mod selection;
pub mod settings;
pub mod spam_guard;

use anyhow::Context;
use app::AppController;
use clipboard::ClipboardChannel;
use coordinator::{RequestCoordinator, UiEvent};
use frontend::HeadlessFrontend;
use hotkey::HotkeyListener;
use input::EnigoKeystrokes;
use log::{info, warn};
use providers::{HttpContext, ProviderGateway};
use selection::SelectionCapture;
use settings::SharedSettings;
use std::sync::{mpsc, Arc};
use std::time::Duration;

/// Loads settings, wires every component and runs the event loop on the
/// calling thread until exit.
pub fn run() -> anyhow::Result<()> {
    let settings_path = match settings::settings_path() {
        Ok(path) => Some(path),
        Err(e) => {
            eprintln!("Settings will not be saved: {}", e);
            None
        }
    };
    let app_settings = match &settings_path {
        Some(path) => settings::load_or_create_app_settings(path),
        None => settings::get_default_settings(),
    };

    let log_dir = settings::app_config_dir().ok();
    logging::init(app_settings.log_level, log_dir.as_deref())?;
    info!(
        "textrelay {} starting (provider {}, hotkey {})",
        env!("CARGO_PKG_VERSION"),
        app_settings.provider,
        app_settings.hotkey
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("textrelay-http")
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;
    let http = HttpContext::new(runtime.handle().clone())?;
    let gateway = Arc::new(ProviderGateway::from_configs(
        http,
        app_settings.provider_configs(),
        &app_settings.provider,
    ));

    let shared = SharedSettings::new(app_settings.clone(), settings_path);
    let (events, receiver) = mpsc::channel();

    let capture = SelectionCapture::new(
        ClipboardChannel::system(),
        Arc::new(EnigoKeystrokes::new()),
        app_settings.capture_timings(),
    );
    let coordinator =
        RequestCoordinator::new(capture, gateway, Arc::new(shared.clone()), events.clone());
    let frontend = Box::new(HeadlessFrontend::new(
        events.clone(),
        app_settings.default_action.clone(),
    ));

    let trigger_events = events.clone();
    let hotkey = Arc::new(HotkeyListener::new(move |at| {
        let _ = trigger_events.send(UiEvent::Trigger { at });
    }));

    if let Err(e) = app::forward_signals(events.clone()) {
        warn!("{:#}", e);
    }

    let mut controller = AppController::new(shared, hotkey, coordinator, frontend, events, receiver);
    controller.run();

    runtime.shutdown_timeout(Duration::from_secs(1));
    info!("Bye");
    log::logger().flush();
    Ok(())
}
