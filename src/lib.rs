//! `flotilla`: multi-printer fleet supervisor. `start_flotilla` wires every
//! component together and hands back a handle bag. The unit of concurrency
//! is a printer *context*, not a single serial port, so most of the wiring
//! reacts to `ContextRegistry` events rather than running a fixed number of
//! tasks.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::camera::{CameraProxyLifecycle, RtspProxyLifecycle};
use crate::config::ConfigStore;
use crate::connection::{CheckCodeProvider, ClientFactory, ConnectionFlow};
use crate::event_bus::Topic;
use crate::monitor::PrintStateMonitor;
use crate::polling::PollingCoordinator;
use crate::printer_details::PrinterDetailsStore;
use crate::registry::{ContextRegistry, RegistryEvent};
use crate::spoolman::SpoolmanClient;
use crate::temperature::{TemperatureEvent, TemperatureMonitor};
use crate::thumbnail_queue::ThumbnailQueue;
use crate::types::{ClientTypeTag, LifecycleEvent};
use crate::usage::{UsageEvent, UsageTracker};

pub mod backend;
pub mod camera;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod event_bus;
pub mod monitor;
pub mod net;
pub mod polling;
pub mod printer_details;
pub mod registry;
pub mod shutdown;
pub mod spoolman;
pub mod temperature;
pub mod thumbnail_queue;
pub mod types;
pub mod usage;

/// The mutually-exclusive startup modes of spec §6.2. Parsing argv into this
/// shape is `main.rs`'s job; the library only ever sees the structured form.
#[derive(Clone, Debug)]
pub enum ConnectionMode {
    LastUsed,
    AllSavedPrinters,
    Printers(Vec<(String, ClientTypeTag, Option<String>)>),
    NoPrinters,
}

#[derive(Clone, Debug)]
pub struct StartupOptions {
    pub data_dir: PathBuf,
    pub mode: ConnectionMode,
    pub webui_port_override: Option<u16>,
    pub webui_password_override: Option<String>,
    pub spoolman_base_url: String,
}

impl Default for StartupOptions {
    fn default() -> Self {
        StartupOptions {
            data_dir: PathBuf::from("data"),
            mode: ConnectionMode::NoPrinters,
            webui_port_override: None,
            webui_password_override: None,
            spoolman_base_url: "http://localhost:7912".to_string(),
        }
    }
}

/// Every long-lived handle `main.rs` (or an embedding host) needs: the
/// wired-up components, the cross-context event feeds an external WebUI
/// would subscribe to (spec §6.5), and the shutdown coordinator.
pub struct Flotilla {
    pub config: Arc<ConfigStore>,
    pub printer_details: Arc<PrinterDetailsStore>,
    pub registry: Arc<ContextRegistry>,
    pub connection_flow: Arc<ConnectionFlow>,
    pub polling: Arc<PollingCoordinator>,
    pub thumbnail_queue: Arc<ThumbnailQueue>,
    pub camera: Arc<CameraProxyLifecycle>,
    pub rtsp_camera: Arc<RtspProxyLifecycle>,
    pub shutdown: Arc<shutdown::ShutdownHandler>,
    /// Aggregated across every context, the way an external WebUI would
    /// observe them (spec §6.5) — each event already carries its `context_id`.
    pub lifecycle_events: Arc<Topic<LifecycleEvent>>,
    pub temperature_events: Arc<Topic<TemperatureEvent>>,
    pub usage_events: Arc<Topic<UsageEvent>>,
}

/// Wires every component, starts the Polling Coordinator's supervisor and the
/// per-context monitor fan-out, then connects whatever printers `options.mode`
/// asks for. Never panics on a single printer failing to connect — each
/// failure is logged and the rest of the fleet still starts (spec §4.3.7).
pub async fn start_flotilla(
    options: StartupOptions,
    client_factory: Arc<dyn ClientFactory>,
    check_code_provider: Option<Arc<dyn CheckCodeProvider>>,
) -> Arc<Flotilla> {
    let config = ConfigStore::load(&options.data_dir).await;
    apply_overrides(&config, &options).await;

    let printer_details = PrinterDetailsStore::load(&options.data_dir).await;
    let registry = ContextRegistry::new();

    let app_config = config.get_all().await;
    let connection_flow = ConnectionFlow::new(
        registry.clone(),
        printer_details.clone(),
        client_factory,
        check_code_provider,
        app_config.force_legacy_api,
    );

    let polling = PollingCoordinator::new(
        registry.clone(),
        app_config.active_interval_ms,
        app_config.inactive_interval_ms,
    );
    let polling_cancel = polling.start();

    let thumbnail_queue = ThumbnailQueue::new(registry.clone());
    let camera = CameraProxyLifecycle::new(registry.clone());
    let rtsp_camera = RtspProxyLifecycle::new();
    let spoolman = Arc::new(SpoolmanClient::new(options.spoolman_base_url.clone()));

    let lifecycle_events = Arc::new(Topic::new());
    let temperature_events = Arc::new(Topic::new());
    let usage_events = Arc::new(Topic::new());

    spawn_per_context_fanout(
        registry.clone(),
        polling.clone(),
        config.clone(),
        printer_details.clone(),
        spoolman,
        lifecycle_events.clone(),
        temperature_events.clone(),
        usage_events.clone(),
    );

    let webui_cancel = CancellationToken::new();
    let shutdown = shutdown::ShutdownHandler::new(
        registry.clone(),
        connection_flow.clone(),
        config.clone(),
        polling_cancel,
        webui_cancel,
    );

    connect_startup_fleet(&connection_flow, &printer_details, options.mode).await;

    Arc::new(Flotilla {
        config,
        printer_details,
        registry,
        connection_flow,
        polling,
        thumbnail_queue,
        camera,
        rtsp_camera,
        shutdown,
        lifecycle_events,
        temperature_events,
        usage_events,
    })
}

async fn apply_overrides(config: &Arc<ConfigStore>, options: &StartupOptions) {
    if options.webui_port_override.is_none() && options.webui_password_override.is_none() {
        return;
    }
    let mut partial = config::UpdateAppConfig {
        webui_port: None,
        webui_password: None,
        force_legacy_api: None,
        usage_tracking_enabled: None,
        usage_update_mode: None,
        active_interval_ms: None,
        inactive_interval_ms: None,
    };
    partial.webui_port = options.webui_port_override;
    if options.webui_password_override.is_some() {
        partial.webui_password = Some(options.webui_password_override.clone());
    }
    config.update(partial).await;
}

async fn connect_startup_fleet(
    connection_flow: &Arc<ConnectionFlow>,
    printer_details: &Arc<PrinterDetailsStore>,
    mode: ConnectionMode,
) {
    match mode {
        ConnectionMode::NoPrinters => {}
        ConnectionMode::LastUsed => {
            if let Some(saved) = printer_details.get_last_used(None).await {
                connection_flow.connect_from_saved(vec![saved]).await;
            } else {
                info!("--last-used given but no printer has ever been connected");
            }
        }
        ConnectionMode::AllSavedPrinters => {
            let saved: Vec<_> = printer_details.all().await.printers.into_values().collect();
            connection_flow.connect_from_saved(saved).await;
        }
        ConnectionMode::Printers(specs) => {
            connection_flow.connect_direct(specs).await;
        }
    }
}

/// Reacts to `ContextCreated` by standing up this context's Print State
/// Monitor, Temperature Monitor, and Usage Tracker, and forwarding each
/// context-scoped event stream into the process-wide topics an external
/// consumer observes (spec §6.5). Runs for the process lifetime; per-context
/// tasks end themselves when their context's Polling loop stops publishing.
#[allow(clippy::too_many_arguments)]
fn spawn_per_context_fanout(
    registry: Arc<ContextRegistry>,
    polling: Arc<PollingCoordinator>,
    config: Arc<ConfigStore>,
    printer_details: Arc<PrinterDetailsStore>,
    spoolman: Arc<SpoolmanClient>,
    lifecycle_events: Arc<Topic<LifecycleEvent>>,
    temperature_events: Arc<Topic<TemperatureEvent>>,
    usage_events: Arc<Topic<UsageEvent>>,
) {
    tokio::spawn(async move {
        let mut events = registry.events.subscribe();
        while let Ok(event) = events.recv().await {
            let RegistryEvent::ContextCreated { context_id } = event else {
                continue;
            };

            let monitor = PrintStateMonitor::new(context_id.clone());
            let per_context_lifecycle = monitor.spawn(&polling.events);
            forward(&per_context_lifecycle, lifecycle_events.clone());

            let temperature_monitor = TemperatureMonitor::new(context_id.clone());
            temperature_monitor.spawn(&per_context_lifecycle, &polling.events);
            forward(&temperature_monitor.events, temperature_events.clone());

            let usage_tracker = UsageTracker::new(
                context_id,
                config.clone(),
                registry.clone(),
                printer_details.clone(),
                spoolman.clone(),
            );
            usage_tracker.spawn(&per_context_lifecycle);
            forward(&usage_tracker.events, usage_events.clone());
        }
    });
}

fn forward<T: Clone + Send + 'static>(source: &Topic<T>, dest: Arc<Topic<T>>) {
    let mut rx = source.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            dest.publish(event);
        }
    });
}
