//! Shutdown coordination (spec §5, scenario S6). SIGINT/SIGTERM trigger a
//! single idempotent teardown: stop polling, disconnect every context
//! sequentially, stop the WebUI, persist the Config Store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ConfigStore;
use crate::connection::ConnectionFlow;
use crate::registry::ContextRegistry;

pub struct ShutdownHandler {
    registry: Arc<ContextRegistry>,
    connection_flow: Arc<ConnectionFlow>,
    config: Arc<ConfigStore>,
    polling_cancel: CancellationToken,
    webui_cancel: CancellationToken,
    done: AtomicBool,
}

impl ShutdownHandler {
    pub fn new(
        registry: Arc<ContextRegistry>,
        connection_flow: Arc<ConnectionFlow>,
        config: Arc<ConfigStore>,
        polling_cancel: CancellationToken,
        webui_cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(ShutdownHandler {
            registry,
            connection_flow,
            config,
            polling_cancel,
            webui_cancel,
            done: AtomicBool::new(false),
        })
    }

    /// Idempotent: a second call while (or after) the first has run is a
    /// no-op (spec §5).
    pub async fn shutdown(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("shutdown: stopping polling coordinator");
        self.polling_cancel.cancel();

        let context_ids = self.registry.all_context_ids().await;
        for context_id in context_ids {
            info!(context_id = %context_id, "shutdown: disconnecting context");
            self.connection_flow.disconnect(&context_id).await;
        }

        info!("shutdown: stopping webui");
        self.webui_cancel.cancel();

        info!("shutdown: persisting config store");
        self.config.dispose().await;

        info!("shutdown complete");
    }
}

/// Awaits SIGINT or SIGTERM (platform-gated) and runs `handler.shutdown()`.
pub async fn wait_for_signal_and_shutdown(handler: Arc<ShutdownHandler>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    handler.shutdown().await;
}
