//! Context Registry (C4, spec §4.4). In-memory table of live printer
//! contexts; exactly one may be active at a time.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::backend::Backend;
use crate::client::{LegacyClient, RichClient};
use crate::event_bus::Topic;
use crate::types::{ActiveSpool, ConnectionState, PerPrinterOverrides, PrinterIdentity};

/// The primary client is a rich client for the `fiveM` family, or a legacy
/// client reused as the primary otherwise (spec §4.3.4).
#[derive(Clone)]
pub enum PrimaryClient {
    Rich(Arc<dyn RichClient>),
    Legacy(Arc<dyn LegacyClient>),
}

pub struct PrinterContext {
    pub context_id: String,
    pub identity: PrinterIdentity,
    pub check_code: Option<String>,
    pub primary_client: PrimaryClient,
    pub secondary_client: Option<Arc<dyn LegacyClient>>,
    pub overrides: PerPrinterOverrides,
    pub connection_state: ConnectionState,
    pub camera_port: Option<u16>,
    pub created_at: String,
    pub last_activity_at: String,
    pub is_active: bool,
    /// Decorations set by other components; the Registry never interprets
    /// them (spec §4.4).
    pub backend: Option<Arc<Backend>>,
    pub polling_running: bool,
}

#[derive(Clone, Debug)]
pub struct ContextInfo {
    pub context_id: String,
    pub name: String,
    pub is_active: bool,
    pub connection_state: ConnectionState,
    pub camera_port: Option<u16>,
}

#[derive(Clone, Debug)]
pub enum RegistryEvent {
    ContextCreated { context_id: String },
    ContextRemoved { context_id: String, was_active: bool },
    ContextSwitched {
        context_id: String,
        previous_context_id: Option<String>,
    },
}

pub struct ContextRegistry {
    contexts: RwLock<HashMap<String, PrinterContext>>,
    serial_index: RwLock<HashMap<String, String>>,
    pub events: Topic<RegistryEvent>,
}

impl ContextRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(ContextRegistry {
            contexts: RwLock::new(HashMap::new()),
            serial_index: RwLock::new(HashMap::new()),
            events: Topic::new(),
        })
    }

    /// Inserts a new context, making it active and demoting whatever was
    /// active before. Mirrors the atomic switch semantics spec §4.4 requires
    /// even on the very first insertion.
    pub async fn insert(&self, context: PrinterContext) {
        let context_id = context.context_id.clone();
        let serial = context.identity.serial_number.clone();

        let previous_active = {
            let mut contexts = self.contexts.write().await;
            let previous_active = contexts
                .iter()
                .find(|(_, c)| c.is_active)
                .map(|(id, _)| id.clone());
            if let Some(prev_id) = &previous_active {
                if let Some(prev) = contexts.get_mut(prev_id) {
                    prev.is_active = false;
                }
            }
            contexts.insert(context_id.clone(), context);
            previous_active
        };
        self.serial_index.write().await.insert(serial, context_id.clone());

        self.events.publish(RegistryEvent::ContextCreated {
            context_id: context_id.clone(),
        });
        self.events.publish(RegistryEvent::ContextSwitched {
            context_id,
            previous_context_id: previous_active,
        });
    }

    /// Atomically switches the active context. No-op (but still emits) if
    /// `context_id` is already active.
    pub async fn switch_active(&self, context_id: &str) -> bool {
        let previous = {
            let mut contexts = self.contexts.write().await;
            if !contexts.contains_key(context_id) {
                return false;
            }
            let previous = contexts
                .iter()
                .find(|(id, c)| c.is_active && id.as_str() != context_id)
                .map(|(id, _)| id.clone());
            if let Some(prev_id) = &previous {
                if let Some(prev) = contexts.get_mut(prev_id) {
                    prev.is_active = false;
                }
            }
            if let Some(target) = contexts.get_mut(context_id) {
                target.is_active = true;
            }
            previous
        };
        self.events.publish(RegistryEvent::ContextSwitched {
            context_id: context_id.to_string(),
            previous_context_id: previous,
        });
        true
    }

    pub async fn remove(&self, context_id: &str) -> Option<PrinterContext> {
        let removed = self.contexts.write().await.remove(context_id);
        if let Some(context) = &removed {
            self.serial_index
                .write()
                .await
                .remove(&context.identity.serial_number);
            self.events.publish(RegistryEvent::ContextRemoved {
                context_id: context_id.to_string(),
                was_active: context.is_active,
            });
        }
        removed
    }

    pub async fn get_info(&self, context_id: &str) -> Option<ContextInfo> {
        self.contexts.read().await.get(context_id).map(to_info)
    }

    pub async fn active_context_id(&self) -> Option<String> {
        self.contexts
            .read()
            .await
            .iter()
            .find(|(_, c)| c.is_active)
            .map(|(id, _)| id.clone())
    }

    pub async fn find_by_serial(&self, serial: &str) -> Option<String> {
        self.serial_index.read().await.get(serial).cloned()
    }

    pub async fn all_context_ids(&self) -> Vec<String> {
        self.contexts.read().await.keys().cloned().collect()
    }

    pub async fn set_camera_port(&self, context_id: &str, port: Option<u16>) {
        if let Some(context) = self.contexts.write().await.get_mut(context_id) {
            context.camera_port = port;
        }
    }

    pub async fn set_backend_decoration(&self, context_id: &str, backend: Option<Arc<Backend>>) {
        if let Some(context) = self.contexts.write().await.get_mut(context_id) {
            context.backend = backend;
        }
    }

    pub async fn get_backend(&self, context_id: &str) -> Option<Arc<Backend>> {
        self.contexts
            .read()
            .await
            .get(context_id)
            .and_then(|c| c.backend.clone())
    }

    pub async fn set_polling_running(&self, context_id: &str, running: bool) {
        if let Some(context) = self.contexts.write().await.get_mut(context_id) {
            context.polling_running = running;
        }
    }

    pub async fn get_identity(&self, context_id: &str) -> Option<PrinterIdentity> {
        self.contexts
            .read()
            .await
            .get(context_id)
            .map(|c| c.identity.clone())
    }

    pub async fn get_overrides(&self, context_id: &str) -> Option<PerPrinterOverrides> {
        self.contexts
            .read()
            .await
            .get(context_id)
            .map(|c| c.overrides.clone())
    }

    pub async fn set_active_spool(&self, context_id: &str, spool: Option<ActiveSpool>) {
        if let Some(context) = self.contexts.write().await.get_mut(context_id) {
            context.overrides.active_spool = spool;
        }
    }
}

fn to_info(context: &PrinterContext) -> ContextInfo {
    ContextInfo {
        context_id: context.context_id.clone(),
        name: context.identity.name.clone(),
        is_active: context.is_active,
        connection_state: context.connection_state,
        camera_port: context.camera_port,
    }
}
