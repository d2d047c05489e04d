//! Connection Flow (C3, spec §4.3). The hardest control flow in the system:
//! given a discovered printer, a stored printer, or an explicit
//! `(ip, clientTypeTag, checkCode?)`, produces a fully wired Context or a
//! typed error. Never throws across its boundary — every public call
//! returns a `ConnectionResult`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, timeout};
use tracing::{info, instrument, warn};

use crate::backend::Backend;
use crate::client::{LegacyClient, LegacyPrinterInfo, RichClient};
use crate::error::{ErrorKind, FlotillaError};
use crate::event_bus::Topic;
use crate::printer_details::PrinterDetailsStore;
use crate::registry::{ContextRegistry, PrimaryClient, PrinterContext};
use crate::types::{
    ClientTypeTag, ConnectionState, Family, ModelKind, PerPrinterOverrides, PrinterIdentity,
    StoredPrinter, next_context_id,
};

const T_PROBE: Duration = Duration::from_secs(10);
const N_PROBE: u32 = 3;
const PROBE_BACKOFF_BASE: Duration = Duration::from_secs(1);
const POST_RICH_INIT_DELAY: Duration = Duration::from_millis(500);
const POST_TEMP_CLIENT_DISPOSE_DELAY: Duration = Duration::from_millis(200);
const POST_DISCONNECT_TIMER_DRAIN: Duration = Duration::from_millis(100);

/// Builds concrete client instances. Implemented by the external wire
/// protocol library; the core never constructs a client itself.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn open_legacy(&self, ip_address: &str) -> Result<Arc<dyn LegacyClient>, FlotillaError>;
    async fn open_rich(
        &self,
        ip_address: &str,
        serial_number: &str,
        check_code: &str,
    ) -> Result<Arc<dyn RichClient>, FlotillaError>;
}

/// External input-dialog collaborator used for interactive check-code entry.
#[async_trait]
pub trait CheckCodeProvider: Send + Sync {
    async fn prompt(&self, identity: &PrinterIdentity) -> Option<String>;
}

#[derive(Clone, Debug)]
pub struct ConnectionDetails {
    pub context_id: String,
    pub identity: PrinterIdentity,
}

pub enum ConnectionResult {
    Success(ConnectionDetails),
    Failure(FlotillaError),
}

#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    Connected { details: ConnectionDetails },
    PreDisconnect { context_id: String },
    Disconnected { name: String },
}

/// Outcome of a probe, including whatever legacy client it opened so the
/// final handshake can reuse it instead of discarding it (spec §9 —
/// `ProbeOutcome` explicit carry, replacing the source's sentinel field).
struct ProbeOutcome {
    identity: PrinterIdentity,
    carry: Option<Arc<dyn LegacyClient>>,
}

pub struct ConnectionFlow {
    registry: Arc<ContextRegistry>,
    printer_details: Arc<PrinterDetailsStore>,
    client_factory: Arc<dyn ClientFactory>,
    check_code_provider: Option<Arc<dyn CheckCodeProvider>>,
    force_legacy_api: bool,
    pub events: Topic<ConnectionEvent>,
}

impl ConnectionFlow {
    pub fn new(
        registry: Arc<ContextRegistry>,
        printer_details: Arc<PrinterDetailsStore>,
        client_factory: Arc<dyn ClientFactory>,
        check_code_provider: Option<Arc<dyn CheckCodeProvider>>,
        force_legacy_api: bool,
    ) -> Arc<Self> {
        Arc::new(ConnectionFlow {
            registry,
            printer_details,
            client_factory,
            check_code_provider,
            force_legacy_api,
            events: Topic::new(),
        })
    }

    /// §4.3.1 Probe: opens a temporary legacy client and retrieves identity.
    /// `forced_legacy` folds in a per-printer `ClientTypeTag::Legacy` on top
    /// of the global `force_legacy_api` flag (spec §4.3.2, §6.2).
    #[instrument(skip(self), fields(ip = %ip_address))]
    async fn probe(&self, ip_address: &str, forced_legacy: bool) -> Result<ProbeOutcome, FlotillaError> {
        let mut last_error = FlotillaError::network("probe never attempted");
        for attempt in 0..N_PROBE {
            if attempt > 0 {
                let backoff = PROBE_BACKOFF_BASE * 2u32.pow(attempt - 1);
                sleep(backoff).await;
            }
            match timeout(T_PROBE, self.probe_once(ip_address, forced_legacy)).await {
                Ok(Ok(outcome)) => return Ok(outcome),
                Ok(Err(err)) => last_error = err,
                Err(_) => last_error = FlotillaError::timeout("probe timed out"),
            }
        }
        warn!(error = %last_error, "probe failed after retries");
        Err(FlotillaError::new(ErrorKind::Network, format!("probe-failed: {last_error}")))
    }

    async fn probe_once(&self, ip_address: &str, forced_legacy: bool) -> Result<ProbeOutcome, FlotillaError> {
        let legacy = self.client_factory.open_legacy(ip_address).await?;
        let ok = legacy.init_control().await?;
        if !ok {
            legacy.dispose().await;
            return Err(FlotillaError::protocol_handshake("initControl returned false"));
        }
        let info: LegacyPrinterInfo = legacy.get_printer_info().await?;
        let type_name = match info.type_name {
            Some(t) if !t.is_empty() => t,
            _ => {
                legacy.dispose().await;
                return Err(FlotillaError::protocol_handshake("probe returned no typeName"));
            }
        };

        let serial_number = info.serial_number.unwrap_or_else(|| {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis();
            PrinterIdentity::synthesize_serial(now)
        });

        let model_kind = ModelKind::classify(&type_name);
        let force_legacy = self.force_legacy_api || forced_legacy;
        let identity = PrinterIdentity {
            name: info.name.unwrap_or_else(|| type_name.clone()),
            ip_address: ip_address.to_string(),
            serial_number,
            type_name,
            family: if force_legacy {
                Family::Legacy
            } else {
                model_kind.family()
            },
            model_kind: if force_legacy {
                ModelKind::GenericLegacy
            } else {
                model_kind
            },
        };

        Ok(ProbeOutcome {
            identity,
            carry: Some(legacy),
        })
    }

    /// §4.3.3 Check-code acquisition: explicit arg, then stored, then prompt.
    async fn acquire_check_code(
        &self,
        identity: &PrinterIdentity,
        explicit: Option<String>,
    ) -> Result<String, FlotillaError> {
        if let Some(code) = explicit {
            return Ok(code);
        }
        if let Some(stored) = self.printer_details.get(&identity.serial_number).await {
            if !stored.check_code.is_empty() {
                return Ok(stored.check_code);
            }
        }
        if let Some(provider) = &self.check_code_provider {
            if let Some(code) = provider.prompt(identity).await {
                return Ok(code);
            }
        }
        Err(FlotillaError::cancelled(
            "no check code available and no prompt handler accepted one",
        ))
    }

    /// §4.3.4 Final handshake, producing the primary/secondary client pair.
    async fn handshake(
        &self,
        identity: &PrinterIdentity,
        probe_carry: Option<Arc<dyn LegacyClient>>,
        check_code: Option<&str>,
    ) -> Result<(PrimaryClient, Option<Arc<dyn LegacyClient>>), FlotillaError> {
        if identity.family == Family::FiveM && !self.force_legacy_api {
            let check_code = check_code.ok_or_else(|| {
                FlotillaError::protocol_handshake("fiveM family requires a check code")
            })?;
            let rich = self
                .client_factory
                .open_rich(&identity.ip_address, &identity.serial_number, check_code)
                .await?;
            if !rich.initialize().await.unwrap_or(false) {
                rich.dispose().await;
                return Err(FlotillaError::protocol_handshake("rich initialize failed"));
            }
            if !rich.init_control().await.unwrap_or(false) {
                rich.dispose().await;
                return Err(FlotillaError::protocol_handshake("rich initControl failed"));
            }
            sleep(POST_RICH_INIT_DELAY).await;

            // The probe's legacy client is discarded either way once we know
            // we're building a rich pair — a fresh secondary is opened so its
            // lifecycle is independent of the probe's temporary one.
            if let Some(carry) = probe_carry {
                carry.dispose().await;
                sleep(POST_TEMP_CLIENT_DISPOSE_DELAY).await;
            }
            let secondary = self.client_factory.open_legacy(&identity.ip_address).await?;
            if !secondary.init_control().await.unwrap_or(false) {
                rich.dispose().await;
                secondary.dispose().await;
                return Err(FlotillaError::protocol_handshake("secondary initControl failed"));
            }
            Ok((PrimaryClient::Rich(rich), Some(secondary)))
        } else {
            let legacy = match probe_carry {
                Some(carry) => carry,
                None => self.client_factory.open_legacy(&identity.ip_address).await?,
            };
            if !legacy.init_control().await.unwrap_or(false) {
                legacy.dispose().await;
                return Err(FlotillaError::protocol_handshake("legacy initControl failed"));
            }
            Ok((PrimaryClient::Legacy(legacy), None))
        }
    }

    /// §4.3.5 Context materialization: atomic from the Registry's
    /// perspective.
    async fn materialize(
        &self,
        identity: PrinterIdentity,
        check_code: Option<String>,
        primary: PrimaryClient,
        secondary: Option<Arc<dyn LegacyClient>>,
        overrides: PerPrinterOverrides,
    ) -> Result<ConnectionDetails, FlotillaError> {
        let context_id = next_context_id();
        let now = now_iso();

        let existing = self.printer_details.get(&identity.serial_number).await;
        let stored = StoredPrinter {
            name: identity.name.clone(),
            ip_address: identity.ip_address.clone(),
            serial_number: identity.serial_number.clone(),
            type_name: identity.type_name.clone(),
            family: identity.family,
            model_kind: identity.model_kind,
            check_code: check_code.clone().unwrap_or_default(),
            client_type_tag: match identity.family {
                Family::FiveM => ClientTypeTag::New,
                Family::Legacy => ClientTypeTag::Legacy,
            },
            last_connected_at: Some(now.clone()),
            per_printer_overrides: existing
                .map(|e| e.per_printer_overrides)
                .unwrap_or(overrides),
        };
        self.printer_details.save(stored, true).await?;

        let rich_for_backend = match &primary {
            PrimaryClient::Rich(rich) => Some(rich.clone()),
            PrimaryClient::Legacy(_) => None,
        };
        let legacy_for_backend = match &primary {
            PrimaryClient::Legacy(legacy) => Some(legacy.clone()),
            PrimaryClient::Rich(_) => secondary.clone(),
        };

        let backend = match Backend::new(identity.model_kind, rich_for_backend, legacy_for_backend) {
            Ok(b) => Arc::new(b),
            Err(err) => {
                self.dispose_pair(&primary, &secondary).await;
                return Err(err);
            }
        };
        if let Err(err) = backend.initialize().await.outcome {
            backend.dispose().await;
            self.dispose_pair(&primary, &secondary).await;
            return Err(err);
        }

        let context = PrinterContext {
            context_id: context_id.clone(),
            identity: identity.clone(),
            check_code,
            primary_client: primary,
            secondary_client: secondary,
            overrides,
            connection_state: ConnectionState::Connected,
            camera_port: None,
            created_at: now.clone(),
            last_activity_at: now,
            is_active: false,
            backend: Some(backend),
            polling_running: false,
        };
        self.registry.insert(context).await;

        let details = ConnectionDetails {
            context_id,
            identity,
        };
        self.events.publish(ConnectionEvent::Connected {
            details: details.clone(),
        });
        info!(context_id = %details.context_id, "printer connected");
        Ok(details)
    }

    async fn dispose_pair(&self, primary: &PrimaryClient, secondary: &Option<Arc<dyn LegacyClient>>) {
        match primary {
            PrimaryClient::Rich(rich) => rich.dispose().await,
            PrimaryClient::Legacy(legacy) => legacy.dispose().await,
        }
        if let Some(secondary) = secondary {
            secondary.dispose().await;
        }
    }

    /// Full flow for one printer: probe, classify (already folded into
    /// probe), check-code, handshake, materialize.
    #[instrument(skip(self, explicit_check_code))]
    pub async fn connect(
        &self,
        ip_address: &str,
        explicit_check_code: Option<String>,
    ) -> ConnectionResult {
        self.connect_forcing_legacy(ip_address, explicit_check_code, false).await
    }

    async fn connect_forcing_legacy(
        &self,
        ip_address: &str,
        explicit_check_code: Option<String>,
        forced_legacy: bool,
    ) -> ConnectionResult {
        match self.connect_inner(ip_address, explicit_check_code, forced_legacy).await {
            Ok(details) => ConnectionResult::Success(details),
            Err(err) => ConnectionResult::Failure(err),
        }
    }

    async fn connect_inner(
        &self,
        ip_address: &str,
        explicit_check_code: Option<String>,
        forced_legacy: bool,
    ) -> Result<ConnectionDetails, FlotillaError> {
        let probe = self.probe(ip_address, forced_legacy).await?;
        let check_code = if probe.identity.family == Family::FiveM && !self.force_legacy_api {
            Some(self.acquire_check_code(&probe.identity, explicit_check_code).await?)
        } else {
            None
        };
        let (primary, secondary) = self
            .handshake(&probe.identity, probe.carry, check_code.as_deref())
            .await?;
        self.materialize(
            probe.identity,
            check_code,
            primary,
            secondary,
            PerPrinterOverrides::default(),
        )
        .await
    }

    /// §4.3.6 Disconnect: inverse of materialize, idempotent.
    #[instrument(skip(self))]
    pub async fn disconnect(&self, context_id: &str) {
        self.events.publish(ConnectionEvent::PreDisconnect {
            context_id: context_id.to_string(),
        });

        let Some(context) = self.registry.remove(context_id).await else {
            // Already disconnected — idempotent no-op.
            return;
        };

        if let Some(backend) = &context.backend {
            backend.dispose().await;
        }

        match &context.primary_client {
            PrimaryClient::Rich(rich) => rich.dispose().await,
            PrimaryClient::Legacy(legacy) => {
                let _ = legacy.send_raw_cmd("~M602").await;
                legacy.dispose().await;
            }
        }
        if let Some(secondary) = &context.secondary_client {
            let _ = secondary.send_raw_cmd("~M602").await;
            secondary.dispose().await;
        }

        sleep(POST_DISCONNECT_TIMER_DRAIN).await;

        self.events.publish(ConnectionEvent::Disconnected {
            name: context.identity.name.clone(),
        });
        info!(context_id, "printer disconnected");
    }

    /// §4.3.7 `connectFromSaved`: sequential, each failure logged and
    /// skipped.
    pub async fn connect_from_saved(&self, saved: Vec<StoredPrinter>) -> Vec<ConnectionResult> {
        let mut results = Vec::with_capacity(saved.len());
        for printer in saved {
            let result = self.connect(&printer.ip_address, Some(printer.check_code.clone())).await;
            if let ConnectionResult::Success(details) = &result {
                self.registry.switch_active(&details.context_id).await;
            } else if let ConnectionResult::Failure(err) = &result {
                warn!(serial = %printer.serial_number, error = %err, "connectFromSaved: printer failed, continuing");
            }
            results.push(result);
        }
        results
    }

    /// §4.3.7 `connectDirect`: explicit `(ip, typeTag, checkCode?)` specs.
    /// A `ClientTypeTag::Legacy` tag forces the legacy family/model even if
    /// the printer would otherwise probe as a rich `fiveM` (spec §6.2).
    pub async fn connect_direct(
        &self,
        specs: Vec<(String, ClientTypeTag, Option<String>)>,
    ) -> Vec<ConnectionResult> {
        let mut results = Vec::with_capacity(specs.len());
        for (ip, type_tag, check_code) in specs {
            let forced_legacy = type_tag == ClientTypeTag::Legacy;
            let result = self.connect_forcing_legacy(&ip, check_code, forced_legacy).await;
            if let ConnectionResult::Success(details) = &result {
                self.registry.switch_active(&details.context_id).await;
            } else if let ConnectionResult::Failure(err) = &result {
                warn!(ip = %ip, error = %err, "connectDirect: printer failed, continuing");
            }
            results.push(result);
        }
        results
    }
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}
