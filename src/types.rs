//! Core data model (spec §3). Plain serde types shared across components —
//! no behavior lives here beyond small derived helpers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use optional_struct::optional_struct;
use serde::{Deserialize, Serialize};

/// Coarse printer classification, controlling which client pair is used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Family {
    FiveM,
    Legacy,
}

/// Finer classification used by the Backend Adapter to pick a variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelKind {
    GenericLegacy,
    Adventurer5m,
    Adventurer5mPro,
    Ad5x,
}

impl ModelKind {
    /// Classifies a raw `typeName` the way `classify` does in the Connection
    /// Flow (spec §4.3.2). Case-insensitive substring match, most specific
    /// first.
    pub fn classify(type_name: &str) -> ModelKind {
        let lower = type_name.to_lowercase();
        if lower.contains("5m pro") {
            ModelKind::Adventurer5mPro
        } else if lower.contains("5m") {
            ModelKind::Adventurer5m
        } else if lower.contains("ad5x") {
            ModelKind::Ad5x
        } else {
            ModelKind::GenericLegacy
        }
    }

    pub fn family(self) -> Family {
        match self {
            ModelKind::GenericLegacy => Family::Legacy,
            ModelKind::Adventurer5m | ModelKind::Adventurer5mPro | ModelKind::Ad5x => {
                Family::FiveM
            }
        }
    }
}

/// Immutable once produced by probe.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrinterIdentity {
    pub name: String,
    pub ip_address: String,
    pub serial_number: String,
    pub type_name: String,
    pub family: Family,
    pub model_kind: ModelKind,
}

impl PrinterIdentity {
    /// Serial numbers are the primary key for storage; when a probe returns
    /// none, synthesize a non-portable placeholder (spec §3).
    pub fn synthesize_serial(now_epoch_ms: u128) -> String {
        format!("Unknown-{now_epoch_ms}")
    }
}

#[optional_struct(UpdatePerPrinterOverrides)]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PerPrinterOverrides {
    pub custom_camera_enabled: bool,
    pub custom_camera_url: Option<String>,
    pub custom_leds_enabled: bool,
    pub force_legacy_mode: bool,
    pub web_ui_enabled: bool,
    pub rtsp_frame_rate: u8,
    pub rtsp_quality: u8,
    pub active_spool: Option<ActiveSpool>,
}

impl Default for PerPrinterOverrides {
    fn default() -> Self {
        PerPrinterOverrides {
            custom_camera_enabled: false,
            custom_camera_url: None,
            custom_leds_enabled: false,
            force_legacy_mode: false,
            web_ui_enabled: true,
            rtsp_frame_rate: 15,
            rtsp_quality: 3,
            active_spool: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActiveSpool {
    pub spool_id: String,
    pub material: Option<String>,
    pub remaining_weight_grams: Option<f64>,
}

/// Durable per-printer record (spec §3, §4.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredPrinter {
    pub name: String,
    pub ip_address: String,
    pub serial_number: String,
    pub type_name: String,
    pub family: Family,
    pub model_kind: ModelKind,
    pub check_code: String,
    pub client_type_tag: ClientTypeTag,
    pub last_connected_at: Option<String>,
    #[serde(default)]
    pub per_printer_overrides: PerPrinterOverrides,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientTypeTag {
    Legacy,
    New,
}

/// Top-level persisted document (`printer_details.json`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PrinterConfig {
    pub last_used_serial: Option<String>,
    pub printers: HashMap<String, StoredPrinter>,
}

impl PrinterConfig {
    /// Repairs the `lastUsedSerial` invariant: it must be null or a key of
    /// `printers` (spec §3, invariant 2 of §8).
    pub fn repair_invariants(&mut self) {
        if let Some(serial) = &self.last_used_serial {
            if !self.printers.contains_key(serial) {
                self.last_used_serial = None;
            }
        }
    }
}

static CONTEXT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generates a monotonic opaque context id, unique for process lifetime
/// (spec §3 — deliberately not a `uuid`, the counter already satisfies the
/// uniqueness and monotonicity the spec asks for without pulling in a crate
/// for it).
pub fn next_context_id() -> String {
    let n = CONTEXT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("ctx-{n}")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrinterState {
    Ready,
    Printing,
    Paused,
    Pausing,
    Completed,
    Cancelled,
    Error,
    Busy,
    Calibrating,
    Heating,
}

impl PrinterState {
    /// Fixed lookup table from a lowercased raw state (spec §4.6.3).
    pub fn from_raw(raw: &str) -> PrinterState {
        match raw.to_lowercase().as_str() {
            "idle" | "ready" => PrinterState::Ready,
            "printing" | "print" => PrinterState::Printing,
            "paused" | "pause" => PrinterState::Paused,
            "pausing" => PrinterState::Pausing,
            "finished" | "complete" | "completed" => PrinterState::Completed,
            "cancelled" | "canceled" => PrinterState::Cancelled,
            "error" => PrinterState::Error,
            "calibrating" => PrinterState::Calibrating,
            "heating" => PrinterState::Heating,
            _ => PrinterState::Busy,
        }
    }

    /// Whether a print job is actively occupying the printer (spec §4.7).
    pub fn is_active(self) -> bool {
        matches!(
            self,
            PrinterState::Busy
                | PrinterState::Printing
                | PrinterState::Heating
                | PrinterState::Calibrating
                | PrinterState::Paused
                | PrinterState::Pausing
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CurrentJob {
    pub file_name: String,
    pub progress_percent: f64,
    pub current_layer: Option<u64>,
    pub total_layers: Option<u64>,
    pub weight_used_grams: Option<f64>,
    pub length_used_meters: Option<f64>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Temperature {
    pub current: f64,
    pub target: f64,
}

impl Temperature {
    /// `isHeating = |current - target| > 2 ∧ target > 0` (spec §4.6.3).
    pub fn is_heating(self) -> bool {
        (self.current - self.target).abs() > 2.0 && self.target > 0.0
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawPrinterStatus {
    pub raw_state: String,
    pub current_job: Option<CurrentJob>,
    pub bed_temperature: Option<Temperature>,
    pub extruder_temperature: Option<Temperature>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrinterStatus {
    pub state: PrinterState,
    pub current_job: Option<CurrentJob>,
    pub bed_temperature: Option<Temperature>,
    pub extruder_temperature: Option<Temperature>,
    pub bed_heating: bool,
    pub extruder_heating: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MaterialStationStatus {
    pub slots: Vec<MaterialSlot>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MaterialSlot {
    pub index: u8,
    pub material: Option<String>,
    pub color: Option<String>,
}

/// Produced by the polling loop; always replaces the prior snapshot
/// atomically (spec §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollingSnapshot {
    pub printer_status: Option<PrinterStatus>,
    pub material_station: Option<MaterialStationStatus>,
    pub thumbnail_base64: Option<String>,
    pub connected: bool,
    pub initializing: bool,
    pub last_polled_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub context_id: String,
    pub job_name: Option<String>,
    pub previous_state: Option<PrinterState>,
    pub current_state: PrinterState,
    pub status: PrinterStatus,
    pub timestamp: String,
    pub kind: LifecycleEventKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEventKind {
    StateChanged,
    PrintStarted,
    PrintCompleted,
    PrintCancelled,
    PrintError,
}

/// Request unit processed by the Thumbnail Queue (spec §3, §4.10).
#[derive(Clone, Debug)]
pub struct ThumbnailRequest {
    pub file_name: String,
    pub priority: i32,
    pub enqueued_at: std::time::Instant,
    pub retry_count: u8,
}

impl ThumbnailRequest {
    pub const MAX_RETRIES: u8 = 2;

    pub fn new(file_name: impl Into<String>, priority: i32) -> Self {
        ThumbnailRequest {
            file_name: file_name.into(),
            priority,
            enqueued_at: std::time::Instant::now(),
            retry_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_matches_5m_pro_before_5m() {
        assert_eq!(
            ModelKind::classify("Adventurer 5M Pro"),
            ModelKind::Adventurer5mPro
        );
        assert_eq!(ModelKind::classify("Adventurer 5M"), ModelKind::Adventurer5m);
        assert_eq!(ModelKind::classify("AD5X"), ModelKind::Ad5x);
        assert_eq!(
            ModelKind::classify("Adventurer 3"),
            ModelKind::GenericLegacy
        );
    }

    #[test]
    fn family_follows_model_kind() {
        assert_eq!(ModelKind::Adventurer5m.family(), Family::FiveM);
        assert_eq!(ModelKind::GenericLegacy.family(), Family::Legacy);
    }

    #[test]
    fn state_from_raw_falls_back_to_busy() {
        assert_eq!(PrinterState::from_raw("offline"), PrinterState::Busy);
        assert_eq!(PrinterState::from_raw("Printing"), PrinterState::Printing);
    }

    #[test]
    fn repair_invariants_clears_dangling_last_used() {
        let mut cfg = PrinterConfig {
            last_used_serial: Some("missing".into()),
            printers: HashMap::new(),
        };
        cfg.repair_invariants();
        assert!(cfg.last_used_serial.is_none());
    }

    #[test]
    fn context_ids_are_monotonic_and_unique() {
        let a = next_context_id();
        let b = next_context_id();
        assert_ne!(a, b);
    }
}
