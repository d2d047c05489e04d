//! External printer client capability contract (spec §6.3). These traits are
//! implemented by whatever concrete wire-protocol library talks to the
//! printer; the core only ever depends on the trait objects.

use async_trait::async_trait;

use crate::error::FlotillaError;
use crate::types::{CurrentJob, MaterialStationStatus, PrinterStatus};

#[derive(Clone, Debug, Default)]
pub struct LegacyPrinterInfo {
    pub type_name: Option<String>,
    pub name: Option<String>,
    pub serial_number: Option<String>,
}

/// Minimal legacy client surface used directly by the Connection Flow
/// (probe, check-code-less handshake, best-effort logout).
#[async_trait]
pub trait LegacyClient: Send + Sync {
    async fn init_control(&self) -> Result<bool, FlotillaError>;
    async fn get_printer_info(&self) -> Result<LegacyPrinterInfo, FlotillaError>;
    async fn send_raw_cmd(&self, cmd: &str) -> Result<(), FlotillaError>;
    async fn dispose(&self);
}

#[derive(Clone, Debug)]
pub struct StartJobParams {
    pub file_name: String,
    pub level_before_print: bool,
}

#[derive(Clone, Debug)]
pub struct MaterialMapping {
    pub slot: u8,
    pub material: String,
}

/// Rich-API client used by the `fiveM` family. Supplies the operations the
/// Backend Adapter dispatches to (spec §4.5, §6.3).
#[async_trait]
pub trait RichClient: Send + Sync {
    async fn initialize(&self) -> Result<bool, FlotillaError>;
    async fn init_control(&self) -> Result<bool, FlotillaError>;
    async fn dispose(&self);

    async fn get_printer_status(&self) -> Result<PrinterStatus, FlotillaError>;
    async fn get_material_station_status(&self) -> Result<MaterialStationStatus, FlotillaError>;
    async fn get_local_jobs(&self) -> Result<Vec<String>, FlotillaError>;
    async fn get_recent_jobs(&self) -> Result<Vec<String>, FlotillaError>;
    async fn start_job(&self, params: StartJobParams) -> Result<CurrentJob, FlotillaError>;
    async fn pause_job(&self) -> Result<(), FlotillaError>;
    async fn resume_job(&self) -> Result<(), FlotillaError>;
    async fn cancel_job(&self) -> Result<(), FlotillaError>;
    async fn get_model_preview(&self) -> Result<Option<String>, FlotillaError>;
    async fn get_job_thumbnail(&self, file_name: &str) -> Result<Option<String>, FlotillaError>;
    async fn execute_gcode(&self, cmd: &str) -> Result<(), FlotillaError>;

    /// Only meaningful on the `ad5x` variant; other variants never call it.
    async fn upload_file_ad5x(
        &self,
        _path: &str,
        _start_print: bool,
        _level_before_print: bool,
        _material_mappings: Option<Vec<MaterialMapping>>,
    ) -> Result<(), FlotillaError> {
        Err(FlotillaError::unsupported_feature("uploadFileAD5X"))
    }
}
