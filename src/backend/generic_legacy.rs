use std::sync::Arc;

use async_trait::async_trait;

use crate::client::{LegacyClient, MaterialMapping, StartJobParams};
use crate::error::FlotillaError;
use crate::types::{CurrentJob, MaterialStationStatus, PrinterState, PrinterStatus};

use super::BackendVariant;

/// Legacy-family backend: the only client is the legacy command client, so
/// only `status` and `gcode` are meaningfully implemented — everything else
/// is gated off by `feature_set_for(GenericLegacy)` before it ever reaches
/// here.
pub struct GenericLegacyBackend {
    legacy: Arc<dyn LegacyClient>,
}

impl GenericLegacyBackend {
    pub fn new(legacy: Arc<dyn LegacyClient>) -> Self {
        GenericLegacyBackend { legacy }
    }
}

#[async_trait]
impl BackendVariant for GenericLegacyBackend {
    async fn initialize(&self) -> Result<(), FlotillaError> {
        if self.legacy.init_control().await? {
            Ok(())
        } else {
            Err(FlotillaError::protocol_handshake(
                "legacy initControl returned false",
            ))
        }
    }

    async fn dispose(&self) {
        self.legacy.dispose().await;
    }

    async fn execute_gcode(&self, cmd: &str) -> Result<(), FlotillaError> {
        self.legacy.send_raw_cmd(cmd).await
    }

    async fn get_printer_status(&self) -> Result<PrinterStatus, FlotillaError> {
        // The legacy client exposes only identity, not a live state machine;
        // reachability is the signal, so a successful info fetch reports
        // `Ready`.
        self.legacy.get_printer_info().await?;
        Ok(PrinterStatus {
            state: PrinterState::Ready,
            current_job: None,
            bed_temperature: None,
            extruder_temperature: None,
            bed_heating: false,
            extruder_heating: false,
        })
    }

    async fn get_local_jobs(&self) -> Result<Vec<String>, FlotillaError> {
        Err(FlotillaError::unsupported_feature("getLocalJobs"))
    }

    async fn get_recent_jobs(&self) -> Result<Vec<String>, FlotillaError> {
        Err(FlotillaError::unsupported_feature("getRecentJobs"))
    }

    async fn start_job(&self, _params: StartJobParams) -> Result<CurrentJob, FlotillaError> {
        Err(FlotillaError::unsupported_feature("startJob"))
    }

    async fn pause_job(&self) -> Result<(), FlotillaError> {
        Err(FlotillaError::unsupported_feature("pauseJob"))
    }

    async fn resume_job(&self) -> Result<(), FlotillaError> {
        Err(FlotillaError::unsupported_feature("resumeJob"))
    }

    async fn cancel_job(&self) -> Result<(), FlotillaError> {
        Err(FlotillaError::unsupported_feature("cancelJob"))
    }

    async fn get_material_station_status(&self) -> Result<MaterialStationStatus, FlotillaError> {
        Err(FlotillaError::unsupported_feature("getMaterialStationStatus"))
    }

    async fn get_model_preview(&self) -> Result<Option<String>, FlotillaError> {
        Err(FlotillaError::unsupported_feature("getModelPreview"))
    }

    async fn get_job_thumbnail(&self, _file_name: &str) -> Result<Option<String>, FlotillaError> {
        Err(FlotillaError::unsupported_feature("getJobThumbnail"))
    }

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
