use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::{sleep, Duration};

use crate::client::{LegacyClient, MaterialMapping, RichClient, StartJobParams};
use crate::error::FlotillaError;
use crate::types::{CurrentJob, MaterialStationStatus, PrinterStatus};

use super::BackendVariant;

/// `fiveM`-family backend (5M / 5M Pro / AD5X). The three model kinds share
/// this one implementation; their only behavioral difference is the feature
/// set `Backend` checks before dispatching here (ad5x upload).
pub struct RichBackend {
    rich: Arc<dyn RichClient>,
    legacy: Option<Arc<dyn LegacyClient>>,
}

impl RichBackend {
    pub fn new(rich: Arc<dyn RichClient>, legacy: Option<Arc<dyn LegacyClient>>) -> Self {
        RichBackend { rich, legacy }
    }
}

#[async_trait]
impl BackendVariant for RichBackend {
    async fn initialize(&self) -> Result<(), FlotillaError> {
        if !self.rich.initialize().await? {
            return Err(FlotillaError::protocol_handshake(
                "rich client initialize returned false",
            ));
        }
        if !self.rich.init_control().await? {
            return Err(FlotillaError::protocol_handshake(
                "rich client initControl returned false",
            ));
        }
        Ok(())
    }

    async fn dispose(&self) {
        self.rich.dispose().await;
        if let Some(legacy) = &self.legacy {
            // Best-effort logout; failures are logged by the caller, not
            // propagated (spec §4.3.6).
            let _ = legacy.send_raw_cmd("~M602").await;
            legacy.dispose().await;
        }
        // Let the client library's keep-alive timers drain before the
        // backend is considered fully torn down (spec §5).
        sleep(Duration::from_millis(100)).await;
    }

    async fn execute_gcode(&self, cmd: &str) -> Result<(), FlotillaError> {
        self.rich.execute_gcode(cmd).await
    }

    async fn get_printer_status(&self) -> Result<PrinterStatus, FlotillaError> {
        self.rich.get_printer_status().await
    }

    async fn get_local_jobs(&self) -> Result<Vec<String>, FlotillaError> {
        self.rich.get_local_jobs().await
    }

    async fn get_recent_jobs(&self) -> Result<Vec<String>, FlotillaError> {
        self.rich.get_recent_jobs().await
    }

    async fn start_job(&self, params: StartJobParams) -> Result<CurrentJob, FlotillaError> {
        self.rich.start_job(params).await
    }

    async fn pause_job(&self) -> Result<(), FlotillaError> {
        self.rich.pause_job().await
    }

    async fn resume_job(&self) -> Result<(), FlotillaError> {
        self.rich.resume_job().await
    }

    async fn cancel_job(&self) -> Result<(), FlotillaError> {
        self.rich.cancel_job().await
    }

    async fn get_material_station_status(&self) -> Result<MaterialStationStatus, FlotillaError> {
        self.rich.get_material_station_status().await
    }

    async fn get_model_preview(&self) -> Result<Option<String>, FlotillaError> {
        self.rich.get_model_preview().await
    }

    async fn get_job_thumbnail(&self, file_name: &str) -> Result<Option<String>, FlotillaError> {
        self.rich.get_job_thumbnail(file_name).await
    }

    async fn upload_file_ad5x(
        &self,
        path: &str,
        start_print: bool,
        level_before_print: bool,
        material_mappings: Option<Vec<MaterialMapping>>,
    ) -> Result<(), FlotillaError> {
        self.rich
            .upload_file_ad5x(path, start_print, level_before_print, material_mappings)
            .await
    }
}
