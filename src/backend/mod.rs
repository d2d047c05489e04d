//! Backend Adapter (C5, spec §4.5). A per-context façade offering a
//! capability-typed interface over the client pair, polymorphic over the
//! four model-kind variants. Generalizes `printer::HardwareControl` from one
//! hardware implementation to one-of-four variants behind a single enum.

mod generic_legacy;
mod rich;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::OnceCell;

use crate::client::{LegacyClient, MaterialMapping, RichClient, StartJobParams};
use crate::error::{ErrorKind, FlotillaError};
use crate::types::{CurrentJob, MaterialStationStatus, ModelKind, PrinterStatus};

pub use generic_legacy::GenericLegacyBackend;
pub use rich::RichBackend;

/// Every public operation returns a timestamped outcome rather than a bare
/// `Result` (spec §4.5: "typed result with success/error/timestamp").
#[derive(Clone, Debug)]
pub struct BackendResult<T> {
    pub outcome: Result<T, FlotillaError>,
    pub timestamp: String,
}

impl<T> BackendResult<T> {
    pub fn ok(value: T) -> Self {
        BackendResult {
            outcome: Ok(value),
            timestamp: now_iso(),
        }
    }

    pub fn err(error: FlotillaError) -> Self {
        BackendResult {
            outcome: Err(error),
            timestamp: now_iso(),
        }
    }
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Capability introspection; callers should not infer capabilities from
/// `ModelKind` alone (spec §4.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeatureSet {
    pub status: bool,
    pub job_list: bool,
    pub job_control: bool,
    pub material_station: bool,
    pub thumbnail: bool,
    pub model_preview: bool,
    pub gcode: bool,
    pub ad5x_upload: bool,
}

pub fn feature_set_for(model_kind: ModelKind) -> FeatureSet {
    match model_kind {
        ModelKind::GenericLegacy => FeatureSet {
            status: true,
            job_list: false,
            job_control: false,
            material_station: false,
            thumbnail: false,
            model_preview: false,
            gcode: true,
            ad5x_upload: false,
        },
        ModelKind::Adventurer5m | ModelKind::Adventurer5mPro => FeatureSet {
            status: true,
            job_list: true,
            job_control: true,
            material_station: true,
            thumbnail: true,
            model_preview: true,
            gcode: true,
            ad5x_upload: false,
        },
        ModelKind::Ad5x => FeatureSet {
            status: true,
            job_list: true,
            job_control: true,
            material_station: true,
            thumbnail: true,
            model_preview: true,
            gcode: true,
            ad5x_upload: true,
        },
    }
}

/// One concrete variant's operations. Implemented once for the legacy family
/// and once for the rich (`fiveM`) family; variant differences within the
/// rich family (5M / 5M Pro / AD5X) are expressed entirely through
/// `feature_set_for` plus the ad5x upload passthrough, not separate structs.
#[async_trait::async_trait]
pub trait BackendVariant: Send + Sync {
    async fn initialize(&self) -> Result<(), FlotillaError>;
    async fn dispose(&self);
    async fn execute_gcode(&self, cmd: &str) -> Result<(), FlotillaError>;
    async fn get_printer_status(&self) -> Result<PrinterStatus, FlotillaError>;
    async fn get_local_jobs(&self) -> Result<Vec<String>, FlotillaError>;
    async fn get_recent_jobs(&self) -> Result<Vec<String>, FlotillaError>;
    async fn start_job(&self, params: StartJobParams) -> Result<CurrentJob, FlotillaError>;
    async fn pause_job(&self) -> Result<(), FlotillaError>;
    async fn resume_job(&self) -> Result<(), FlotillaError>;
    async fn cancel_job(&self) -> Result<(), FlotillaError>;
    async fn get_material_station_status(&self) -> Result<MaterialStationStatus, FlotillaError>;
    async fn get_model_preview(&self) -> Result<Option<String>, FlotillaError>;
    async fn get_job_thumbnail(&self, file_name: &str) -> Result<Option<String>, FlotillaError>;
    async fn upload_file_ad5x(
        &self,
        path: &str,
        start_print: bool,
        level_before_print: bool,
        material_mappings: Option<Vec<MaterialMapping>>,
    ) -> Result<(), FlotillaError>;
}

/// Per-context façade. Wraps one `BackendVariant` plus the capability
/// introspection, disposal, and coalesced-initialize behavior common to all
/// of them.
pub struct Backend {
    model_kind: ModelKind,
    variant: Box<dyn BackendVariant>,
    disposed: AtomicBool,
    init_once: OnceCell<Result<(), FlotillaError>>,
}

impl Backend {
    /// Builds a backend from `(modelKind, clients)`. An unknown kind falls
    /// back to `genericLegacy` (spec §4.5) — in this enum-closed model that
    /// can only happen if a caller bypasses `ModelKind::classify`, so this
    /// is defensive rather than reachable in practice.
    pub fn new(
        model_kind: ModelKind,
        primary_rich: Option<Arc<dyn RichClient>>,
        legacy: Option<Arc<dyn LegacyClient>>,
    ) -> Result<Backend, FlotillaError> {
        let variant: Box<dyn BackendVariant> = match model_kind {
            ModelKind::GenericLegacy => {
                let legacy = legacy
                    .ok_or_else(|| FlotillaError::protocol_handshake("generic-legacy backend requires a legacy client"))?;
                Box::new(GenericLegacyBackend::new(legacy))
            }
            ModelKind::Adventurer5m | ModelKind::Adventurer5mPro | ModelKind::Ad5x => {
                let rich = primary_rich.ok_or_else(|| {
                    FlotillaError::protocol_handshake("rich backend requires a rich client")
                })?;
                Box::new(RichBackend::new(rich, legacy))
            }
        };
        Ok(Backend {
            model_kind,
            variant,
            disposed: AtomicBool::new(false),
            init_once: OnceCell::new(),
        })
    }

    pub fn model_kind(&self) -> ModelKind {
        self.model_kind
    }

    pub fn feature_set(&self) -> FeatureSet {
        feature_set_for(self.model_kind)
    }

    fn check_disposed(&self) -> Result<(), FlotillaError> {
        if self.disposed.load(Ordering::Acquire) {
            Err(FlotillaError::backend_disposed(
                "backend has already been disposed",
            ))
        } else {
            Ok(())
        }
    }

    /// Concurrent callers coalesce onto the same initialize future and
    /// observe the same result; the underlying factory runs exactly once
    /// (spec §4.5, §8 invariant 9).
    pub async fn initialize(&self) -> BackendResult<()> {
        if let Err(e) = self.check_disposed() {
            return BackendResult::err(e);
        }
        let result = self
            .init_once
            .get_or_init(|| async { self.variant.initialize().await })
            .await
            .clone();
        match result {
            Ok(()) => BackendResult::ok(()),
            Err(e) => BackendResult::err(e),
        }
    }

    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.variant.dispose().await;
    }

    pub async fn execute_gcode(&self, cmd: &str) -> BackendResult<()> {
        if let Err(e) = self.ready() {
            return BackendResult::err(e);
        }
        self.finish(self.variant.execute_gcode(cmd).await)
    }

    pub async fn get_printer_status(&self) -> BackendResult<PrinterStatus> {
        if let Err(e) = self.ready() {
            return BackendResult::err(e);
        }
        self.finish(self.variant.get_printer_status().await)
    }

    pub async fn get_local_jobs(&self) -> BackendResult<Vec<String>> {
        if !self.feature_set().job_list {
            return BackendResult::err(FlotillaError::unsupported_feature("getLocalJobs"));
        }
        if let Err(e) = self.ready() {
            return BackendResult::err(e);
        }
        self.finish(self.variant.get_local_jobs().await)
    }

    pub async fn get_recent_jobs(&self) -> BackendResult<Vec<String>> {
        if !self.feature_set().job_list {
            return BackendResult::err(FlotillaError::unsupported_feature("getRecentJobs"));
        }
        if let Err(e) = self.ready() {
            return BackendResult::err(e);
        }
        self.finish(self.variant.get_recent_jobs().await)
    }

    pub async fn start_job(&self, params: StartJobParams) -> BackendResult<CurrentJob> {
        if !self.feature_set().job_control {
            return BackendResult::err(FlotillaError::unsupported_feature("startJob"));
        }
        if let Err(e) = self.ready() {
            return BackendResult::err(e);
        }
        self.finish(self.variant.start_job(params).await)
    }

    pub async fn pause_job(&self) -> BackendResult<()> {
        if !self.feature_set().job_control {
            return BackendResult::err(FlotillaError::unsupported_feature("pauseJob"));
        }
        if let Err(e) = self.ready() {
            return BackendResult::err(e);
        }
        self.finish(self.variant.pause_job().await)
    }

    pub async fn resume_job(&self) -> BackendResult<()> {
        if !self.feature_set().job_control {
            return BackendResult::err(FlotillaError::unsupported_feature("resumeJob"));
        }
        if let Err(e) = self.ready() {
            return BackendResult::err(e);
        }
        self.finish(self.variant.resume_job().await)
    }

    pub async fn cancel_job(&self) -> BackendResult<()> {
        if !self.feature_set().job_control {
            return BackendResult::err(FlotillaError::unsupported_feature("cancelJob"));
        }
        if let Err(e) = self.ready() {
            return BackendResult::err(e);
        }
        self.finish(self.variant.cancel_job().await)
    }

    pub async fn get_material_station_status(&self) -> BackendResult<MaterialStationStatus> {
        if !self.feature_set().material_station {
            return BackendResult::err(FlotillaError::unsupported_feature(
                "getMaterialStationStatus",
            ));
        }
        if let Err(e) = self.ready() {
            return BackendResult::err(e);
        }
        self.finish(self.variant.get_material_station_status().await)
    }

    pub async fn get_model_preview(&self) -> BackendResult<Option<String>> {
        if !self.feature_set().model_preview {
            return BackendResult::err(FlotillaError::unsupported_feature("getModelPreview"));
        }
        if let Err(e) = self.ready() {
            return BackendResult::err(e);
        }
        self.finish(self.variant.get_model_preview().await)
    }

    pub async fn get_job_thumbnail(&self, file_name: &str) -> BackendResult<Option<String>> {
        if !self.feature_set().thumbnail {
            return BackendResult::err(FlotillaError::unsupported_feature("getJobThumbnail"));
        }
        if let Err(e) = self.ready() {
            return BackendResult::err(e);
        }
        self.finish(self.variant.get_job_thumbnail(file_name).await)
    }

    pub async fn upload_file_ad5x(
        &self,
        path: &str,
        start_print: bool,
        level_before_print: bool,
        material_mappings: Option<Vec<MaterialMapping>>,
    ) -> BackendResult<()> {
        if !self.feature_set().ad5x_upload {
            return BackendResult::err(FlotillaError::unsupported_feature("uploadFileAD5X"));
        }
        if let Err(e) = self.ready() {
            return BackendResult::err(e);
        }
        self.finish(
            self.variant
                .upload_file_ad5x(path, start_print, level_before_print, material_mappings)
                .await,
        )
    }

    /// `BackendNotReady` while initialize hasn't completed; `BackendDisposed`
    /// once torn down.
    fn ready(&self) -> Result<(), FlotillaError> {
        self.check_disposed()?;
        if self.init_once.get().is_none() {
            return Err(FlotillaError::new(
                ErrorKind::BackendNotReady,
                "backend has not completed initialize()",
            ));
        }
        Ok(())
    }

    fn finish<T>(&self, result: Result<T, FlotillaError>) -> BackendResult<T> {
        match result {
            Ok(value) => BackendResult::ok(value),
            Err(e) => BackendResult::err(e),
        }
    }
}
