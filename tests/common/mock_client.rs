//! Mock printer client pair standing in for the external wire-protocol
//! library (spec §6.3). Configurable canned responses, following the
//! `response_map` + `default_response` shape used for mocking
//! other external-collaborator boundaries.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;

use flotilla::client::{LegacyClient, LegacyPrinterInfo, MaterialMapping, RichClient, StartJobParams};
use flotilla::connection::ClientFactory;
use flotilla::error::FlotillaError;
use flotilla::types::{CurrentJob, MaterialStationStatus, PrinterStatus};

#[derive(Clone, Default)]
pub struct MockLegacyClient {
    pub info: LegacyPrinterInfo,
    pub init_control_ok: bool,
    pub disposed: Arc<Mutex<bool>>,
    pub sent_commands: Arc<Mutex<Vec<String>>>,
}

impl MockLegacyClient {
    pub fn new(info: LegacyPrinterInfo) -> Self {
        MockLegacyClient {
            info,
            init_control_ok: true,
            disposed: Arc::new(Mutex::new(false)),
            sent_commands: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl LegacyClient for MockLegacyClient {
    async fn init_control(&self) -> Result<bool, FlotillaError> {
        Ok(self.init_control_ok)
    }

    async fn get_printer_info(&self) -> Result<LegacyPrinterInfo, FlotillaError> {
        Ok(self.info.clone())
    }

    async fn send_raw_cmd(&self, cmd: &str) -> Result<(), FlotillaError> {
        self.sent_commands.lock().unwrap().push(cmd.to_string());
        Ok(())
    }

    async fn dispose(&self) {
        *self.disposed.lock().unwrap() = true;
    }
}

pub struct MockRichClient {
    pub status: Mutex<PrinterStatus>,
    pub material_station: MaterialStationStatus,
    pub disposed: Arc<Mutex<bool>>,
    pub gcode_log: Mutex<Vec<String>>,
}

impl MockRichClient {
    pub fn new(status: PrinterStatus) -> Self {
        MockRichClient {
            status: Mutex::new(status),
            material_station: MaterialStationStatus::default(),
            disposed: Arc::new(Mutex::new(false)),
            gcode_log: Mutex::new(Vec::new()),
        }
    }

    pub fn set_status(&self, status: PrinterStatus) {
        *self.status.lock().unwrap() = status;
    }
}

#[async_trait]
impl RichClient for MockRichClient {
    async fn initialize(&self) -> Result<bool, FlotillaError> {
        Ok(true)
    }

    async fn init_control(&self) -> Result<bool, FlotillaError> {
        Ok(true)
    }

    async fn dispose(&self) {
        *self.disposed.lock().unwrap() = true;
    }

    async fn get_printer_status(&self) -> Result<PrinterStatus, FlotillaError> {
        Ok(self.status.lock().unwrap().clone())
    }

    async fn get_material_station_status(&self) -> Result<MaterialStationStatus, FlotillaError> {
        Ok(self.material_station.clone())
    }

    async fn get_local_jobs(&self) -> Result<Vec<String>, FlotillaError> {
        Ok(Vec::new())
    }

    async fn get_recent_jobs(&self) -> Result<Vec<String>, FlotillaError> {
        Ok(Vec::new())
    }

    async fn start_job(&self, params: StartJobParams) -> Result<CurrentJob, FlotillaError> {
        Ok(CurrentJob {
            file_name: params.file_name,
            progress_percent: 0.0,
            current_layer: Some(0),
            total_layers: Some(100),
            weight_used_grams: None,
            length_used_meters: None,
        })
    }

    async fn pause_job(&self) -> Result<(), FlotillaError> {
        Ok(())
    }

    async fn resume_job(&self) -> Result<(), FlotillaError> {
        Ok(())
    }

    async fn cancel_job(&self) -> Result<(), FlotillaError> {
        Ok(())
    }

    async fn get_model_preview(&self) -> Result<Option<String>, FlotillaError> {
        Ok(None)
    }

    async fn get_job_thumbnail(&self, _file_name: &str) -> Result<Option<String>, FlotillaError> {
        Ok(None)
    }

    async fn execute_gcode(&self, cmd: &str) -> Result<(), FlotillaError> {
        self.gcode_log.lock().unwrap().push(cmd.to_string());
        Ok(())
    }

    async fn upload_file_ad5x(
        &self,
        _path: &str,
        _start_print: bool,
        _level_before_print: bool,
        _material_mappings: Option<Vec<MaterialMapping>>,
    ) -> Result<(), FlotillaError> {
        Ok(())
    }
}

/// Hands back canned legacy/rich clients keyed by IP, the way a real factory
/// would dial out — but from an in-memory map instead of a socket.
pub struct MockClientFactory {
    pub legacy_by_ip: Mutex<HashMap<String, MockLegacyClient>>,
    pub rich_by_ip: Mutex<HashMap<String, Arc<MockRichClient>>>,
    pub fail_legacy: Mutex<Option<String>>,
}

impl MockClientFactory {
    pub fn new() -> Self {
        MockClientFactory {
            legacy_by_ip: Mutex::new(HashMap::new()),
            rich_by_ip: Mutex::new(HashMap::new()),
            fail_legacy: Mutex::new(None),
        }
    }

    pub fn with_legacy(self, ip: &str, client: MockLegacyClient) -> Self {
        self.legacy_by_ip.lock().unwrap().insert(ip.to_string(), client);
        self
    }

    pub fn with_rich(self, ip: &str, client: Arc<MockRichClient>) -> Self {
        self.rich_by_ip.lock().unwrap().insert(ip.to_string(), client);
        self
    }

    pub fn fail_legacy_with(self, ip: &str, reason: &str) -> Self {
        *self.fail_legacy.lock().unwrap() = Some(reason.to_string());
        self.legacy_by_ip.lock().unwrap().remove(ip);
        self
    }
}

#[async_trait]
impl ClientFactory for MockClientFactory {
    async fn open_legacy(&self, ip_address: &str) -> Result<Arc<dyn LegacyClient>, FlotillaError> {
        if let Some(reason) = self.fail_legacy.lock().unwrap().clone() {
            return Err(FlotillaError::network(reason));
        }
        match self.legacy_by_ip.lock().unwrap().get(ip_address) {
            Some(client) => Ok(Arc::new(client.clone())),
            None => Err(FlotillaError::network(format!("no mock legacy client for {ip_address}"))),
        }
    }

    async fn open_rich(
        &self,
        ip_address: &str,
        _serial_number: &str,
        _check_code: &str,
    ) -> Result<Arc<dyn RichClient>, FlotillaError> {
        match self.rich_by_ip.lock().unwrap().get(ip_address) {
            Some(client) => Ok(client.clone()),
            None => Err(FlotillaError::network(format!("no mock rich client for {ip_address}"))),
        }
    }
}
