//! Concrete printer client implementations (spec §6.3's external collaborator
//! contract, given a body). Grounded directly on
//! `other_examples/.../flashforge-api-server/src/printer.rs`'s raw TCP
//! control-port protocol for the legacy client, and the pack's `reqwest`
//! idiom (already used in `spoolman.rs`) for the rich client's HTTP API.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::client::{
    LegacyClient, LegacyPrinterInfo, MaterialMapping, RichClient, StartJobParams,
};
use crate::connection::ClientFactory;
use crate::error::FlotillaError;
use crate::types::{CurrentJob, MaterialStationStatus, PrinterStatus};

const LEGACY_API_PORT: u16 = 8899;
const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);

/// Legacy raw command-port client. One TCP connection per call, matching the
/// request/response-per-connection style of the reference implementation.
pub struct TcpLegacyClient {
    addr: SocketAddr,
    info: Mutex<Option<LegacyPrinterInfo>>,
}

impl TcpLegacyClient {
    pub fn new(ip_address: &str) -> Result<Self, FlotillaError> {
        let addr: std::net::IpAddr = ip_address
            .parse()
            .map_err(|_| FlotillaError::validation(format!("invalid IP address '{ip_address}'")))?;
        Ok(TcpLegacyClient {
            addr: SocketAddr::new(addr, LEGACY_API_PORT),
            info: Mutex::new(None),
        })
    }

    async fn send_and_read(&self, command: &str) -> Result<String, FlotillaError> {
        let connect = TcpStream::connect(self.addr);
        let mut stream = tokio::time::timeout(SOCKET_TIMEOUT, connect)
            .await
            .map_err(|_| FlotillaError::timeout("legacy control-port connect timed out"))?
            .map_err(|err| FlotillaError::network(err.to_string()))?;

        stream
            .write_all(command.as_bytes())
            .await
            .map_err(|err| FlotillaError::network(err.to_string()))?;

        let mut buf = vec![0u8; 4096];
        let n = tokio::time::timeout(SOCKET_TIMEOUT, stream.read(&mut buf))
            .await
            .map_err(|_| FlotillaError::timeout("legacy control-port read timed out"))?
            .map_err(|err| FlotillaError::network(err.to_string()))?;
        Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
    }
}

#[async_trait]
impl LegacyClient for TcpLegacyClient {
    async fn init_control(&self) -> Result<bool, FlotillaError> {
        let response = self.send_and_read("~M601 S1\r\n").await?;
        Ok(response.contains("ok"))
    }

    async fn get_printer_info(&self) -> Result<LegacyPrinterInfo, FlotillaError> {
        let response = self.send_and_read("~M115\r\n").await?;
        let parsed = parse_m115(&response);
        *self.info.lock().await = Some(parsed.clone());
        Ok(parsed)
    }

    async fn send_raw_cmd(&self, cmd: &str) -> Result<(), FlotillaError> {
        self.send_and_read(&format!("{cmd}\r\n")).await?;
        Ok(())
    }

    async fn dispose(&self) {
        // Each call opens its own connection; nothing to release here.
    }
}

/// Parses the `~M115` firmware-info response's `key:value` pairs. Unknown or
/// missing fields are left `None` rather than failing the call — identity
/// probing tolerates partial responses (spec §4.3.2).
fn parse_m115(raw: &str) -> LegacyPrinterInfo {
    let mut type_name = None;
    let mut name = None;
    let mut serial_number = None;
    for part in raw.split_whitespace() {
        if let Some((key, value)) = part.split_once(':') {
            match key {
                "TYPE" => type_name = Some(value.to_string()),
                "NAME" => name = Some(value.to_string()),
                "SN" => serial_number = Some(value.to_string()),
                _ => {}
            }
        }
    }
    LegacyPrinterInfo { type_name, name, serial_number }
}

/// `fiveM`-family rich HTTP client, authenticated with the printer's
/// check-code. Request/response shapes mirror what the Backend Adapter
/// needs (spec §4.5); unknown/missing fields degrade gracefully rather than
/// failing the whole response.
pub struct HttpRichClient {
    http: reqwest::Client,
    base_url: String,
    serial_number: String,
    check_code: String,
}

impl HttpRichClient {
    pub fn new(ip_address: &str, serial_number: &str, check_code: &str) -> Self {
        HttpRichClient {
            http: reqwest::Client::new(),
            base_url: format!("http://{ip_address}:8898"),
            serial_number: serial_number.to_string(),
            check_code: check_code.to_string(),
        }
    }

    async fn post<T: serde::Serialize + ?Sized, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<R, FlotillaError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|err| FlotillaError::network(err.to_string()))?;
        if !response.status().is_success() {
            return Err(FlotillaError::upstream(format!(
                "rich client call to {path} failed with status {}",
                response.status()
            )));
        }
        response
            .json::<R>()
            .await
            .map_err(|err| FlotillaError::upstream(err.to_string()))
    }

    fn auth_envelope(&self) -> serde_json::Value {
        serde_json::json!({ "serialNumber": self.serial_number, "checkCode": self.check_code })
    }
}

#[async_trait]
impl RichClient for HttpRichClient {
    async fn initialize(&self) -> Result<bool, FlotillaError> {
        let response: serde_json::Value = self.post("/control/init", &self.auth_envelope()).await?;
        Ok(response.get("ok").and_then(|v| v.as_bool()).unwrap_or(false))
    }

    async fn init_control(&self) -> Result<bool, FlotillaError> {
        let response: serde_json::Value = self.post("/control/take", &self.auth_envelope()).await?;
        Ok(response.get("ok").and_then(|v| v.as_bool()).unwrap_or(false))
    }

    async fn dispose(&self) {
        let _ = self
            .post::<_, serde_json::Value>("/control/release", &self.auth_envelope())
            .await;
    }

    async fn get_printer_status(&self) -> Result<PrinterStatus, FlotillaError> {
        let raw: RawStatusResponse = self.post("/status", &self.auth_envelope()).await?;
        Ok(raw.into())
    }

    async fn get_material_station_status(&self) -> Result<MaterialStationStatus, FlotillaError> {
        self.post("/material-station", &self.auth_envelope()).await
    }

    async fn get_local_jobs(&self) -> Result<Vec<String>, FlotillaError> {
        self.post("/jobs/local", &self.auth_envelope()).await
    }

    async fn get_recent_jobs(&self) -> Result<Vec<String>, FlotillaError> {
        self.post("/jobs/recent", &self.auth_envelope()).await
    }

    async fn start_job(&self, params: StartJobParams) -> Result<CurrentJob, FlotillaError> {
        let mut body = self.auth_envelope();
        body["fileName"] = serde_json::Value::String(params.file_name);
        body["levelBeforePrint"] = serde_json::Value::Bool(params.level_before_print);
        self.post("/jobs/start", &body).await
    }

    async fn pause_job(&self) -> Result<(), FlotillaError> {
        self.post::<_, serde_json::Value>("/jobs/pause", &self.auth_envelope()).await?;
        Ok(())
    }

    async fn resume_job(&self) -> Result<(), FlotillaError> {
        self.post::<_, serde_json::Value>("/jobs/resume", &self.auth_envelope()).await?;
        Ok(())
    }

    async fn cancel_job(&self) -> Result<(), FlotillaError> {
        self.post::<_, serde_json::Value>("/jobs/cancel", &self.auth_envelope()).await?;
        Ok(())
    }

    async fn get_model_preview(&self) -> Result<Option<String>, FlotillaError> {
        let response: serde_json::Value = self.post("/jobs/preview", &self.auth_envelope()).await?;
        Ok(response.get("image").and_then(|v| v.as_str()).map(str::to_string))
    }

    async fn get_job_thumbnail(&self, file_name: &str) -> Result<Option<String>, FlotillaError> {
        let mut body = self.auth_envelope();
        body["fileName"] = serde_json::Value::String(file_name.to_string());
        let response: serde_json::Value = self.post("/jobs/thumbnail", &body).await?;
        Ok(response.get("thumbnail").and_then(|v| v.as_str()).map(str::to_string))
    }

    async fn execute_gcode(&self, cmd: &str) -> Result<(), FlotillaError> {
        let mut body = self.auth_envelope();
        body["command"] = serde_json::Value::String(cmd.to_string());
        self.post::<_, serde_json::Value>("/gcode", &body).await?;
        Ok(())
    }

    async fn upload_file_ad5x(
        &self,
        path: &str,
        start_print: bool,
        level_before_print: bool,
        material_mappings: Option<Vec<MaterialMapping>>,
    ) -> Result<(), FlotillaError> {
        let mut body = self.auth_envelope();
        body["path"] = serde_json::Value::String(path.to_string());
        body["startPrint"] = serde_json::Value::Bool(start_print);
        body["levelBeforePrint"] = serde_json::Value::Bool(level_before_print);
        if let Some(mappings) = material_mappings {
            body["materialMappings"] = serde_json::to_value(mappings)
                .map_err(|err| FlotillaError::validation(err.to_string()))?;
        }
        self.post::<_, serde_json::Value>("/upload/ad5x", &body).await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct RawStatusResponse {
    state: String,
    #[serde(default)]
    current_job: Option<CurrentJob>,
    #[serde(default)]
    bed_temperature: Option<crate::types::Temperature>,
    #[serde(default)]
    extruder_temperature: Option<crate::types::Temperature>,
}

impl From<RawStatusResponse> for PrinterStatus {
    fn from(raw: RawStatusResponse) -> Self {
        let bed_heating = raw.bed_temperature.map(|t| t.is_heating()).unwrap_or(false);
        let extruder_heating = raw.extruder_temperature.map(|t| t.is_heating()).unwrap_or(false);
        // A raw progress of 0.5 means 50%, not 0.5%.
        let current_job = raw.current_job.map(|mut job| {
            job.progress_percent = crate::polling::normalize_progress(job.progress_percent);
            job
        });
        PrinterStatus {
            state: crate::types::PrinterState::from_raw(&raw.state),
            current_job,
            bed_temperature: raw.bed_temperature,
            extruder_temperature: raw.extruder_temperature,
            bed_heating,
            extruder_heating,
        }
    }
}

/// The default `ClientFactory` wired in by `main.rs`.
pub struct DefaultClientFactory;

#[async_trait]
impl ClientFactory for DefaultClientFactory {
    async fn open_legacy(&self, ip_address: &str) -> Result<std::sync::Arc<dyn LegacyClient>, FlotillaError> {
        Ok(std::sync::Arc::new(TcpLegacyClient::new(ip_address)?))
    }

    async fn open_rich(
        &self,
        ip_address: &str,
        serial_number: &str,
        check_code: &str,
    ) -> Result<std::sync::Arc<dyn RichClient>, FlotillaError> {
        Ok(std::sync::Arc::new(HttpRichClient::new(ip_address, serial_number, check_code)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_m115_extracts_known_fields() {
        let info = parse_m115("TYPE:Adventurer5M NAME:Sigma SN:SNMOCK123");
        assert_eq!(info.type_name.as_deref(), Some("Adventurer5M"));
        assert_eq!(info.name.as_deref(), Some("Sigma"));
        assert_eq!(info.serial_number.as_deref(), Some("SNMOCK123"));
    }

    #[test]
    fn parse_m115_tolerates_missing_fields() {
        let info = parse_m115("TYPE:Adventurer5M");
        assert_eq!(info.type_name.as_deref(), Some("Adventurer5M"));
        assert!(info.name.is_none());
        assert!(info.serial_number.is_none());
    }
}
