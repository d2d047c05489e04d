//! Printer Details Store (C2, spec §4.2). Durable `PrinterConfig` catalog of
//! known printers, legacy-shape migration, and the process-scoped (not
//! persisted) `contextLastUsed` side map.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::FlotillaError;
use crate::types::{ClientTypeTag, Family, ModelKind, PrinterConfig, StoredPrinter};

/// Legacy single-printer shape auto-migrated on load (spec §4.2, scenario S5).
#[derive(Debug, Deserialize)]
struct LegacyShape {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "IPAddress")]
    ip_address: String,
    #[serde(rename = "SerialNumber")]
    serial_number: String,
    #[serde(rename = "CheckCode")]
    check_code: String,
    #[serde(rename = "ClientType")]
    client_type: String,
    #[serde(rename = "printerModel")]
    printer_model: String,
}

pub struct PrinterDetailsStore {
    path: PathBuf,
    document: RwLock<PrinterConfig>,
    context_last_used: RwLock<HashMap<String, String>>,
}

impl PrinterDetailsStore {
    pub async fn load(dir: &Path) -> Arc<Self> {
        let path = dir.join("printer_details.json");
        let text = tokio::fs::read_to_string(&path).await.unwrap_or_default();

        let mut document = if let Ok(cfg) = serde_json::from_str::<PrinterConfig>(&text) {
            cfg
        } else if let Ok(legacy) = serde_json::from_str::<LegacyShape>(&text) {
            info!(serial = %legacy.serial_number, "migrating legacy printer_details.json shape");
            migrate_legacy(legacy)
        } else {
            PrinterConfig::default()
        };
        document.repair_invariants();

        let store = Arc::new(PrinterDetailsStore {
            path,
            document: RwLock::new(document),
            context_last_used: RwLock::new(HashMap::new()),
        });
        store.write_to_disk().await;
        store
    }

    pub async fn all(&self) -> PrinterConfig {
        self.document.read().await.clone()
    }

    pub async fn get(&self, serial: &str) -> Option<StoredPrinter> {
        self.document.read().await.printers.get(serial).cloned()
    }

    /// Validates, merges existing overrides, and writes the document back
    /// (spec §4.2: "no partial write" on validation failure).
    pub async fn save(
        &self,
        details: StoredPrinter,
        update_last_used: bool,
    ) -> Result<(), FlotillaError> {
        validate(&details)?;
        let mut guard = self.document.write().await;
        guard
            .printers
            .insert(details.serial_number.clone(), details.clone());
        if update_last_used {
            guard.last_used_serial = Some(details.serial_number.clone());
        }
        guard.repair_invariants();
        drop(guard);
        self.write_to_disk().await;
        Ok(())
    }

    pub async fn remove(&self, serial: &str) {
        let mut guard = self.document.write().await;
        guard.printers.remove(serial);
        guard.repair_invariants();
        drop(guard);
        self.write_to_disk().await;
    }

    pub async fn set_last_used(&self, serial: &str) {
        let mut guard = self.document.write().await;
        if guard.printers.contains_key(serial) {
            guard.last_used_serial = Some(serial.to_string());
        }
        drop(guard);
        self.write_to_disk().await;
    }

    pub async fn clear_last_used(&self) {
        self.document.write().await.last_used_serial = None;
        self.write_to_disk().await;
    }

    pub async fn clear_all(&self) {
        let mut guard = self.document.write().await;
        guard.printers.clear();
        guard.last_used_serial = None;
        drop(guard);
        self.write_to_disk().await;
    }

    pub async fn get_last_used(&self, context_id: Option<&str>) -> Option<StoredPrinter> {
        if let Some(context_id) = context_id {
            let serial = self.context_last_used.read().await.get(context_id).cloned();
            if let Some(serial) = serial {
                return self.get(&serial).await;
            }
        }
        let serial = self.document.read().await.last_used_serial.clone()?;
        self.get(&serial).await
    }

    pub async fn record_context_last_used(&self, context_id: &str, serial: &str) {
        self.context_last_used
            .write()
            .await
            .insert(context_id.to_string(), serial.to_string());
    }

    pub async fn clear_context_tracking(&self, context_id: &str) {
        self.context_last_used.write().await.remove(context_id);
    }

    async fn write_to_disk(&self) {
        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let snapshot = self.document.read().await.clone();
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                if let Err(err) = tokio::fs::write(&self.path, json).await {
                    tracing::warn!(error = %err, "failed to persist printer_details.json");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to serialize printer_details.json"),
        }
    }
}

fn migrate_legacy(legacy: LegacyShape) -> PrinterConfig {
    let client_type_tag = if legacy.client_type.eq_ignore_ascii_case("legacy") {
        ClientTypeTag::Legacy
    } else {
        ClientTypeTag::New
    };
    let model_kind = ModelKind::classify(&legacy.printer_model);
    let stored = StoredPrinter {
        name: legacy.name,
        ip_address: legacy.ip_address,
        serial_number: legacy.serial_number.clone(),
        type_name: legacy.printer_model,
        family: model_kind.family(),
        model_kind,
        check_code: legacy.check_code,
        client_type_tag,
        last_connected_at: Some(now_iso()),
        per_printer_overrides: Default::default(),
    };
    let mut printers = HashMap::new();
    printers.insert(legacy.serial_number.clone(), stored);
    PrinterConfig {
        last_used_serial: Some(legacy.serial_number),
        printers,
    }
}

fn validate(details: &StoredPrinter) -> Result<(), FlotillaError> {
    if details.name.trim().is_empty() {
        return Err(FlotillaError::validation("Name must not be empty"));
    }
    if details.serial_number.trim().is_empty() {
        return Err(FlotillaError::validation("SerialNumber must not be empty"));
    }
    if details.check_code.trim().is_empty() {
        return Err(FlotillaError::validation("CheckCode must not be empty"));
    }
    if details.type_name.trim().is_empty() {
        return Err(FlotillaError::validation("printerModel must not be empty"));
    }
    if Ipv4Addr::from_str(&details.ip_address).is_err() {
        return Err(FlotillaError::validation(format!(
            "IPAddress '{}' is not a valid IPv4 dotted-quad",
            details.ip_address
        )));
    }
    let _: Family = details.family;
    Ok(())
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PerPrinterOverrides;

    fn sample(serial: &str) -> StoredPrinter {
        StoredPrinter {
            name: "Sigma".into(),
            ip_address: "10.0.0.7".into(),
            serial_number: serial.into(),
            type_name: "Adventurer 5M".into(),
            family: Family::FiveM,
            model_kind: ModelKind::Adventurer5m,
            check_code: "0000".into(),
            client_type_tag: ClientTypeTag::New,
            last_connected_at: None,
            per_printer_overrides: PerPrinterOverrides::default(),
        }
    }

    #[tokio::test]
    async fn save_then_set_last_used_satisfies_invariant() {
        let dir = tempfile::tempdir().unwrap();
        let store = PrinterDetailsStore::load(dir.path()).await;
        store.save(sample("SN-1"), true).await.unwrap();
        let all = store.all().await;
        assert_eq!(all.last_used_serial.as_deref(), Some("SN-1"));
        assert!(all.printers.contains_key("SN-1"));
    }

    #[tokio::test]
    async fn save_rejects_bad_ip_without_partial_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = PrinterDetailsStore::load(dir.path()).await;
        let mut bad = sample("SN-2");
        bad.ip_address = "not-an-ip".into();
        assert!(store.save(bad, true).await.is_err());
        assert!(store.get("SN-2").await.is_none());
    }

    #[tokio::test]
    async fn legacy_shape_migrates_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let legacy_json = serde_json::json!({
            "Name": "Sigma",
            "IPAddress": "10.0.0.7",
            "SerialNumber": "SN-1",
            "CheckCode": "0000",
            "ClientType": "new",
            "printerModel": "Adventurer 5M",
        });
        tokio::fs::write(
            dir.path().join("printer_details.json"),
            legacy_json.to_string(),
        )
        .await
        .unwrap();

        let store = PrinterDetailsStore::load(dir.path()).await;
        let all = store.all().await;
        assert_eq!(all.last_used_serial.as_deref(), Some("SN-1"));
        assert!(all.printers.contains_key("SN-1"));

        let rewritten = tokio::fs::read_to_string(dir.path().join("printer_details.json"))
            .await
            .unwrap();
        let rewritten: PrinterConfig = serde_json::from_str(&rewritten).unwrap();
        assert!(rewritten.printers.contains_key("SN-1"));
    }

    #[tokio::test]
    async fn remove_clears_dangling_last_used() {
        let dir = tempfile::tempdir().unwrap();
        let store = PrinterDetailsStore::load(dir.path()).await;
        store.save(sample("SN-1"), true).await.unwrap();
        store.remove("SN-1").await;
        assert!(store.all().await.last_used_serial.is_none());
    }
}
