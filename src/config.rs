//! Config Store (C1, spec §4.1). Process-wide mutable `AppConfig`, debounced
//! persistence with a lock-file sibling, change notifications.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use optional_struct::{optional_struct, Applicable};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::FlotillaError;
use crate::event_bus::Topic;

const DEBOUNCE: Duration = Duration::from_millis(100);
const FORCE_SAVE_TIMEOUT: Duration = Duration::from_secs(1);

#[optional_struct(UpdateAppConfig)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub webui_port: u16,
    pub webui_password: Option<String>,
    pub force_legacy_api: bool,
    pub usage_tracking_enabled: bool,
    pub usage_update_mode: UsageUpdateMode,
    pub active_interval_ms: u64,
    pub inactive_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            webui_port: 8080,
            webui_password: None,
            force_legacy_api: false,
            usage_tracking_enabled: true,
            usage_update_mode: UsageUpdateMode::Weight,
            active_interval_ms: 3000,
            inactive_interval_ms: 3000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageUpdateMode {
    Weight,
    Length,
}

#[derive(Clone, Debug)]
pub struct ConfigUpdated {
    pub changed_keys: Vec<String>,
    pub previous: AppConfig,
    pub current: AppConfig,
}

/// Per-field identifier for `ConfigStore::get`/`set`, one variant per
/// `AppConfig` field (spec §4.1's `config:<key>` subscribers watch one of
/// these rather than the aggregate `ConfigUpdated` event).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigKey {
    WebuiPort,
    WebuiPassword,
    ForceLegacyApi,
    UsageTrackingEnabled,
    UsageUpdateMode,
    ActiveIntervalMs,
    InactiveIntervalMs,
}

impl ConfigKey {
    fn field_name(self) -> &'static str {
        match self {
            ConfigKey::WebuiPort => "webui_port",
            ConfigKey::WebuiPassword => "webui_password",
            ConfigKey::ForceLegacyApi => "force_legacy_api",
            ConfigKey::UsageTrackingEnabled => "usage_tracking_enabled",
            ConfigKey::UsageUpdateMode => "usage_update_mode",
            ConfigKey::ActiveIntervalMs => "active_interval_ms",
            ConfigKey::InactiveIntervalMs => "inactive_interval_ms",
        }
    }
}

/// Published once per changed field alongside the aggregate `ConfigUpdated`.
#[derive(Clone, Debug)]
pub struct ConfigKeyUpdated {
    pub key: String,
    pub previous: serde_json::Value,
    pub current: serde_json::Value,
}

struct Inner {
    current: AppConfig,
    save_handle: Option<JoinHandle<()>>,
}

/// Process-wide singleton; owns the in-memory `AppConfig` and its on-disk
/// mirror. `dispose()` must be called once before process exit.
pub struct ConfigStore {
    path: PathBuf,
    lock_path: PathBuf,
    inner: RwLock<Inner>,
    saving: Mutex<()>,
    pub updated: Topic<ConfigUpdated>,
    pub key_updated: Topic<ConfigKeyUpdated>,
}

impl ConfigStore {
    /// Loads `config.json` from `dir`, sanitizing unknown/missing keys. A
    /// parse failure falls back to defaults and schedules an overwrite rather
    /// than treating a bad config file as fatal — a long-lived daemon
    /// recovers instead of refusing to start.
    pub async fn load(dir: &Path) -> Arc<Self> {
        let path = dir.join("config.json");
        let lock_path = dir.join("config.lock");

        let (current, needs_resave) = match tokio::fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(raw) => sanitize(raw),
                Err(err) => {
                    warn!(error = %err, "config.json failed to parse, falling back to defaults");
                    (AppConfig::default(), true)
                }
            },
            Err(_) => (AppConfig::default(), true),
        };

        let store = Arc::new(ConfigStore {
            path,
            lock_path,
            inner: RwLock::new(Inner {
                current,
                save_handle: None,
            }),
            saving: Mutex::new(()),
            updated: Topic::new(),
            key_updated: Topic::new(),
        });

        if needs_resave {
            store.clone().schedule_save().await;
        }
        store
    }

    pub async fn get_all(&self) -> AppConfig {
        self.inner.read().await.current.clone()
    }

    /// Reads a single field (spec §4.1 `get(key)`).
    pub async fn get(&self, key: ConfigKey) -> serde_json::Value {
        field_value(&self.get_all().await, key.field_name())
    }

    pub async fn update(self: &Arc<Self>, partial: UpdateAppConfig) -> Vec<String> {
        let mut guard = self.inner.write().await;
        let previous = guard.current.clone();
        let candidate = partial.build(previous.clone());
        if candidate == previous {
            return Vec::new();
        }
        let changed_keys = changed_fields(&previous, &candidate);
        guard.current = candidate.clone();
        drop(guard);

        self.clone().schedule_save().await;
        for key in &changed_keys {
            self.key_updated.publish(ConfigKeyUpdated {
                key: key.clone(),
                previous: field_value(&previous, key),
                current: field_value(&candidate, key),
            });
        }
        self.updated.publish(ConfigUpdated {
            changed_keys: changed_keys.clone(),
            previous,
            current: candidate,
        });
        changed_keys
    }

    /// Sets a single field (spec §4.1 `set(key, value)`). `value` must
    /// deserialize into the field's type or the call fails validation
    /// without mutating anything.
    pub async fn set(
        self: &Arc<Self>,
        key: ConfigKey,
        value: serde_json::Value,
    ) -> Result<Vec<String>, FlotillaError> {
        let current = self.get_all().await;
        let mut as_value = serde_json::to_value(&current)?;
        if let serde_json::Value::Object(obj) = &mut as_value {
            obj.insert(key.field_name().to_string(), value);
        }
        let candidate: AppConfig = serde_json::from_value(as_value).map_err(|err| {
            FlotillaError::validation(format!("invalid value for {}: {err}", key.field_name()))
        })?;
        Ok(self.update(as_update(candidate)).await)
    }

    /// Full replace, same event semantics as `update`.
    pub async fn replace(self: &Arc<Self>, next: AppConfig) -> Vec<String> {
        self.update(as_update(next)).await
    }

    pub async fn reset_to_defaults(self: &Arc<Self>) -> Vec<String> {
        self.replace(AppConfig::default()).await
    }

    pub async fn reload(self: &Arc<Self>) {
        if let Ok(text) = tokio::fs::read_to_string(&self.path).await {
            if let Ok(raw) = serde_json::from_str::<serde_json::Value>(&text) {
                let (sanitized, needs_resave) = sanitize(raw);
                let mut guard = self.inner.write().await;
                let previous = guard.current.clone();
                guard.current = sanitized.clone();
                drop(guard);
                if sanitized != previous {
                    let changed_keys = changed_fields(&previous, &sanitized);
                    self.updated.publish(ConfigUpdated {
                        changed_keys,
                        previous,
                        current: sanitized,
                    });
                }
                if needs_resave {
                    self.clone().schedule_save().await;
                }
            }
        }
    }

    /// Debounces a write 100 ms out unless one is already scheduled.
    async fn schedule_save(self: Arc<Self>) {
        let mut guard = self.inner.write().await;
        if guard.save_handle.is_some() {
            return;
        }
        let store = self.clone();
        guard.save_handle = Some(tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            store.write_now().await;
            store.inner.write().await.save_handle = None;
        }));
    }

    /// Cancels the debounce timer and writes immediately.
    pub async fn force_save(self: &Arc<Self>) {
        let handle = self.inner.write().await.save_handle.take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.write_now().await;
    }

    async fn write_now(&self) {
        let _guard = self.saving.lock().await;
        let snapshot = self.inner.read().await.current.clone();
        if let Err(err) = self.write_to_disk(&snapshot).await {
            warn!(error = %err, "failed to persist config.json");
        } else {
            debug!("config.json persisted");
        }
    }

    async fn write_to_disk(&self, config: &AppConfig) -> Result<(), FlotillaError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.lock_path, b"").await?;
        let json = serde_json::to_string_pretty(config)?;
        let result = tokio::fs::write(&self.path, json).await;
        let _ = tokio::fs::remove_file(&self.lock_path).await;
        result?;
        Ok(())
    }

    /// Bounded async save on shutdown, falling back to a blocking write so no
    /// in-memory change is lost (spec §4.1).
    pub async fn dispose(self: &Arc<Self>) {
        let handle = self.inner.write().await.save_handle.take();
        if let Some(handle) = handle {
            handle.abort();
        }
        let snapshot = self.inner.read().await.current.clone();
        if timeout(FORCE_SAVE_TIMEOUT, self.write_to_disk(&snapshot))
            .await
            .is_err()
        {
            warn!("config save timed out on shutdown, falling back to blocking write");
            if let Ok(json) = serde_json::to_string_pretty(&snapshot) {
                let _ = std::fs::write(&self.path, json);
                let _ = std::fs::remove_file(&self.lock_path);
            }
        }
        info!("config store disposed");
    }
}

/// Drops unknown keys, fills missing ones from defaults. Returns whether the
/// sanitized value differs from the raw input (schedules a resave if so).
fn sanitize(raw: serde_json::Value) -> (AppConfig, bool) {
    let defaults = serde_json::to_value(AppConfig::default()).expect("AppConfig always serializes");
    let merged = match (raw.clone(), defaults) {
        (serde_json::Value::Object(mut raw_obj), serde_json::Value::Object(default_obj)) => {
            raw_obj.retain(|k, _| default_obj.contains_key(k));
            let mut merged = default_obj;
            for (k, v) in raw_obj {
                merged.insert(k, v);
            }
            serde_json::Value::Object(merged)
        }
        (_, defaults) => defaults,
    };
    let needs_resave = merged != raw;
    let config = serde_json::from_value(merged).unwrap_or_default();
    (config, needs_resave)
}

fn as_update(config: AppConfig) -> UpdateAppConfig {
    UpdateAppConfig {
        webui_port: Some(config.webui_port),
        webui_password: Some(config.webui_password),
        force_legacy_api: Some(config.force_legacy_api),
        usage_tracking_enabled: Some(config.usage_tracking_enabled),
        usage_update_mode: Some(config.usage_update_mode),
        active_interval_ms: Some(config.active_interval_ms),
        inactive_interval_ms: Some(config.inactive_interval_ms),
    }
}

/// Reads one named field out of an `AppConfig` as JSON. Panics only if
/// `field` isn't one of `AppConfig`'s own field names, which `ConfigKey`
/// guarantees.
fn field_value(config: &AppConfig, field: &str) -> serde_json::Value {
    let as_value = serde_json::to_value(config).expect("AppConfig always serializes");
    as_value
        .get(field)
        .cloned()
        .expect("field_value called with a field name not present on AppConfig")
}

fn changed_fields(previous: &AppConfig, current: &AppConfig) -> Vec<String> {
    let mut changed = Vec::new();
    macro_rules! check {
        ($field:ident) => {
            if previous.$field != current.$field {
                changed.push(stringify!($field).to_string());
            }
        };
    }
    check!(webui_port);
    check!(webui_password);
    check!(force_legacy_api);
    check!(usage_tracking_enabled);
    check!(usage_update_mode);
    check!(active_interval_ms);
    check!(inactive_interval_ms);
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_missing_file_falls_back_to_defaults_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path()).await;
        assert_eq!(store.get_all().await, AppConfig::default());
        store.force_save().await;
        assert!(dir.path().join("config.json").exists());
    }

    fn no_op_update() -> UpdateAppConfig {
        UpdateAppConfig {
            webui_port: None,
            webui_password: None,
            force_legacy_api: None,
            usage_tracking_enabled: None,
            usage_update_mode: None,
            active_interval_ms: None,
            inactive_interval_ms: None,
        }
    }

    #[tokio::test]
    async fn update_with_no_changes_emits_no_event() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path()).await;
        let mut rx = store.updated.subscribe();
        let defaults = AppConfig::default();
        let partial = UpdateAppConfig {
            webui_port: Some(defaults.webui_port),
            ..no_op_update()
        };
        store.update(partial).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn update_changes_value_and_reports_changed_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path()).await;
        let partial = UpdateAppConfig {
            webui_port: Some(9999),
            ..no_op_update()
        };
        let changed = store.update(partial).await;
        assert_eq!(changed, vec!["webui_port".to_string()]);
        assert_eq!(store.get_all().await.webui_port, 9999);
    }

    #[tokio::test]
    async fn update_publishes_one_key_updated_event_per_changed_field() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path()).await;
        let mut rx = store.key_updated.subscribe();
        let partial = UpdateAppConfig {
            webui_port: Some(9999),
            ..no_op_update()
        };
        store.update(partial).await;
        let event = rx.try_recv().unwrap();
        assert_eq!(event.key, "webui_port");
        assert_eq!(event.current, serde_json::json!(9999));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn get_reads_a_single_field() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path()).await;
        assert_eq!(
            store.get(ConfigKey::WebuiPort).await,
            serde_json::json!(AppConfig::default().webui_port)
        );
    }

    #[tokio::test]
    async fn set_changes_a_single_field_and_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path()).await;
        let changed = store.set(ConfigKey::WebuiPort, serde_json::json!(9090)).await.unwrap();
        assert_eq!(changed, vec!["webui_port".to_string()]);
        assert_eq!(store.get_all().await.webui_port, 9090);

        let err = store
            .set(ConfigKey::WebuiPort, serde_json::json!("not-a-port"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn reload_picks_up_external_edits() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path()).await;
        store.force_save().await;
        let mut on_disk = AppConfig::default();
        on_disk.webui_port = 1234;
        tokio::fs::write(
            dir.path().join("config.json"),
            serde_json::to_string_pretty(&on_disk).unwrap(),
        )
        .await
        .unwrap();
        store.reload().await;
        assert_eq!(store.get_all().await.webui_port, 1234);
    }

    #[tokio::test]
    async fn dispose_writes_pending_change_even_if_debounce_has_not_fired() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path()).await;
        let partial = UpdateAppConfig {
            webui_port: Some(4321),
            ..no_op_update()
        };
        store.update(partial).await;
        store.dispose().await;
        let text = tokio::fs::read_to_string(dir.path().join("config.json"))
            .await
            .unwrap();
        let on_disk: AppConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(on_disk.webui_port, 4321);
    }
}
