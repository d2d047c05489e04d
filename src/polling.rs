//! Polling Coordinator (C6, spec §4.6). One independently-cancellable loop
//! per context, adaptive active/inactive cadence, cached snapshot. Grounded
//! directly on `groblegark-coop`'s `spawn_screen_poller`: a
//! `CancellationToken` + `tokio::time::interval` + `RwLock`-guarded cache per
//! live resource.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::ErrorKind;
use crate::event_bus::Topic;
use crate::registry::{ContextRegistry, RegistryEvent};
use crate::types::{MaterialStationStatus, PollingSnapshot, PrinterStatus};

const MAX_RETRIES: u32 = 3;
const BASE_RETRY_MS: u64 = 1000;
const MAX_RETRY_MS: u64 = 30_000;
const THUMBNAIL_CACHE_CAP: usize = 64;

#[derive(Clone, Debug)]
pub enum PollingEvent {
    DataUpdated { context_id: String, snapshot: PollingSnapshot },
    StatusUpdated { context_id: String, status: PrinterStatus },
    JobUpdated { context_id: String, job: crate::types::CurrentJob },
    PollingError { context_id: String, error: String, retry_count: u32, will_retry: bool },
    PollingStopped { context_id: String },
    /// Synchronous replay of a context's cached snapshot, emitted on cadence
    /// retune so subscribers see the newly-active printer immediately
    /// (spec §4.6.2, §8 invariant 10).
    PollingData { context_id: String, snapshot: Option<PollingSnapshot> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ThumbnailCacheEntry {
    Failed,
}

struct LoopHandle {
    cancel: CancellationToken,
    cadence: watch::Sender<u64>,
    cached_snapshot: Arc<RwLock<Option<PollingSnapshot>>>,
}

pub struct PollingCoordinator {
    registry: Arc<ContextRegistry>,
    active_interval_ms: u64,
    inactive_interval_ms: u64,
    loops: RwLock<HashMap<String, LoopHandle>>,
    pub events: Topic<PollingEvent>,
}

impl PollingCoordinator {
    pub fn new(
        registry: Arc<ContextRegistry>,
        active_interval_ms: u64,
        inactive_interval_ms: u64,
    ) -> Arc<Self> {
        Arc::new(PollingCoordinator {
            registry,
            active_interval_ms,
            inactive_interval_ms,
            loops: RwLock::new(HashMap::new()),
            events: Topic::new(),
        })
    }

    /// Spawns the supervisor task that reacts to Registry lifecycle events.
    /// Call once at startup; the returned token cancels the whole
    /// Coordinator (used by shutdown).
    pub fn start(self: &Arc<Self>) -> CancellationToken {
        let supervisor_token = CancellationToken::new();
        let coordinator = self.clone();
        let mut registry_events = self.registry.events.subscribe();
        let token = supervisor_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = registry_events.recv() => {
                        match event {
                            Ok(RegistryEvent::ContextCreated { context_id }) => {
                                coordinator.spawn_loop(context_id).await;
                            }
                            Ok(RegistryEvent::ContextRemoved { context_id, .. }) => {
                                coordinator.stop_loop(&context_id).await;
                            }
                            Ok(RegistryEvent::ContextSwitched { context_id, previous_context_id }) => {
                                coordinator.retune(&context_id, previous_context_id.as_deref()).await;
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
        });
        supervisor_token
    }

    async fn spawn_loop(self: &Arc<Self>, context_id: String) {
        let is_active = self.registry.active_context_id().await.as_deref() == Some(&context_id);
        let initial_interval = if is_active {
            self.active_interval_ms
        } else {
            self.inactive_interval_ms
        };
        let cancel = CancellationToken::new();
        let (cadence_tx, cadence_rx) = watch::channel(initial_interval);
        let cached_snapshot = Arc::new(RwLock::new(None));

        self.loops.write().await.insert(
            context_id.clone(),
            LoopHandle {
                cancel: cancel.clone(),
                cadence: cadence_tx,
                cached_snapshot: cached_snapshot.clone(),
            },
        );
        self.registry.set_polling_running(&context_id, true).await;

        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator
                .run_loop(context_id, cancel, cadence_rx, cached_snapshot)
                .await;
        });
    }

    async fn stop_loop(&self, context_id: &str) {
        if let Some(handle) = self.loops.write().await.remove(context_id) {
            handle.cancel.cancel();
        }
        self.registry.set_polling_running(context_id, false).await;
    }

    /// §4.6.2 cadence re-tuning: new active context gets the active cadence
    /// and a synchronous snapshot replay; the previous one drops to the
    /// inactive cadence.
    async fn retune(&self, new_context_id: &str, previous_context_id: Option<&str>) {
        let loops = self.loops.read().await;
        if let Some(handle) = loops.get(new_context_id) {
            let _ = handle.cadence.send(self.active_interval_ms);
            let snapshot = handle.cached_snapshot.read().await.clone();
            drop(loops);
            self.events.publish(PollingEvent::PollingData {
                context_id: new_context_id.to_string(),
                snapshot,
            });
        } else {
            drop(loops);
        }
        if let Some(previous_id) = previous_context_id {
            if let Some(handle) = self.loops.read().await.get(previous_id) {
                let _ = handle.cadence.send(self.inactive_interval_ms);
            }
        }
    }

    #[instrument(skip(self, cancel, cadence_rx, cached_snapshot), fields(context_id = %context_id))]
    async fn run_loop(
        self: Arc<Self>,
        context_id: String,
        cancel: CancellationToken,
        mut cadence_rx: watch::Receiver<u64>,
        cached_snapshot: Arc<RwLock<Option<PollingSnapshot>>>,
    ) {
        let mut tick_interval = interval(Duration::from_millis(*cadence_rx.borrow()));
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut retry_count: u32 = 0;
        let mut thumbnail_cache: HashMap<String, ThumbnailCacheEntry> = HashMap::new();
        let mut cached_thumbnails: HashMap<String, String> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("polling loop cancelled");
                    return;
                }
                changed = cadence_rx.changed() => {
                    if changed.is_ok() {
                        tick_interval = interval(Duration::from_millis(*cadence_rx.borrow()));
                        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    }
                }
                _ = tick_interval.tick() => {
                    let Some(backend) = self.registry.get_backend(&context_id).await else {
                        continue;
                    };
                    let status_result = backend.get_printer_status().await;
                    let material_result = if backend.feature_set().material_station {
                        Some(backend.get_material_station_status().await)
                    } else {
                        None
                    };

                    match status_result.outcome {
                        Ok(status) => {
                            retry_count = 0;
                            let material_station = material_result
                                .and_then(|r| r.outcome.ok());
                            let thumbnail = self
                                .resolve_thumbnail(
                                    &backend,
                                    &status,
                                    &mut thumbnail_cache,
                                    &mut cached_thumbnails,
                                )
                                .await;

                            let snapshot = derive_snapshot(&status, material_station, thumbnail);
                            *cached_snapshot.write().await = Some(snapshot.clone());

                            self.events.publish(PollingEvent::DataUpdated {
                                context_id: context_id.clone(),
                                snapshot,
                            });
                            self.events.publish(PollingEvent::StatusUpdated {
                                context_id: context_id.clone(),
                                status: status.clone(),
                            });
                            if let Some(job) = status.current_job.clone() {
                                self.events.publish(PollingEvent::JobUpdated {
                                    context_id: context_id.clone(),
                                    job,
                                });
                            }
                        }
                        Err(err) if err.kind == ErrorKind::BackendNotReady => {
                            // Backend hasn't finished initializing yet; skip this tick
                            // without touching the retry counter (spec §4.6.1.1).
                            continue;
                        }
                        Err(err) => {
                            retry_count += 1;
                            let will_retry = retry_count <= MAX_RETRIES;
                            self.events.publish(PollingEvent::PollingError {
                                context_id: context_id.clone(),
                                error: err.to_string(),
                                retry_count,
                                will_retry,
                            });
                            if !will_retry {
                                self.events.publish(PollingEvent::PollingStopped {
                                    context_id: context_id.clone(),
                                });
                                warn!(retry_count, "polling loop stopped after exceeding max retries");
                                return;
                            }
                            let backoff_ms =
                                (BASE_RETRY_MS * 2u64.pow(retry_count - 1)).min(MAX_RETRY_MS);
                            sleep(Duration::from_millis(backoff_ms)).await;
                        }
                    }
                }
            }
        }
    }

    /// §4.6.4 thumbnail side-cache: reuse non-null cache hits, never retry a
    /// cached failure, otherwise ask the backend and cache the outcome.
    async fn resolve_thumbnail(
        &self,
        backend: &crate::backend::Backend,
        status: &PrinterStatus,
        failed_cache: &mut HashMap<String, ThumbnailCacheEntry>,
        success_cache: &mut HashMap<String, String>,
    ) -> Option<String> {
        let file_name = status.current_job.as_ref()?.file_name.clone();

        if let Some(thumb) = success_cache.get(&file_name) {
            return Some(thumb.clone());
        }
        if failed_cache.contains_key(&file_name) {
            return None;
        }
        if !backend.feature_set().thumbnail {
            return None;
        }

        match backend.get_job_thumbnail(&file_name).await.outcome {
            Ok(Some(thumb)) => {
                if success_cache.len() >= THUMBNAIL_CACHE_CAP {
                    success_cache.clear();
                }
                success_cache.insert(file_name, thumb.clone());
                Some(thumb)
            }
            Ok(None) | Err(_) => {
                if failed_cache.len() >= THUMBNAIL_CACHE_CAP {
                    failed_cache.clear();
                }
                failed_cache.insert(file_name, ThumbnailCacheEntry::Failed);
                None
            }
        }
    }
}

/// §4.6.3 stateless normalization from raw backend status into a snapshot.
fn derive_snapshot(
    status: &PrinterStatus,
    material_station: Option<MaterialStationStatus>,
    thumbnail_base64: Option<String>,
) -> PollingSnapshot {
    let mut status = status.clone();
    if let Some(job) = &mut status.current_job {
        job.progress_percent = normalize_progress(job.progress_percent);
        if let (Some(current), Some(total)) = (job.current_layer, job.total_layers) {
            if current > total {
                job.current_layer = Some(0);
            }
        }
    }
    // Current-job fields are preserved across Printing/Paused/Completed, and
    // cleared otherwise (spec §4.6.3).
    use crate::types::PrinterState::*;
    if !matches!(status.state, Printing | Paused | Completed) {
        status.current_job = None;
    }

    PollingSnapshot {
        printer_status: Some(status),
        material_station,
        thumbnail_base64,
        connected: true,
        initializing: false,
        last_polled_at: now_iso(),
    }
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Normalizes a raw 0–1 fraction or an already-percent value into [0,100]
/// (spec §4.6.3 progress handling).
pub fn normalize_progress(raw: f64) -> f64 {
    if raw <= 1.0 {
        (raw * 100.0).clamp(0.0, 100.0)
    } else {
        raw.clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CurrentJob, PrinterState};

    #[test]
    fn normalize_progress_treats_fraction_and_percent() {
        assert_eq!(normalize_progress(0.5), 50.0);
        assert_eq!(normalize_progress(42.0), 42.0);
        assert_eq!(normalize_progress(150.0), 100.0);
    }

    #[test]
    fn derive_snapshot_clears_job_when_not_active_or_completed() {
        let status = PrinterStatus {
            state: PrinterState::Ready,
            current_job: Some(CurrentJob {
                file_name: "a.3mf".into(),
                progress_percent: 50.0,
                current_layer: Some(1),
                total_layers: Some(10),
                weight_used_grams: None,
                length_used_meters: None,
            }),
            bed_temperature: None,
            extruder_temperature: None,
            bed_heating: false,
            extruder_heating: false,
        };
        let snapshot = derive_snapshot(&status, None, None);
        assert!(snapshot.printer_status.unwrap().current_job.is_none());
    }

    #[test]
    fn derive_snapshot_preserves_job_while_completed() {
        let status = PrinterStatus {
            state: PrinterState::Completed,
            current_job: Some(CurrentJob {
                file_name: "a.3mf".into(),
                progress_percent: 100.0,
                current_layer: Some(10),
                total_layers: Some(10),
                weight_used_grams: None,
                length_used_meters: None,
            }),
            bed_temperature: None,
            extruder_temperature: None,
            bed_heating: false,
            extruder_heating: false,
        };
        let snapshot = derive_snapshot(&status, None, None);
        assert!(snapshot.printer_status.unwrap().current_job.is_some());
    }
}
