//! Usage Tracker (C9, spec §4.9). Per context; reconciles completed-print
//! filament usage against the external inventory service.

use std::sync::Arc;
use std::sync::Mutex;

use tracing::{instrument, warn};

use crate::config::{ConfigStore, UsageUpdateMode};
use crate::event_bus::Topic;
use crate::printer_details::PrinterDetailsStore;
use crate::registry::ContextRegistry;
use crate::spoolman::SpoolmanClient;
use crate::types::{LifecycleEvent, LifecycleEventKind};

#[derive(Clone, Debug)]
pub enum UsageEvent {
    UsageUpdateFailed { context_id: String, error: String },
    UsageRecorded { context_id: String, job_name: String },
}

pub struct UsageTracker {
    context_id: String,
    config: Arc<ConfigStore>,
    registry: Arc<ContextRegistry>,
    printer_details: Arc<PrinterDetailsStore>,
    spoolman: Arc<SpoolmanClient>,
    usage_recorded_for_print: Mutex<Option<String>>,
    pub events: Topic<UsageEvent>,
}

impl UsageTracker {
    pub fn new(
        context_id: String,
        config: Arc<ConfigStore>,
        registry: Arc<ContextRegistry>,
        printer_details: Arc<PrinterDetailsStore>,
        spoolman: Arc<SpoolmanClient>,
    ) -> Arc<Self> {
        Arc::new(UsageTracker {
            context_id,
            config,
            registry,
            printer_details,
            spoolman,
            usage_recorded_for_print: Mutex::new(None),
            events: Topic::new(),
        })
    }

    pub fn spawn(self: &Arc<Self>, lifecycle_events: &Topic<LifecycleEvent>) {
        let tracker = self.clone();
        let mut rx = lifecycle_events.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if event.context_id != tracker.context_id {
                    continue;
                }
                if event.kind == LifecycleEventKind::PrintCompleted {
                    tracker.on_print_completed(event).await;
                }
            }
        });
    }

    #[instrument(skip(self, event), fields(context_id = %self.context_id))]
    async fn on_print_completed(&self, event: LifecycleEvent) {
        let Some(job_name) = event.job_name.clone() else {
            return;
        };
        if self.usage_recorded_for_print.lock().unwrap().as_deref() == Some(job_name.as_str()) {
            return;
        }

        if !self.config.get_all().await.usage_tracking_enabled {
            return;
        }

        let Some(overrides) = self.registry.get_overrides(&self.context_id).await else {
            return;
        };
        let Some(active_spool) = overrides.active_spool else {
            return;
        };

        let Some(job) = event.status.current_job.as_ref() else {
            return;
        };
        let weight_used_grams = job.weight_used_grams.unwrap_or(0.0);
        let length_used_mm = job
            .length_used_meters
            .map(|meters| round2(meters * 1000.0))
            .unwrap_or(0.0);

        let mode = self.config.get_all().await.usage_update_mode;
        let (use_weight, use_length) = select_payload(mode, weight_used_grams, length_used_mm);

        let (use_weight, use_length) = match (use_weight, use_length) {
            (None, None) => {
                warn!(job_name = %job_name, "no usable usage payload for completed print");
                return;
            }
            pair => pair,
        };

        match self
            .spoolman
            .update_usage(&active_spool.spool_id, use_weight, use_length)
            .await
        {
            Ok(spool) => {
                let updated = spool.to_active_spool();
                self.registry
                    .set_active_spool(&self.context_id, Some(updated.clone()))
                    .await;
                if let Some(identity) = self.registry.get_identity(&self.context_id).await {
                    if let Some(mut stored) = self.printer_details.get(&identity.serial_number).await {
                        stored.per_printer_overrides.active_spool = Some(updated);
                        let _ = self.printer_details.save(stored, false).await;
                    }
                }
                *self.usage_recorded_for_print.lock().unwrap() = Some(job_name.clone());
                self.events.publish(UsageEvent::UsageRecorded {
                    context_id: self.context_id.clone(),
                    job_name,
                });
            }
            Err(err) => {
                self.events.publish(UsageEvent::UsageUpdateFailed {
                    context_id: self.context_id.clone(),
                    error: err.to_string(),
                });
            }
        }
    }
}

/// §4.9 step 5: each mode prefers its own unit, falling back to the other
/// when the preferred one is not `> 0`.
fn select_payload(mode: UsageUpdateMode, weight: f64, length_mm: f64) -> (Option<f64>, Option<f64>) {
    match mode {
        UsageUpdateMode::Weight => {
            if weight > 0.0 {
                (Some(weight), None)
            } else if length_mm > 0.0 {
                (None, Some(length_mm))
            } else {
                (None, None)
            }
        }
        UsageUpdateMode::Length => {
            if length_mm > 0.0 {
                (None, Some(length_mm))
            } else if weight > 0.0 {
                (Some(weight), None)
            } else {
                (None, None)
            }
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_mode_falls_back_to_length_when_weight_is_zero() {
        assert_eq!(select_payload(UsageUpdateMode::Weight, 0.0, 120.5), (None, Some(120.5)));
    }

    #[test]
    fn length_mode_prefers_length() {
        assert_eq!(select_payload(UsageUpdateMode::Length, 10.0, 120.5), (None, Some(120.5)));
    }

    #[test]
    fn neither_field_positive_yields_no_payload() {
        assert_eq!(select_payload(UsageUpdateMode::Weight, 0.0, 0.0), (None, None));
    }

    #[test]
    fn round2_rounds_to_two_decimal_places() {
        assert_eq!(round2(1.23456), 1.23);
    }
}
