//! Print State Monitor (C7, spec §4.7). One per context; derives lifecycle
//! transitions from the Polling Coordinator's `status-updated` stream.

use std::sync::Arc;

use tracing::instrument;

use crate::event_bus::Topic;
use crate::polling::PollingEvent;
use crate::types::{LifecycleEvent, LifecycleEventKind, PrinterState, PrinterStatus};

pub struct PrintStateMonitor {
    context_id: String,
    previous_state: Option<PrinterState>,
    current_job_name: Option<String>,
    pub events: Topic<LifecycleEvent>,
}

impl PrintStateMonitor {
    pub fn new(context_id: String) -> Self {
        PrintStateMonitor {
            context_id,
            previous_state: None,
            current_job_name: None,
            events: Topic::new(),
        }
    }

    /// Runs for the lifetime of the context; ignores events for other
    /// contexts on the shared Coordinator topic.
    pub fn spawn(mut self, polling_events: &Topic<PollingEvent>) -> Arc<Topic<LifecycleEvent>> {
        let events = Arc::new(Topic::new());
        let emitted = events.clone();
        let context_id = self.context_id.clone();
        let mut rx = polling_events.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let PollingEvent::StatusUpdated { context_id: cid, status } = event {
                    if cid != context_id {
                        continue;
                    }
                    self.on_status_updated(status, &emitted);
                }
            }
        });
        events
    }

    #[instrument(skip(self, status, events), fields(context_id = %self.context_id))]
    fn on_status_updated(&mut self, status: PrinterStatus, events: &Topic<LifecycleEvent>) {
        self.current_job_name = status.current_job.as_ref().map(|j| j.file_name.clone());
        let current_state = status.state;
        let previous_state = self.previous_state;
        let timestamp = now_iso();

        if let Some(prev) = previous_state {
            if prev != current_state {
                events.publish(LifecycleEvent {
                    context_id: self.context_id.clone(),
                    job_name: self.current_job_name.clone(),
                    previous_state: Some(prev),
                    current_state,
                    status: status.clone(),
                    timestamp: timestamp.clone(),
                    kind: LifecycleEventKind::StateChanged,
                });
            }
        }

        let was_active = previous_state.map(|p| p.is_active()).unwrap_or(false);
        let is_active = current_state.is_active();

        if is_active && !was_active && self.current_job_name.is_some() {
            events.publish(LifecycleEvent {
                context_id: self.context_id.clone(),
                job_name: self.current_job_name.clone(),
                previous_state,
                current_state,
                status: status.clone(),
                timestamp: timestamp.clone(),
                kind: LifecycleEventKind::PrintStarted,
            });
        }

        let kind = match current_state {
            PrinterState::Completed => Some(LifecycleEventKind::PrintCompleted),
            PrinterState::Cancelled => Some(LifecycleEventKind::PrintCancelled),
            PrinterState::Error => Some(LifecycleEventKind::PrintError),
            _ => None,
        };
        if let Some(kind) = kind {
            events.publish(LifecycleEvent {
                context_id: self.context_id.clone(),
                job_name: self.current_job_name.clone(),
                previous_state,
                current_state,
                status,
                timestamp,
                kind,
            });
        }

        self.previous_state = Some(current_state);
    }
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Temperature;

    fn status(state: PrinterState, job_name: Option<&str>) -> PrinterStatus {
        PrinterStatus {
            state,
            current_job: job_name.map(|name| crate::types::CurrentJob {
                file_name: name.to_string(),
                progress_percent: 0.0,
                current_layer: None,
                total_layers: None,
                weight_used_grams: None,
                length_used_meters: None,
            }),
            bed_temperature: Some(Temperature { current: 20.0, target: 0.0 }),
            extruder_temperature: Some(Temperature { current: 20.0, target: 0.0 }),
            bed_heating: false,
            extruder_heating: false,
        }
    }

    #[test]
    fn first_status_never_emits_state_changed() {
        let mut monitor = PrintStateMonitor::new("ctx-1".into());
        let events = Topic::new();
        monitor.on_status_updated(status(PrinterState::Ready, None), &events);
        assert_eq!(monitor.previous_state, Some(PrinterState::Ready));
    }

    #[test]
    fn transition_to_printing_emits_started_and_state_changed() {
        let mut monitor = PrintStateMonitor::new("ctx-1".into());
        monitor.previous_state = Some(PrinterState::Ready);
        let events = Topic::new();
        let mut rx = events.subscribe();
        monitor.on_status_updated(status(PrinterState::Printing, Some("a.3mf")), &events);

        let first = rx.try_recv().unwrap();
        assert!(matches!(first.kind, LifecycleEventKind::StateChanged));
        let second = rx.try_recv().unwrap();
        assert!(matches!(second.kind, LifecycleEventKind::PrintStarted));
    }

    #[test]
    fn transition_to_completed_emits_print_completed() {
        let mut monitor = PrintStateMonitor::new("ctx-1".into());
        monitor.previous_state = Some(PrinterState::Printing);
        let events = Topic::new();
        let mut rx = events.subscribe();
        monitor.on_status_updated(status(PrinterState::Completed, Some("a.3mf")), &events);
        let _state_changed = rx.try_recv().unwrap();
        let completed = rx.try_recv().unwrap();
        assert!(matches!(completed.kind, LifecycleEventKind::PrintCompleted));
    }
}
