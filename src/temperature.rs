//! Temperature Monitor (C8, spec §4.8). Per context; watches bed temperature
//! cool down after a print completes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::instrument;

use crate::event_bus::Topic;
use crate::polling::PollingEvent;
use crate::types::{LifecycleEvent, LifecycleEventKind, PrinterStatus};

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_THRESHOLD_C: f64 = 35.0;

#[derive(Clone, Debug)]
pub enum TemperatureEvent {
    TemperatureChecked { context_id: String, temperature: f64, threshold: f64, has_cooled: bool },
    PrinterCooled { context_id: String, temperature: f64, bed_cooled_at: String, status: PrinterStatus },
}

struct Watch {
    started_at: String,
}

pub struct TemperatureMonitor {
    context_id: String,
    threshold_c: f64,
    check_interval: Duration,
    watch: Mutex<Option<Watch>>,
    last_status: Mutex<Option<PrinterStatus>>,
    pub events: Topic<TemperatureEvent>,
}

impl TemperatureMonitor {
    pub fn new(context_id: String) -> Arc<Self> {
        Arc::new(TemperatureMonitor {
            context_id,
            threshold_c: DEFAULT_THRESHOLD_C,
            check_interval: DEFAULT_CHECK_INTERVAL,
            watch: Mutex::new(None),
            last_status: Mutex::new(None),
            events: Topic::new(),
        })
    }

    /// Subscribes to lifecycle and polling status events for its own context.
    pub fn spawn(
        self: &Arc<Self>,
        lifecycle_events: &Topic<LifecycleEvent>,
        polling_events: &Topic<PollingEvent>,
    ) {
        let monitor = self.clone();
        let mut lifecycle_rx = lifecycle_events.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = lifecycle_rx.recv().await {
                if event.context_id != monitor.context_id {
                    continue;
                }
                match event.kind {
                    LifecycleEventKind::PrintCompleted => monitor.start(event.status).await,
                    LifecycleEventKind::PrintStarted
                    | LifecycleEventKind::PrintCancelled
                    | LifecycleEventKind::PrintError => monitor.reset().await,
                    LifecycleEventKind::StateChanged => {}
                }
            }
        });

        let monitor = self.clone();
        let mut polling_rx = polling_events.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = polling_rx.recv().await {
                if let PollingEvent::StatusUpdated { context_id, status } = event {
                    if context_id == monitor.context_id {
                        monitor.check(&status).await;
                    }
                }
            }
        });

        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(monitor.check_interval);
            loop {
                ticker.tick().await;
                let last = monitor.last_status.lock().await.clone();
                if let Some(status) = last {
                    monitor.check(&status).await;
                }
            }
        });
    }

    /// Begins watching; the first check happens on the next status-updated
    /// or tick rather than here, so it isn't double-counted against the one
    /// that follows immediately on most printers.
    #[instrument(skip(self, status), fields(context_id = %self.context_id))]
    async fn start(&self, status: PrinterStatus) {
        *self.last_status.lock().await = Some(status);
        *self.watch.lock().await = Some(Watch { started_at: now_iso() });
    }

    async fn reset(&self) {
        *self.watch.lock().await = None;
    }

    async fn check(&self, status: &PrinterStatus) {
        *self.last_status.lock().await = Some(status.clone());
        if self.watch.lock().await.is_none() {
            return;
        }
        let Some(bed) = status.bed_temperature else {
            return;
        };
        let has_cooled = bed.current < self.threshold_c;
        self.events.publish(TemperatureEvent::TemperatureChecked {
            context_id: self.context_id.clone(),
            temperature: bed.current,
            threshold: self.threshold_c,
            has_cooled,
        });
        if has_cooled {
            let bed_cooled_at = now_iso();
            self.events.publish(TemperatureEvent::PrinterCooled {
                context_id: self.context_id.clone(),
                temperature: bed.current,
                bed_cooled_at,
                status: status.clone(),
            });
            self.reset().await;
        }
    }
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Temperature;

    fn status_with_bed(current: f64) -> PrinterStatus {
        PrinterStatus {
            state: crate::types::PrinterState::Ready,
            current_job: None,
            bed_temperature: Some(Temperature { current, target: 0.0 }),
            extruder_temperature: None,
            bed_heating: false,
            extruder_heating: false,
        }
    }

    #[tokio::test]
    async fn ignores_checks_before_started() {
        let monitor = TemperatureMonitor::new("ctx-1".into());
        monitor.check(&status_with_bed(20.0)).await;
        assert!(monitor.watch.lock().await.is_none());
    }

    #[tokio::test]
    async fn cools_below_threshold_emits_and_stops() {
        let monitor = TemperatureMonitor::new("ctx-1".into());
        let mut rx = monitor.events.subscribe();
        monitor.start(status_with_bed(60.0)).await;
        monitor.check(&status_with_bed(60.0)).await;
        let checked = rx.try_recv().unwrap();
        assert!(matches!(checked, TemperatureEvent::TemperatureChecked { has_cooled: false, .. }));

        monitor.check(&status_with_bed(30.0)).await;
        let checked2 = rx.try_recv().unwrap();
        assert!(matches!(checked2, TemperatureEvent::TemperatureChecked { has_cooled: true, .. }));
        let cooled = rx.try_recv().unwrap();
        assert!(matches!(cooled, TemperatureEvent::PrinterCooled { .. }));
        assert!(monitor.watch.lock().await.is_none());
    }
}
