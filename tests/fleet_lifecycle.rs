//! End-to-end wiring test: Connection Flow → Polling Coordinator → Print
//! State Monitor → Temperature Monitor, driven off a mock rich client whose
//! status is mutated mid-test (spec §8 scenarios S2/S3).

use std::sync::Arc;
use std::time::Duration;

use flotilla::client::LegacyPrinterInfo;
use flotilla::connection::{ConnectionFlow, ConnectionResult};
use flotilla::monitor::PrintStateMonitor;
use flotilla::polling::PollingCoordinator;
use flotilla::printer_details::PrinterDetailsStore;
use flotilla::registry::ContextRegistry;
use flotilla::temperature::{TemperatureEvent, TemperatureMonitor};
use flotilla::types::{CurrentJob, LifecycleEventKind, PrinterState, PrinterStatus, Temperature};

mod common;
use common::mock_client::{MockClientFactory, MockLegacyClient, MockRichClient};

const POLL_INTERVAL_MS: u64 = 20;
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn status(state: PrinterState, job: Option<&str>, bed: f64) -> PrinterStatus {
    PrinterStatus {
        state,
        current_job: job.map(|name| CurrentJob {
            file_name: name.to_string(),
            progress_percent: 50.0,
            current_layer: Some(5),
            total_layers: Some(10),
            weight_used_grams: Some(12.0),
            length_used_meters: Some(4.0),
        }),
        bed_temperature: Some(Temperature { current: bed, target: 0.0 }),
        extruder_temperature: Some(Temperature { current: bed, target: 0.0 }),
        bed_heating: false,
        extruder_heating: false,
    }
}

#[tokio::test]
async fn print_completion_flows_through_to_temperature_cooldown() {
    let rich = Arc::new(MockRichClient::new(status(PrinterState::Printing, Some("part.3mf"), 60.0)));
    let legacy = MockLegacyClient::new(LegacyPrinterInfo {
        type_name: Some("Adventurer 5M".into()),
        name: Some("Bay 1".into()),
        serial_number: Some("SN-E2E-1".into()),
    });
    let factory = MockClientFactory::new()
        .with_legacy("10.0.0.40", legacy)
        .with_rich("10.0.0.40", rich.clone());

    let dir = tempfile::tempdir().unwrap();
    let registry = ContextRegistry::new();
    let printer_details = PrinterDetailsStore::load(dir.path()).await;
    let connection_flow = ConnectionFlow::new(
        registry.clone(),
        printer_details,
        Arc::new(factory),
        None,
        false,
    );

    let polling = PollingCoordinator::new(registry.clone(), POLL_INTERVAL_MS, POLL_INTERVAL_MS);
    polling.start();

    let ConnectionResult::Success(details) = connection_flow
        .connect("10.0.0.40", Some("1234".to_string()))
        .await
    else {
        panic!("expected successful connection");
    };

    let print_state_monitor = PrintStateMonitor::new(details.context_id.clone());
    let lifecycle_events = print_state_monitor.spawn(&polling.events);

    let temperature_monitor = TemperatureMonitor::new(details.context_id.clone());
    temperature_monitor.spawn(&lifecycle_events, &polling.events);
    let mut temperature_rx = temperature_monitor.events.subscribe();

    let mut lifecycle_rx = lifecycle_events.subscribe();

    // First poll tick observes "printing" again; no transition is emitted
    // since the monitor only just started watching.
    tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS * 3)).await;

    rich.set_status(status(PrinterState::Completed, Some("part.3mf"), 60.0));

    let completed = tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            let event = lifecycle_rx.recv().await.unwrap();
            if event.kind == LifecycleEventKind::PrintCompleted {
                return event;
            }
        }
    })
    .await
    .expect("expected a PrintCompleted lifecycle event");
    assert_eq!(completed.context_id, details.context_id);

    rich.set_status(status(PrinterState::Completed, Some("part.3mf"), 20.0));

    let cooled = tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            if let TemperatureEvent::PrinterCooled { context_id, .. } = temperature_rx.recv().await.unwrap() {
                return context_id;
            }
        }
    })
    .await
    .expect("expected the bed to be observed cooling below threshold");
    assert_eq!(cooled, details.context_id);
}
