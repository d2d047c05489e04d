//! Scenario-level coverage of the Connection Flow (spec §4.3, §8) against a
//! mock client pair instead of real hardware.

use std::sync::Arc;

use flotilla::client::LegacyPrinterInfo;
use flotilla::connection::{ConnectionFlow, ConnectionResult};
use flotilla::printer_details::PrinterDetailsStore;
use flotilla::registry::ContextRegistry;
use flotilla::types::{ClientTypeTag, Family, ModelKind, PerPrinterOverrides, StoredPrinter};

mod common;
use common::mock_client::{MockClientFactory, MockLegacyClient};

async fn flow(factory: MockClientFactory, force_legacy_api: bool) -> (Arc<ConnectionFlow>, Arc<ContextRegistry>) {
    let dir = tempfile::tempdir().unwrap();
    let registry = ContextRegistry::new();
    let printer_details = PrinterDetailsStore::load(dir.path()).await;
    let flow = ConnectionFlow::new(
        registry.clone(),
        printer_details,
        Arc::new(factory),
        None,
        force_legacy_api,
    );
    (flow, registry)
}

#[tokio::test]
async fn connects_generic_legacy_printer_without_check_code() {
    let legacy = MockLegacyClient::new(LegacyPrinterInfo {
        type_name: Some("Adventurer 3".into()),
        name: Some("Workshop".into()),
        serial_number: Some("SN-LEGACY-1".into()),
    });
    let factory = MockClientFactory::new().with_legacy("10.0.0.10", legacy);
    let (flow, registry) = flow(factory, false).await;

    match flow.connect("10.0.0.10", None).await {
        ConnectionResult::Success(details) => {
            assert_eq!(details.identity.family, Family::Legacy);
            assert_eq!(details.identity.model_kind, ModelKind::GenericLegacy);
            assert!(registry.get_info(&details.context_id).await.unwrap().is_active);
        }
        ConnectionResult::Failure(err) => panic!("expected success, got {err}"),
    }
}

#[tokio::test]
async fn connects_five_m_printer_with_explicit_check_code() {
    let legacy = MockLegacyClient::new(LegacyPrinterInfo {
        type_name: Some("Adventurer 5M".into()),
        name: Some("Bay 2".into()),
        serial_number: Some("SN-5M-1".into()),
    });
    let rich = Arc::new(common::mock_client::MockRichClient::new(
        flotilla::types::PrinterStatus {
            state: flotilla::types::PrinterState::Ready,
            current_job: None,
            bed_temperature: None,
            extruder_temperature: None,
            bed_heating: false,
            extruder_heating: false,
        },
    ));
    let factory = MockClientFactory::new()
        .with_legacy("10.0.0.11", legacy)
        .with_rich("10.0.0.11", rich);
    let (flow, _registry) = flow(factory, false).await;

    match flow.connect("10.0.0.11", Some("1234".to_string())).await {
        ConnectionResult::Success(details) => {
            assert_eq!(details.identity.family, Family::FiveM);
        }
        ConnectionResult::Failure(err) => panic!("expected success, got {err}"),
    }
}

#[tokio::test]
async fn five_m_printer_without_check_code_fails_with_no_prompt_handler() {
    let legacy = MockLegacyClient::new(LegacyPrinterInfo {
        type_name: Some("Adventurer 5M".into()),
        name: Some("Bay 3".into()),
        serial_number: Some("SN-5M-2".into()),
    });
    let factory = MockClientFactory::new().with_legacy("10.0.0.12", legacy);
    let (flow, _registry) = flow(factory, false).await;

    match flow.connect("10.0.0.12", None).await {
        ConnectionResult::Success(_) => panic!("expected failure without a check code"),
        ConnectionResult::Failure(err) => {
            assert_eq!(err.kind, flotilla::error::ErrorKind::Cancelled);
        }
    }
}

#[tokio::test]
async fn connect_from_saved_continues_past_a_failing_printer() {
    let good = MockLegacyClient::new(LegacyPrinterInfo {
        type_name: Some("Adventurer 3".into()),
        name: Some("Good".into()),
        serial_number: Some("SN-GOOD".into()),
    });
    let factory = MockClientFactory::new().with_legacy("10.0.0.20", good);
    let (flow, registry) = flow(factory, false).await;

    let saved = vec![
        StoredPrinter {
            name: "Missing".into(),
            ip_address: "10.0.0.21".into(),
            serial_number: "SN-MISSING".into(),
            type_name: "Adventurer 3".into(),
            family: Family::Legacy,
            model_kind: ModelKind::GenericLegacy,
            check_code: String::new(),
            client_type_tag: ClientTypeTag::Legacy,
            last_connected_at: None,
            per_printer_overrides: PerPrinterOverrides::default(),
        },
        StoredPrinter {
            name: "Good".into(),
            ip_address: "10.0.0.20".into(),
            serial_number: "SN-GOOD".into(),
            type_name: "Adventurer 3".into(),
            family: Family::Legacy,
            model_kind: ModelKind::GenericLegacy,
            check_code: String::new(),
            client_type_tag: ClientTypeTag::Legacy,
            last_connected_at: None,
            per_printer_overrides: PerPrinterOverrides::default(),
        },
    ];

    let results = flow.connect_from_saved(saved).await;
    assert_eq!(results.len(), 2);
    assert!(matches!(results[0], ConnectionResult::Failure(_)));
    assert!(matches!(results[1], ConnectionResult::Success(_)));
    assert_eq!(registry.all_context_ids().await.len(), 1);
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let legacy = MockLegacyClient::new(LegacyPrinterInfo {
        type_name: Some("Adventurer 3".into()),
        name: Some("Workshop".into()),
        serial_number: Some("SN-LEGACY-2".into()),
    });
    let factory = MockClientFactory::new().with_legacy("10.0.0.30", legacy);
    let (flow, registry) = flow(factory, false).await;

    let ConnectionResult::Success(details) = flow.connect("10.0.0.30", None).await else {
        panic!("expected success");
    };
    flow.disconnect(&details.context_id).await;
    assert!(registry.get_info(&details.context_id).await.is_none());
    flow.disconnect(&details.context_id).await;
}
