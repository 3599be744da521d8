//! Integration tests for the PIN command layer.

use std::time::Duration;

use hsm_broker_core::hsm::{ErrorCode, HsmError, PinKeys, PinVerification};
use hsm_broker_core::testing::{responses, TestHarnessBuilder};
use hsm_broker_core::BrokerError;

const TPK: &str = "UC4ED597EE0C9697104ED399BE6F8B872";
const PVK: &str = "U7336D50C47128D710DF450BCB2C6461B";

fn keys() -> PinKeys {
    PinKeys::new(TPK, PVK)
}

fn request() -> PinVerification {
    PinVerification::new("4234070000000102", "793AE62DFC8D2426", "3843").unwrap()
}

#[tokio::test]
async fn test_verify_success() {
    let mut harness = TestHarnessBuilder::new().build().await;
    let service = harness.pin_service(keys());

    service.verify(&request()).await.unwrap();

    let calls = harness.device_calls_for_command("DC").await;
    assert_eq!(calls.len(), 1);
    // keys, pin block, format 01, account number, PVKI 1, PVV
    let expected = format!("DC{TPK}{PVK}793AE62DFC8D2426014070000000101{}", "3843");
    assert_eq!(&calls[0].command[..], expected.as_bytes());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_verify_failure_reported_while_core_returns_raw_bytes() {
    let mut harness = TestHarnessBuilder::new()
        .responder(responses::with_error_code("01"))
        .build()
        .await;
    let service = harness.pin_service(keys());

    let err = service.verify(&request()).await.unwrap_err();
    assert!(err.is_pin_verification_failure());

    // The broker itself treats the same response as a success.
    let raw = harness
        .send(request().command(&keys()).unwrap())
        .await
        .unwrap();
    assert_eq!(&raw[..], b"DD01");

    harness.shutdown().await;
}

#[tokio::test]
async fn test_verify_device_errors() {
    for (code, expected) in [
        ("10", ErrorCode::TpkParity),
        ("11", ErrorCode::PvkParity),
        ("27", ErrorCode::PvkNotDoubleLength),
        ("68", ErrorCode::CommandDisabled),
        ("69", ErrorCode::PinBlockFormatDisabled),
    ] {
        let mut harness = TestHarnessBuilder::new()
            .responder(responses::with_error_code(code))
            .build()
            .await;
        let service = harness.pin_service(keys());

        match service.verify(&request()).await {
            Err(HsmError::Device(actual)) => assert_eq!(actual, expected),
            other => panic!("code {code}: unexpected result {other:?}"),
        }

        harness.shutdown().await;
    }
}

#[tokio::test]
async fn test_verify_wrong_response_code() {
    let mut harness = TestHarnessBuilder::new()
        .responder(responses::fixed(b"ND00"))
        .build()
        .await;
    let service = harness.pin_service(keys());

    let err = service.verify(&request()).await.unwrap_err();
    assert!(matches!(err, HsmError::InvalidResponse(_)));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_verify_timeout_passes_through() {
    let mut harness = TestHarnessBuilder::new()
        .request_timeout(Duration::from_millis(100))
        .build()
        .await;
    harness.device().set_silent(true);
    let service = harness.pin_service(keys());

    let err = service.verify(&request()).await.unwrap_err();
    assert!(matches!(err, HsmError::Broker(BrokerError::Timeout)));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_diagnostics() {
    let mut harness = TestHarnessBuilder::new()
        .responder(responses::fixed(b"ND002686041100-0007"))
        .build()
        .await;
    let service = harness.pin_service(keys());

    let body = service.diagnostics().await.unwrap();
    assert_eq!(&body[..], b"2686041100-0007");
    assert_eq!(harness.device_calls_for_command("NC").await.len(), 1);

    harness.shutdown().await;
}
