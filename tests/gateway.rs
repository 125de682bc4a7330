//! Device lifecycle end-to-end: connect, OTA round-trips, and teardown.

mod common;

use common::{Harness, TestClient};
use serde_json::{json, Value};
use spire::handlers::device_info::DeviceInfo;
use spire::handlers::ota::{OtaPhase, OtaState};
use std::time::Duration;

const FORMATION: &str = "00000000-0000-0000-0000-000000000001";

fn metadata() -> Value {
    json!({
        "data": {
            "current_system_image": {
                "vendor": "tplink",
                "product": "archer-c7",
                "variant": "lingrush",
                "version": 44,
            }
        }
    })
}

#[tokio::test]
async fn device_connect_produces_up_state_and_device_info() {
    let harness = Harness::start(metadata()).await;

    let mut ui = TestClient::connect(harness.control_addr, "ui", None).await;
    ui.subscribe(&["matriarch/1.marsara/up"]).await;

    let _device =
        TestClient::connect(harness.devices_addr, "1.marsara", Some(FORMATION)).await;

    let (topic, payload) = ui.next_publish().await;
    assert_eq!(topic, "/matriarch/1.marsara/up");
    let msg: Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(msg["state"], "up");
    assert!(msg["timestamp"].is_i64());

    let info = harness
        .store
        .get_device_state::<DeviceInfo>("1.marsara", "device_info")
        .expect("device_info stored");
    assert_eq!(info.device_os, "tplink-archer-c7-lingrush-44");
    assert_eq!(
        harness.store.formation_id("1.marsara").as_deref(),
        Some(FORMATION)
    );
}

#[tokio::test]
async fn connect_initializes_ota_state_for_the_ui() {
    let harness = Harness::start(metadata()).await;

    let mut ui = TestClient::connect(harness.control_addr, "ui", None).await;
    ui.subscribe(&["matriarch/1.marsara/ota/state"]).await;

    let _device =
        TestClient::connect(harness.devices_addr, "1.marsara", Some(FORMATION)).await;

    let (topic, payload) = ui.next_publish().await;
    assert_eq!(topic, "/matriarch/1.marsara/ota/state");
    let msg: Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(msg["state"], "default");
}

/// Wait until the ConnectEvent handlers have initialized the device's OTA
/// state. CONNACK is written before the event is processed, so a client
/// returning from connect() may still be ahead of the handlers.
async fn wait_for_ota_state(harness: &Harness, device: &str) {
    for _ in 0..200 {
        if harness
            .store
            .get_device_state::<OtaState>(device, "ota")
            .is_some()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("ota state was never initialized for {device}");
}

#[tokio::test]
async fn ota_sysupgrade_round_trip() {
    let harness = Harness::start(metadata()).await;

    let mut device =
        TestClient::connect(harness.devices_addr, "1.marsara", Some(FORMATION)).await;
    device.subscribe(&["pylon/1.marsara/ota/sysupgrade"]).await;
    wait_for_ota_state(&harness, "1.marsara").await;

    let mut ui = TestClient::connect(harness.control_addr, "ui", None).await;
    ui.subscribe(&["matriarch/1.marsara/ota/state"]).await;
    // Late subscriber: the persisted default state is re-emitted.
    let (_, payload) = ui.next_publish().await;
    let msg: Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(msg["state"], "default");

    let command = br#"{"url": "http://x", "sha256": "ab63bd"}"#;
    ui.publish("armada/1.marsara/ota/sysupgrade", command).await;

    // The device receives the byte-identical payload.
    let (topic, payload) = device.next_publish().await;
    assert_eq!(topic, "/pylon/1.marsara/ota/sysupgrade");
    assert_eq!(&payload[..], command);

    // The UI sees the downloading state, which is also persisted.
    let (_, payload) = ui.next_publish().await;
    let msg: Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(msg["state"], "downloading");
    let persisted = harness
        .store
        .get_device_state::<OtaState>("1.marsara", "ota")
        .unwrap();
    assert_eq!(persisted.state, OtaPhase::Downloading);

    // The device reports the next phase; it is persisted and forwarded.
    device
        .publish("pylon/1.marsara/ota/state", br#"{"state": "upgrading"}"#)
        .await;
    let (_, payload) = ui.next_publish().await;
    let msg: Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(msg["state"], "upgrading");

    let persisted = harness
        .store
        .get_device_state::<OtaState>("1.marsara", "ota")
        .unwrap();
    assert_eq!(persisted.state, OtaPhase::Upgrading);
}

#[tokio::test]
async fn device_reported_download_progress_is_not_persisted() {
    let harness = Harness::start(metadata()).await;

    let mut device =
        TestClient::connect(harness.devices_addr, "1.marsara", Some(FORMATION)).await;
    wait_for_ota_state(&harness, "1.marsara").await;

    let mut ui = TestClient::connect(harness.control_addr, "ui", None).await;
    ui.subscribe(&["matriarch/1.marsara/ota/state"]).await;
    ui.next_publish().await; // re-emitted default state

    device
        .publish(
            "pylon/1.marsara/ota/state",
            br#"{"state": "downloading", "progress": 30}"#,
        )
        .await;

    // Forwarded to the UI...
    let (_, payload) = ui.next_publish().await;
    let msg: Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(msg["state"], "downloading");
    assert_eq!(msg["progress"], 30);

    // ...but the persisted state still reads default.
    let persisted = harness
        .store
        .get_device_state::<OtaState>("1.marsara", "ota")
        .unwrap();
    assert_eq!(persisted.state, OtaPhase::Default);
}

#[tokio::test]
async fn disconnect_during_download_reports_an_error_and_down_state() {
    let harness = Harness::start(metadata()).await;

    let device =
        TestClient::connect(harness.devices_addr, "1.marsara", Some(FORMATION)).await;
    wait_for_ota_state(&harness, "1.marsara").await;

    let mut ui = TestClient::connect(harness.control_addr, "ui", None).await;
    ui.subscribe(&["matriarch/1.marsara/ota/state", "matriarch/1.marsara/up"])
        .await;
    // Initial deliveries: re-emitted OTA state; the up heartbeat arrived
    // before this subscription, so only the OTA state is guaranteed.
    let (_, payload) = ui.next_publish().await;
    let msg: Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(msg["state"], "default");

    ui.publish(
        "armada/1.marsara/ota/sysupgrade",
        br#"{"url": "http://x", "sha256": "ab63bd"}"#,
    )
    .await;
    let (_, payload) = ui.next_publish().await;
    let msg: Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(msg["state"], "downloading");

    // The device vanishes mid-download.
    device.abort().await;

    let mut saw_error = false;
    let mut saw_down = false;
    while !(saw_error && saw_down) {
        let (topic, payload) = ui.next_publish().await;
        let msg: Value = serde_json::from_slice(&payload).unwrap();
        match topic.as_str() {
            "/matriarch/1.marsara/ota/state" => {
                assert!(!saw_error, "more than one error message");
                assert_eq!(msg["state"], "error");
                assert_eq!(msg["error"], "connection to device lost during download");
                saw_error = true;
            }
            "/matriarch/1.marsara/up" => {
                if msg["state"] == "down" {
                    saw_down = true;
                }
            }
            other => panic!("unexpected topic {other}"),
        }
    }

    // Exactly one error: nothing further arrives on the OTA topic.
    if let Some((topic, payload)) = ui.try_next_publish(Duration::from_millis(300)).await {
        let msg: Value = serde_json::from_slice(&payload).unwrap();
        assert_ne!(
            (topic.as_str(), msg["state"].as_str()),
            ("/matriarch/1.marsara/ota/state", Some("error")),
            "second error message"
        );
    }
}

#[tokio::test]
async fn missing_formation_id_closes_the_connection() {
    let harness = Harness::start(metadata()).await;
    let mut device = TestClient::connect(harness.devices_addr, "1.marsara", Some("")).await;
    device.expect_close().await;
}

#[tokio::test]
async fn sentry_accept_writes_one_audit_row() {
    let harness = Harness::start(metadata()).await;

    let mut device = TestClient::connect(
        harness.devices_addr,
        "1.marsara",
        Some(r#"{"formation_id": "F", "ip_address": "23.23.23.23"}"#),
    )
    .await;

    device
        .publish(
            "pylon/1.marsara/sentry/accept",
            br#"{"ip": "1.2.3.4", "mac": "23:23:23:23:23:23", "timestamp": 1502982990}"#,
        )
        .await;

    let mut rows = Vec::new();
    for _ in 0..50 {
        rows = harness.audit.rows();
        if !rows.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.ip, "1.2.3.4");
    assert_eq!(row.mac, "23:23:23:23:23:23");
    assert_eq!(row.timestamp, 1_502_982_990);
    assert_eq!(row.day, 1_503_014_400);
    assert_eq!(row.pylon_ip, "23.23.23.23");
    assert_eq!(row.pylon_name, "1.marsara");
    assert_eq!(row.action, "logged_in");
}

#[tokio::test]
async fn bare_formation_id_connects_record_an_empty_forwarded_ip() {
    let harness = Harness::start(metadata()).await;

    let mut device =
        TestClient::connect(harness.devices_addr, "1.marsara", Some(FORMATION)).await;

    device
        .publish(
            "pylon/1.marsara/sentry/accept",
            br#"{"ip": "1.2.3.4", "mac": "23:23:23:23:23:23", "timestamp": 1502982990}"#,
        )
        .await;

    let mut rows = Vec::new();
    for _ in 0..50 {
        rows = harness.audit.rows();
        if !rows.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].pylon_ip, "");
    assert_eq!(
        *harness
            .store
            .get_device_state::<String>("1.marsara", "forwarded_ip")
            .expect("forwarded_ip stored on connect"),
        ""
    );
}
