//! Broker behavior over real TCP: fan-out, reserved topics, unsubscribe,
//! and topic normalization.

mod common;

use common::{Harness, TestClient};
use mqttbytes::QoS;
use serde_json::json;
use std::time::Duration;

fn metadata() -> serde_json::Value {
    json!({"data": {}})
}

#[tokio::test]
async fn subscribe_publish_roundtrip() {
    let harness = Harness::start(metadata()).await;

    let mut subscriber = TestClient::connect(harness.control_addr, "ui-1", None).await;
    subscriber.subscribe(&["armada/1.marsara/#"]).await;

    let mut publisher = TestClient::connect(harness.control_addr, "ui-2", None).await;
    publisher
        .publish("armada/1.marsara/sys/facts", br#"{"board": {}}"#)
        .await;

    let (topic, payload) = subscriber.next_publish().await;
    assert_eq!(topic, "/armada/1.marsara/sys/facts");
    assert_eq!(&payload[..], br#"{"board": {}}"#);
}

#[tokio::test]
async fn wildcard_matching_selects_the_right_subscriptions() {
    let harness = Harness::start(metadata()).await;

    let mut stations = TestClient::connect(harness.control_addr, "a", None).await;
    stations.subscribe(&["armada/2.zenn/stations"]).await;

    let mut single = TestClient::connect(harness.control_addr, "b", None).await;
    single.subscribe(&["armada/1.marsara/+"]).await;

    let mut facts = TestClient::connect(harness.control_addr, "c", None).await;
    facts
        .subscribe(&["armada/+/sys/facts", "armada/+/sys/#"])
        .await;

    let mut publisher = TestClient::connect(harness.control_addr, "d", None).await;
    publisher.publish("armada/1.marsara/sys/facts", b"x").await;

    // The four-segment topic matches both patterns held by this client.
    let (topic, _) = facts.next_publish().await;
    assert_eq!(topic, "/armada/1.marsara/sys/facts");
    let (topic, _) = facts.next_publish().await;
    assert_eq!(topic, "/armada/1.marsara/sys/facts");

    assert!(stations
        .try_next_publish(Duration::from_millis(300))
        .await
        .is_none());
    assert!(single
        .try_next_publish(Duration::from_millis(300))
        .await
        .is_none());
}

#[tokio::test]
async fn reserved_topics_from_the_wire_are_dropped() {
    let harness = Harness::start(metadata()).await;

    let mut subscriber = TestClient::connect(harness.control_addr, "ui-1", None).await;
    subscriber.subscribe(&["t", "u"]).await;

    let mut publisher = TestClient::connect(harness.control_addr, "ui-2", None).await;
    publisher.publish("$SYS/subscribe", b"forged").await;
    publisher.publish("/$SYS/subscribe", b"forged").await;
    publisher.publish("t", b"sentinel").await;

    let (topic, payload) = subscriber.next_publish().await;
    assert_eq!(topic, "/t");
    assert_eq!(&payload[..], b"sentinel");
}

#[tokio::test]
async fn unsubscribe_restores_the_registry() {
    let harness = Harness::start(metadata()).await;

    let mut subscriber = TestClient::connect(harness.control_addr, "ui-1", None).await;
    subscriber.subscribe(&["x/y", "sentinel"]).await;
    subscriber.unsubscribe(&["x/y"]).await;

    let mut publisher = TestClient::connect(harness.control_addr, "ui-2", None).await;
    publisher.publish("x/y", b"gone").await;
    publisher.publish("sentinel", b"still here").await;

    let (topic, payload) = subscriber.next_publish().await;
    assert_eq!(topic, "/sentinel");
    assert_eq!(&payload[..], b"still here");
}

#[tokio::test]
async fn slash_prefix_normalization_applies_to_both_sides() {
    let harness = Harness::start(metadata()).await;

    let mut subscriber = TestClient::connect(harness.control_addr, "ui-1", None).await;
    subscriber.subscribe(&["x/y"]).await;

    let mut publisher = TestClient::connect(harness.control_addr, "ui-2", None).await;
    publisher.publish("/x/y", b"one").await;
    publisher.publish("x/y", b"two").await;

    assert_eq!(subscriber.next_publish().await.0, "/x/y");
    assert_eq!(subscriber.next_publish().await.0, "/x/y");
}

#[tokio::test]
async fn qos_above_zero_subscriptions_evict_the_session() {
    let harness = Harness::start(metadata()).await;

    let mut client = TestClient::connect(harness.control_addr, "ui-1", None).await;
    client.subscribe_with_qos("x/y", QoS::AtLeastOnce).await;
    client.expect_close().await;
}
