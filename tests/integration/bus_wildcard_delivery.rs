//! Bus-level delivery properties: wildcard fan-in, ordering, sender
//! exclusion, and `#` boundary lengths.

use av_bus::{Broker, BusClient};
use av_test_utils::BusProbe;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn hash_subscriber_sees_all_manager_events_in_order() {
    let broker = Broker::new();
    let probe = BusProbe::subscribe(&broker, "a", &["event/network_devices/#"]).unwrap();
    let publisher = BusClient::connect(&broker, "manager").unwrap();

    publisher.publish(
        "event/network_devices/added/10.0.0.1:554",
        json!({ "id": "10.0.0.1:554" }),
    );
    publisher.publish(
        "event/network_devices/status/10.0.0.1:554",
        json!({ "device_id": "10.0.0.1:554", "status": "online" }),
    );
    publisher.publish(
        "event/network_devices/removed/10.0.0.1:554",
        json!({ "device_id": "10.0.0.1:554" }),
    );
    // Unrelated topics must never reach the subscriber.
    publisher.publish("event/local_devices/stream_started", json!({}));
    publisher.publish("info/network_devices", json!({}));

    let first = probe.expect_message(Duration::from_secs(1)).await.unwrap();
    let second = probe.expect_message(Duration::from_secs(1)).await.unwrap();
    let third = probe.expect_message(Duration::from_secs(1)).await.unwrap();
    assert_eq!(first.topic, "event/network_devices/added/10.0.0.1:554");
    assert_eq!(second.topic, "event/network_devices/status/10.0.0.1:554");
    assert_eq!(third.topic, "event/network_devices/removed/10.0.0.1:554");
    assert!(probe.expect_silence(Duration::from_millis(200)).await);

    probe.close().await;
    publisher.close().await;
}

#[tokio::test]
async fn hash_matches_one_and_many_trailing_segments() {
    let broker = Broker::new();
    let probe = BusProbe::subscribe(&broker, "a", &["x/#"]).unwrap();
    let publisher = BusClient::connect(&broker, "b").unwrap();

    publisher.publish("x/a", json!(1));
    publisher.publish("x/a/b/c/d/e", json!(2));
    publisher.publish("x", json!(3)); // '#' needs at least one segment

    let first = probe.expect_message(Duration::from_secs(1)).await.unwrap();
    let second = probe.expect_message(Duration::from_secs(1)).await.unwrap();
    assert_eq!(first.topic, "x/a");
    assert_eq!(second.topic, "x/a/b/c/d/e");
    assert!(probe.expect_silence(Duration::from_millis(200)).await);

    probe.close().await;
    publisher.close().await;
}

#[tokio::test]
async fn publisher_never_receives_its_own_messages() {
    let broker = Broker::new();
    let probe = BusProbe::subscribe(&broker, "a", &["loop/#"]).unwrap();

    // The probe publishes on a topic it subscribes to.
    probe.publish("loop/echo", json!(1));
    assert!(probe.expect_silence(Duration::from_millis(200)).await);

    probe.close().await;
}

#[tokio::test]
async fn plus_matches_exactly_one_segment_between_literals() {
    let broker = Broker::new();
    let probe = BusProbe::subscribe(&broker, "a", &["command/+/scan"]).unwrap();
    let publisher = BusClient::connect(&broker, "b").unwrap();

    publisher.publish("command/network_devices/scan", json!(1));
    publisher.publish("command/scan", json!(2));
    publisher.publish("command/network_devices/extra/scan", json!(3));

    let only = probe.expect_message(Duration::from_secs(1)).await.unwrap();
    assert_eq!(only.topic, "command/network_devices/scan");
    assert!(probe.expect_silence(Duration::from_millis(200)).await);

    probe.close().await;
    publisher.close().await;
}
