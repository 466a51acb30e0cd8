//! End-to-end: network device CRUD over the bus.
//!
//! 1. add -> added event -> scan -> info snapshot -> remove -> removed event.
//! 2. Validation rejects an out-of-range port: error result, no added event,
//!    registry unchanged.

use av_test_utils::{BusProbe, MockMonitor, MockScanner};
use hubd::settings::{LocalSettings, NetworkSettings, Settings, StreamingSettings};
use hubd::supervisor::Supervisor;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn test_settings(storage: &std::path::Path) -> Settings {
    Settings {
        storage_path: storage.to_path_buf(),
        log_level: "INFO".to_owned(),
        local: LocalSettings {
            enable_video: false,
            enable_audio: false,
            scan_interval: Duration::from_secs(3600),
            auto_start: false,
        },
        network: NetworkSettings {
            scan_interval: Duration::from_secs(3600),
            discovery_enabled: false,
            discovery_methods: vec![],
        },
        streaming: StreamingSettings::default(),
    }
}

async fn started_supervisor(storage: &std::path::Path) -> Supervisor {
    let mut supervisor = Supervisor::with_collaborators(
        test_settings(storage),
        Arc::new(MockScanner::new()),
        Arc::new(MockMonitor::new()),
    );
    supervisor.start().await.unwrap();
    supervisor
}

#[tokio::test]
async fn add_list_remove_round_trip() {
    let storage = tempfile::tempdir().unwrap();
    let mut supervisor = started_supervisor(storage.path()).await;
    let probe = BusProbe::subscribe(
        supervisor.broker(),
        "probe",
        &["event/network_devices/#", "info/network_devices"],
    )
    .unwrap();

    probe.publish(
        "command/network_devices/add",
        json!({ "name": "Cam1", "ip": "192.168.1.10", "port": 554 }),
    );
    let added = probe
        .expect_topic(
            "event/network_devices/added/192.168.1.10:554",
            Duration::from_secs(1),
        )
        .await
        .expect("added event within 1s");
    assert_eq!(added.payload["name"], "Cam1");
    assert_eq!(added.payload["id"], "192.168.1.10:554");
    assert!(added.payload.get("username").is_none());

    probe.publish("command/network_devices/scan", json!({}));
    let info = probe
        .expect_topic("info/network_devices", Duration::from_secs(2))
        .await
        .expect("info snapshot after scan");
    assert!(
        info.payload["devices"]
            .as_object()
            .unwrap()
            .contains_key("192.168.1.10:554")
    );

    // The registry is persisted (without credentials) on mutation.
    let persisted =
        std::fs::read_to_string(storage.path().join("network_devices.json")).unwrap();
    assert!(persisted.contains("192.168.1.10"));
    assert!(persisted.contains("Cam1"));

    probe.publish(
        "command/network_devices/remove",
        json!({ "device_id": "192.168.1.10:554" }),
    );
    let removed = probe
        .expect_topic(
            "event/network_devices/removed/192.168.1.10:554",
            Duration::from_secs(1),
        )
        .await
        .expect("removed event within 1s");
    assert_eq!(removed.payload["device_id"], "192.168.1.10:554");

    probe.close().await;
    supervisor.stop().await;
}

#[tokio::test]
async fn add_rejects_out_of_range_port() {
    let storage = tempfile::tempdir().unwrap();
    let mut supervisor = started_supervisor(storage.path()).await;
    let probe = BusProbe::subscribe(
        supervisor.broker(),
        "probe",
        &["event/network_devices/#", "network_devices/command/result"],
    )
    .unwrap();

    probe.publish(
        "command/network_devices/add",
        json!({ "name": "Bad", "ip": "10.0.0.1", "port": 70000 }),
    );
    let result = probe
        .expect_topic("network_devices/command/result", Duration::from_secs(1))
        .await
        .expect("error result within 1s");
    assert_eq!(result.payload["command"], "add");
    assert_eq!(result.payload["success"], false);
    assert!(
        result.payload["error"]
            .as_str()
            .unwrap()
            .contains("Port must be between 1 and 65535")
    );

    // No added event may follow a rejection.
    assert!(
        probe
            .expect_topic(
                "event/network_devices/added/10.0.0.1:70000",
                Duration::from_millis(300),
            )
            .await
            .is_none()
    );

    probe.close().await;
    supervisor.stop().await;
}

#[tokio::test]
async fn duplicate_endpoint_is_rejected() {
    let storage = tempfile::tempdir().unwrap();
    let mut supervisor = started_supervisor(storage.path()).await;
    let probe = BusProbe::subscribe(
        supervisor.broker(),
        "probe",
        &["network_devices/command/result"],
    )
    .unwrap();

    probe.publish(
        "command/network_devices/add",
        json!({ "name": "First", "ip": "10.0.0.7", "port": 554 }),
    );
    let first = probe
        .expect_topic("network_devices/command/result", Duration::from_secs(1))
        .await
        .expect("first add result");
    assert_eq!(first.payload["success"], true);

    probe.publish(
        "command/network_devices/add",
        json!({ "name": "Second", "ip": "10.0.0.7", "port": 554 }),
    );
    let second = probe
        .expect_topic("network_devices/command/result", Duration::from_secs(1))
        .await
        .expect("second add result");
    assert_eq!(second.payload["success"], false);
    assert!(
        second.payload["error"]
            .as_str()
            .unwrap()
            .contains("already exists")
    );

    probe.close().await;
    supervisor.stop().await;
}

#[tokio::test]
async fn discovery_records_are_ingested_once() {
    let storage = tempfile::tempdir().unwrap();
    let monitor = Arc::new(MockMonitor::new());
    let mut settings = test_settings(storage.path());
    settings.network.discovery_enabled = true;
    let mut supervisor = Supervisor::with_collaborators(
        settings,
        Arc::new(MockScanner::new()),
        monitor.clone(),
    );
    supervisor.start().await.unwrap();
    let probe = BusProbe::subscribe(
        supervisor.broker(),
        "probe",
        &["event/network_devices/#"],
    )
    .unwrap();

    monitor.push_discovery(av_core::DiscoveredDevice {
        ip: "10.0.0.42".to_owned(),
        port: 8554,
        kind: Some("video".to_owned()),
        protocol: Some("rtsp".to_owned()),
        name: Some("Found cam".to_owned()),
        username: None,
        password: None,
        paths: vec!["ch0".to_owned()],
    });
    probe.publish("command/network_devices/scan", json!({}));

    let added = probe
        .expect_topic(
            "event/network_devices/added/10.0.0.42:8554",
            Duration::from_secs(2),
        )
        .await
        .expect("discovered device added");
    assert_eq!(added.payload["name"], "Found cam");
    assert_eq!(
        added.payload["streams"]["10.0.0.42:8554_0"],
        "rtsp://10.0.0.42:8554/ch0"
    );

    // A second scan with the same (already ingested) endpoint adds nothing.
    monitor.push_discovery(av_core::DiscoveredDevice {
        ip: "10.0.0.42".to_owned(),
        port: 8554,
        kind: None,
        protocol: None,
        name: None,
        username: None,
        password: None,
        paths: vec![],
    });
    probe.publish("command/network_devices/scan", json!({}));
    assert!(
        probe
            .expect_topic(
                "event/network_devices/added/10.0.0.42:8554",
                Duration::from_millis(300),
            )
            .await
            .is_none()
    );

    probe.close().await;
    supervisor.stop().await;
}
