//! End-to-end: stream start / restart / stop over the bus, with stub
//! transcoder executables standing in for ffmpeg.
//!
//! Linux-only: the stubs are shell scripts, graceful stop is SIGTERM, and
//! the scripted camera is a v4l2 device.

#![cfg(target_os = "linux")]

use av_test_utils::{BusProbe, MockMonitor, MockScanner, sample_video_device, write_stub_executable};
use hubd::settings::{LocalSettings, NetworkSettings, Settings, StreamingSettings};
use hubd::supervisor::Supervisor;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn test_settings(storage: &std::path::Path, stub_dir: &std::path::Path) -> Settings {
    let transcoder = write_stub_executable(stub_dir, "fake-transcoder.sh");
    Settings {
        storage_path: storage.to_path_buf(),
        log_level: "INFO".to_owned(),
        local: LocalSettings {
            enable_video: true,
            enable_audio: false,
            scan_interval: Duration::from_secs(3600),
            auto_start: false,
        },
        network: NetworkSettings {
            scan_interval: Duration::from_secs(3600),
            discovery_enabled: false,
            discovery_methods: vec![],
        },
        streaming: StreamingSettings {
            transcoder: transcoder.to_string_lossy().into_owned(),
            startup_grace: Duration::from_millis(50),
            ancillary_grace: Duration::from_millis(50),
            stop_timeout: Duration::from_secs(2),
            ..StreamingSettings::default()
        },
    }
}

async fn started(storage: &std::path::Path, stubs: &std::path::Path) -> (Supervisor, BusProbe) {
    let mut supervisor = Supervisor::with_collaborators(
        test_settings(storage, stubs),
        Arc::new(MockScanner::with_devices(vec![sample_video_device("cam0")], vec![])),
        Arc::new(MockMonitor::new()),
    );
    supervisor.start().await.unwrap();
    let probe = BusProbe::subscribe(
        supervisor.broker(),
        "probe",
        &[
            "event/local_devices/#",
            "info/local_devices",
            "local_devices/command/result",
        ],
    )
    .unwrap();
    // Force a scan we can observe: once its snapshot arrives, the registry
    // is guaranteed to hold the scripted camera.
    probe.publish("command/local_devices/scan", json!({}));
    probe
        .expect_topic("info/local_devices", Duration::from_secs(2))
        .await
        .expect("device snapshot after scan");
    (supervisor, probe)
}

#[tokio::test]
async fn restart_returns_same_url_without_second_event() {
    let storage = tempfile::tempdir().unwrap();
    let stubs = tempfile::tempdir().unwrap();
    let (mut supervisor, probe) = started(storage.path(), stubs.path()).await;

    probe.publish(
        "command/local_devices/start_stream",
        json!({ "device_id": "video:cam0", "protocol": "rtsp" }),
    );
    let started_event = probe
        .expect_topic("event/local_devices/stream_started", Duration::from_secs(5))
        .await
        .expect("stream_started event");
    let url = started_event.payload["url"].as_str().unwrap().to_owned();
    assert!(url.starts_with("rtsp://localhost:"));
    assert_eq!(started_event.payload["device_id"], "video:cam0");
    let first_result = probe
        .expect_topic("local_devices/command/result", Duration::from_secs(2))
        .await
        .expect("first start result");
    assert_eq!(first_result.payload["url"], url.as_str());

    // Restarting the same (device, protocol) pair: same URL, no new event.
    probe.publish(
        "command/local_devices/start_stream",
        json!({ "device_id": "video:cam0", "protocol": "rtsp" }),
    );
    let second_result = probe
        .expect_topic("local_devices/command/result", Duration::from_secs(5))
        .await
        .expect("second start result");
    assert_eq!(second_result.payload["success"], true);
    assert_eq!(second_result.payload["url"], url.as_str());
    assert!(
        probe
            .expect_topic("event/local_devices/stream_started", Duration::from_millis(300))
            .await
            .is_none(),
        "restart must not emit a second stream_started"
    );

    probe.close().await;
    supervisor.stop().await;
}

#[tokio::test]
async fn stop_releases_the_stream() {
    let storage = tempfile::tempdir().unwrap();
    let stubs = tempfile::tempdir().unwrap();
    let (mut supervisor, probe) = started(storage.path(), stubs.path()).await;

    probe.publish(
        "command/local_devices/start_stream",
        json!({ "device_id": "video:cam0" }),
    );
    let started_event = probe
        .expect_topic("event/local_devices/stream_started", Duration::from_secs(5))
        .await
        .expect("stream_started event");
    let stream_id = started_event.payload["stream_id"].as_str().unwrap().to_owned();

    probe.publish(
        "command/local_devices/stop_stream",
        json!({ "stream_id": stream_id }),
    );
    let stopped_event = probe
        .expect_topic("event/local_devices/stream_stopped", Duration::from_secs(5))
        .await
        .expect("stream_stopped event");
    assert_eq!(stopped_event.payload["stream_id"], stream_id.as_str());
    assert_eq!(stopped_event.payload["device_id"], "video:cam0");

    // Drain the stop result, then the snapshot must no longer list it.
    probe
        .expect_topic("local_devices/command/result", Duration::from_secs(2))
        .await
        .expect("stop result");
    probe.publish("command/local_devices/get_streams", json!({}));
    let streams = probe
        .expect_topic("local_devices/command/result", Duration::from_secs(2))
        .await
        .expect("get_streams result");
    assert_eq!(streams.payload["command"], "get_streams");
    assert!(
        !streams.payload["streams"]
            .as_object()
            .unwrap()
            .contains_key(&stream_id)
    );

    // Repeated stop: false outcome, still no error.
    probe.publish(
        "command/local_devices/stop_stream",
        json!({ "stream_id": stream_id }),
    );
    let second_stop = probe
        .expect_topic("local_devices/command/result", Duration::from_secs(2))
        .await
        .expect("second stop result");
    assert_eq!(second_stop.payload["success"], false);

    probe.close().await;
    supervisor.stop().await;
}

#[tokio::test]
async fn unknown_device_start_is_an_error_result() {
    let storage = tempfile::tempdir().unwrap();
    let stubs = tempfile::tempdir().unwrap();
    let (mut supervisor, probe) = started(storage.path(), stubs.path()).await;

    probe.publish(
        "command/local_devices/start_stream",
        json!({ "device_id": "video:ghost" }),
    );
    let result = probe
        .expect_topic("local_devices/command/result", Duration::from_secs(2))
        .await
        .expect("error result");
    assert_eq!(result.payload["success"], false);
    assert!(
        result.payload["error"]
            .as_str()
            .unwrap()
            .contains("Device not found")
    );
    assert!(
        probe
            .expect_topic("event/local_devices/stream_started", Duration::from_millis(300))
            .await
            .is_none()
    );

    probe.close().await;
    supervisor.stop().await;
}

#[tokio::test]
async fn supervisor_shutdown_stops_running_streams() {
    let storage = tempfile::tempdir().unwrap();
    let stubs = tempfile::tempdir().unwrap();
    let (mut supervisor, probe) = started(storage.path(), stubs.path()).await;

    probe.publish(
        "command/local_devices/start_stream",
        json!({ "device_id": "video:cam0" }),
    );
    probe
        .expect_topic("event/local_devices/stream_started", Duration::from_secs(5))
        .await
        .expect("stream_started event");

    // Stopping the supervisor tears the stream down and emits the event.
    supervisor.stop().await;
    let stopped = probe
        .expect_topic("event/local_devices/stream_stopped", Duration::from_secs(5))
        .await
        .expect("stream_stopped on shutdown");
    assert_eq!(stopped.payload["device_id"], "video:cam0");
    probe.close().await;
}
