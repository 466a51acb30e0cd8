//! End-to-end: a scan command produces an `info/local_devices` snapshot.
//!
//! The whole supervisor runs in-process with scripted collaborators; the
//! probe acts as the external client driving the command topic.

use av_test_utils::{BusProbe, MockMonitor, MockScanner, sample_audio_device, sample_video_device};
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
            enable_video: true,
            enable_audio: true,
            // Long interval: only explicit scan commands matter here.
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

#[tokio::test]
async fn scan_command_publishes_video_and_audio_snapshot() {
    let storage = tempfile::tempdir().unwrap();
    let scanner = Arc::new(MockScanner::with_devices(
        vec![sample_video_device("cam0")],
        vec![sample_audio_device("hw:0,0")],
    ));
    let mut supervisor = Supervisor::with_collaborators(
        test_settings(storage.path()),
        scanner,
        Arc::new(MockMonitor::new()),
    );
    supervisor.start().await.unwrap();

    let probe = BusProbe::subscribe(supervisor.broker(), "probe", &["info/local_devices"]).unwrap();
    probe.publish("command/local_devices/scan", json!({}));

    let msg = probe
        .expect_topic("info/local_devices", Duration::from_secs(2))
        .await
        .expect("info/local_devices within 2s");
    let payload = msg.payload.as_object().unwrap();
    assert!(payload["video"].is_object());
    assert!(payload["audio"].is_object());
    assert_eq!(payload["video"]["video:cam0"]["type"], "video");
    assert_eq!(payload["audio"]["alsa:hw:0,0"]["type"], "audio");

    probe.close().await;
    supervisor.stop().await;
}

#[tokio::test]
async fn rescans_track_unplugged_devices() {
    let storage = tempfile::tempdir().unwrap();
    let scanner = Arc::new(MockScanner::with_devices(
        vec![sample_video_device("cam0")],
        vec![],
    ));
    let mut supervisor = Supervisor::with_collaborators(
        test_settings(storage.path()),
        scanner.clone(),
        Arc::new(MockMonitor::new()),
    );
    supervisor.start().await.unwrap();
    let probe = BusProbe::subscribe(supervisor.broker(), "probe", &["info/local_devices"]).unwrap();

    // Unplug the camera, then force a re-scan: the snapshot must not
    // contain it any more (wholesale category replacement).  The probe may
    // still see the startup snapshot first, so wait for one without cam0.
    scanner.remove("video:cam0");
    probe.publish("command/local_devices/scan", json!({}));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let msg = probe
            .expect_topic("info/local_devices", remaining)
            .await
            .expect("info snapshot after rescan");
        if msg.payload["video"].as_object().unwrap().is_empty() {
            break;
        }
    }

    probe.close().await;
    supervisor.stop().await;
}
