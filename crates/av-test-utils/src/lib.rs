// av-test-utils: Shared test doubles for the orchestration suites.
//
// Provides scriptable scanner/monitor collaborators, a bus probe that
// collects messages for assertions, and a stub-executable helper for
// exercising the orchestrator without real transcoders.

use async_trait::async_trait;
use av_bus::{Broker, BusClient, BusError, BusMessage};
use av_core::{
    DeviceKind, DeviceMonitor, DeviceScanner, DeviceStatus, DiscoveredDevice, LocalDevice,
    NetworkDevice,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// MockScanner
// ---------------------------------------------------------------------------

/// A `DeviceScanner` that reports whatever the test scripted.
#[derive(Default)]
pub struct MockScanner {
    video: Mutex<HashMap<String, LocalDevice>>,
    audio: Mutex<HashMap<String, LocalDevice>>,
}

impl MockScanner {
    pub fn new() -> Self {
        MockScanner::default()
    }

    pub fn with_devices(video: Vec<LocalDevice>, audio: Vec<LocalDevice>) -> Self {
        let scanner = MockScanner::new();
        for device in video {
            scanner.add(device);
        }
        for device in audio {
            scanner.add(device);
        }
        scanner
    }

    /// Add (or replace) a device in the scripted result.
    pub fn add(&self, device: LocalDevice) {
        let map = match device.kind {
            DeviceKind::Video => &self.video,
            DeviceKind::Audio => &self.audio,
        };
        map.lock()
            .expect("mock scanner poisoned")
            .insert(device.id.clone(), device);
    }

    /// Drop a device, as if it was unplugged before the next scan.
    pub fn remove(&self, device_id: &str) {
        self.video
            .lock()
            .expect("mock scanner poisoned")
            .remove(device_id);
        self.audio
            .lock()
            .expect("mock scanner poisoned")
            .remove(device_id);
    }
}

#[async_trait]
impl DeviceScanner for MockScanner {
    async fn scan_video_devices(&self) -> HashMap<String, LocalDevice> {
        self.video.lock().expect("mock scanner poisoned").clone()
    }

    async fn scan_audio_devices(&self) -> HashMap<String, LocalDevice> {
        self.audio.lock().expect("mock scanner poisoned").clone()
    }
}

/// An online local webcam for tests.
pub fn sample_video_device(id: &str) -> LocalDevice {
    let mut device = LocalDevice::new(
        format!("video:{id}"),
        format!("Test camera {id}"),
        DeviceKind::Video,
        id,
        av_core::CaptureDriver::V4l2,
    );
    device.status = DeviceStatus::Online;
    device.formats = vec!["YUYV".to_owned()];
    device.resolutions = vec!["640x480".to_owned()];
    device
}

/// An online local microphone for tests.
pub fn sample_audio_device(id: &str) -> LocalDevice {
    let mut device = LocalDevice::new(
        format!("alsa:{id}"),
        format!("Test microphone {id}"),
        DeviceKind::Audio,
        id,
        av_core::CaptureDriver::Alsa,
    );
    device.status = DeviceStatus::Online;
    device
}

// ---------------------------------------------------------------------------
// MockMonitor
// ---------------------------------------------------------------------------

/// A `DeviceMonitor` with scripted statuses and one-shot discovery batches.
pub struct MockMonitor {
    default_status: DeviceStatus,
    statuses: Mutex<HashMap<String, DeviceStatus>>,
    discoveries: Mutex<Vec<DiscoveredDevice>>,
}

impl MockMonitor {
    pub fn new() -> Self {
        MockMonitor {
            default_status: DeviceStatus::Online,
            statuses: Mutex::new(HashMap::new()),
            discoveries: Mutex::new(Vec::new()),
        }
    }

    pub fn with_default_status(default_status: DeviceStatus) -> Self {
        MockMonitor {
            default_status,
            ..MockMonitor::new()
        }
    }

    /// Script the status the next probes of `device_id` will observe.
    pub fn set_status(&self, device_id: &str, status: DeviceStatus) {
        self.statuses
            .lock()
            .expect("mock monitor poisoned")
            .insert(device_id.to_owned(), status);
    }

    /// Queue a discovery record; the next `discover_devices` drains the queue.
    pub fn push_discovery(&self, record: DiscoveredDevice) {
        self.discoveries
            .lock()
            .expect("mock monitor poisoned")
            .push(record);
    }
}

impl Default for MockMonitor {
    fn default() -> Self {
        MockMonitor::new()
    }
}

#[async_trait]
impl DeviceMonitor for MockMonitor {
    async fn check_device_status(&self, device: &NetworkDevice) -> DeviceStatus {
        self.statuses
            .lock()
            .expect("mock monitor poisoned")
            .get(&device.id)
            .copied()
            .unwrap_or(self.default_status)
    }

    async fn discover_devices(&self) -> Vec<DiscoveredDevice> {
        std::mem::take(&mut *self.discoveries.lock().expect("mock monitor poisoned"))
    }
}

// ---------------------------------------------------------------------------
// BusProbe
// ---------------------------------------------------------------------------

/// A bus client that forwards everything it receives into a channel, so
/// tests can both drive commands and assert on the resulting traffic.
pub struct BusProbe {
    client: Arc<BusClient>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<BusMessage>>,
}

impl BusProbe {
    /// Connect as `client_id` and subscribe to every given pattern.
    pub fn subscribe(
        broker: &Arc<Broker>,
        client_id: &str,
        patterns: &[&str],
    ) -> Result<Self, BusError> {
        let client = BusClient::connect(broker, client_id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        for pattern in patterns {
            let tx = tx.clone();
            client.subscribe(
                pattern,
                Box::new(move |msg| {
                    let tx = tx.clone();
                    Box::pin(async move {
                        let _ = tx.send(msg);
                        Ok(())
                    })
                }),
            )?;
        }
        Ok(BusProbe {
            client,
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// Publish as this probe's client id.
    pub fn publish(&self, topic: &str, payload: serde_json::Value) {
        self.client.publish(topic, payload);
    }

    /// Next received message, or `None` after `within` elapses.
    pub async fn expect_message(&self, within: Duration) -> Option<BusMessage> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(within, rx.recv()).await.ok().flatten()
    }

    /// Wait (bounded) for a message on an exact topic, discarding others.
    pub async fn expect_topic(&self, topic: &str, within: Duration) -> Option<BusMessage> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match self.expect_message(remaining).await {
                Some(msg) if msg.topic == topic => return Some(msg),
                Some(_) => {}
                None => return None,
            }
        }
    }

    /// True when nothing arrives for the whole window.
    pub async fn expect_silence(&self, within: Duration) -> bool {
        self.expect_message(within).await.is_none()
    }

    pub async fn close(&self) {
        self.client.close().await;
    }
}

// ---------------------------------------------------------------------------
// Stub executables
// ---------------------------------------------------------------------------

/// Write an executable shell stub that ignores its arguments and sleeps, so
/// orchestrator tests can "launch a transcoder" without ffmpeg installed.
#[cfg(unix)]
pub fn write_stub_executable(dir: &std::path::Path, name: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, "#!/bin/sh\nexec sleep 600\n").expect("write stub script");
    let mut perms = std::fs::metadata(&path).expect("stub metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod stub script");
    path
}
