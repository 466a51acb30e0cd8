//! Local device manager: periodic enumeration of attached cameras and
//! microphones, command handling, and stream delegation.
//!
//! One scan-loop task re-enumerates the enabled categories and publishes the
//! registry snapshot; commands arrive on the bus client's dispatcher and run
//! sequentially.  Both sides share the registry behind one async mutex.

use crate::orchestrator::{StartOutcome, StreamOrchestrator};
use crate::registry::LocalRegistry;
use crate::settings::{LocalSettings, StreamingSettings};
use av_bus::{Broker, BusClient, BusError, BusMessage, HandlerError};
use av_core::{
    CommandResult, Device, DeviceKind, DeviceScanner, DeviceStatus, LocalDevice, StartStreamRequest,
    StopStreamRequest, StreamProtocol, StreamSnapshot, StreamStartedEvent, StreamStoppedEvent,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CLIENT_ID: &str = "local_devices_manager";
const COMMAND_PATTERN: &str = "command/local_devices/#";
const RESULT_TOPIC: &str = "local_devices/command/result";
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct LocalDeviceManager {
    inner: Arc<Inner>,
    shutdown: watch::Sender<bool>,
    scan_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    client: Arc<BusClient>,
    scanner: Arc<dyn DeviceScanner>,
    registry: Mutex<LocalRegistry>,
    orchestrator: StreamOrchestrator,
    settings: LocalSettings,
}

impl LocalDeviceManager {
    /// Wire up the manager: bus client, command subscription, scan loop.
    pub async fn start(
        broker: &Arc<Broker>,
        scanner: Arc<dyn DeviceScanner>,
        settings: LocalSettings,
        streaming: StreamingSettings,
        storage_path: &Path,
    ) -> Result<Self, BusError> {
        let client = BusClient::connect(broker, CLIENT_ID)?;
        let orchestrator = StreamOrchestrator::new(streaming, storage_path.join("local_streams"));
        let inner = Arc::new(Inner {
            client,
            scanner,
            registry: Mutex::new(LocalRegistry::new()),
            orchestrator,
            settings,
        });

        let handler_inner = inner.clone();
        inner.client.subscribe(
            COMMAND_PATTERN,
            Box::new(move |msg| {
                let inner = handler_inner.clone();
                Box::pin(async move { inner.handle_command(msg).await })
            }),
        )?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let scan_task = tokio::spawn(scan_loop(inner.clone(), shutdown_rx));
        info!(client_id = CLIENT_ID, "local device manager started");
        Ok(LocalDeviceManager {
            inner,
            shutdown,
            scan_task: std::sync::Mutex::new(Some(scan_task)),
        })
    }

    /// Stop the scan loop, tear down every stream, close the bus client.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.scan_task.lock().expect("scan task slot poisoned").take();
        if let Some(handle) = handle
            && tokio::time::timeout(JOIN_TIMEOUT, handle).await.is_err()
        {
            warn!(client_id = CLIENT_ID, "scan loop did not stop within join timeout");
        }
        for snapshot in self.inner.orchestrator.shutdown().await {
            self.inner.publish_stream_stopped(&snapshot);
        }
        self.inner.client.close().await;
        info!(client_id = CLIENT_ID, "local device manager stopped");
    }
}

async fn scan_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    inner.scan_and_publish().await;
    if inner.settings.auto_start {
        inner.auto_start_streams().await;
    }
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            () = tokio::time::sleep(inner.settings.scan_interval) => {
                inner.scan_and_publish().await;
            }
        }
    }
}

impl Inner {
    /// Re-enumerate the enabled categories (wholesale replacement) and
    /// publish the snapshot on `info/local_devices`.
    async fn scan_and_publish(&self) {
        let (video, audio) = tokio::join!(
            async {
                if self.settings.enable_video {
                    Some(self.scanner.scan_video_devices().await)
                } else {
                    None
                }
            },
            async {
                if self.settings.enable_audio {
                    Some(self.scanner.scan_audio_devices().await)
                } else {
                    None
                }
            },
        );

        let snapshot = {
            let mut registry = self.registry.lock().await;
            if let Some(video) = video {
                registry.replace(DeviceKind::Video, video);
            }
            if let Some(audio) = audio {
                registry.replace(DeviceKind::Audio, audio);
            }
            debug!(devices = registry.len(), "local device scan complete");
            registry.snapshot()
        };
        self.client.publish("info/local_devices", snapshot);
    }

    /// Start an RTSP stream for every online video device.  Best-effort.
    async fn auto_start_streams(&self) {
        let devices: Vec<LocalDevice> = {
            let registry = self.registry.lock().await;
            registry
                .devices(DeviceKind::Video)
                .values()
                .filter(|d| d.status == DeviceStatus::Online)
                .cloned()
                .collect()
        };
        for device in devices {
            let device_id = device.id.clone();
            match self
                .orchestrator
                .start_stream(&Device::Local(device), StreamProtocol::Rtsp)
                .await
            {
                Ok(StartOutcome::Started(snapshot)) => self.publish_stream_started(&snapshot),
                Ok(StartOutcome::AlreadyRunning { .. }) => {}
                Err(e) => warn!(device_id = %device_id, error = %e, "auto-start failed"),
            }
        }
    }

    async fn handle_command(&self, msg: BusMessage) -> Result<(), HandlerError> {
        let verb = msg.topic.rsplit('/').next().unwrap_or_default().to_owned();
        match verb.as_str() {
            "scan" => {
                info!("local device scan requested");
                self.scan_and_publish().await;
            }
            "get_devices" => {
                let snapshot = self.registry.lock().await.snapshot();
                self.client.publish("info/local_devices", snapshot);
            }
            "get_streams" => {
                let streams = self.orchestrator.snapshots().await;
                self.publish_result(
                    CommandResult::ok("get_streams")
                        .with("streams", serde_json::to_value(streams)?),
                );
            }
            "start_stream" => self.cmd_start_stream(&msg.payload).await,
            "stop_stream" => self.cmd_stop_stream(&msg.payload).await,
            other => {
                warn!(command = other, "unknown local_devices command");
                self.publish_result(CommandResult::err(other, format!("Unknown command: {other}")));
            }
        }
        Ok(())
    }

    async fn cmd_start_stream(&self, payload: &serde_json::Value) {
        let req: StartStreamRequest = match serde_json::from_value(payload.clone()) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "bad start_stream payload");
                self.publish_result(CommandResult::err("start_stream", format!("invalid payload: {e}")));
                return;
            }
        };
        let protocol = match StreamProtocol::try_from(req.protocol.as_deref().unwrap_or("rtsp")) {
            Ok(protocol) => protocol,
            Err(e) => {
                warn!(device_id = %req.device_id, error = %e, "start_stream rejected");
                self.publish_result(CommandResult::err("start_stream", e));
                return;
            }
        };
        let device = self.registry.lock().await.get(&req.device_id).cloned();
        let Some(device) = device else {
            warn!(device_id = %req.device_id, "start_stream for unknown device");
            self.publish_result(CommandResult::err(
                "start_stream",
                format!("Device not found: {}", req.device_id),
            ));
            return;
        };

        info!(device_id = %req.device_id, %protocol, "starting local stream");
        match self
            .orchestrator
            .start_stream(&Device::Local(device), protocol)
            .await
        {
            Ok(StartOutcome::Started(snapshot)) => {
                self.publish_stream_started(&snapshot);
                self.publish_result(
                    CommandResult::ok("start_stream")
                        .with("stream_id", json!(snapshot.stream_id))
                        .with("device_id", json!(snapshot.device_id))
                        .with("protocol", json!(snapshot.protocol))
                        .with("url", json!(snapshot.url)),
                );
            }
            Ok(StartOutcome::AlreadyRunning { url }) => {
                self.publish_result(
                    CommandResult::ok("start_stream")
                        .with("device_id", json!(req.device_id))
                        .with("protocol", json!(protocol))
                        .with("url", json!(url)),
                );
            }
            Err(e) => {
                warn!(device_id = %req.device_id, error = %e, "start_stream failed");
                self.publish_result(CommandResult::err("start_stream", e.to_string()));
            }
        }
    }

    async fn cmd_stop_stream(&self, payload: &serde_json::Value) {
        let req: StopStreamRequest = match serde_json::from_value(payload.clone()) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "bad stop_stream payload");
                self.publish_result(CommandResult::err("stop_stream", format!("invalid payload: {e}")));
                return;
            }
        };
        if self.inner_stop(&req.stream_id).await {
            self.publish_result(
                CommandResult::ok("stop_stream").with("stream_id", json!(req.stream_id)),
            );
        } else {
            // Unknown stream is a false outcome, not an error.
            let mut result =
                CommandResult::ok("stop_stream").with("stream_id", json!(req.stream_id));
            result.success = false;
            self.publish_result(result);
        }
    }

    async fn inner_stop(&self, stream_id: &str) -> bool {
        match self.orchestrator.stop_stream(stream_id).await {
            Some(snapshot) => {
                self.publish_stream_stopped(&snapshot);
                true
            }
            None => {
                warn!(stream_id, "stop_stream for unknown stream");
                false
            }
        }
    }

    fn publish_stream_started(&self, snapshot: &StreamSnapshot) {
        let event = StreamStartedEvent {
            stream_id: snapshot.stream_id.clone(),
            device_id: snapshot.device_id.clone(),
            kind: snapshot.kind,
            protocol: snapshot.protocol,
            url: snapshot.url.clone(),
        };
        self.client.publish(
            "event/local_devices/stream_started",
            serde_json::to_value(event).unwrap_or_default(),
        );
    }

    fn publish_stream_stopped(&self, snapshot: &StreamSnapshot) {
        let event = StreamStoppedEvent {
            stream_id: snapshot.stream_id.clone(),
            device_id: snapshot.device_id.clone(),
            kind: snapshot.kind,
        };
        self.client.publish(
            "event/local_devices/stream_stopped",
            serde_json::to_value(event).unwrap_or_default(),
        );
    }

    fn publish_result(&self, result: CommandResult) {
        self.client
            .publish(RESULT_TOPIC, serde_json::to_value(result).unwrap_or_default());
    }
}
