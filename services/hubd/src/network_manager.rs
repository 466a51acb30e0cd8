//! Network device manager: reachability probing, discovery ingestion, CRUD
//! over the bus, persistence, and proxy stream delegation.
//!
//! The registry is the single in-memory truth; every mutation persists to
//! the device store.  Persistence failures are logged and never roll back
//! the in-memory state or fail the originating command.

use crate::orchestrator::{StartOutcome, StreamOrchestrator};
use crate::registry::NetworkRegistry;
use crate::settings::{NetworkSettings, StreamingSettings};
use crate::store::DeviceStore;
use av_bus::{Broker, BusClient, BusError, BusMessage, HandlerError};
use av_core::{
    AddDeviceRequest, CommandResult, Device, DeviceKind, DeviceMonitor, DeviceStatus,
    DeviceStatusEvent, DiscoveredDevice, NetworkDevice, NetworkDeviceSnapshot, RemoveDeviceRequest,
    StartStreamRequest, StopStreamRequest, StreamProtocol, StreamSnapshot, StreamStartedEvent,
    StreamStoppedEvent, TransportProtocol, UpdateDeviceRequest,
};
use futures::future::join_all;
use serde_json::json;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CLIENT_ID: &str = "network_devices_manager";
const COMMAND_PATTERN: &str = "command/network_devices/#";
const RESULT_TOPIC: &str = "network_devices/command/result";
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Failures surfaced as `{success: false, error}` results on the bus.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("{0}")]
    Validation(String),
    #[error("Device not found: {0}")]
    NotFound(String),
    #[error("invalid payload: {0}")]
    Payload(String),
}

pub struct NetworkDeviceManager {
    inner: Arc<Inner>,
    shutdown: watch::Sender<bool>,
    scan_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    client: Arc<BusClient>,
    monitor: Arc<dyn DeviceMonitor>,
    registry: Mutex<NetworkRegistry>,
    store: DeviceStore,
    orchestrator: StreamOrchestrator,
    settings: NetworkSettings,
}

impl NetworkDeviceManager {
    /// Load persisted devices, subscribe to commands, start the scan loop.
    pub async fn start(
        broker: &Arc<Broker>,
        monitor: Arc<dyn DeviceMonitor>,
        settings: NetworkSettings,
        streaming: StreamingSettings,
        storage_path: &Path,
    ) -> Result<Self, BusError> {
        let client = BusClient::connect(broker, CLIENT_ID)?;
        let store = DeviceStore::new(storage_path);
        let mut registry = NetworkRegistry::new();
        for device in store.load() {
            registry.insert(device);
        }

        let orchestrator = StreamOrchestrator::new(streaming, storage_path.join("network_streams"));
        let inner = Arc::new(Inner {
            client,
            monitor,
            registry: Mutex::new(registry),
            store,
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
        info!(client_id = CLIENT_ID, "network device manager started");
        Ok(NetworkDeviceManager {
            inner,
            shutdown,
            scan_task: std::sync::Mutex::new(Some(scan_task)),
        })
    }

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
        info!(client_id = CLIENT_ID, "network device manager stopped");
    }
}

async fn scan_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    inner.scan_cycle().await;
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            () = tokio::time::sleep(inner.settings.scan_interval) => {
                inner.scan_cycle().await;
            }
        }
    }
}

impl Inner {
    /// One scan cycle: re-probe due devices, ingest discovery, persist,
    /// publish the snapshot.
    async fn scan_cycle(&self) {
        // Devices probed longer ago than half the interval are due.
        let due: Vec<NetworkDevice> = {
            let registry = self.registry.lock().await;
            registry
                .devices()
                .values()
                .filter(|d| {
                    d.last_check
                        .is_none_or(|t| t.elapsed() >= self.settings.scan_interval / 2)
                })
                .cloned()
                .collect()
        };

        let probes = due.into_iter().map(|device| {
            let monitor = self.monitor.clone();
            async move {
                let status = monitor.check_device_status(&device).await;
                (device.id, status)
            }
        });
        for (device_id, status) in join_all(probes).await {
            let changed = {
                let mut registry = self.registry.lock().await;
                match registry.get_mut(&device_id) {
                    Some(live) => {
                        live.last_check = Some(Instant::now());
                        if live.status == status {
                            false
                        } else {
                            live.status = status;
                            true
                        }
                    }
                    // Removed while we probed.
                    None => false,
                }
            };
            if changed {
                debug!(device_id = %device_id, %status, "device status changed");
                self.publish_status(&device_id, status);
            }
        }

        if self.settings.discovery_enabled {
            for record in self.monitor.discover_devices().await {
                if let Err(e) = self.ingest_discovered(record).await {
                    warn!(error = %e, "discovered device rejected");
                }
            }
        }

        let snapshot = {
            let registry = self.registry.lock().await;
            self.persist(&registry);
            registry.snapshot()
        };
        self.client.publish("info/network_devices", snapshot);
    }

    /// A discovery record becomes an `add` unless its endpoint is known.
    async fn ingest_discovered(&self, record: DiscoveredDevice) -> Result<(), CommandError> {
        let ip = parse_dotted_quad(&record.ip)?;
        let port =
            u16::try_from(record.port).map_err(|_| CommandError::Validation(format!(
                "Port must be between 1 and 65535, got {}",
                record.port
            )))?;
        if self.registry.lock().await.contains_endpoint(ip, port) {
            return Ok(());
        }
        let request = AddDeviceRequest {
            name: record.name.unwrap_or_else(|| format!("Device {}", record.ip)),
            ip: record.ip,
            port: Some(u64::from(port)),
            kind: record.kind,
            protocol: record.protocol,
            username: record.username,
            password: record.password,
            paths: record.paths,
        };
        let snapshot = self.add_device(request).await?;
        info!(device_id = %snapshot.id, "device added via discovery");
        Ok(())
    }

    async fn handle_command(&self, msg: BusMessage) -> Result<(), HandlerError> {
        let verb = msg.topic.rsplit('/').next().unwrap_or_default().to_owned();
        match verb.as_str() {
            "add" => self.cmd_add(&msg.payload).await,
            "remove" => self.cmd_remove(&msg.payload).await,
            "update" => self.cmd_update(&msg.payload).await,
            "scan" => {
                info!("network device scan requested");
                self.scan_cycle().await;
                self.publish_result(CommandResult::ok("scan"));
            }
            "get_devices" => {
                let snapshot = self.registry.lock().await.snapshot();
                self.client.publish("info/network_devices", snapshot);
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
                warn!(command = other, "unknown network_devices command");
                self.publish_result(CommandResult::err(other, format!("Unknown command: {other}")));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // CRUD
    // -----------------------------------------------------------------------

    async fn cmd_add(&self, payload: &serde_json::Value) {
        let request: AddDeviceRequest = match serde_json::from_value(payload.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "bad add payload");
                self.publish_result(CommandResult::err("add", format!("invalid payload: {e}")));
                return;
            }
        };
        match self.add_device(request).await {
            Ok(snapshot) => {
                info!(device_id = %snapshot.id, name = %snapshot.name, "network device added");
                self.publish_result(
                    CommandResult::ok("add").with("device_id", json!(snapshot.id)),
                );
            }
            Err(e) => {
                warn!(error = %e, "add rejected");
                self.publish_result(CommandResult::err("add", e.to_string()));
            }
        }
    }

    /// Validate, probe, insert, persist, announce.  The registry is only
    /// touched after every check has passed, so a rejection leaves it
    /// unchanged.
    async fn add_device(
        &self,
        request: AddDeviceRequest,
    ) -> Result<NetworkDeviceSnapshot, CommandError> {
        let name = request.name.trim().to_owned();
        if name.is_empty() {
            return Err(CommandError::Validation("Name is required".to_owned()));
        }
        let ip = parse_dotted_quad(&request.ip)?;
        let port = match request.port {
            None => 554,
            Some(p) if (1..=65_535).contains(&p) => p as u16,
            Some(p) => {
                return Err(CommandError::Validation(format!(
                    "Port must be between 1 and 65535, got {p}"
                )));
            }
        };
        let kind = match request.kind.as_deref() {
            None => DeviceKind::Video,
            Some(raw) => DeviceKind::try_from(raw).map_err(CommandError::Validation)?,
        };
        let protocol = match request.protocol.as_deref() {
            None => TransportProtocol::Rtsp,
            Some(raw) => TransportProtocol::try_from(raw).map_err(CommandError::Validation)?,
        };

        let device_id = NetworkDevice::device_id(ip, port);
        if self.registry.lock().await.contains(&device_id) {
            return Err(CommandError::Validation(format!(
                "Device {device_id} already exists"
            )));
        }

        let mut device = NetworkDevice::new(name, kind, ip, port, protocol);
        device.username = request.username.unwrap_or_default();
        device.password = request.password.unwrap_or_default();
        for (i, path) in request.paths.iter().enumerate() {
            device.streams.insert(
                format!("{device_id}_{i}"),
                format!("{}/{}", device.base_url(), path.trim_start_matches('/')),
            );
        }

        // Initial reachability probe (bounded by the monitor).
        device.status = self.monitor.check_device_status(&device).await;
        device.last_check = Some(Instant::now());

        let snapshot = device.snapshot();
        {
            let mut registry = self.registry.lock().await;
            // The probe ran unlocked; a concurrent add may have won.
            if registry.contains(&device_id) {
                return Err(CommandError::Validation(format!(
                    "Device {device_id} already exists"
                )));
            }
            registry.insert(device);
            self.persist(&registry);
        }
        self.client.publish(
            &format!("event/network_devices/added/{device_id}"),
            serde_json::to_value(&snapshot).unwrap_or_default(),
        );
        Ok(snapshot)
    }

    async fn cmd_remove(&self, payload: &serde_json::Value) {
        let request: RemoveDeviceRequest = match serde_json::from_value(payload.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "bad remove payload");
                self.publish_result(CommandResult::err("remove", format!("invalid payload: {e}")));
                return;
            }
        };
        let removed = {
            let mut registry = self.registry.lock().await;
            let removed = registry.remove(&request.device_id);
            if removed.is_some() {
                self.persist(&registry);
            }
            removed
        };
        if removed.is_none() {
            warn!(device_id = %request.device_id, "remove for unknown device");
            self.publish_result(CommandResult::err(
                "remove",
                CommandError::NotFound(request.device_id).to_string(),
            ));
            return;
        }
        info!(device_id = %request.device_id, "network device removed");
        self.client.publish(
            &format!("event/network_devices/removed/{}", request.device_id),
            json!({ "device_id": request.device_id }),
        );
        self.publish_result(
            CommandResult::ok("remove").with("device_id", json!(request.device_id)),
        );
    }

    async fn cmd_update(&self, payload: &serde_json::Value) {
        let request: UpdateDeviceRequest = match serde_json::from_value(payload.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "bad update payload");
                self.publish_result(CommandResult::err("update", format!("invalid payload: {e}")));
                return;
            }
        };
        let device_id = request.device_id.clone();
        match self.update_device(request).await {
            Ok(snapshot) => {
                info!(device_id = %device_id, "network device updated");
                self.client.publish(
                    &format!("event/network_devices/updated/{device_id}"),
                    serde_json::to_value(&snapshot).unwrap_or_default(),
                );
                self.publish_result(
                    CommandResult::ok("update").with("device_id", json!(device_id)),
                );
            }
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "update rejected");
                self.publish_result(CommandResult::err("update", e.to_string()));
            }
        }
    }

    async fn update_device(
        &self,
        request: UpdateDeviceRequest,
    ) -> Result<NetworkDeviceSnapshot, CommandError> {
        if request.ip.is_some() || request.port.is_some() {
            return Err(CommandError::Validation(
                "ip and port are the device identity and cannot be updated".to_owned(),
            ));
        }
        // Validate before taking the lock so a rejection mutates nothing.
        let kind = request
            .kind
            .as_deref()
            .map(DeviceKind::try_from)
            .transpose()
            .map_err(CommandError::Validation)?;
        let protocol = request
            .protocol
            .as_deref()
            .map(TransportProtocol::try_from)
            .transpose()
            .map_err(CommandError::Validation)?;
        if let Some(name) = request.name.as_deref()
            && name.trim().is_empty()
        {
            return Err(CommandError::Validation("Name is required".to_owned()));
        }

        let mut registry = self.registry.lock().await;
        let device = registry
            .get_mut(&request.device_id)
            .ok_or_else(|| CommandError::NotFound(request.device_id.clone()))?;

        if let Some(name) = request.name {
            device.name = name.trim().to_owned();
        }
        if let Some(kind) = kind {
            device.kind = kind;
        }
        if let Some(protocol) = protocol {
            device.protocol = protocol;
        }
        if let Some(username) = request.username {
            device.username = username;
        }
        if let Some(password) = request.password {
            device.password = password;
        }
        if let Some(paths) = request.paths {
            device.streams.clear();
            let base = device.base_url();
            let id = device.id.clone();
            for (i, path) in paths.iter().enumerate() {
                device
                    .streams
                    .insert(format!("{id}_{i}"), format!("{base}/{}", path.trim_start_matches('/')));
            }
        }
        let snapshot = device.snapshot();
        self.persist(&registry);
        Ok(snapshot)
    }

    // -----------------------------------------------------------------------
    // Streams (proxying a network device through the orchestrator)
    // -----------------------------------------------------------------------

    async fn cmd_start_stream(&self, payload: &serde_json::Value) {
        let request: StartStreamRequest = match serde_json::from_value(payload.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "bad start_stream payload");
                self.publish_result(CommandResult::err("start_stream", format!("invalid payload: {e}")));
                return;
            }
        };
        let protocol = match StreamProtocol::try_from(request.protocol.as_deref().unwrap_or("rtsp"))
        {
            Ok(protocol) => protocol,
            Err(e) => {
                warn!(device_id = %request.device_id, error = %e, "start_stream rejected");
                self.publish_result(CommandResult::err("start_stream", e));
                return;
            }
        };
        let device = self.registry.lock().await.get(&request.device_id).cloned();
        let Some(device) = device else {
            warn!(device_id = %request.device_id, "start_stream for unknown device");
            self.publish_result(CommandResult::err(
                "start_stream",
                CommandError::NotFound(request.device_id).to_string(),
            ));
            return;
        };

        info!(device_id = %request.device_id, %protocol, "starting network proxy stream");
        match self
            .orchestrator
            .start_stream(&Device::Network(device), protocol)
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
                        .with("device_id", json!(request.device_id))
                        .with("protocol", json!(protocol))
                        .with("url", json!(url)),
                );
            }
            Err(e) => {
                warn!(device_id = %request.device_id, error = %e, "start_stream failed");
                self.publish_result(CommandResult::err("start_stream", e.to_string()));
            }
        }
    }

    async fn cmd_stop_stream(&self, payload: &serde_json::Value) {
        let request: StopStreamRequest = match serde_json::from_value(payload.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "bad stop_stream payload");
                self.publish_result(CommandResult::err("stop_stream", format!("invalid payload: {e}")));
                return;
            }
        };
        match self.orchestrator.stop_stream(&request.stream_id).await {
            Some(snapshot) => {
                self.publish_stream_stopped(&snapshot);
                self.publish_result(
                    CommandResult::ok("stop_stream").with("stream_id", json!(request.stream_id)),
                );
            }
            None => {
                warn!(stream_id = %request.stream_id, "stop_stream for unknown stream");
                let mut result =
                    CommandResult::ok("stop_stream").with("stream_id", json!(request.stream_id));
                result.success = false;
                self.publish_result(result);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Publication helpers
    // -----------------------------------------------------------------------

    fn publish_status(&self, device_id: &str, status: DeviceStatus) {
        let event = DeviceStatusEvent {
            device_id: device_id.to_owned(),
            status,
        };
        self.client.publish(
            &format!("event/network_devices/status/{device_id}"),
            serde_json::to_value(event).unwrap_or_default(),
        );
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
            "event/network_devices/stream_started",
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
            "event/network_devices/stream_stopped",
            serde_json::to_value(event).unwrap_or_default(),
        );
    }

    fn publish_result(&self, result: CommandResult) {
        self.client
            .publish(RESULT_TOPIC, serde_json::to_value(result).unwrap_or_default());
    }

    /// Persistence failures never fail the command; memory stays authoritative.
    fn persist(&self, registry: &NetworkRegistry) {
        if let Err(e) = self.store.save(registry) {
            error!(error = %e, "persisting network devices failed");
        }
    }
}

/// Strict dotted-quad validation: four all-digit octets, each 0..=255.
fn parse_dotted_quad(raw: &str) -> Result<Ipv4Addr, CommandError> {
    let octets: Vec<&str> = raw.split('.').collect();
    if octets.len() != 4
        || octets
            .iter()
            .any(|o| o.is_empty() || !o.chars().all(|c| c.is_ascii_digit()))
    {
        return Err(CommandError::Validation(format!(
            "Invalid IP address format: '{raw}'"
        )));
    }
    let mut parts = [0u8; 4];
    for (slot, octet) in parts.iter_mut().zip(&octets) {
        *slot = octet.parse::<u8>().map_err(|_| {
            CommandError::Validation(
                "Invalid IP address: octets must be between 0 and 255".to_owned(),
            )
        })?;
    }
    Ok(Ipv4Addr::from(parts))
}
