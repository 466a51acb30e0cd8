//! The supervisor owns the broker, the settings, and both managers, and is
//! the only component that starts or stops them.  Everything is an explicit
//! owned value threaded by reference — no process-global state.

use crate::local_manager::LocalDeviceManager;
use crate::monitor::PortProbeMonitor;
use crate::network_manager::NetworkDeviceManager;
use crate::scanner::PlatformScanner;
use crate::settings::Settings;
use av_bus::{Broker, BusClient, BusError};
use av_core::{DeviceMonitor, DeviceScanner, SystemStatusEvent};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

const CLIENT_ID: &str = "avhub";

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("cannot prepare storage path: {0}")]
    Storage(std::io::Error),
}

pub struct Supervisor {
    broker: Arc<Broker>,
    settings: Settings,
    scanner: Arc<dyn DeviceScanner>,
    monitor: Arc<dyn DeviceMonitor>,
    client: Option<Arc<BusClient>>,
    local: Option<LocalDeviceManager>,
    network: Option<NetworkDeviceManager>,
}

impl Supervisor {
    /// Production wiring: platform scanner and TCP probe monitor.
    pub fn new(settings: Settings) -> Self {
        Supervisor::with_collaborators(
            settings,
            Arc::new(PlatformScanner),
            Arc::new(PortProbeMonitor::new()),
        )
    }

    /// Inject the collaborators; the seam the test harnesses use.
    pub fn with_collaborators(
        settings: Settings,
        scanner: Arc<dyn DeviceScanner>,
        monitor: Arc<dyn DeviceMonitor>,
    ) -> Self {
        Supervisor {
            broker: Broker::new(),
            settings,
            scanner,
            monitor,
            client: None,
            local: None,
            network: None,
        }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Build and start both managers, then announce `system/status started`.
    pub async fn start(&mut self) -> Result<(), SupervisorError> {
        if self.client.is_some() {
            warn!("supervisor already running");
            return Ok(());
        }
        std::fs::create_dir_all(&self.settings.storage_path).map_err(SupervisorError::Storage)?;

        let client = BusClient::connect(&self.broker, CLIENT_ID)?;
        let local = LocalDeviceManager::start(
            &self.broker,
            self.scanner.clone(),
            self.settings.local.clone(),
            self.settings.streaming.clone(),
            &self.settings.storage_path,
        )
        .await?;
        let network = NetworkDeviceManager::start(
            &self.broker,
            self.monitor.clone(),
            self.settings.network.clone(),
            self.settings.streaming.clone(),
            &self.settings.storage_path,
        )
        .await?;

        client.publish(
            "system/status",
            status_payload("started", Some(json!({
                "os": std::env::consts::OS,
                "version": env!("CARGO_PKG_VERSION"),
            }))),
        );
        self.client = Some(client);
        self.local = Some(local);
        self.network = Some(network);
        info!("avhub started");
        Ok(())
    }

    /// Ordered stop: announce, stop managers (streams, scan loops, clients),
    /// close the supervisor's own client.  Idempotent.
    pub async fn stop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        info!("avhub stopping");
        client.publish("system/status", status_payload("stopped", None));

        if let Some(local) = self.local.take() {
            local.stop().await;
        }
        if let Some(network) = self.network.take() {
            network.stop().await;
        }
        client.close().await;
        info!("avhub stopped");
    }
}

fn status_payload(status: &str, info: Option<serde_json::Value>) -> serde_json::Value {
    let event = SystemStatusEvent {
        status: status.to_owned(),
        timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        info,
    };
    serde_json::to_value(event).unwrap_or_default()
}
