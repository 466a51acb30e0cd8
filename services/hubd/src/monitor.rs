//! Reachability probing for network devices.
//!
//! `PortProbeMonitor` is the built-in `DeviceMonitor`: a bounded TCP connect
//! to the device's endpoint.  An accepted connection means Online for every
//! source protocol (RTSP/RTMP cannot be cheaply verified beyond the open
//! port); refusal or probe timeout means Offline.
//!
//! Discovery probes (ONVIF, UPnP, mDNS) are external collaborators; this
//! implementation reports none.  Tests script discovery through
//! `av-test-utils`.

use async_trait::async_trait;
use av_core::{DeviceMonitor, DeviceStatus, DiscoveredDevice, NetworkDevice};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

pub struct PortProbeMonitor {
    probe_timeout: Duration,
}

impl PortProbeMonitor {
    pub fn new() -> Self {
        PortProbeMonitor {
            probe_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_timeout(probe_timeout: Duration) -> Self {
        PortProbeMonitor { probe_timeout }
    }
}

impl Default for PortProbeMonitor {
    fn default() -> Self {
        PortProbeMonitor::new()
    }
}

#[async_trait]
impl DeviceMonitor for PortProbeMonitor {
    async fn check_device_status(&self, device: &NetworkDevice) -> DeviceStatus {
        let addr = SocketAddr::from((device.ip, device.port));
        match tokio::time::timeout(self.probe_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => DeviceStatus::Online,
            Ok(Err(e)) => {
                debug!(device_id = %device.id, error = %e, "device probe refused");
                DeviceStatus::Offline
            }
            Err(_) => {
                debug!(device_id = %device.id, "device probe timed out");
                DeviceStatus::Offline
            }
        }
    }

    async fn discover_devices(&self) -> Vec<DiscoveredDevice> {
        Vec::new()
    }
}
