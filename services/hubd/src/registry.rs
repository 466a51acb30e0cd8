//! In-memory device registries, one per manager.
//!
//! Registries are owned exclusively by their manager and mutated only under
//! the manager's lock; anything published to the bus is a snapshot copy,
//! never a live reference.

use av_core::{DeviceKind, DeviceStatus, LocalDevice, NetworkDevice};
use serde_json::json;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Instant;

/// Local devices, split by category the way scans replace them.
#[derive(Debug, Default)]
pub struct LocalRegistry {
    video: HashMap<String, LocalDevice>,
    audio: HashMap<String, LocalDevice>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        LocalRegistry::default()
    }

    pub fn get(&self, device_id: &str) -> Option<&LocalDevice> {
        self.video
            .get(device_id)
            .or_else(|| self.audio.get(device_id))
    }

    pub fn insert(&mut self, device: LocalDevice) {
        let map = match device.kind {
            DeviceKind::Video => &mut self.video,
            DeviceKind::Audio => &mut self.audio,
        };
        map.insert(device.id.clone(), device);
    }

    pub fn remove(&mut self, device_id: &str) -> Option<LocalDevice> {
        self.video
            .remove(device_id)
            .or_else(|| self.audio.remove(device_id))
    }

    /// Wholesale replacement of one category, as the scan loop does.
    pub fn replace(&mut self, kind: DeviceKind, devices: HashMap<String, LocalDevice>) {
        match kind {
            DeviceKind::Video => self.video = devices,
            DeviceKind::Audio => self.audio = devices,
        }
    }

    pub fn update_status(&mut self, device_id: &str, status: DeviceStatus) -> bool {
        for map in [&mut self.video, &mut self.audio] {
            if let Some(device) = map.get_mut(device_id) {
                device.status = status;
                device.last_check = Some(Instant::now());
                return true;
            }
        }
        false
    }

    pub fn devices(&self, kind: DeviceKind) -> &HashMap<String, LocalDevice> {
        match kind {
            DeviceKind::Video => &self.video,
            DeviceKind::Audio => &self.audio,
        }
    }

    pub fn len(&self) -> usize {
        self.video.len() + self.audio.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `info/local_devices` payload shape.
    pub fn snapshot(&self) -> serde_json::Value {
        let to_map = |m: &HashMap<String, LocalDevice>| {
            m.iter()
                .map(|(id, d)| (id.clone(), serde_json::to_value(d.snapshot()).unwrap_or_default()))
                .collect::<serde_json::Map<_, _>>()
        };
        json!({ "video": to_map(&self.video), "audio": to_map(&self.audio) })
    }
}

/// Network devices, keyed by the `{ip}:{port}` composite id.
#[derive(Debug, Default)]
pub struct NetworkRegistry {
    devices: HashMap<String, NetworkDevice>,
}

impl NetworkRegistry {
    pub fn new() -> Self {
        NetworkRegistry::default()
    }

    pub fn get(&self, device_id: &str) -> Option<&NetworkDevice> {
        self.devices.get(device_id)
    }

    pub fn get_mut(&mut self, device_id: &str) -> Option<&mut NetworkDevice> {
        self.devices.get_mut(device_id)
    }

    pub fn insert(&mut self, device: NetworkDevice) {
        self.devices.insert(device.id.clone(), device);
    }

    pub fn remove(&mut self, device_id: &str) -> Option<NetworkDevice> {
        self.devices.remove(device_id)
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    pub fn contains_endpoint(&self, ip: Ipv4Addr, port: u16) -> bool {
        self.devices
            .contains_key(&NetworkDevice::device_id(ip, port))
    }

    pub fn update_status(&mut self, device_id: &str, status: DeviceStatus) -> bool {
        match self.devices.get_mut(device_id) {
            Some(device) => {
                device.status = status;
                device.last_check = Some(Instant::now());
                true
            }
            None => false,
        }
    }

    pub fn devices(&self) -> &HashMap<String, NetworkDevice> {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// The `info/network_devices` payload shape.
    pub fn snapshot(&self) -> serde_json::Value {
        let map: serde_json::Map<_, _> = self
            .devices
            .iter()
            .map(|(id, d)| (id.clone(), serde_json::to_value(d.snapshot()).unwrap_or_default()))
            .collect();
        json!({ "devices": map })
    }
}
