//! Durable persistence of network device records.
//!
//! One JSON array at `{storage_path}/network_devices.json`.  Records are the
//! credential-free snapshot type, so nothing sensitive can reach disk.  A
//! record that fails to decode is skipped with an error log; the rest of the
//! file still loads.

use crate::registry::NetworkRegistry;
use av_core::{NetworkDevice, NetworkDeviceSnapshot};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub struct DeviceStore {
    path: PathBuf,
}

impl DeviceStore {
    pub fn new(storage_path: &Path) -> Self {
        DeviceStore {
            path: storage_path.join("network_devices.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist every device in the registry.  Record order is stable (by id)
    /// so the file diffs cleanly.
    pub fn save(&self, registry: &NetworkRegistry) -> Result<(), StoreError> {
        let mut records: Vec<NetworkDeviceSnapshot> =
            registry.devices().values().map(NetworkDevice::snapshot).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let rendered = serde_json::to_string_pretty(&records)?;
        std::fs::write(&self.path, rendered).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        debug!(count = records.len(), path = %self.path.display(), "device state saved");
        Ok(())
    }

    /// Load persisted devices.  A missing file yields an empty list; a
    /// corrupt record is skipped.  Restored devices carry empty credentials.
    pub fn load(&self) -> Vec<NetworkDevice> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "device state unreadable");
                return Vec::new();
            }
        };

        let records: Vec<serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(records) => records,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "device state failed to parse");
                return Vec::new();
            }
        };

        let mut devices = Vec::with_capacity(records.len());
        for record in records {
            match serde_json::from_value::<NetworkDeviceSnapshot>(record) {
                Ok(snapshot) => devices.push(snapshot.into_device()),
                Err(e) => error!(error = %e, "skipping undecodable device record"),
            }
        }
        info!(count = devices.len(), path = %self.path.display(), "device state loaded");
        devices
    }
}
