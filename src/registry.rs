use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::client::MoenClient;
use crate::error::Result;
use crate::types::{Device, DeviceStatus};

/// Latest known state of one faucet.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub device: Device,
    /// `None` when the last status fetch failed.
    pub status: Option<DeviceStatus>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Most recent snapshot per device, for hosts that render state rather
/// than call the API themselves.
pub struct DeviceRegistry {
    client: Arc<MoenClient>,
    snapshots: RwLock<HashMap<String, DeviceSnapshot>>,
}

impl DeviceRegistry {
    pub fn new(client: Arc<MoenClient>) -> Self {
        Self {
            client,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Re-list devices and fetch each one's status.
    ///
    /// Failing to list is an error. A failing status fetch only marks that
    /// device's snapshot.
    pub async fn refresh(&self) -> Result<Vec<DeviceSnapshot>> {
        let devices = self.client.list_devices().await?;
        let now = self.client.clock().now();

        let mut snapshots = Vec::with_capacity(devices.len());
        for device in devices {
            let snapshot = match self.client.get_device_status(&device.device_id).await {
                Ok(status) => DeviceSnapshot {
                    device,
                    status: Some(status),
                    error: None,
                    updated_at: now,
                },
                Err(e) => {
                    warn!("Failed to fetch status for {}: {}", device.device_id, e);
                    DeviceSnapshot {
                        device,
                        status: None,
                        error: Some(e.to_string()),
                        updated_at: now,
                    }
                }
            };
            snapshots.push(snapshot);
        }

        let mut current = self.snapshots.write().await;
        *current = snapshots
            .iter()
            .map(|s| (s.device.device_id.clone(), s.clone()))
            .collect();
        debug!("Registry holds {} devices", current.len());

        Ok(snapshots)
    }

    pub async fn snapshot(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.snapshots.read().await.get(device_id).cloned()
    }

    /// All snapshots, ordered by device id.
    pub async fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let mut all: Vec<DeviceSnapshot> = self.snapshots.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.device.device_id.cmp(&b.device.device_id));
        all
    }
}
