use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use canopy_core::{Device, DeviceId};
use tokio::sync::RwLock;

use super::{DeviceRepository, RepositoryError};

/// In-memory device repository.
/// Used for tests and for running the hub without a database.
#[derive(Clone, Default)]
pub struct InMemoryDeviceRepository {
    devices: Arc<RwLock<HashMap<DeviceId, Device>>>,
}

impl InMemoryDeviceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let devices = devices
            .into_iter()
            .map(|device| (device.id.clone(), device))
            .collect();

        Self {
            devices: Arc::new(RwLock::new(devices)),
        }
    }

    pub async fn get(&self, id: &DeviceId) -> Option<Device> {
        self.devices.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }
}

#[async_trait]
impl DeviceRepository for InMemoryDeviceRepository {
    async fn get_all(&self) -> Result<Vec<Device>, RepositoryError> {
        let devices = self.devices.read().await;
        let mut all: Vec<Device> = devices.values().cloned().collect();
        all.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));

        Ok(all)
    }

    async fn upsert(&self, device: &Device) -> Result<(), RepositoryError> {
        let mut devices = self.devices.write().await;
        devices.insert(device.id.clone(), device.clone());

        Ok(())
    }

    async fn delete(&self, id: &DeviceId) -> Result<bool, RepositoryError> {
        let mut devices = self.devices.write().await;

        Ok(devices.remove(id).is_some())
    }
}
