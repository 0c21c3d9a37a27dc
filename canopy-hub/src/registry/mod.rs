pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use canopy_core::{Device, DeviceId};

pub use memory::InMemoryDeviceRepository;
pub use sqlite::SqliteDeviceRepository;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("invalid device document: {0}")]
    Document(#[from] serde_json::Error),
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// Durable store of approved devices, keyed by device id.
#[async_trait]
pub trait DeviceRepository: Send + Sync + 'static {
    /// Every persisted device.
    async fn get_all(&self) -> Result<Vec<Device>, RepositoryError>;

    /// Insert the device or replace the stored copy.
    async fn upsert(&self, device: &Device) -> Result<(), RepositoryError>;

    /// Delete a device. Returns `false` when nothing was stored under `id`.
    async fn delete(&self, id: &DeviceId) -> Result<bool, RepositoryError>;
}
