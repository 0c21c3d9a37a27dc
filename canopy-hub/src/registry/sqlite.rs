use std::path::Path;

use async_trait::async_trait;
use canopy_core::{Device, DeviceId};
use sqlx::{
    Row, SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use tracing::warn;

use super::{DeviceRepository, RepositoryError};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed device repository.
///
/// Each device is stored as a JSON document; `farm_id`, `kind` and
/// `registered_at` are copied into columns for ordering and lookups.
#[derive(Clone)]
pub struct SqliteDeviceRepository {
    pool: SqlitePool,
}

impl SqliteDeviceRepository {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn new_in_memory() -> Result<Self, RepositoryError> {
        // every connection to `sqlite::memory:` opens its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl DeviceRepository for SqliteDeviceRepository {
    async fn get_all(&self) -> Result<Vec<Device>, RepositoryError> {
        let rows = sqlx::query("SELECT id, document FROM devices ORDER BY registered_at, id")
            .fetch_all(&self.pool)
            .await?;

        let mut devices = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let document: String = row.try_get("document")?;

            match serde_json::from_str::<Device>(&document) {
                Ok(device) => devices.push(device),
                Err(e) => {
                    warn!(device_id = %id, error = %e, "skipping undecodable device document");
                }
            }
        }

        Ok(devices)
    }

    async fn upsert(&self, device: &Device) -> Result<(), RepositoryError> {
        let document = serde_json::to_string(device)?;

        sqlx::query(
            r#"
            INSERT INTO devices (id, farm_id, kind, document, registered_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                farm_id = excluded.farm_id,
                kind = excluded.kind,
                document = excluded.document,
                registered_at = excluded.registered_at
            "#,
        )
        .bind(device.id.as_str())
        .bind(device.farm_id.as_str())
        .bind(device.kind.topic_prefix())
        .bind(document)
        .bind(device.registered_at.as_second())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: &DeviceId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM devices WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
