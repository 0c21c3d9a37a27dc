use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::{events::ChangeEventBus, twin::SyncPolicy};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub repository: RepositoryConfig,
    pub sync: SyncConfig,
    pub ledger: LedgerConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address for the admin HTTP API to listen on
    pub http_addr: SocketAddr,
}

#[derive(Debug, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RepositoryConfig {
    #[default]
    Memory,
    Sqlite { path: PathBuf },
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Expected interval between device heartbeats
    pub heartbeat_interval_secs: u64,
    /// Failed pushes before a pending change is reported as a conflict
    pub max_retries: u32,
    /// How often twin statuses are re-evaluated
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// How often the registered set is reloaded from the repository
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub capacity: usize,
}

impl Config {
    pub fn load(path: &PathBuf) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl SyncConfig {
    pub fn policy(&self) -> SyncPolicy {
        SyncPolicy::from_heartbeat_secs(self.heartbeat_interval_secs, self.max_retries)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: SyncPolicy::DEFAULT_HEARTBEAT_SECS,
            max_retries: SyncPolicy::DEFAULT_MAX_RETRIES,
            sweep_interval_secs: 10,
        }
    }
}

impl LedgerConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 300,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: ChangeEventBus::DEFAULT_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use jiff::SignedDuration;

    use super::*;

    #[test]
    fn parses_full_config() {
        let config: Config = toml::from_str(
            r#"
            [server]
            http_addr = "127.0.0.1:9090"

            [repository]
            type = "sqlite"
            path = "/var/lib/canopy/devices.db"

            [sync]
            heartbeat_interval_secs = 10
            max_retries = 5
            sweep_interval_secs = 2

            [ledger]
            refresh_interval_secs = 60

            [events]
            capacity = 256
            "#,
        )
        .unwrap();

        assert_eq!(config.server.http_addr.port(), 9090);
        assert!(matches!(config.repository, RepositoryConfig::Sqlite { .. }));
        let policy = config.sync.policy();
        assert_eq!(policy.offline_after, SignedDuration::from_secs(50));
        assert_eq!(policy.stale_after, SignedDuration::from_secs(20));
        assert_eq!(policy.max_retries, 5);
        assert_eq!(config.ledger.refresh_interval(), Duration::from_secs(60));
        assert_eq!(config.events.capacity, 256);
    }

    #[test]
    fn missing_sections_use_defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.http_addr.port(), 8080);
        assert!(matches!(config.repository, RepositoryConfig::Memory));
        assert_eq!(config.sync.policy(), SyncPolicy::default());
        assert_eq!(config.events.capacity, 1024);
    }
}
