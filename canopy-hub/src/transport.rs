use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use canopy_core::BroadcastEvent;
use serde_json::Value;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Publish-only link to devices and connected operator clients.
#[async_trait]
pub trait CommandTransport: Send + Sync + 'static {
    /// Send a JSON command to a device topic (`<devicekind>/<deviceId>/<suffix>`).
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), TransportError>;

    /// Push a notification to every connected operator client.
    async fn broadcast(&self, event: BroadcastEvent, payload: Value)
    -> Result<(), TransportError>;
}

/// A command sent to a device.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedCommand {
    pub topic: String,
    pub payload: Value,
}

/// A notification sent to operator clients.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub event: BroadcastEvent,
    pub payload: Value,
}

/// Transport that records everything it is asked to send.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    published: Arc<Mutex<Vec<PublishedCommand>>>,
    broadcasts: Arc<Mutex<Vec<Notification>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent send fail (nothing is recorded while failing).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<PublishedCommand> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn broadcasts(&self) -> Vec<Notification> {
        self.broadcasts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn broadcasts_of(&self, event: BroadcastEvent) -> Vec<Notification> {
        self.broadcasts()
            .into_iter()
            .filter(|n| n.event == event)
            .collect()
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("memory transport set to fail".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CommandTransport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), TransportError> {
        self.check()?;
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PublishedCommand {
                topic: topic.to_owned(),
                payload,
            });
        Ok(())
    }

    async fn broadcast(
        &self,
        event: BroadcastEvent,
        payload: Value,
    ) -> Result<(), TransportError> {
        self.check()?;
        self.broadcasts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Notification { event, payload });
        Ok(())
    }
}

/// Transport that only logs. Stands in for the MQTT and WebSocket bridges
/// when the hub runs on its own.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingTransport;

#[async_trait]
impl CommandTransport for TracingTransport {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), TransportError> {
        info!(topic, payload = %payload, "publish device command");
        Ok(())
    }

    async fn broadcast(
        &self,
        event: BroadcastEvent,
        payload: Value,
    ) -> Result<(), TransportError> {
        info!(event = %event, payload = %payload, "broadcast notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn memory_transport_records_and_fails_on_demand() {
        let transport = MemoryTransport::new();

        transport
            .publish("coordinator/c1/registered", json!({ "farm_id": "farm-1" }))
            .await
            .unwrap();
        transport
            .broadcast(BroadcastEvent::CoordinatorRegistered, json!({ "coord_id": "c1" }))
            .await
            .unwrap();

        transport.set_failing(true);
        assert!(
            transport
                .broadcast(BroadcastEvent::CoordinatorRemoved, json!({}))
                .await
                .is_err()
        );

        assert_eq!(transport.published().len(), 1);
        assert_eq!(transport.broadcasts().len(), 1);
        assert_eq!(
            transport
                .broadcasts_of(BroadcastEvent::CoordinatorRegistered)
                .len(),
            1
        );
    }
}
