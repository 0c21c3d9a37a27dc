use std::sync::Arc;

use canopy_core::{AnnounceInfo, DeviceId, FarmId, StateMap, Twin};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::{
    ledger::RegistrationLedger,
    registry::DeviceRepository,
    transport::CommandTransport,
    twin::{SyncError, TwinSynchronizer},
};

/// Keys the firmware adds to every message that are not device state.
const ENVELOPE_KEYS: [&str; 4] = ["ts", "farm_id", "coord_id", "tower_id"];

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("malformed payload on {topic}: {source}")]
    Payload {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("payload on {topic} is not a JSON object")]
    NotAnObject { topic: String },
    #[error("payload on {topic} has an empty {field}")]
    EmptyField { topic: String, field: &'static str },
    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// What a device topic carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Announce { device_id: DeviceId },
    Telemetry { farm_id: FarmId, device_id: DeviceId },
    Reservoir { farm_id: FarmId, device_id: DeviceId },
    Connection { farm_id: FarmId, device_id: DeviceId },
    /// A coordinator relaying a tower's request to join.
    PairingRequest { farm_id: FarmId, device_id: DeviceId },
    /// Traffic that only identifies its sender (OTA progress, serial logs).
    Activity { device_id: DeviceId },
}

impl Route {
    pub fn device_id(&self) -> &DeviceId {
        match self {
            Route::Announce { device_id }
            | Route::Telemetry { device_id, .. }
            | Route::Reservoir { device_id, .. }
            | Route::Connection { device_id, .. }
            | Route::PairingRequest { device_id, .. }
            | Route::Activity { device_id } => device_id,
        }
    }
}

/// Parse a firmware topic.
pub fn route(topic: &str) -> Option<Route> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return None;
    }

    let route = match parts.as_slice() {
        ["coordinator", id, "announce"] => Route::Announce {
            device_id: DeviceId::from(*id),
        },
        ["farm", farm, "coord", id, "telemetry"] => Route::Telemetry {
            farm_id: FarmId::from(*farm),
            device_id: DeviceId::from(*id),
        },
        ["farm", farm, "coord", id, "reservoir", "telemetry"] => Route::Reservoir {
            farm_id: FarmId::from(*farm),
            device_id: DeviceId::from(*id),
        },
        ["farm", farm, "coord", _, "tower", tower, "telemetry"] => Route::Telemetry {
            farm_id: FarmId::from(*farm),
            device_id: DeviceId::from(*tower),
        },
        ["farm", farm, "coord", id, "status", "connection"] => Route::Connection {
            farm_id: FarmId::from(*farm),
            device_id: DeviceId::from(*id),
        },
        ["farm", farm, "coord", id, "pairing", "request"] => Route::PairingRequest {
            farm_id: FarmId::from(*farm),
            device_id: DeviceId::from(*id),
        },
        ["farm", _, "coord", id, "ota", "status"]
        | ["farm", _, "coord", id, "serial"]
        | ["farm", _, "coord", id, "mmwave"] => Route::Activity {
            device_id: DeviceId::from(*id),
        },
        _ => return None,
    };

    Some(route)
}

/// Result of handling one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Announce folded into the registration ledger.
    Announced,
    /// Sender is not registered; counted as unannounced traffic.
    Unregistered,
    /// Reported state merged into the twin.
    Reported(Box<Twin>),
    /// Device lost its transport connection.
    Disconnected(Box<Twin>),
    /// Registered device activity with no state attached.
    Seen,
    /// Topic not recognised.
    Ignored,
}

/// Routes raw transport messages to the ledger or the twin synchronizer.
pub struct Ingestor<R, T> {
    ledger: Arc<RegistrationLedger<R, T>>,
    synchronizer: Arc<TwinSynchronizer<T>>,
}

impl<R, T> Clone for Ingestor<R, T> {
    fn clone(&self) -> Self {
        Self {
            ledger: Arc::clone(&self.ledger),
            synchronizer: Arc::clone(&self.synchronizer),
        }
    }
}

impl<R, T> Ingestor<R, T>
where
    R: DeviceRepository,
    T: CommandTransport,
{
    pub fn new(
        ledger: Arc<RegistrationLedger<R, T>>,
        synchronizer: Arc<TwinSynchronizer<T>>,
    ) -> Self {
        Self {
            ledger,
            synchronizer,
        }
    }

    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub async fn handle(&self, topic: &str, payload: &[u8]) -> Result<Outcome, IngestError> {
        let Some(route) = route(topic) else {
            debug!(topic, "ignoring unroutable topic");
            return Ok(Outcome::Ignored);
        };

        match &route {
            Route::Announce { device_id } => {
                let announce: AnnounceInfo = decode(topic, payload)?;
                self.ledger.handle_announce(device_id, announce).await;
                return Ok(Outcome::Announced);
            }
            Route::PairingRequest { farm_id, .. } => {
                let request: PairingRequest = decode(topic, payload)?;
                let tower_id = DeviceId::new(request.tower_id.trim());
                if tower_id.is_blank() {
                    return Err(IngestError::EmptyField {
                        topic: topic.to_owned(),
                        field: "tower_id",
                    });
                }
                let announce = AnnounceInfo {
                    farm_id_hint: Some(farm_id.as_str().into()),
                    firmware_version: request.fw_version.map(String::into_boxed_str),
                    signal_strength: request.rssi,
                    ..Default::default()
                };
                self.ledger.handle_pairing_request(&tower_id, announce).await;
                return Ok(Outcome::Announced);
            }
            _ => {}
        }

        let device_id = route.device_id().clone();
        if !self.ledger.is_registered(&device_id).await {
            self.ledger
                .process_unannounced_traffic(&device_id, topic, payload)
                .await;
            return Ok(Outcome::Unregistered);
        }

        match self.apply(route, topic, payload).await {
            Err(IngestError::Sync(SyncError::TwinNotFound(_))) => {
                // removed between the registration check and the update
                debug!(
                    device_id = %device_id,
                    topic,
                    "device removed while message was in flight"
                );
                Ok(Outcome::Unregistered)
            }
            outcome => outcome,
        }
    }

    async fn apply(
        &self,
        route: Route,
        topic: &str,
        payload: &[u8],
    ) -> Result<Outcome, IngestError> {
        match route {
            Route::Telemetry { device_id, .. } => {
                let state = state_object(topic, payload)?;
                let twin = self.synchronizer.update_reported(&device_id, &state).await?;
                Ok(Outcome::Reported(Box::new(twin)))
            }
            Route::Reservoir { device_id, .. } => {
                let state = state_object(topic, payload)?;
                let mut report = StateMap::new();
                report.insert("reservoir".to_owned(), Value::Object(state));
                let twin = self.synchronizer.update_reported(&device_id, &report).await?;
                Ok(Outcome::Reported(Box::new(twin)))
            }
            Route::Connection { device_id, .. } => {
                let state = state_object(topic, payload)?;

                if is_connected(&state) {
                    let mut report = StateMap::new();
                    report.insert("connection".to_owned(), Value::Object(state));
                    let twin = self.synchronizer.update_reported(&device_id, &report).await?;
                    Ok(Outcome::Reported(Box::new(twin)))
                } else {
                    let twin = self.synchronizer.mark_disconnected(&device_id).await?;
                    Ok(Outcome::Disconnected(Box::new(twin)))
                }
            }
            Route::Activity { device_id } => {
                debug!(device_id = %device_id, topic, "activity from registered device");
                Ok(Outcome::Seen)
            }
            Route::Announce { .. } | Route::PairingRequest { .. } => Ok(Outcome::Announced),
        }
    }
}

/// Body of `.../pairing/request`, published by a coordinator for a tower.
#[derive(Debug, Deserialize)]
struct PairingRequest {
    tower_id: String,
    #[serde(default)]
    fw_version: Option<String>,
    #[serde(default)]
    rssi: Option<i16>,
}

fn decode<'a, D: Deserialize<'a>>(topic: &str, payload: &'a [u8]) -> Result<D, IngestError> {
    serde_json::from_slice(payload).map_err(|source| IngestError::Payload {
        topic: topic.to_owned(),
        source,
    })
}

/// Decode a telemetry payload and strip the envelope keys.
fn state_object(topic: &str, payload: &[u8]) -> Result<StateMap, IngestError> {
    let value: Value = decode(topic, payload)?;

    let Value::Object(mut state) = value else {
        return Err(IngestError::NotAnObject {
            topic: topic.to_owned(),
        });
    };
    for key in ENVELOPE_KEYS {
        state.remove(key);
    }

    Ok(state)
}

/// The `mqtt_connected` flag wins; otherwise the event name decides.
fn is_connected(state: &StateMap) -> bool {
    if let Some(connected) = state.get("mqtt_connected").and_then(Value::as_bool) {
        return connected;
    }

    match state.get("event").and_then(Value::as_str) {
        Some(event) => !event.contains("disconnect") && !event.contains("lost"),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use canopy_core::{ApprovalRequest, BroadcastEvent, DeviceKind, SyncStatus};
    use serde_json::json;

    use super::*;
    use crate::{
        events::ChangeEventBus,
        registry::InMemoryDeviceRepository,
        transport::MemoryTransport,
        twin::{SyncPolicy, TwinStore},
    };

    fn ingestor() -> (
        Ingestor<InMemoryDeviceRepository, MemoryTransport>,
        MemoryTransport,
    ) {
        let transport = MemoryTransport::new();
        let twins = TwinStore::new();
        let events = ChangeEventBus::new(64);
        let ledger = Arc::new(RegistrationLedger::new(
            InMemoryDeviceRepository::new(),
            transport.clone(),
            twins.clone(),
            events.clone(),
        ));
        let synchronizer = Arc::new(TwinSynchronizer::new(
            twins,
            events,
            transport.clone(),
            SyncPolicy::default(),
        ));

        (Ingestor::new(ledger, synchronizer), transport)
    }

    async fn register(ingestor: &Ingestor<InMemoryDeviceRepository, MemoryTransport>, id: &str) {
        ingestor
            .ledger
            .approve(ApprovalRequest {
                device_id: id.into(),
                farm_id: "farm-1".into(),
                name: id.into(),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    fn bytes(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn routes_firmware_topics() {
        assert_eq!(
            route("coordinator/aa:bb/announce"),
            Some(Route::Announce {
                device_id: DeviceId::from("aa:bb")
            })
        );
        assert_eq!(
            route("farm/f1/coord/c1/tower/t7/telemetry"),
            Some(Route::Telemetry {
                farm_id: FarmId::from("f1"),
                device_id: DeviceId::from("t7")
            })
        );
        assert_eq!(
            route("farm/f1/coord/c1/reservoir/telemetry")
                .unwrap()
                .device_id(),
            &DeviceId::from("c1")
        );
        assert!(matches!(
            route("farm/f1/coord/c1/ota/status"),
            Some(Route::Activity { .. })
        ));
        assert_eq!(
            route("farm/f1/coord/c1/pairing/request"),
            Some(Route::PairingRequest {
                farm_id: FarmId::from("f1"),
                device_id: DeviceId::from("c1")
            })
        );
        assert_eq!(route("farm/f1/coord//telemetry"), None);
        assert_eq!(route("weather/today"), None);
    }

    #[tokio::test]
    async fn telemetry_from_unknown_device_requests_registration() {
        let (ingestor, transport) = ingestor();

        let outcome = ingestor
            .handle("farm/f1/coord/c1/telemetry", b"{\"temp\":20}")
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Unregistered);
        assert_eq!(
            transport
                .broadcasts_of(BroadcastEvent::CoordinatorRegistrationRequest)
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn announce_reaches_ledger() {
        let (ingestor, _) = ingestor();
        let payload = bytes(json!({
            "mac": "aa:bb",
            "fw_version": "2.0.1",
            "farm_id": "unregistered",
        }));

        let outcome = ingestor
            .handle("coordinator/aa:bb/announce", &payload)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Announced);
        let pending = ingestor.ledger.pending(&DeviceId::from("aa:bb")).await.unwrap();
        assert_eq!(pending.firmware_version.as_deref(), Some("2.0.1"));
        assert_eq!(pending.farm_id_hint, None);
    }

    #[tokio::test]
    async fn pairing_request_announces_the_tower() {
        let (ingestor, transport) = ingestor();
        let payload = bytes(json!({
            "tower_id": "tower-9",
            "mac_address": "aa:bb:cc:dd:ee:ff",
            "fw_version": "1.2.0",
            "capabilities": { "dht_sensor": true, "light_sensor": true },
            "rssi": -40,
        }));

        let outcome = ingestor
            .handle("farm/farm-1/coord/c1/pairing/request", &payload)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Announced);
        let pending = ingestor.ledger.pending(&DeviceId::from("tower-9")).await.unwrap();
        assert_eq!(pending.kind, DeviceKind::Tower);
        assert_eq!(pending.firmware_version.as_deref(), Some("1.2.0"));
        assert_eq!(pending.signal_strength, Some(-40));
        assert_eq!(pending.farm_id_hint.as_deref(), Some("farm-1"));
        assert!(ingestor.ledger.pending(&DeviceId::from("c1")).await.is_none());
        assert_eq!(transport.broadcasts().len(), 1);
    }

    #[tokio::test]
    async fn pairing_request_without_tower_id_is_rejected() {
        let (ingestor, _) = ingestor();
        let topic = "farm/farm-1/coord/c1/pairing/request";

        let err = ingestor
            .handle(topic, &bytes(json!({ "fw_version": "1.2.0" })))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Payload { .. }));

        let err = ingestor
            .handle(topic, &bytes(json!({ "tower_id": "  " })))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::EmptyField { field: "tower_id", .. }));
    }

    #[tokio::test]
    async fn telemetry_racing_a_removal_does_not_recreate_the_twin() {
        let (ingestor, _) = ingestor();
        register(&ingestor, "c1").await;
        let id = DeviceId::from("c1");
        // twin already gone while the id still reads as registered
        ingestor.synchronizer.store().remove(&id).await.unwrap();

        let outcome = ingestor
            .handle("farm/farm-1/coord/c1/telemetry", &bytes(json!({ "temp": 20 })))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Unregistered);
        assert!(!ingestor.synchronizer.store().contains(&id));
    }

    #[tokio::test]
    async fn registered_telemetry_updates_twin_without_envelope() {
        let (ingestor, _) = ingestor();
        register(&ingestor, "c1").await;

        let payload = bytes(json!({ "ts": 1, "coord_id": "c1", "air_temp_c": 24.0 }));
        let Outcome::Reported(twin) = ingestor
            .handle("farm/farm-1/coord/c1/telemetry", &payload)
            .await
            .unwrap()
        else {
            panic!("expected reported outcome");
        };

        assert_eq!(twin.reported, json!({ "air_temp_c": 24.0 }).as_object().unwrap().clone());
        assert_eq!(twin.metadata.sync_status, SyncStatus::InSync);
    }

    #[tokio::test]
    async fn reservoir_telemetry_nests_under_reservoir() {
        let (ingestor, _) = ingestor();
        register(&ingestor, "c1").await;

        let payload = bytes(json!({ "ph": 6.1, "ec_ms_cm": 1.4 }));
        let Outcome::Reported(twin) = ingestor
            .handle("farm/farm-1/coord/c1/reservoir/telemetry", &payload)
            .await
            .unwrap()
        else {
            panic!("expected reported outcome");
        };

        assert_eq!(twin.reported["reservoir"]["ph"], json!(6.1));
    }

    #[tokio::test]
    async fn connection_loss_marks_offline() {
        let (ingestor, _) = ingestor();
        register(&ingestor, "c1").await;
        let topic = "farm/farm-1/coord/c1/status/connection";

        ingestor
            .handle(topic, &bytes(json!({ "event": "mqtt_connected", "mqtt_connected": true })))
            .await
            .unwrap();
        let outcome = ingestor
            .handle(topic, &bytes(json!({ "event": "mqtt_disconnected", "mqtt_connected": false })))
            .await
            .unwrap();

        let Outcome::Disconnected(twin) = outcome else {
            panic!("expected disconnected outcome");
        };
        assert!(!twin.metadata.is_connected);
        assert_eq!(twin.metadata.sync_status, SyncStatus::Offline);
    }

    #[tokio::test]
    async fn malformed_payload_is_an_error() {
        let (ingestor, _) = ingestor();
        register(&ingestor, "c1").await;

        let err = ingestor
            .handle("farm/farm-1/coord/c1/telemetry", b"not json")
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Payload { .. }));

        let err = ingestor
            .handle("farm/farm-1/coord/c1/telemetry", b"[1, 2]")
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::NotAnObject { .. }));
    }

    #[tokio::test]
    async fn unknown_topic_is_ignored() {
        let (ingestor, transport) = ingestor();

        let outcome = ingestor.handle("sensors/legacy", b"{}").await.unwrap();

        assert_eq!(outcome, Outcome::Ignored);
        assert!(transport.broadcasts().is_empty());
    }
}
