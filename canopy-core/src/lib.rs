use std::fmt;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

// We use `Box<str>` and `Box<[T]>` for structures that don't need to be
// dynamically sized. This helps us keep allocations compact and avoid
// accidental cloning of large values.
pub type BoxStr = Box<str>;
pub type BoxList<T> = Box<[T]>;

/// Free-form device state. Coordinators and towers report different keys,
/// the synchronization engine only compares and merges them.
pub type StateMap = serde_json::Map<String, Value>;

/// Farm id the coordinator firmware announces before it has been assigned one.
pub const UNREGISTERED_FARM: &str = "unregistered";

/// Unique identifier for a coordinator or tower (usually its MAC address).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub BoxStr);

/// Unique identifier for a farm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FarmId(pub BoxStr);

/// Unique identifier for a twin change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Ulid);

impl DeviceId {
    pub fn new(id: impl Into<BoxStr>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the id is empty or only whitespace.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl FarmId {
    pub fn new(id: impl Into<BoxStr>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for FarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.into())
    }
}

impl From<&str> for FarmId {
    fn from(id: &str) -> Self {
        Self(id.into())
    }
}

/// Device classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Farm gateway bridging ESP-NOW towers to MQTT.
    #[default]
    Coordinator,
    /// Grow tower paired to a coordinator.
    Tower,
}

impl DeviceKind {
    /// First segment of the `<devicekind>/<deviceId>/<suffix>` topic convention.
    pub fn topic_prefix(self) -> &'static str {
        match self {
            DeviceKind::Coordinator => "coordinator",
            DeviceKind::Tower => "tower",
        }
    }

    /// Topic addressed to a single device, e.g. `coordinator/{id}/registered`.
    pub fn topic(self, id: &DeviceId, suffix: &str) -> String {
        format!("{}/{}/{}", self.topic_prefix(), id, suffix)
    }
}

/// A device approved into the fleet and durably persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Stable identity of this device.
    pub id: DeviceId,
    /// Type of the device.
    pub kind: DeviceKind,
    /// Farm this device belongs to.
    pub farm_id: FarmId,
    /// Operator facing name.
    pub name: BoxStr,
    pub description: Option<BoxStr>,
    /// Display color chosen by the operator.
    pub color: Option<BoxStr>,
    pub tags: BoxList<BoxStr>,
    /// Free-form location label (greenhouse, row, ...).
    pub location: Option<BoxStr>,
    /// Approval timestamp.
    pub registered_at: Timestamp,
}

/// Self-description a device sends when it announces itself.
///
/// Field names follow the coordinator announce payload published on
/// `coordinator/{id}/announce`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnounceInfo {
    /// Farm the device believes it belongs to.
    #[serde(default, rename = "farm_id", skip_serializing_if = "Option::is_none")]
    pub farm_id_hint: Option<BoxStr>,
    #[serde(default, rename = "fw_version", skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<BoxStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chip_model: Option<BoxStr>,
    /// WiFi RSSI in dBm.
    #[serde(default, rename = "wifi_rssi", skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<i16>,
    #[serde(default, rename = "ip", skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<BoxStr>,
    #[serde(default, rename = "free_heap", skip_serializing_if = "Option::is_none")]
    pub free_heap_bytes: Option<u64>,
}

/// A device observed on the transport but not yet admitted to the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRegistration {
    pub device_id: DeviceId,
    pub kind: DeviceKind,
    pub farm_id_hint: Option<BoxStr>,
    pub firmware_version: Option<BoxStr>,
    pub chip_model: Option<BoxStr>,
    pub signal_strength: Option<i16>,
    pub ip_address: Option<BoxStr>,
    pub free_heap_bytes: Option<u64>,
    /// Number of messages observed from this device.
    pub message_count: u64,
    pub first_seen_at: Timestamp,
    pub last_seen_at: Timestamp,
    /// Topic of the most recent passive observation.
    pub last_topic: Option<BoxStr>,
}

impl PendingRegistration {
    pub fn new(device_id: DeviceId, kind: DeviceKind, now: Timestamp) -> Self {
        Self {
            device_id,
            kind,
            farm_id_hint: None,
            firmware_version: None,
            chip_model: None,
            signal_strength: None,
            ip_address: None,
            free_heap_bytes: None,
            message_count: 0,
            first_seen_at: now,
            last_seen_at: now,
            last_topic: None,
        }
    }

    /// Count one more message from this device.
    pub fn observe(&mut self, now: Timestamp) {
        self.message_count += 1;
        self.last_seen_at = now;
    }

    /// Fold an announce into this entry. Fields present in the announce
    /// replace what we had, absent ones keep the older value.
    pub fn merge_announce(&mut self, announce: AnnounceInfo) {
        let AnnounceInfo {
            farm_id_hint,
            firmware_version,
            chip_model,
            signal_strength,
            ip_address,
            free_heap_bytes,
        } = announce;

        if let Some(hint) =
            farm_id_hint.filter(|h| !h.trim().is_empty() && &**h != UNREGISTERED_FARM)
        {
            self.farm_id_hint = Some(hint);
        }
        if firmware_version.is_some() {
            self.firmware_version = firmware_version;
        }
        if chip_model.is_some() {
            self.chip_model = chip_model;
        }
        if signal_strength.is_some() {
            self.signal_strength = signal_strength;
        }
        if ip_address.is_some() {
            self.ip_address = ip_address;
        }
        if free_heap_bytes.is_some() {
            self.free_heap_bytes = free_heap_bytes;
        }
    }
}

/// Operator input for admitting a device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalRequest {
    #[serde(alias = "coord_id")]
    pub device_id: String,
    pub farm_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub location: Option<String>,
    /// Defaults to the kind observed while pending, else coordinator.
    #[serde(default)]
    pub kind: Option<DeviceKind>,
}

/// How well a twin's reported state agrees with its desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    InSync,
    /// A desired change has not been confirmed by a report yet.
    Pending,
    /// Connected but the heartbeat is overdue.
    Stale,
    /// Repeated sync attempts failed to converge.
    Conflict,
    Offline,
}

/// Reconciliation bookkeeping kept next to a twin's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwinMetadata {
    /// Incremented on every state mutation, never decreases.
    pub version: u64,
    pub sync_status: SyncStatus,
    pub last_reported_at: Option<Timestamp>,
    pub last_desired_at: Option<Timestamp>,
    pub last_sync_attempt_at: Option<Timestamp>,
    pub sync_retry_count: u32,
    pub is_connected: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl TwinMetadata {
    pub fn new(now: Timestamp) -> Self {
        Self {
            version: 1,
            sync_status: SyncStatus::Offline,
            last_reported_at: None,
            last_desired_at: None,
            last_sync_attempt_at: None,
            sync_retry_count: 0,
            is_connected: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when a desired write has not been confirmed by a fresher report.
    pub fn desired_ahead_of_reported(&self) -> bool {
        match (self.last_desired_at, self.last_reported_at) {
            (Some(desired), Some(reported)) => desired > reported,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Backend-side record pairing a device's reported and desired state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Twin {
    pub device_id: DeviceId,
    pub farm_id: FarmId,
    pub name: BoxStr,
    pub kind: DeviceKind,
    /// Last state reported by the physical device.
    pub reported: StateMap,
    /// State an operator or automation wants the device to converge to.
    pub desired: StateMap,
    pub metadata: TwinMetadata,
}

impl Twin {
    pub fn new(
        device_id: DeviceId,
        farm_id: FarmId,
        name: impl Into<BoxStr>,
        kind: DeviceKind,
        now: Timestamp,
    ) -> Self {
        Self {
            device_id,
            farm_id,
            name: name.into(),
            kind,
            reported: StateMap::new(),
            desired: StateMap::new(),
            metadata: TwinMetadata::new(now),
        }
    }

    /// Desired keys whose reported value differs (or is missing).
    pub fn desired_delta(&self) -> StateMap {
        self.desired
            .iter()
            .filter(|(key, value)| self.reported.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// Apply a JSON merge patch (RFC 7386) to `target`.
///
/// Nested objects merge recursively, `null` removes the key and any other
/// value replaces what was there.
pub fn merge_patch(target: &mut StateMap, patch: &StateMap) {
    for (key, value) in patch {
        match value {
            Value::Null => {
                target.remove(key);
            }
            Value::Object(inner) => {
                let slot = target
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(StateMap::new()));
                if !slot.is_object() {
                    *slot = Value::Object(StateMap::new());
                }
                if let Value::Object(existing) = slot {
                    merge_patch(existing, inner);
                }
            }
            other => {
                target.insert(key.clone(), other.clone());
            }
        }
    }
}

/// Kind of twin-affecting transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    DeviceRegistered,
    DeviceRemoved,
    ReportedUpdated,
    DesiredUpdated,
    SyncStatusChanged,
}

/// Immutable fact emitted on every twin-affecting transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwinChangeEvent {
    pub id: EventId,
    pub change_type: ChangeType,
    pub device_id: DeviceId,
    /// Absent only when a device is removed before its twin was ever loaded.
    pub farm_id: Option<FarmId>,
    /// Twin state right after the transition.
    pub twin: Option<Twin>,
    /// Status before a `SyncStatusChanged` transition.
    pub previous_status: Option<SyncStatus>,
    pub occurred_at: Timestamp,
}

impl TwinChangeEvent {
    pub fn new(change_type: ChangeType, twin: &Twin, occurred_at: Timestamp) -> Self {
        Self {
            id: EventId(Ulid::new()),
            change_type,
            device_id: twin.device_id.clone(),
            farm_id: Some(twin.farm_id.clone()),
            twin: Some(twin.clone()),
            previous_status: None,
            occurred_at,
        }
    }

    pub fn status_changed(twin: &Twin, previous: SyncStatus, occurred_at: Timestamp) -> Self {
        Self {
            previous_status: Some(previous),
            ..Self::new(ChangeType::SyncStatusChanged, twin, occurred_at)
        }
    }

    pub fn device_removed(
        device_id: DeviceId,
        twin: Option<Twin>,
        occurred_at: Timestamp,
    ) -> Self {
        Self {
            id: EventId(Ulid::new()),
            change_type: ChangeType::DeviceRemoved,
            device_id,
            farm_id: twin.as_ref().map(|t| t.farm_id.clone()),
            twin,
            previous_status: None,
            occurred_at,
        }
    }
}

/// Notification types pushed to connected operator clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastEvent {
    CoordinatorRegistrationRequest,
    CoordinatorRegistered,
    CoordinatorRejected,
    CoordinatorRemoved,
}

impl BroadcastEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            BroadcastEvent::CoordinatorRegistrationRequest => "coordinator_registration_request",
            BroadcastEvent::CoordinatorRegistered => "coordinator_registered",
            BroadcastEvent::CoordinatorRejected => "coordinator_rejected",
            BroadcastEvent::CoordinatorRemoved => "coordinator_removed",
        }
    }
}

impl fmt::Display for BroadcastEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn map(value: Value) -> StateMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn announce_deserializes_firmware_payload() {
        let announce: AnnounceInfo = serde_json::from_value(json!({
            "mac": "AA:BB:CC:DD:EE:FF",
            "fw_version": "2.1.0",
            "chip_model": "ESP32-S3",
            "free_heap": 200000,
            "wifi_rssi": -45,
            "ip": "192.168.1.200",
            "farm_id": "unregistered",
        }))
        .unwrap();

        assert_eq!(announce.firmware_version.as_deref(), Some("2.1.0"));
        assert_eq!(announce.signal_strength, Some(-45));
        assert_eq!(announce.free_heap_bytes, Some(200_000));
        assert_eq!(announce.ip_address.as_deref(), Some("192.168.1.200"));
    }

    #[test]
    fn merge_announce_keeps_older_fields_and_ignores_placeholder_farm() {
        let mut pending = PendingRegistration::new(
            DeviceId::from("coord-1"),
            DeviceKind::Coordinator,
            Timestamp::now(),
        );

        pending.merge_announce(AnnounceInfo {
            farm_id_hint: Some("farm-7".into()),
            firmware_version: Some("1.0.0".into()),
            chip_model: Some("ESP32-S3".into()),
            ..Default::default()
        });
        pending.merge_announce(AnnounceInfo {
            farm_id_hint: Some(UNREGISTERED_FARM.into()),
            firmware_version: Some("1.1.0".into()),
            ..Default::default()
        });

        assert_eq!(pending.farm_id_hint.as_deref(), Some("farm-7"));
        assert_eq!(pending.firmware_version.as_deref(), Some("1.1.0"));
        assert_eq!(pending.chip_model.as_deref(), Some("ESP32-S3"));
    }

    #[test]
    fn merge_patch_follows_rfc7386() {
        let mut target = map(json!({
            "pump_on": false,
            "light": { "on": true, "brightness": 80 },
            "mode": "idle",
        }));

        merge_patch(
            &mut target,
            &map(json!({
                "pump_on": true,
                "light": { "brightness": 40 },
                "mode": null,
            })),
        );

        assert_eq!(
            Value::Object(target),
            json!({ "pump_on": true, "light": { "on": true, "brightness": 40 } })
        );
    }

    #[test]
    fn desired_delta_lists_unconfirmed_keys() {
        let mut twin = Twin::new(
            DeviceId::from("tower-1"),
            FarmId::from("farm-1"),
            "Tower 1",
            DeviceKind::Tower,
            Timestamp::now(),
        );
        twin.reported = map(json!({ "pump_on": true, "light_brightness": 10 }));
        twin.desired = map(json!({ "pump_on": true, "light_brightness": 80 }));

        assert_eq!(
            Value::Object(twin.desired_delta()),
            json!({ "light_brightness": 80 })
        );
    }

    #[test]
    fn desired_ahead_of_reported() {
        let now = Timestamp::now();
        let mut metadata = TwinMetadata::new(now);
        assert!(!metadata.desired_ahead_of_reported());

        metadata.last_desired_at = Some(now);
        assert!(metadata.desired_ahead_of_reported());

        metadata.last_reported_at = Some(now);
        assert!(!metadata.desired_ahead_of_reported());
    }

    #[test]
    fn broadcast_event_wire_names() {
        assert_eq!(
            serde_json::to_value(BroadcastEvent::CoordinatorRegistrationRequest).unwrap(),
            json!(BroadcastEvent::CoordinatorRegistrationRequest.as_str())
        );
        assert_eq!(
            DeviceKind::Coordinator.topic(&DeviceId::from("c1"), "registered"),
            "coordinator/c1/registered"
        );
    }
}
