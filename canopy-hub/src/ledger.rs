use std::collections::{HashMap, HashSet};

use canopy_core::{
    AnnounceInfo, ApprovalRequest, BoxStr, BroadcastEvent, ChangeType, Device, DeviceId,
    DeviceKind, FarmId, PendingRegistration, TwinChangeEvent,
};
use jiff::Timestamp;
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::{
    events::ChangeEventBus,
    registry::{DeviceRepository, RepositoryError},
    transport::CommandTransport,
    twin::TwinStore,
};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{field} must not be empty")]
    Validation { field: &'static str },
    #[error("device {0} is already registered")]
    AlreadyRegistered(DeviceId),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Default)]
struct LedgerState {
    registered: HashSet<DeviceId>,
    rejected: HashSet<DeviceId>,
    pending: HashMap<DeviceId, PendingEntry>,
    /// Monotonic observation counter, breaks `last_seen_at` ties.
    sequence: u64,
}

impl LedgerState {
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

struct PendingEntry {
    registration: PendingRegistration,
    seen_seq: u64,
}

/// Gate-keeper for fleet membership.
///
/// Unknown devices become pending registrations that an operator approves or
/// rejects. Approved devices are persisted through the repository and get a
/// twin; the registered set is a cache of the repository contents.
pub struct RegistrationLedger<R, T> {
    repository: R,
    transport: T,
    twins: TwinStore,
    events: ChangeEventBus,
    state: RwLock<LedgerState>,
    // serializes approve/reject/remove/refresh across the repository call
    admission: Mutex<()>,
}

impl<R, T> RegistrationLedger<R, T>
where
    R: DeviceRepository,
    T: CommandTransport,
{
    pub fn new(repository: R, transport: T, twins: TwinStore, events: ChangeEventBus) -> Self {
        Self {
            repository,
            transport,
            twins,
            events,
            state: RwLock::new(LedgerState::default()),
            admission: Mutex::new(()),
        }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub async fn is_registered(&self, id: &DeviceId) -> bool {
        self.state.read().await.registered.contains(id)
    }

    pub async fn is_rejected(&self, id: &DeviceId) -> bool {
        self.state.read().await.rejected.contains(id)
    }

    pub async fn registered_count(&self) -> usize {
        self.state.read().await.registered.len()
    }

    pub async fn pending(&self, id: &DeviceId) -> Option<PendingRegistration> {
        self.state
            .read()
            .await
            .pending
            .get(id)
            .map(|entry| entry.registration.clone())
    }

    /// Forget a rejection so the device can request registration again.
    pub async fn clear_rejection(&self, id: &DeviceId) -> bool {
        let cleared = self.state.write().await.rejected.remove(id);
        if cleared {
            info!(device_id = %id, "rejection cleared");
        }
        cleared
    }

    /// Record a message from a device that has not announced itself.
    ///
    /// Only the first message of an unknown device triggers a registration
    /// request broadcast; later ones just bump the counters.
    pub async fn process_unannounced_traffic(&self, id: &DeviceId, topic: &str, payload: &[u8]) {
        let created = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let now = Timestamp::now();

            if state.rejected.contains(id) || state.registered.contains(id) {
                return;
            }

            let seq = state.next_sequence();
            match state.pending.get_mut(id) {
                Some(entry) => {
                    entry.registration.observe(now);
                    entry.registration.last_topic = Some(topic.into());
                    entry.seen_seq = seq;
                    None
                }
                None => {
                    let mut registration =
                        PendingRegistration::new(id.clone(), kind_from_topic(topic), now);
                    registration.observe(now);
                    registration.last_topic = Some(topic.into());
                    state.pending.insert(
                        id.clone(),
                        PendingEntry {
                            registration: registration.clone(),
                            seen_seq: seq,
                        },
                    );
                    Some(registration)
                }
            }
        };

        match created {
            Some(registration) => {
                info!(device_id = %id, topic, "unknown device seen, requesting registration");
                self.notify(
                    BroadcastEvent::CoordinatorRegistrationRequest,
                    request_payload(&registration),
                )
                .await;
            }
            None => {
                debug!(
                    device_id = %id,
                    topic,
                    bytes = payload.len(),
                    "traffic from pending device"
                );
            }
        }
    }

    /// Fold a self-announcement into the pending entry and re-broadcast the
    /// registration request with the freshest details.
    pub async fn handle_announce(&self, id: &DeviceId, announce: AnnounceInfo) {
        self.announce(id, None, announce).await;
    }

    /// A coordinator relayed a pairing request on behalf of a tower. Handled
    /// like an announce from the tower itself.
    pub async fn handle_pairing_request(&self, tower_id: &DeviceId, announce: AnnounceInfo) {
        self.announce(tower_id, Some(DeviceKind::Tower), announce).await;
    }

    async fn announce(&self, id: &DeviceId, kind: Option<DeviceKind>, announce: AnnounceInfo) {
        let registration = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;

            if state.registered.contains(id) || state.rejected.contains(id) {
                debug!(device_id = %id, "ignoring announce from known device");
                return;
            }

            let now = Timestamp::now();
            let seq = state.next_sequence();
            let entry = state.pending.entry(id.clone()).or_insert_with(|| PendingEntry {
                registration: PendingRegistration::new(id.clone(), kind.unwrap_or_default(), now),
                seen_seq: seq,
            });
            if let Some(kind) = kind {
                entry.registration.kind = kind;
            }
            entry.registration.merge_announce(announce);
            entry.registration.observe(now);
            entry.seen_seq = seq;
            entry.registration.clone()
        };

        info!(
            device_id = %id,
            kind = ?registration.kind,
            firmware_version = ?registration.firmware_version,
            messages = registration.message_count,
            "device announced"
        );
        self.notify(
            BroadcastEvent::CoordinatorRegistrationRequest,
            request_payload(&registration),
        )
        .await;
    }

    /// Admit a device into the fleet.
    #[instrument(skip(self, request), fields(device_id = %request.device_id))]
    pub async fn approve(&self, request: ApprovalRequest) -> Result<Device, LedgerError> {
        let ApprovalRequest {
            device_id,
            farm_id,
            name,
            description,
            color,
            tags,
            location,
            kind,
        } = request;

        let device_id = required("device_id", &device_id)?;
        let farm_id = required("farm_id", &farm_id)?;
        let name = required("name", &name)?;
        let id = DeviceId::new(device_id);

        let _admission = self.admission.lock().await;

        let pending_kind = {
            let state = self.state.read().await;
            if state.registered.contains(&id) {
                return Err(LedgerError::AlreadyRegistered(id));
            }
            state.pending.get(&id).map(|entry| entry.registration.kind)
        };

        let now = Timestamp::now();
        let device = Device {
            id: id.clone(),
            kind: kind.or(pending_kind).unwrap_or_default(),
            farm_id: FarmId::new(farm_id),
            name: name.into(),
            description: optional(description),
            color: optional(color),
            tags: tags
                .iter()
                .map(|tag| tag.trim())
                .filter(|tag| !tag.is_empty())
                .map(BoxStr::from)
                .collect(),
            location: optional(location),
            registered_at: now,
        };

        self.repository.upsert(&device).await?;

        // the id is not visible as registered yet, so nothing routes
        // telemetry to the twin before its registration event
        let twin = self.twins.replace(&device);
        self.events
            .emit(TwinChangeEvent::new(ChangeType::DeviceRegistered, &twin, now));

        {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            state.registered.insert(id.clone());
            state.pending.remove(&id);
            state.rejected.remove(&id);
        }
        drop(_admission);

        info!(farm_id = %device.farm_id, kind = ?device.kind, "device registered");

        let topic = device.kind.topic(&id, "registered");
        if let Err(e) = self
            .transport
            .publish(&topic, json!({ "farm_id": device.farm_id }))
            .await
        {
            warn!(device_id = %id, error = %e, "failed to send farm assignment");
        }
        self.notify(
            BroadcastEvent::CoordinatorRegistered,
            json!({
                "coord_id": device.id,
                "farm_id": device.farm_id,
                "name": device.name,
                "kind": device.kind,
            }),
        )
        .await;

        Ok(device)
    }

    /// Refuse a device. Its traffic is dropped until the rejection is cleared
    /// or an operator approves it anyway.
    pub async fn reject(&self, id: &DeviceId) {
        {
            let _admission = self.admission.lock().await;
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            state.rejected.insert(id.clone());
            state.pending.remove(id);
        }

        info!(device_id = %id, "device rejected");
        self.notify(BroadcastEvent::CoordinatorRejected, json!({ "coord_id": id }))
            .await;
    }

    /// Remove a registered device. Returns `false` when the repository had
    /// no such device.
    pub async fn remove(&self, id: &DeviceId) -> Result<bool, LedgerError> {
        {
            let _admission = self.admission.lock().await;

            if !self.repository.delete(id).await? {
                debug!(device_id = %id, "remove of unknown device");
                return Ok(false);
            }

            self.state.write().await.registered.remove(id);
            self.drop_twin(id).await;
        }

        info!(device_id = %id, "device removed");
        self.notify(BroadcastEvent::CoordinatorRemoved, json!({ "coord_id": id }))
            .await;

        Ok(true)
    }

    /// Pending registrations, most recently seen first.
    pub async fn list_pending(&self) -> Vec<PendingRegistration> {
        let state = self.state.read().await;
        let mut entries: Vec<&PendingEntry> = state.pending.values().collect();
        entries.sort_by(|a, b| {
            b.registration
                .last_seen_at
                .cmp(&a.registration.last_seen_at)
                .then(b.seen_seq.cmp(&a.seen_seq))
        });

        entries
            .into_iter()
            .map(|entry| entry.registration.clone())
            .collect()
    }

    /// Reload the registered set from the repository. On failure the
    /// current cache is kept. Returns the number of registered devices.
    pub async fn refresh_cache(&self) -> usize {
        let _admission = self.admission.lock().await;

        let devices = match self.repository.get_all().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "failed to refresh registration cache, keeping current");
                return self.state.read().await.registered.len();
            }
        };

        let devices: Vec<Device> = devices
            .into_iter()
            .filter(|device| {
                let blank = device.id.is_blank();
                if blank {
                    warn!("skipping stored device with empty id");
                }
                !blank
            })
            .collect();

        let previous = self.state.read().await.registered.clone();
        let registered: HashSet<DeviceId> =
            devices.iter().map(|device| device.id.clone()).collect();

        for device in &devices {
            self.twins.provision(device).await;
        }
        for id in previous.difference(&registered) {
            info!(device_id = %id, "device no longer stored, dropping twin");
            self.drop_twin(id).await;
        }

        let mut guard = self.state.write().await;
        let state = &mut *guard;
        state.registered = registered;
        let registered = &state.registered;
        state.pending.retain(|id, _| !registered.contains(id));

        debug!(registered = state.registered.len(), "registration cache refreshed");
        state.registered.len()
    }

    async fn drop_twin(&self, id: &DeviceId) {
        let twin = self.twins.remove(id).await;
        self.events
            .emit(TwinChangeEvent::device_removed(id.clone(), twin, Timestamp::now()));
    }

    async fn notify(&self, event: BroadcastEvent, payload: Value) {
        if let Err(e) = self.transport.broadcast(event, payload).await {
            warn!(event = %event, error = %e, "failed to broadcast notification");
        }
    }
}

fn required<'a>(field: &'static str, value: &'a str) -> Result<&'a str, LedgerError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(LedgerError::Validation { field });
    }
    Ok(value)
}

fn optional(value: Option<String>) -> Option<BoxStr> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .map(String::into_boxed_str)
}

/// Towers publish under `.../tower/<id>/...`, everything else is a coordinator.
fn kind_from_topic(topic: &str) -> DeviceKind {
    if topic.starts_with("tower/") || topic.contains("/tower/") {
        DeviceKind::Tower
    } else {
        DeviceKind::Coordinator
    }
}

fn request_payload(registration: &PendingRegistration) -> Value {
    json!({
        "coord_id": registration.device_id,
        "kind": registration.kind,
        "farm_id": registration.farm_id_hint,
        "fw_version": registration.firmware_version,
        "chip_model": registration.chip_model,
        "wifi_rssi": registration.signal_strength,
        "ip": registration.ip_address,
        "free_heap": registration.free_heap_bytes,
        "message_count": registration.message_count,
        "first_seen_at": registration.first_seen_at,
        "last_seen_at": registration.last_seen_at,
        "last_topic": registration.last_topic,
    })
}
