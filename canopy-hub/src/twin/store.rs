use std::sync::Arc;

use canopy_core::{Device, DeviceId, DeviceKind, FarmId, Twin};
use dashmap::DashMap;
use jiff::Timestamp;
use tokio::sync::Mutex;

/// Per-device twin records.
///
/// Each twin sits behind its own mutex, so writes to one device are
/// serialized while different devices never contend. The map itself is only
/// touched long enough to clone the entry's `Arc`.
#[derive(Clone, Default)]
pub struct TwinStore {
    twins: Arc<DashMap<DeviceId, Arc<Mutex<Twin>>>>,
}

impl TwinStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing twin, or a fresh one with empty state at version 1.
    pub async fn get_or_create(&self, id: &DeviceId, farm_id: &FarmId) -> Twin {
        let slot = self.slot_or_insert(id, || {
            Twin::new(
                id.clone(),
                farm_id.clone(),
                id.as_str(),
                DeviceKind::Coordinator,
                Timestamp::now(),
            )
        });

        slot.lock().await.clone()
    }

    /// Create the twin for an approved device if it does not exist yet.
    pub async fn provision(&self, device: &Device) -> Twin {
        let slot = self.slot_or_insert(&device.id, || {
            Twin::new(
                device.id.clone(),
                device.farm_id.clone(),
                device.name.clone(),
                device.kind,
                Timestamp::now(),
            )
        });

        slot.lock().await.clone()
    }

    /// Install a fresh twin for a newly approved device, discarding any state
    /// left behind by an earlier registration of the same id.
    pub fn replace(&self, device: &Device) -> Twin {
        let twin = Twin::new(
            device.id.clone(),
            device.farm_id.clone(),
            device.name.clone(),
            device.kind,
            Timestamp::now(),
        );
        self.twins
            .insert(device.id.clone(), Arc::new(Mutex::new(twin.clone())));

        twin
    }

    pub async fn get(&self, id: &DeviceId) -> Option<Twin> {
        let slot = self.slot(id)?;
        let twin = slot.lock().await;
        Some(twin.clone())
    }

    /// Drop a twin, returning its last state.
    pub async fn remove(&self, id: &DeviceId) -> Option<Twin> {
        let (_, slot) = self.twins.remove(id)?;
        let twin = slot.lock().await;
        Some(twin.clone())
    }

    /// Snapshot of every twin, optionally restricted to one farm, ordered by device id.
    pub async fn list(&self, farm_id: Option<&FarmId>) -> Vec<Twin> {
        let mut twins = Vec::new();
        for slot in self.slots() {
            let twin = slot.lock().await;
            if farm_id.is_none_or(|farm| &twin.farm_id == farm) {
                twins.push(twin.clone());
            }
        }
        twins.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        twins
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.twins.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.twins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.twins.is_empty()
    }

    pub(crate) fn slot(&self, id: &DeviceId) -> Option<Arc<Mutex<Twin>>> {
        self.twins.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn slots(&self) -> Vec<Arc<Mutex<Twin>>> {
        self.twins
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn slot_or_insert(&self, id: &DeviceId, create: impl FnOnce() -> Twin) -> Arc<Mutex<Twin>> {
        Arc::clone(
            self.twins
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(create())))
                .value(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, farm: &str) -> Device {
        Device {
            id: DeviceId::from(id),
            kind: DeviceKind::Tower,
            farm_id: FarmId::from(farm),
            name: format!("Tower {id}").into(),
            description: None,
            color: None,
            tags: Box::new([]),
            location: None,
            registered_at: Timestamp::now(),
        }
    }

    #[tokio::test]
    async fn get_or_create_starts_empty_at_version_one() {
        let store = TwinStore::new();
        let id = DeviceId::from("coord-1");

        let twin = store.get_or_create(&id, &FarmId::from("farm-1")).await;

        assert_eq!(twin.metadata.version, 1);
        assert!(twin.reported.is_empty());
        assert!(twin.desired.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn get_or_create_returns_existing_twin() {
        let store = TwinStore::new();
        let id = DeviceId::from("coord-1");

        let first = store.get_or_create(&id, &FarmId::from("farm-1")).await;
        let second = store.get_or_create(&id, &FarmId::from("farm-2")).await;

        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn provision_uses_device_name_and_kind() {
        let store = TwinStore::new();
        let twin = store.provision(&device("t1", "farm-1")).await;

        assert_eq!(&*twin.name, "Tower t1");
        assert_eq!(twin.kind, DeviceKind::Tower);
    }

    #[tokio::test]
    async fn replace_discards_previous_state() {
        let store = TwinStore::new();
        let old = device("t1", "farm-1");
        store.provision(&old).await;
        store
            .slot(&old.id)
            .unwrap()
            .lock()
            .await
            .reported
            .insert("pump_on".into(), serde_json::json!(true));

        let twin = store.replace(&device("t1", "farm-2"));

        assert_eq!(twin.farm_id, FarmId::from("farm-2"));
        assert!(twin.reported.is_empty());
        assert_eq!(store.get(&old.id).await.unwrap(), twin);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn list_filters_by_farm() {
        let store = TwinStore::new();
        store.provision(&device("t2", "farm-1")).await;
        store.provision(&device("t1", "farm-1")).await;
        store.provision(&device("t3", "farm-2")).await;

        let farm_one: Vec<_> = store
            .list(Some(&FarmId::from("farm-1")))
            .await
            .into_iter()
            .map(|t| t.device_id)
            .collect();

        assert_eq!(farm_one, vec![DeviceId::from("t1"), DeviceId::from("t2")]);
        assert_eq!(store.list(None).await.len(), 3);
    }

    #[tokio::test]
    async fn remove_returns_last_state() {
        let store = TwinStore::new();
        store.provision(&device("t1", "farm-1")).await;

        let removed = store.remove(&DeviceId::from("t1")).await.unwrap();
        assert_eq!(removed.device_id, DeviceId::from("t1"));
        assert!(store.is_empty());
        assert!(store.remove(&DeviceId::from("t1")).await.is_none());
    }
}
