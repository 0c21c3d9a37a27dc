use canopy_core::{ChangeType, DeviceId, StateMap, Twin, TwinChangeEvent, merge_patch};
use jiff::Timestamp;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{
    status::{self, SyncPolicy},
    store::TwinStore,
};
use crate::{events::ChangeEventBus, transport::CommandTransport};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no twin for device {0}")]
    TwinNotFound(DeviceId),
    #[error("twin version conflict: expected {expected}, current {current}")]
    VersionConflict { expected: u64, current: u64 },
    #[error("state patch must be a JSON object")]
    InvalidPatch,
}

/// Interpret a JSON value as a state patch.
pub fn patch_from_value(value: Value) -> Result<StateMap, SyncError> {
    match value {
        Value::Object(patch) => Ok(patch),
        _ => Err(SyncError::InvalidPatch),
    }
}

/// Applies reported/desired changes to twins, keeps their sync status
/// current and emits a change event for every transition.
pub struct TwinSynchronizer<T> {
    store: TwinStore,
    events: ChangeEventBus,
    transport: T,
    policy: SyncPolicy,
}

impl<T> TwinSynchronizer<T>
where
    T: CommandTransport,
{
    pub fn new(store: TwinStore, events: ChangeEventBus, transport: T, policy: SyncPolicy) -> Self {
        Self {
            store,
            events,
            transport,
            policy,
        }
    }

    pub fn store(&self) -> &TwinStore {
        &self.store
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    pub fn events(&self) -> &ChangeEventBus {
        &self.events
    }

    /// Merge a device report into `reported`.
    pub async fn update_reported(
        &self,
        id: &DeviceId,
        patch: &StateMap,
    ) -> Result<Twin, SyncError> {
        self.mutate(id, Some(ChangeType::ReportedUpdated), |twin, now| {
            merge_patch(&mut twin.reported, patch);
            twin.metadata.last_reported_at = Some(now);
            twin.metadata.is_connected = true;
            Ok(())
        })
        .await
    }

    /// Merge operator or automation intent into `desired`.
    pub async fn set_desired(&self, id: &DeviceId, patch: &StateMap) -> Result<Twin, SyncError> {
        self.write_desired(id, patch, None).await
    }

    /// Like [`set_desired`](Self::set_desired), but only if the twin is still
    /// at `expected_version`.
    pub async fn set_desired_checked(
        &self,
        id: &DeviceId,
        patch: &StateMap,
        expected_version: u64,
    ) -> Result<Twin, SyncError> {
        self.write_desired(id, patch, Some(expected_version)).await
    }

    pub async fn record_sync_attempt(
        &self,
        id: &DeviceId,
        succeeded: bool,
    ) -> Result<Twin, SyncError> {
        self.mutate(id, None, |twin, now| {
            twin.metadata.last_sync_attempt_at = Some(now);
            if succeeded {
                twin.metadata.sync_retry_count = 0;
            } else {
                twin.metadata.sync_retry_count += 1;
            }
            Ok(())
        })
        .await
    }

    /// The device dropped off the transport (LWT or connection status).
    pub async fn mark_disconnected(&self, id: &DeviceId) -> Result<Twin, SyncError> {
        self.mutate(id, None, |twin, _| {
            twin.metadata.is_connected = false;
            Ok(())
        })
        .await
    }

    /// Send the unconfirmed part of `desired` to the device and record the
    /// attempt. Nothing is sent when reported already matches.
    pub async fn push_desired(&self, id: &DeviceId) -> Result<Twin, SyncError> {
        let twin = self
            .store
            .get(id)
            .await
            .ok_or_else(|| SyncError::TwinNotFound(id.clone()))?;

        let delta = twin.desired_delta();
        if delta.is_empty() {
            debug!(device_id = %id, "desired state already reported, nothing to push");
            return Ok(twin);
        }

        let topic = twin.kind.topic(id, "desired");
        let payload = json!({
            "version": twin.metadata.version,
            "desired": delta,
        });

        let succeeded = match self.transport.publish(&topic, payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!(device_id = %id, error = %e, "failed to push desired state");
                false
            }
        };

        self.record_sync_attempt(id, succeeded).await
    }

    /// Re-evaluate every twin at `now`. Stale and offline verdicts come from
    /// time passing rather than from a write, so this has to run
    /// periodically. Status-only changes do not bump the version.
    pub async fn sweep(&self, now: Timestamp) -> usize {
        let mut changed = 0;

        for slot in self.store.slots() {
            let mut twin = slot.lock().await;
            let previous = twin.metadata.sync_status;
            let next = status::compute(&twin.metadata, now, &self.policy);

            if previous != next {
                twin.metadata.sync_status = next;
                debug!(device_id = %twin.device_id, ?previous, ?next, "sync status changed");
                self.events
                    .emit(TwinChangeEvent::status_changed(&twin, previous, now));
                changed += 1;
            }
        }

        if changed > 0 {
            info!(changed, "sync sweep updated twin statuses");
        }

        changed
    }

    async fn write_desired(
        &self,
        id: &DeviceId,
        patch: &StateMap,
        expected_version: Option<u64>,
    ) -> Result<Twin, SyncError> {
        self.mutate(id, Some(ChangeType::DesiredUpdated), |twin, now| {
            match expected_version {
                Some(expected) if expected != twin.metadata.version => {
                    return Err(SyncError::VersionConflict {
                        expected,
                        current: twin.metadata.version,
                    });
                }
                _ => {}
            }

            merge_patch(&mut twin.desired, patch);
            // desired writes never move backwards in time
            let desired_at = match twin.metadata.last_desired_at {
                Some(previous) if previous > now => previous,
                _ => now,
            };
            twin.metadata.last_desired_at = Some(desired_at);
            twin.metadata.sync_retry_count = 0;
            Ok(())
        })
        .await
    }

    /// Apply `apply` under the twin's lock, bump the version, recompute the
    /// status and emit events before the lock is released.
    async fn mutate<F>(
        &self,
        id: &DeviceId,
        change: Option<ChangeType>,
        apply: F,
    ) -> Result<Twin, SyncError>
    where
        F: FnOnce(&mut Twin, Timestamp) -> Result<(), SyncError>,
    {
        let slot = self
            .store
            .slot(id)
            .ok_or_else(|| SyncError::TwinNotFound(id.clone()))?;
        let mut twin = slot.lock().await;
        let now = Timestamp::now();

        apply(&mut *twin, now)?;

        let previous = twin.metadata.sync_status;
        twin.metadata.version += 1;
        twin.metadata.updated_at = now;
        twin.metadata.sync_status = status::compute(&twin.metadata, now, &self.policy);

        if let Some(change) = change {
            self.events.emit(TwinChangeEvent::new(change, &twin, now));
        }
        if previous != twin.metadata.sync_status {
            debug!(
                device_id = %id,
                ?previous,
                next = ?twin.metadata.sync_status,
                "sync status changed"
            );
            self.events
                .emit(TwinChangeEvent::status_changed(&twin, previous, now));
        }

        Ok(twin.clone())
    }
}
