use canopy_core::{SyncStatus, TwinMetadata};
use jiff::{SignedDuration, Timestamp};

/// Thresholds for [`compute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Silence after which a device counts as offline.
    pub offline_after: SignedDuration,
    /// Silence after which a connected device counts as stale.
    pub stale_after: SignedDuration,
    /// Failed sync attempts before a pending change becomes a conflict.
    pub max_retries: u32,
}

impl SyncPolicy {
    pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    /// Offline after five missed heartbeats, stale after two.
    pub fn from_heartbeat_secs(heartbeat_secs: u64, max_retries: u32) -> Self {
        let heartbeat = i64::try_from(heartbeat_secs).unwrap_or(i64::MAX / 5);

        Self {
            offline_after: SignedDuration::from_secs(heartbeat.saturating_mul(5)),
            stale_after: SignedDuration::from_secs(heartbeat.saturating_mul(2)),
            max_retries,
        }
    }
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self::from_heartbeat_secs(Self::DEFAULT_HEARTBEAT_SECS, Self::DEFAULT_MAX_RETRIES)
    }
}

/// Derive the sync verdict for a twin at `now`.
///
/// Offline wins over everything (agreement is unknowable for an unreachable
/// device), conflict wins over pending.
pub fn compute(metadata: &TwinMetadata, now: Timestamp, policy: &SyncPolicy) -> SyncStatus {
    let Some(reported_at) = metadata.last_reported_at.filter(|_| metadata.is_connected) else {
        return SyncStatus::Offline;
    };

    let silence = now.duration_since(reported_at);
    if silence > policy.offline_after {
        return SyncStatus::Offline;
    }

    if metadata.desired_ahead_of_reported() {
        if metadata.sync_retry_count >= policy.max_retries {
            SyncStatus::Conflict
        } else {
            SyncStatus::Pending
        }
    } else if silence > policy.stale_after {
        SyncStatus::Stale
    } else {
        SyncStatus::InSync
    }
}
