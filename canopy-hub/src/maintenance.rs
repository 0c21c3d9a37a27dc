use std::sync::Arc;
use std::time::Duration;

use jiff::Timestamp;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    events::ChangeEventStream, ledger::RegistrationLedger, registry::DeviceRepository,
    transport::CommandTransport, twin::TwinSynchronizer,
};

/// Periodically re-evaluate twin statuses so silent devices turn stale and
/// then offline.
pub async fn run_sync_sweep<T>(
    synchronizer: Arc<TwinSynchronizer<T>>,
    period: Duration,
    cancel: CancellationToken,
) where
    T: CommandTransport,
{
    info!(?period, "Sync sweep started");
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Sync sweep shutting down");
                break;
            }
            _ = interval.tick() => {
                synchronizer.sweep(Timestamp::now()).await;
            }
        }
    }
}

/// Periodically reload the registered set from the repository.
pub async fn run_cache_refresh<R, T>(
    ledger: Arc<RegistrationLedger<R, T>>,
    period: Duration,
    cancel: CancellationToken,
) where
    R: DeviceRepository,
    T: CommandTransport,
{
    info!(?period, "Registration cache refresh started");
    let mut interval = tokio::time::interval(period);
    // the first tick fires immediately and startup already refreshed
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Registration cache refresh shutting down");
                break;
            }
            _ = interval.tick() => {
                let registered = ledger.refresh_cache().await;
                debug!(registered, "registration cache refreshed");
            }
        }
    }
}

/// Log every twin change until cancelled.
pub async fn run_event_log(mut events: ChangeEventStream, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                info!(
                    event_id = %event.id.0,
                    change_type = ?event.change_type,
                    device_id = %event.device_id,
                    version = event.twin.as_ref().map(|t| t.metadata.version),
                    status = ?event.twin.as_ref().map(|t| t.metadata.sync_status),
                    "twin changed"
                );
            }
        }
    }

    info!(lagged = events.lagged(), "Event log stopped");
}
