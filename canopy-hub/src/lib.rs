pub mod api;
pub mod config;
pub mod events;
pub mod ingest;
pub mod ledger;
pub mod maintenance;
pub mod registry;
pub mod transport;
pub mod twin;

use std::sync::Arc;

use events::ChangeEventBus;
use ingest::Ingestor;
use ledger::RegistrationLedger;
use registry::DeviceRepository;
use transport::CommandTransport;
use twin::{SyncPolicy, TwinStore, TwinSynchronizer};

// AppState must be defined in lib.rs to be visible to all modules
pub struct AppState<R, T> {
    pub ledger: Arc<RegistrationLedger<R, T>>,
    pub synchronizer: Arc<TwinSynchronizer<T>>,
    pub ingestor: Ingestor<R, T>,
}

impl<R, T> AppState<R, T>
where
    R: DeviceRepository,
    T: CommandTransport + Clone,
{
    /// Wire the ledger, the synchronizer and the ingestor around one twin
    /// store and one event bus.
    pub fn new(repository: R, transport: T, policy: SyncPolicy, events: ChangeEventBus) -> Self {
        let twins = TwinStore::new();
        let ledger = Arc::new(RegistrationLedger::new(
            repository,
            transport.clone(),
            twins.clone(),
            events.clone(),
        ));
        let synchronizer = Arc::new(TwinSynchronizer::new(twins, events, transport, policy));
        let ingestor = Ingestor::new(Arc::clone(&ledger), Arc::clone(&synchronizer));

        Self {
            ledger,
            synchronizer,
            ingestor,
        }
    }
}

impl<R, T> Clone for AppState<R, T> {
    fn clone(&self) -> Self {
        Self {
            ledger: Arc::clone(&self.ledger),
            synchronizer: Arc::clone(&self.synchronizer),
            ingestor: self.ingestor.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_state() -> (
    AppState<registry::InMemoryDeviceRepository, transport::MemoryTransport>,
    transport::MemoryTransport,
) {
    let transport = transport::MemoryTransport::new();
    let state = AppState::new(
        registry::InMemoryDeviceRepository::new(),
        transport.clone(),
        SyncPolicy::default(),
        ChangeEventBus::default(),
    );
    (state, transport)
}
