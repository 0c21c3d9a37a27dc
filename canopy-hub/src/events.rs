use canopy_core::TwinChangeEvent;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tracing::{debug, warn};

/// Ordered channel of twin change events.
///
/// Emission never blocks. The channel is bounded: a consumer that falls more
/// than `capacity` events behind loses the oldest ones and sees the count in
/// [`ChangeEventStream::lagged`]. Events for one device are emitted in the
/// order they happened; there is no ordering across devices.
#[derive(Clone)]
pub struct ChangeEventBus {
    tx: broadcast::Sender<TwinChangeEvent>,
}

impl ChangeEventBus {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: TwinChangeEvent) {
        let change_type = event.change_type;
        let device_id = event.device_id.clone();

        if self.tx.send(event).is_err() {
            debug!(?change_type, %device_id, "no event subscribers, dropping change event");
        }
    }

    pub fn subscribe(&self) -> ChangeEventStream {
        ChangeEventStream {
            rx: self.tx.subscribe(),
            lagged: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChangeEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

/// One consumer's view of the bus.
pub struct ChangeEventStream {
    rx: broadcast::Receiver<TwinChangeEvent>,
    lagged: u64,
}

impl ChangeEventStream {
    /// Wait for the next event. Returns `None` once every bus handle is gone.
    pub async fn recv(&mut self) -> Option<TwinChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<TwinChangeEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain everything currently queued.
    pub fn drain(&mut self) -> Vec<TwinChangeEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Number of events this consumer lost by falling behind.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }

    fn record_lag(&mut self, skipped: u64) {
        warn!(skipped, "change event consumer lagged, oldest events dropped");
        self.lagged += skipped;
    }
}
