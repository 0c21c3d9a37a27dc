pub mod status;
pub mod store;
pub mod synchronizer;

pub use status::SyncPolicy;
pub use store::TwinStore;
pub use synchronizer::{SyncError, TwinSynchronizer, patch_from_value};
