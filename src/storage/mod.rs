pub mod bucket;
pub mod engine;
pub mod persistence;

pub use bucket::BucketTable;
pub use engine::{EventStore, StorageEngine, StoreError};
pub use persistence::{PersistenceConfig, PersistenceError, SnapshotManager, SnapshotWorker};
