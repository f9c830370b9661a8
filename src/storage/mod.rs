pub mod engine;
pub mod memory;
pub mod persistence;
pub mod table;

pub use engine::StorageEngine;
pub use memory::{InMemoryStorage, Tables};
pub use persistence::{DurabilityMode, PersistenceManager, SnapshotManager, WalEntry, WalManager};
pub use table::Table;
