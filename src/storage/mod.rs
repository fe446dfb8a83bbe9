// Storage module - injected capability traits for objects and mappings

pub mod local;
pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;

use crate::error::Result;

pub use local::LocalDirStore;
pub use memory::{MemoryMappingStore, MemoryStore};
pub use sqlite::SqliteMappingStore;

/// Byte-level object storage, addressed by string keys.
///
/// The engine only ever needs get/put/list; bucket provisioning, retries
/// and transport concerns belong to the implementation or the caller.
/// Implementations surface infrastructure failures as
/// [`ReconcileError::StorageUnavailable`](crate::error::ReconcileError);
/// an absent key is `Ok(None)`, not an error.
pub trait ObjectStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;
    /// All keys starting with `prefix`, sorted ascending.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Durable account-label override store, scoped by dataset.
///
/// The only state that outlives a run. Upserts must be atomic per
/// (dataset_id, source_label); last writer wins.
pub trait MappingStore {
    fn get(&self, dataset_id: &str, source_label: &str) -> Result<Option<String>>;
    /// Every override for one dataset: source label -> canonical code.
    fn load_all(&self, dataset_id: &str) -> Result<BTreeMap<String, String>>;
    fn put(&self, dataset_id: &str, source_label: &str, canonical_code: &str) -> Result<()>;
}
