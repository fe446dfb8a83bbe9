//! In-memory stores for offline tests
//!
//! Behavior mirrors the real implementations: absent keys are `Ok(None)`,
//! listings come back sorted, mapping upserts are last-writer-wins.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{MappingStore, ObjectStore};
use crate::error::Result;

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored key, for asserting what a run persisted.
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

impl ObjectStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryMappingStore {
    entries: Mutex<BTreeMap<(String, String), String>>,
}

impl MemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MappingStore for MemoryMappingStore {
    fn get(&self, dataset_id: &str, source_label: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .get(&(dataset_id.to_string(), source_label.to_string()))
            .cloned())
    }

    fn load_all(&self, dataset_id: &str) -> Result<BTreeMap<String, String>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|((ds, _), _)| ds == dataset_id)
            .map(|((_, label), code)| (label.clone(), code.clone()))
            .collect())
    }

    fn put(&self, dataset_id: &str, source_label: &str, canonical_code: &str) -> Result<()> {
        self.entries.lock().unwrap().insert(
            (dataset_id.to_string(), source_label.to_string()),
            canonical_code.to_string(),
        );
        Ok(())
    }
}
