//! Filesystem-backed object store
//!
//! Keys are slash-separated relative paths under a root directory, so a
//! bucket layout like `source/positions-2025-08-21.csv` maps 1:1 onto
//! directories on disk. Used by the CLI; tests mostly use the in-memory
//! store instead.

use std::path::{Path, PathBuf};

use anyhow::anyhow;
use tracing::debug;

use super::ObjectStore;
use crate::error::{ReconcileError, Result};

pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        // Keys are internal, but never let one escape the root.
        if key.split('/').any(|part| part == "..") || key.starts_with('/') {
            return Err(anyhow!("invalid object key: {key}"));
        }
        Ok(self.root.join(key))
    }

    fn collect_keys(&self, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                self.collect_keys(&path, out)?;
            } else if let Ok(rel) = path.strip_prefix(&self.root) {
                // Normalize to slash-separated keys regardless of platform
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(key);
            }
        }
        Ok(())
    }
}

impl ObjectStore for LocalDirStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ReconcileError::StorageUnavailable(format!(
                "read {key}: {e}"
            ))
            .into()),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ReconcileError::StorageUnavailable(format!("mkdir for {key}: {e}"))
            })?;
        }
        std::fs::write(&path, bytes)
            .map_err(|e| ReconcileError::StorageUnavailable(format!("write {key}: {e}")))?;
        debug!("Stored {} bytes at {:?}", bytes.len(), path);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        self.collect_keys(&self.root.clone(), &mut keys)
            .map_err(|e| ReconcileError::StorageUnavailable(format!("list {prefix}: {e}")))?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_list_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = LocalDirStore::new(dir.path());

        store.put("source/positions-2025-08-20.csv", b"a,b").unwrap();
        store.put("source/positions-2025-08-21.csv", b"c,d").unwrap();
        store.put("output/report.json", b"{}").unwrap();

        assert_eq!(
            store.get("source/positions-2025-08-20.csv").unwrap(),
            Some(b"a,b".to_vec())
        );
        assert_eq!(store.get("source/missing.csv").unwrap(), None);

        let keys = store.list("source/").unwrap();
        assert_eq!(
            keys,
            vec![
                "source/positions-2025-08-20.csv".to_string(),
                "source/positions-2025-08-21.csv".to_string(),
            ]
        );
    }

    #[test]
    fn test_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let store = LocalDirStore::new(dir.path());
        assert!(store.get("../outside").is_err());
        assert!(store.put("/absolute", b"x").is_err());
    }
}
