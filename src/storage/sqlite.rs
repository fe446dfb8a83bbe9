//! SQLite-backed mapping store
//!
//! One table keyed by (dataset_id, source_label). Upserts ride on the
//! primary key, so concurrent apply calls resolve last-writer-wins per
//! label without any extra locking.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use super::MappingStore;
use crate::error::Result;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS account_mappings (
    dataset_id   TEXT NOT NULL,
    source_label TEXT NOT NULL,
    target_code  TEXT NOT NULL,
    updated_at   TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (dataset_id, source_label)
);
";

pub struct SqliteMappingStore {
    conn: Connection,
}

impl SqliteMappingStore {
    /// Open (and create if needed) the mapping database at `path`.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory for {:?}", path))?;
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open mapping database at {:?}", path))?;
        conn.execute_batch(SCHEMA)
            .context("failed to initialize mapping schema")?;
        info!("Opened mapping store at {:?}", path);
        Ok(Self { conn })
    }

    /// In-memory database, handy for tests that want real SQL semantics.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.execute_batch(SCHEMA)
            .context("failed to initialize mapping schema")?;
        Ok(Self { conn })
    }
}

impl MappingStore for SqliteMappingStore {
    fn get(&self, dataset_id: &str, source_label: &str) -> Result<Option<String>> {
        let code = self
            .conn
            .query_row(
                "SELECT target_code FROM account_mappings
                 WHERE dataset_id = ?1 AND source_label = ?2",
                params![dataset_id, source_label],
                |row| row.get(0),
            )
            .optional()
            .context("mapping lookup failed")?;
        Ok(code)
    }

    fn load_all(&self, dataset_id: &str) -> Result<BTreeMap<String, String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT source_label, target_code FROM account_mappings
                 WHERE dataset_id = ?1",
            )
            .context("failed to prepare mapping query")?;
        let rows = stmt
            .query_map(params![dataset_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("mapping query failed")?;

        let mut out = BTreeMap::new();
        for row in rows {
            let (label, code) = row.context("bad mapping row")?;
            out.insert(label, code);
        }
        Ok(out)
    }

    fn put(&self, dataset_id: &str, source_label: &str, canonical_code: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO account_mappings (dataset_id, source_label, target_code)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (dataset_id, source_label)
                 DO UPDATE SET target_code = excluded.target_code,
                               updated_at = datetime('now')",
                params![dataset_id, source_label, canonical_code],
            )
            .context("mapping upsert failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_round_trip() {
        let store = SqliteMappingStore::open_in_memory().unwrap();

        store.put("default", "BrokerageLink", "401K").unwrap();
        assert_eq!(
            store.get("default", "BrokerageLink").unwrap().as_deref(),
            Some("401K")
        );

        // Re-applying with a new code overwrites, not duplicates
        store.put("default", "BrokerageLink", "401K Roth").unwrap();
        let all = store.load_all("default").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all.get("BrokerageLink").unwrap(), "401K Roth");
    }

    #[test]
    fn test_datasets_are_isolated() {
        let store = SqliteMappingStore::open_in_memory().unwrap();
        store.put("a", "Label", "CODE").unwrap();

        assert_eq!(store.get("b", "Label").unwrap(), None);
        assert!(store.load_all("b").unwrap().is_empty());
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("mappings.db");
        let store = SqliteMappingStore::open(path.clone()).unwrap();
        store.put("default", "X", "Y").unwrap();
        assert!(path.exists());
    }
}
