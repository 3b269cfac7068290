//! # SledStore: On-Disk Record Store
//!
//! [`PersistentStore`] over sled's embedded key-value engine. All records
//! live in one `records` tree; the key prefixes keep record kinds apart and
//! sled's lexicographic ordering gives prefix scans for free.
//!
//! Writes are flushed before `put` returns. An intent that was acknowledged
//! to a peer must still be there after a power cut.

use sled::{Db, Tree};
use std::path::Path;

use super::{PersistentStore, StorageError, StorageResult};

const RECORDS_TREE: &str = "records";

/// sled-backed store. Cheap to clone; clones share the same database.
#[derive(Debug, Clone)]
pub struct SledStore {
    db: Db,
    records: Tree,
}

impl SledStore {
    /// Open or create a store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A throwaway store removed when dropped. Tests.
    pub fn open_temporary() -> StorageResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StorageResult<Self> {
        let records = db.open_tree(RECORDS_TREE)?;
        Ok(Self { db, records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl PersistentStore for SledStore {
    fn put(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        self.records.insert(key.as_bytes(), value)?;
        self.db.flush()?;
        Ok(())
    }

    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.records.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn list_by_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for entry in self.records.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| StorageError::Codec(format!("non-utf8 key: {}", e)))?;
            out.push((key, value.to_vec()));
        }
        Ok(out)
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        let existed = self.records.remove(key.as_bytes())?.is_some();
        self.db.flush()?;
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_store_roundtrip() {
        let store = SledStore::open_temporary().unwrap();
        store.put("intent/1", b"one".to_vec()).unwrap();
        assert_eq!(store.get("intent/1").unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.get("intent/2").unwrap(), None);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = SledStore::open(dir.path()).unwrap();
            store.put("nonce/alice", vec![7]).unwrap();
        }
        let store = SledStore::open(dir.path()).unwrap();
        assert_eq!(store.get("nonce/alice").unwrap(), Some(vec![7]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn scan_prefix_only_returns_matching_keys() {
        let store = SledStore::open_temporary().unwrap();
        store.put("settlement/a", vec![1]).unwrap();
        store.put("settlement/b", vec![2]).unwrap();
        store.put("intent/a", vec![3]).unwrap();

        let listed = store.list_by_prefix("settlement/").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0, "settlement/a");
        assert!(store.delete("intent/a").unwrap());
        assert!(store.list_by_prefix("intent/").unwrap().is_empty());
    }
}
