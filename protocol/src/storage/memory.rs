//! In-memory [`PersistentStore`]. Gone when the process exits.

use parking_lot::RwLock;
use std::collections::BTreeMap;

use super::{PersistentStore, StorageResult};

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl PersistentStore for MemoryStore {
    fn put(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn list_by_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_listing_is_ordered_and_bounded() {
        let store = MemoryStore::new();
        store.put("intent/b", vec![2]).unwrap();
        store.put("intent/a", vec![1]).unwrap();
        store.put("intents-other", vec![9]).unwrap();
        store.put("nonce/a", vec![3]).unwrap();

        let listed = store.list_by_prefix("intent/").unwrap();
        let keys: Vec<_> = listed.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["intent/a", "intent/b"]);
    }

    #[test]
    fn delete_reports_presence() {
        let store = MemoryStore::new();
        store.put("k", vec![1]).unwrap();
        assert!(store.delete("k").unwrap());
        assert!(!store.delete("k").unwrap());
        assert!(store.is_empty());
    }
}
