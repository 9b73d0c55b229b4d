use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

use super::{Backend, Entry, StoreError};

/// Process-local store. Used for tests, dry runs, and as a scratch area.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Backend for MemoryStore {
    fn read(&self, key: &str, now_ms: u64) -> Result<Option<Entry>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now_ms))
            .cloned())
    }

    fn update<R>(
        &self,
        key: &str,
        now_ms: u64,
        f: impl FnOnce(&mut Option<Entry>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        let mut slot = entries
            .get(key)
            .filter(|entry| entry.is_live(now_ms))
            .cloned();
        let out = f(&mut slot)?;
        match slot {
            Some(entry) => {
                entries.insert(key.to_string(), entry);
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(out)
    }

    fn page(
        &self,
        after: Option<&str>,
        count: usize,
        now_ms: u64,
    ) -> Result<(Vec<String>, Option<String>), StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        let lower = match after {
            Some(key) => Bound::Excluded(key.to_string()),
            None => Bound::Unbounded,
        };
        let mut range = entries.range((lower, Bound::Unbounded));
        let mut keys = Vec::new();
        let mut last = None;
        for (key, entry) in range.by_ref().take(count) {
            last = Some(key.clone());
            if entry.is_live(now_ms) {
                keys.push(key.clone());
            }
        }
        let more = range.next().is_some();
        Ok((keys, if more { last } else { None }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, StoredValue};

    #[test]
    fn expired_entries_are_invisible() {
        let store = MemoryStore::new();
        store
            .update("k", 1_000, |slot| {
                *slot = Some(Entry {
                    value: StoredValue::String("v".into()),
                    expires_at_ms: Some(1_500),
                });
                Ok(())
            })
            .expect("insert");
        assert!(store.read("k", 1_400).expect("read").is_some());
        assert!(store.read("k", 1_500).expect("read").is_none());
        let (keys, _) = store.page(None, 10, 2_000).expect("page");
        assert!(keys.is_empty());
    }

    #[test]
    fn delete_reports_whether_key_existed() {
        let store = MemoryStore::new();
        store.set_string("k", "v").expect("set");
        assert!(store.delete("k").expect("delete"));
        assert!(!store.delete("k").expect("delete"));
        assert!(store.is_empty());
    }
}
