//! Data store boundary.
//!
//! The engine only talks to a store through [`Store`]: cursor scans, hash
//! field access, sorted-set insert/enumerate, and a binary dump/restore pair
//! that can move any value out of the store and back in.
//!
//! Backends implement the smaller [`Backend`] trait (entry read, atomic
//! per-key update, key paging) and get [`Store`] for free.

mod dump;
mod glob;
mod memory;
mod sqlite;
mod value;

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::error::{Effect, Transience};

pub use dump::{DumpBlob, DumpError};
pub use glob::glob_match;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use value::{Entry, SortedSet, StoredValue, ValueType};

/// Materialized hash value: field name -> field value.
pub type FieldMap = BTreeMap<String, String>;

pub const DEFAULT_SCAN_COUNT: usize = 256;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error at {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("wrong type for key `{key}`: expected {expected}, found {found}")]
    WrongType {
        key: String,
        expected: ValueType,
        found: ValueType,
    },
    #[error("key `{key}` already exists")]
    KeyExists { key: String },
    #[error("stored value for `{key}` is unreadable: {source}")]
    CorruptEntry {
        key: String,
        #[source]
        source: DumpError,
    },
    #[error(transparent)]
    Dump(#[from] DumpError),
    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn transience(&self) -> Transience {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                Transience::Retryable
            }
            StoreError::Sqlite(_) | StoreError::Io { .. } => Transience::Unknown,
            StoreError::WrongType { .. }
            | StoreError::KeyExists { .. }
            | StoreError::CorruptEntry { .. }
            | StoreError::Dump(_)
            | StoreError::Poisoned => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            StoreError::Sqlite(_) | StoreError::Io { .. } | StoreError::Poisoned => Effect::Unknown,
            _ => Effect::None,
        }
    }
}

/// Resumption token for [`Store::scan`]. The start cursor is the default.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanCursor(Option<String>);

impl ScanCursor {
    pub fn start() -> Self {
        Self(None)
    }

    pub fn after(key: impl Into<String>) -> Self {
        Self(Some(key.into()))
    }

    pub fn position(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

/// One batch of a cursor scan. `next == None` means the scan is complete.
#[derive(Clone, Debug, Default)]
pub struct ScanPage {
    pub keys: Vec<String>,
    pub next: Option<ScanCursor>,
}

pub trait Store: Send + Sync {
    /// Examine up to `count` keys after `cursor`, returning those matching
    /// `pattern`. Pages may be empty while the scan is still incomplete.
    fn scan(&self, cursor: &ScanCursor, pattern: &str, count: usize)
    -> Result<ScanPage, StoreError>;
    fn key_type(&self, key: &str) -> Result<Option<ValueType>, StoreError>;
    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.key_type(key)?.is_some())
    }
    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    /// Empty map when the key does not exist.
    fn hgetall(&self, key: &str) -> Result<FieldMap, StoreError>;
    fn hset(&self, key: &str, fields: &FieldMap) -> Result<(), StoreError>;

    fn set_string(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn get_string(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError>;
    /// Members ordered by `(score, member)`.
    fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError>;

    fn dump(&self, key: &str) -> Result<Option<DumpBlob>, StoreError>;
    fn restore(
        &self,
        key: &str,
        ttl_ms: Option<u64>,
        blob: &DumpBlob,
        replace: bool,
    ) -> Result<(), StoreError>;
    /// Remaining time to live; `None` for persistent or missing keys.
    fn pttl(&self, key: &str) -> Result<Option<u64>, StoreError>;
    fn pexpire(&self, key: &str, ttl_ms: u64) -> Result<bool, StoreError>;
}

/// Storage primitive a backend has to provide.
pub trait Backend: Send + Sync {
    fn read(&self, key: &str, now_ms: u64) -> Result<Option<Entry>, StoreError>;
    /// Run `f` against the live entry for `key` under the backend's lock and
    /// persist whatever it leaves behind (`None` deletes the key).
    fn update<R>(
        &self,
        key: &str,
        now_ms: u64,
        f: impl FnOnce(&mut Option<Entry>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError>;
    /// Up to `count` live keys strictly after `after`, in key order, plus the
    /// last key examined when more keys follow.
    fn page(
        &self,
        after: Option<&str>,
        count: usize,
        now_ms: u64,
    ) -> Result<(Vec<String>, Option<String>), StoreError>;
}

impl<B: Backend> Store for B {
    fn scan(
        &self,
        cursor: &ScanCursor,
        pattern: &str,
        count: usize,
    ) -> Result<ScanPage, StoreError> {
        let (examined, last) = self.page(cursor.position(), count.max(1), now_ms())?;
        let keys = examined
            .into_iter()
            .filter(|key| glob_match(pattern, key))
            .collect();
        Ok(ScanPage {
            keys,
            next: last.map(ScanCursor::after),
        })
    }

    fn key_type(&self, key: &str) -> Result<Option<ValueType>, StoreError> {
        Ok(self
            .read(key, now_ms())?
            .map(|entry| entry.value.value_type()))
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.update(key, now_ms(), |slot| Ok(slot.take().is_some()))
    }

    fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        match self.read(key, now_ms())? {
            None => Ok(None),
            Some(entry) => Ok(entry.value.as_hash(key)?.get(field).cloned()),
        }
    }

    fn hgetall(&self, key: &str) -> Result<FieldMap, StoreError> {
        match self.read(key, now_ms())? {
            None => Ok(FieldMap::new()),
            Some(entry) => Ok(entry.value.as_hash(key)?.clone()),
        }
    }

    fn hset(&self, key: &str, fields: &FieldMap) -> Result<(), StoreError> {
        self.update(key, now_ms(), |slot| {
            let entry = slot.get_or_insert_with(|| Entry::persistent(StoredValue::empty_hash()));
            let hash = entry.value.as_hash_mut(key)?;
            for (field, value) in fields {
                hash.insert(field.clone(), value.clone());
            }
            Ok(())
        })
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.update(key, now_ms(), |slot| {
            *slot = Some(Entry::persistent(StoredValue::String(value.to_string())));
            Ok(())
        })
    }

    fn get_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.read(key, now_ms())? {
            None => Ok(None),
            Some(entry) => match entry.value {
                StoredValue::String(value) => Ok(Some(value)),
                other => Err(StoreError::WrongType {
                    key: key.to_string(),
                    expected: ValueType::String,
                    found: other.value_type(),
                }),
            },
        }
    }

    fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.update(key, now_ms(), |slot| {
            let entry = slot.get_or_insert_with(|| Entry::persistent(StoredValue::empty_set()));
            Ok(entry.value.as_set_mut(key)?.insert(member.to_string()))
        })
    }

    fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        self.update(key, now_ms(), |slot| {
            let entry = slot.get_or_insert_with(|| Entry::persistent(StoredValue::empty_zset()));
            entry.value.as_zset_mut(key)?.insert(member, score);
            Ok(())
        })
    }

    fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError> {
        match self.read(key, now_ms())? {
            None => Ok(Vec::new()),
            Some(entry) => match entry.value {
                StoredValue::Zset(set) => Ok(set.ordered()),
                other => Err(StoreError::WrongType {
                    key: key.to_string(),
                    expected: ValueType::Zset,
                    found: other.value_type(),
                }),
            },
        }
    }

    fn dump(&self, key: &str) -> Result<Option<DumpBlob>, StoreError> {
        match self.read(key, now_ms())? {
            None => Ok(None),
            Some(entry) => Ok(Some(DumpBlob::encode(&entry.value)?)),
        }
    }

    fn restore(
        &self,
        key: &str,
        ttl_ms: Option<u64>,
        blob: &DumpBlob,
        replace: bool,
    ) -> Result<(), StoreError> {
        let value = blob.decode()?;
        let now = now_ms();
        self.update(key, now, |slot| {
            if slot.is_some() && !replace {
                return Err(StoreError::KeyExists {
                    key: key.to_string(),
                });
            }
            *slot = Some(Entry {
                value,
                expires_at_ms: ttl_ms.map(|ttl| now.saturating_add(ttl)),
            });
            Ok(())
        })
    }

    fn pttl(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let now = now_ms();
        Ok(self
            .read(key, now)?
            .and_then(|entry| entry.expires_at_ms)
            .map(|at| at.saturating_sub(now)))
    }

    fn pexpire(&self, key: &str, ttl_ms: u64) -> Result<bool, StoreError> {
        let now = now_ms();
        self.update(key, now, |slot| match slot {
            Some(entry) => {
                entry.expires_at_ms = Some(now.saturating_add(ttl_ms));
                Ok(true)
            }
            None => Ok(false),
        })
    }
}

/// Cursor-driven key iterator. Each page is fetched lazily, so an interrupted
/// iteration never holds a long-lived lock on the store.
pub struct KeyScan<'a> {
    store: &'a dyn Store,
    pattern: String,
    count: usize,
    cursor: Option<ScanCursor>,
    buffered: std::vec::IntoIter<String>,
}

impl<'a> KeyScan<'a> {
    pub fn new(store: &'a dyn Store, pattern: impl Into<String>, count: usize) -> Self {
        Self {
            store,
            pattern: pattern.into(),
            count,
            cursor: Some(ScanCursor::start()),
            buffered: Vec::new().into_iter(),
        }
    }
}

impl Iterator for KeyScan<'_> {
    type Item = Result<String, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(key) = self.buffered.next() {
                return Some(Ok(key));
            }
            let cursor = self.cursor.take()?;
            match self.store.scan(&cursor, &self.pattern, self.count) {
                Ok(page) => {
                    self.cursor = page.next;
                    self.buffered = page.keys.into_iter();
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

pub fn scan_keys<'a>(store: &'a dyn Store, pattern: &str) -> KeyScan<'a> {
    KeyScan::new(store, pattern, DEFAULT_SCAN_COUNT)
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
