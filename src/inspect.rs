//! Temporary value inspector.
//!
//! Opaque dump blobs are materialized by restoring them under a scratch key,
//! reading the hash back, and deleting the scratch key again. Scratch keys
//! live under a reserved prefix so leftovers from an interrupted run can be
//! swept.

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::store::{DumpBlob, FieldMap, Store, StoreError, ValueType};

pub const DEFAULT_SCRATCH_PREFIX: &str = "_keyshift_scratch";

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("scratch store error: {0}")]
    Store(#[from] StoreError),
    #[error("value is a {found}, expected a hash")]
    NotAHash { found: ValueType },
    #[error("scratch key `{key}` vanished before it was read")]
    Vanished { key: String },
}

/// Per-task slice of the scratch prefix: `{prefix}:{task}:{seq}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScratchNamespace {
    prefix: String,
    task: String,
}

impl ScratchNamespace {
    pub fn new(prefix: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            task: task.into(),
        }
    }

    pub fn key(&self, seq: u64) -> String {
        format!("{}:{}:{seq}", self.prefix, self.task)
    }

    pub fn task(&self) -> &str {
        &self.task
    }
}

pub struct Inspector<'a> {
    store: &'a dyn Store,
    namespace: ScratchNamespace,
    seq: AtomicU64,
}

impl<'a> Inspector<'a> {
    pub fn new(store: &'a dyn Store, namespace: ScratchNamespace) -> Self {
        Self {
            store,
            namespace,
            seq: AtomicU64::new(0),
        }
    }

    /// Materialize a hash blob. The scratch key is gone when this returns,
    /// whether or not materialization succeeded.
    pub fn inspect(&self, blob: &DumpBlob) -> Result<FieldMap, InspectError> {
        let key = self
            .namespace
            .key(self.seq.fetch_add(1, Ordering::Relaxed));
        let guard = ScratchGuard {
            store: self.store,
            key,
        };
        self.store.restore(&guard.key, None, blob, true)?;
        match self.store.key_type(&guard.key)? {
            Some(ValueType::Hash) => Ok(self.store.hgetall(&guard.key)?),
            Some(found) => Err(InspectError::NotAHash { found }),
            None => Err(InspectError::Vanished {
                key: guard.key.clone(),
            }),
        }
    }
}

struct ScratchGuard<'a> {
    store: &'a dyn Store,
    key: String,
}

impl Drop for ScratchGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.store.delete(&self.key) {
            tracing::warn!(key = %self.key, error = %err, "failed to delete scratch key");
        }
    }
}

/// Delete every key under `prefix`. Returns how many were removed.
pub fn sweep_scratch(store: &dyn Store, prefix: &str) -> Result<u64, StoreError> {
    let pattern = format!("{prefix}:*");
    let keys = crate::store::scan_keys(store, &pattern).collect::<Result<Vec<_>, _>>()?;
    let mut removed = 0;
    for key in keys {
        if store.delete(&key)? {
            removed += 1;
        }
    }
    if removed > 0 {
        tracing::info!(prefix, removed, "swept scratch keys");
    }
    Ok(removed)
}
