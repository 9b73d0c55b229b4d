//! Cross-model mapping tables.
//!
//! A phase's workers publish into private [`MappingDelta`]s. After the phase
//! joins, the deltas are merged into [`MappingTables`] and the produced kinds
//! are sealed; only sealed kinds can be read by later phases.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::TransformError;

pub const MAPPINGS_FILE: &str = "mappings.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingKind {
    /// v1 customer email -> customer objid
    CustomerByEmail,
    /// v1 customer email -> default organization objid
    OrganizationByEmail,
    /// display domain -> custom_domain objid
    DomainByName,
    /// v1 secret key -> secret objid
    SecretByKey,
}

impl MappingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MappingKind::CustomerByEmail => "customer_by_email",
            MappingKind::OrganizationByEmail => "organization_by_email",
            MappingKind::DomainByName => "domain_by_name",
            MappingKind::SecretByKey => "secret_by_key",
        }
    }
}

impl fmt::Display for MappingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Same natural key published twice with different ids. The first id stays.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MappingConflict {
    pub kind: MappingKind,
    pub key: String,
    pub kept: String,
    pub rejected: String,
}

impl fmt::Display for MappingConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} `{}` already maps to {}; ignoring {}",
            self.kind, self.key, self.kept, self.rejected
        )
    }
}

type Table = BTreeMap<String, String>;

fn insert_first(
    tables: &mut BTreeMap<MappingKind, Table>,
    kind: MappingKind,
    key: String,
    id: String,
) -> Result<(), MappingConflict> {
    let table = tables.entry(kind).or_default();
    match table.get(&key) {
        Some(existing) if *existing == id => Ok(()),
        Some(existing) => Err(MappingConflict {
            kind,
            kept: existing.clone(),
            key,
            rejected: id,
        }),
        None => {
            table.insert(key, id);
            Ok(())
        }
    }
}

/// Entries published by one worker during a phase.
#[derive(Clone, Debug, Default)]
pub struct MappingDelta {
    entries: BTreeMap<MappingKind, Table>,
}

impl MappingDelta {
    pub fn publish(
        &mut self,
        kind: MappingKind,
        key: impl Into<String>,
        id: impl Into<String>,
    ) -> Result<(), MappingConflict> {
        insert_first(&mut self.entries, kind, key.into(), id.into())
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, Default)]
pub struct MappingTables {
    tables: BTreeMap<MappingKind, Table>,
    sealed: BTreeSet<MappingKind>,
}

impl MappingTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a sealed table. Reading before the producing phase joined is a
    /// plan bug, not a miss.
    pub fn lookup(&self, kind: MappingKind, key: &str) -> Result<Option<&str>, TransformError> {
        if !self.sealed.contains(&kind) {
            return Err(TransformError::UnsealedTable { kind });
        }
        Ok(self
            .tables
            .get(&kind)
            .and_then(|table| table.get(key))
            .map(String::as_str))
    }

    /// Fold a worker delta in. Conflicting entries keep the first id.
    pub fn merge(&mut self, delta: MappingDelta) -> Vec<MappingConflict> {
        let mut conflicts = Vec::new();
        for (kind, entries) in delta.entries {
            for (key, id) in entries {
                if let Err(conflict) = insert_first(&mut self.tables, kind, key, id) {
                    conflicts.push(conflict);
                }
            }
        }
        conflicts
    }

    pub fn seal(&mut self, kinds: impl IntoIterator<Item = MappingKind>) {
        for kind in kinds {
            self.tables.entry(kind).or_default();
            self.sealed.insert(kind);
        }
    }

    pub fn is_sealed(&self, kind: MappingKind) -> bool {
        self.sealed.contains(&kind)
    }

    pub fn len(&self, kind: MappingKind) -> usize {
        self.tables.get(&kind).map_or(0, BTreeMap::len)
    }

    pub fn sizes(&self) -> BTreeMap<MappingKind, usize> {
        self.tables
            .iter()
            .map(|(kind, table)| (*kind, table.len()))
            .collect()
    }

    /// Persist every table as `{kind: {natural_key: objid}}`, atomically.
    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let json = serde_json::to_vec_pretty(&self.tables).map_err(std::io::Error::other)?;
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(&json)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|err| err.error)?;
        Ok(())
    }

    pub fn read_json(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read(path)?;
        let tables: BTreeMap<MappingKind, Table> =
            serde_json::from_slice(&raw).map_err(std::io::Error::other)?;
        let sealed = tables.keys().copied().collect();
        Ok(Self { tables, sealed })
    }
}
