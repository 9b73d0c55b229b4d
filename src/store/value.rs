//! In-store value shapes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{FieldMap, StoreError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Hash,
    Zset,
    Set,
}

impl ValueType {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Hash => "hash",
            ValueType::Zset => "zset",
            ValueType::Set => "set",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(ValueType::String),
            "hash" => Ok(ValueType::Hash),
            "zset" => Ok(ValueType::Zset),
            "set" => Ok(ValueType::Set),
            other => Err(format!("unknown value type `{other}`")),
        }
    }
}

/// Sorted set keyed by member. Iteration order is `(score, member)`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SortedSet {
    scores: BTreeMap<String, f64>,
}

impl SortedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite `member`. Returns true when the member is new.
    pub fn insert(&mut self, member: &str, score: f64) -> bool {
        self.scores.insert(member.to_string(), score).is_none()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn ordered(&self) -> Vec<(String, f64)> {
        let mut members: Vec<(String, f64)> = self
            .scores
            .iter()
            .map(|(member, score)| (member.clone(), *score))
            .collect();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        members
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum StoredValue {
    String(String),
    Hash(FieldMap),
    Zset(SortedSet),
    Set(BTreeSet<String>),
}

impl StoredValue {
    pub fn empty_hash() -> Self {
        StoredValue::Hash(FieldMap::new())
    }

    pub fn empty_zset() -> Self {
        StoredValue::Zset(SortedSet::new())
    }

    pub fn empty_set() -> Self {
        StoredValue::Set(BTreeSet::new())
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            StoredValue::String(_) => ValueType::String,
            StoredValue::Hash(_) => ValueType::Hash,
            StoredValue::Zset(_) => ValueType::Zset,
            StoredValue::Set(_) => ValueType::Set,
        }
    }

    pub(crate) fn as_hash(&self, key: &str) -> Result<&FieldMap, StoreError> {
        match self {
            StoredValue::Hash(fields) => Ok(fields),
            other => Err(wrong_type(key, ValueType::Hash, other)),
        }
    }

    pub(crate) fn as_hash_mut(&mut self, key: &str) -> Result<&mut FieldMap, StoreError> {
        match self {
            StoredValue::Hash(fields) => Ok(fields),
            other => Err(wrong_type(key, ValueType::Hash, other)),
        }
    }

    pub(crate) fn as_zset_mut(&mut self, key: &str) -> Result<&mut SortedSet, StoreError> {
        match self {
            StoredValue::Zset(set) => Ok(set),
            other => Err(wrong_type(key, ValueType::Zset, other)),
        }
    }

    pub(crate) fn as_set_mut(&mut self, key: &str) -> Result<&mut BTreeSet<String>, StoreError> {
        match self {
            StoredValue::Set(set) => Ok(set),
            other => Err(wrong_type(key, ValueType::Set, other)),
        }
    }
}

fn wrong_type(key: &str, expected: ValueType, found: &StoredValue) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
        expected,
        found: found.value_type(),
    }
}

/// A stored value plus its absolute expiry.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub value: StoredValue,
    pub expires_at_ms: Option<u64>,
}

impl Entry {
    pub fn persistent(value: StoredValue) -> Self {
        Self {
            value,
            expires_at_ms: None,
        }
    }

    pub fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_none_or(|at| at > now_ms)
    }
}
