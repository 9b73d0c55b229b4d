//! Field plans: the per-model table of what happens to each source field.

use crate::model::{FieldType, ModelSchema};
use crate::store::FieldMap;

use super::TransformError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldAction {
    /// Same name, value unchanged.
    Copy,
    Rename(&'static str),
    Coerce(FieldType),
    RenameCoerce(&'static str, FieldType),
    /// Rename through a total old-value -> new-value table.
    MapValue(&'static str, &'static ValueTable),
    /// Same name, carried byte-for-byte. Used for sensitive fields.
    Verbatim,
    Drop,
}

impl FieldAction {
    /// Target field name for `source`, or `None` when dropped.
    pub fn target(&self, source: &'static str) -> Option<&'static str> {
        match self {
            FieldAction::Copy | FieldAction::Coerce(_) | FieldAction::Verbatim => Some(source),
            FieldAction::Rename(to)
            | FieldAction::RenameCoerce(to, _)
            | FieldAction::MapValue(to, _) => Some(*to),
            FieldAction::Drop => None,
        }
    }
}

/// Explicit old-value -> new-value mapping for a field whose labels changed.
#[derive(Debug, PartialEq, Eq)]
pub struct ValueTable {
    pub name: &'static str,
    pub entries: &'static [(&'static str, &'static str)],
}

impl ValueTable {
    pub fn map(&self, old: &str) -> Option<&'static str> {
        self.entries
            .iter()
            .find(|(from, _)| *from == old)
            .map(|(_, to)| *to)
    }

    /// Duplicate source values or empty targets make a table ambiguous.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (i, (from, to)) in self.entries.iter().enumerate() {
            if to.is_empty() {
                problems.push(format!("{}: `{from}` maps to an empty value", self.name));
            }
            if self.entries[..i].iter().any(|(prior, _)| prior == from) {
                problems.push(format!("{}: `{from}` listed twice", self.name));
            }
        }
        problems
    }
}

/// How one source model's fields land in one v2 model.
#[derive(Debug)]
pub struct FieldPlan {
    pub source: &'static str,
    pub target: &'static ModelSchema,
    pub entries: &'static [(&'static str, FieldAction)],
}

impl FieldPlan {
    pub fn action(&self, field: &str) -> Option<FieldAction> {
        self.entries
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, action)| *action)
    }

    pub fn targets(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries
            .iter()
            .filter_map(|(source, action)| action.target(*source))
    }

    pub fn value_tables(&self) -> impl Iterator<Item = &'static ValueTable> + '_ {
        self.entries.iter().filter_map(|(_, action)| match action {
            FieldAction::MapValue(_, table) => Some(*table),
            _ => None,
        })
    }

    /// Apply the plan to every source field. Any field without an entry
    /// aborts the record before anything is written.
    pub fn apply(&self, source: &FieldMap) -> Result<FieldMap, TransformError> {
        let mut out = FieldMap::new();
        for (field, value) in source {
            let action = self
                .action(field)
                .ok_or_else(|| TransformError::UnknownField {
                    model: self.source.to_string(),
                    field: field.clone(),
                })?;
            let (target, value) = match action {
                FieldAction::Drop => continue,
                FieldAction::Copy | FieldAction::Verbatim => (field.as_str(), value.clone()),
                FieldAction::Rename(to) => (to, value.clone()),
                FieldAction::Coerce(ty) => (field.as_str(), coerce(field, value, ty)?),
                FieldAction::RenameCoerce(to, ty) => (to, coerce(field, value, ty)?),
                FieldAction::MapValue(to, table) => {
                    let mapped =
                        table
                            .map(value)
                            .ok_or_else(|| TransformError::UnmappedValue {
                                table: table.name,
                                field: field.clone(),
                                value: value.clone(),
                            })?;
                    (to, mapped.to_string())
                }
            };
            if !self.target.declares(target) {
                return Err(TransformError::UnknownField {
                    model: self.target.name.to_string(),
                    field: target.to_string(),
                });
            }
            out.insert(target.to_string(), value);
        }
        Ok(out)
    }
}

fn coerce(field: &str, value: &str, ty: FieldType) -> Result<String, TransformError> {
    ty.normalize(value).map_err(|source| TransformError::Coerce {
        field: field.to_string(),
        source,
    })
}
