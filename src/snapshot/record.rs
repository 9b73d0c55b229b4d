//! Snapshot record and its JSON line form.

use serde::{Deserialize, Serialize};

use crate::store::{DumpBlob, FieldMap, ValueType};

use super::CodecError;

/// One migrated key. Never mutated; transforms build new records.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub key: String,
    pub value_type: ValueType,
    /// Remaining time to live in milliseconds. `None` means no expiry.
    pub ttl_ms: Option<u64>,
    pub value: RecordValue,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RecordValue {
    /// Store-native serialized value.
    Dump(DumpBlob),
    /// Field map synthesized during migration.
    Fields(FieldMap),
}

impl Record {
    pub fn dumped(
        key: impl Into<String>,
        value_type: ValueType,
        ttl_ms: Option<u64>,
        blob: DumpBlob,
    ) -> Self {
        Self {
            key: key.into(),
            value_type,
            ttl_ms,
            value: RecordValue::Dump(blob),
        }
    }

    pub fn generated(key: impl Into<String>, fields: FieldMap) -> Self {
        Self {
            key: key.into(),
            value_type: ValueType::Hash,
            ttl_ms: None,
            value: RecordValue::Fields(fields),
        }
    }

    pub fn is_generated(&self) -> bool {
        matches!(self.value, RecordValue::Fields(_))
    }

    pub fn fields(&self) -> Option<&FieldMap> {
        match &self.value {
            RecordValue::Fields(fields) => Some(fields),
            RecordValue::Dump(_) => None,
        }
    }

    pub fn key_parts(&self) -> KeyParts<'_> {
        KeyParts::parse(&self.key)
    }

    pub fn to_line(&self) -> Result<String, CodecError> {
        let wire = WireRecord::from(self);
        serde_json::to_string(&wire).map_err(|source| CodecError::Encode {
            key: self.key.clone(),
            source,
        })
    }

    pub fn from_line(line_no: usize, raw: &str) -> Result<Self, CodecError> {
        let wire: WireRecord =
            serde_json::from_str(raw).map_err(|source| CodecError::Parse {
                line_no,
                reason: source.to_string(),
                raw: raw.to_string(),
            })?;
        Record::try_from(wire).map_err(|reason| CodecError::Parse {
            line_no,
            reason,
            raw: raw.to_string(),
        })
    }
}

/// `prefix:id:suffix` view of a key. The id keeps any inner colons.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyParts<'a> {
    pub prefix: &'a str,
    pub id: &'a str,
    pub suffix: &'a str,
}

impl<'a> KeyParts<'a> {
    pub fn parse(key: &'a str) -> Self {
        let Some((prefix, rest)) = key.split_once(':') else {
            return Self {
                prefix: key,
                id: "",
                suffix: "",
            };
        };
        match rest.rsplit_once(':') {
            Some((id, suffix)) => Self { prefix, id, suffix },
            None => Self {
                prefix,
                id: "",
                suffix: rest,
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireRecord {
    key: String,
    #[serde(rename = "type")]
    value_type: ValueType,
    #[serde(default)]
    ttl: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<DumpBlob>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    generated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fields: Option<FieldMap>,
}

impl From<&Record> for WireRecord {
    fn from(record: &Record) -> Self {
        let ttl = record.ttl_ms.map(|ttl| ttl.min(i64::MAX as u64) as i64);
        match &record.value {
            RecordValue::Dump(blob) => WireRecord {
                key: record.key.clone(),
                value_type: record.value_type,
                ttl,
                value: Some(blob.clone()),
                generated: false,
                fields: None,
            },
            RecordValue::Fields(fields) => WireRecord {
                key: record.key.clone(),
                value_type: record.value_type,
                ttl,
                value: None,
                generated: true,
                fields: Some(fields.clone()),
            },
        }
    }
}

impl TryFrom<WireRecord> for Record {
    type Error = String;

    fn try_from(wire: WireRecord) -> Result<Self, Self::Error> {
        if wire.key.is_empty() {
            return Err("record key is empty".into());
        }
        // Negative ttl is the store's "no expiry" marker.
        let ttl_ms = wire.ttl.and_then(|ttl| u64::try_from(ttl).ok());
        let value = match (wire.generated, wire.value, wire.fields) {
            (true, None, Some(fields)) => {
                if wire.value_type != ValueType::Hash {
                    return Err(format!(
                        "generated record `{}` must be a hash, got {}",
                        wire.key, wire.value_type
                    ));
                }
                RecordValue::Fields(fields)
            }
            (false, Some(blob), None) => RecordValue::Dump(blob),
            (true, _, _) => {
                return Err(format!(
                    "generated record `{}` must carry `fields` and no `value`",
                    wire.key
                ));
            }
            (false, _, _) => {
                return Err(format!(
                    "record `{}` must carry `value` and no `fields`",
                    wire.key
                ));
            }
        };
        Ok(Record {
            key: wire.key,
            value_type: wire.value_type,
            ttl_ms,
            value,
        })
    }
}
